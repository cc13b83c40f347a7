//! The network-control surface and the `Service` contract both switches
//! and aggregators implement for their services.
//!
//! `Network` is the polymorphic handle an aggregator holds for each of its
//! inferior networks (switches or nested aggregators); `Service` is the
//! polymorphic handle it holds for each sub-service it creates on them.
//! Both are plain traits rather than a closed enum, so a new network or
//! service kind (e.g. a remote-backed one) can be added without touching
//! this crate.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::identity::{Edge, Terminal};
use crate::listener::Listener;
use crate::segment::Segment;
use crate::status::Status;

/// An opaque token captured from a per-call creation context and attached
/// to a newly-created service. Verifying it is out of scope for this
/// crate; it is carried so a caller's auth layer can.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthToken(pub String);

/// A single pairwise connectivity summary, as returned by
/// `Network::model`. Atomic networks always report a small positive
/// weight, never zero.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChordMetrics {
    pub weight: f64,
}

/// The polymorphic handle to one service, whether it lives on a switch or
/// an aggregator.
pub trait Service: Send + Sync {
    fn id(&self) -> u64;
    fn handle(&self) -> Option<String>;
    fn status(&self) -> Status;

    /// Defines (or redefines, where the engine allows it) this service's
    /// traffic demand.
    fn define(&self, segment: Segment) -> Result<()>;
    fn activate(&self) -> Result<()>;
    fn deactivate(&self) -> Result<()>;
    /// Clears the current definition, returning every resource it held.
    /// If active, first deactivates. The service remains usable — a new
    /// `define` may follow — unlike `release`, which is terminal.
    fn reset(&self) -> Result<()>;
    /// Always eventually successful, even from `Failed`.
    fn release(&self);

    fn add_listener(&self, listener: Arc<dyn Listener>);

    /// A snapshot of accumulated failure causes from this service or its
    /// sub-services.
    fn errors(&self) -> Vec<String>;
}

/// The polymorphic handle to a network: a switch or an aggregator.
pub trait Network: Send + Sync {
    fn name(&self) -> &str;

    fn get_terminal(&self, name: &str) -> Option<Terminal>;
    fn get_terminals(&self) -> Vec<Terminal>;

    /// Creates a new service, or `None` if `handle` is already in use.
    fn new_service(&self, handle: Option<String>, auth_token: Option<AuthToken>) -> Option<Arc<dyn Service>>;

    fn get_service(&self, id: u64) -> Option<Arc<dyn Service>>;
    fn get_service_by_handle(&self, handle: &str) -> Option<Arc<dyn Service>>;

    fn require_service(&self, id: u64) -> Result<Arc<dyn Service>> {
        self.get_service(id)
            .ok_or_else(|| crate::error::Error::unknown_service(id.to_string()))
    }

    fn require_service_by_handle(&self, handle: &str) -> Result<Arc<dyn Service>> {
        self.get_service_by_handle(handle)
            .ok_or_else(|| crate::error::Error::unknown_service(handle.to_string()))
    }

    fn get_service_ids(&self) -> Vec<u64>;

    /// Summarizes internal connectivity between every pair of this
    /// network's external terminals, filtered to paths able to carry at
    /// least `min_bandwidth`.
    fn get_model(&self, min_bandwidth: f64) -> HashMap<Edge, ChordMetrics>;
}
