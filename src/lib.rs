//! `netfabric` — a control-plane library for a hierarchical network-service
//! abstraction.
//!
//! A *network* exposes named *terminals* through which *services*
//! (point-to-multipoint connections with per-endpoint bandwidth guarantees)
//! are provisioned. Two kinds of networks compose recursively: a [`switch`]
//! is an atomic network that admits or rejects services against per-terminal
//! capacity limits; an [`aggregator`] is a composite network that routes
//! services over a graph of [`trunk`]s and inferior networks.
//!
//! See `DESIGN.md` for the grounding ledger behind this crate's structure.

pub mod config;
pub mod error;
pub mod executor;
pub mod graph;
pub mod identity;
pub mod listener;
pub mod network;
pub mod segment;
pub mod status;
pub mod transport;
pub mod trunk;

pub mod aggregator;
pub mod switch;

pub use error::{Error, Result};
pub use identity::{Circuit, Edge, Terminal, TrafficFlow};
pub use listener::Listener;
pub use network::{AuthToken, ChordMetrics, Network, Service};
pub use segment::Segment;
pub use status::{Intent, Status};

pub use aggregator::Aggregator;
pub use switch::Switch;
