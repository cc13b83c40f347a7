//! The switch engine: an atomic network's terminal/capacity accounting and
//! per-service lifecycle.
//!
//! A `Switch` owns one `parking_lot::Mutex` covering its terminals,
//! capacity counters, and every service it owns. There is no separate
//! service-level mutex: switch-side services are simple enough that every
//! operation completes in one pass under the switch's own lock, so the
//! extra ordering machinery the aggregator needs (service mutex below
//! network mutex) would be pure overhead.
//!
//! `service` is a child module, not a sibling crate boundary: it reaches
//! into `Switch`'s private fields directly.

mod service;

pub use service::SwitchServiceHandle;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::identity::{Edge, Terminal};
use crate::network::{AuthToken, ChordMetrics, Network, Service};
use crate::segment::Segment;

use service::ServiceState;

/// Either replace a terminal's bandwidth outright, or adjust it by a
/// delta from its current value (treating an unset current as zero).
#[derive(Clone, Copy, Debug)]
pub enum BandwidthChange {
    /// Replace the capacity. `None` means unlimited.
    Set(Option<f64>),
    /// Add `delta` to the current capacity (current `None` is treated as
    /// zero). The result must not go negative.
    Adjust(f64),
}

struct TerminalRecord {
    terminal: Terminal,
    #[allow(dead_code)]
    description: Option<String>,
    ingress_capacity: Option<f64>,
    egress_capacity: Option<f64>,
}

struct Inner {
    terminals_by_name: HashMap<String, TerminalRecord>,
    terminal_ids: HashSet<u64>,
    services: HashMap<u64, ServiceState>,
    handles: HashMap<String, u64>,
    next_service_id: u64,
}

impl Inner {
    fn find_terminal(&self, id: u64) -> Option<&TerminalRecord> {
        self.terminals_by_name.values().find(|r| r.terminal.id() == id)
    }

    fn find_terminal_mut(&mut self, id: u64) -> Option<&mut TerminalRecord> {
        self.terminals_by_name.values_mut().find(|r| r.terminal.id() == id)
    }

    /// Sum of ingress/egress already committed to `terminal_id` by every
    /// *other* defined service than `excluding`.
    fn used_by_others(&self, terminal_id: u64, excluding: u64) -> (f64, f64) {
        let mut ingress = 0.0;
        let mut egress = 0.0;
        for (id, svc) in &self.services {
            if *id == excluding {
                continue;
            }
            if let Some(seg) = &svc.segment {
                for (circuit, flow) in seg.iter() {
                    if circuit.terminal().id() == terminal_id {
                        ingress += flow.ingress();
                        egress += flow.egress();
                    }
                }
            }
        }
        (ingress, egress)
    }
}

/// An atomic network: admits or rejects services against per-terminal
/// capacity limits, performs no routing.
pub struct Switch {
    name: String,
    self_weak: Weak<Switch>,
    executor: Arc<Executor>,
    inner: Mutex<Inner>,
}

impl Switch {
    pub fn new(name: impl Into<String>) -> Arc<Switch> {
        let name = name.into();
        Arc::new_cyclic(|weak| Switch {
            name,
            self_weak: weak.clone(),
            executor: Executor::new(),
            inner: Mutex::new(Inner {
                terminals_by_name: HashMap::new(),
                terminal_ids: HashSet::new(),
                services: HashMap::new(),
                handles: HashMap::new(),
                next_service_id: 1,
            }),
        })
    }

    fn arc(&self) -> Arc<Switch> {
        self.self_weak.upgrade().expect("switch dropped while a handle to it was still live")
    }

    pub fn add_terminal(&self, name: impl Into<String>, description: Option<String>) -> Result<Terminal> {
        let name = name.into();
        let mut inner = self.inner.lock();
        if inner.terminals_by_name.contains_key(&name) {
            return Err(Error::name_in_use(format!("terminal {} already exists", name)));
        }
        let terminal = Terminal::new_atomic(name.clone());
        log::debug!("switch {}: added terminal {}", self.name, name);
        inner.terminal_ids.insert(terminal.id());
        inner.terminals_by_name.insert(
            name,
            TerminalRecord {
                terminal: terminal.clone(),
                description,
                ingress_capacity: None,
                egress_capacity: None,
            },
        );
        Ok(terminal)
    }

    pub fn modify_bandwidth(
        &self,
        name: &str,
        ingress: Option<BandwidthChange>,
        egress: Option<BandwidthChange>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner
            .terminals_by_name
            .get_mut(name)
            .ok_or_else(|| Error::unknown_terminal(name))?;

        let new_ingress = apply_change(record.ingress_capacity, ingress)?;
        let new_egress = apply_change(record.egress_capacity, egress)?;
        record.ingress_capacity = new_ingress;
        record.egress_capacity = new_egress;
        log::debug!(
            "switch {}: terminal {} capacity now ingress={:?} egress={:?}",
            self.name,
            name,
            new_ingress,
            new_egress
        );
        Ok(())
    }
}

fn apply_change(current: Option<f64>, change: Option<BandwidthChange>) -> Result<Option<f64>> {
    match change {
        None => Ok(current),
        Some(BandwidthChange::Set(v)) => {
            if let Some(v) = v {
                if v < 0.0 {
                    return Err(Error::invalid_argument("capacity must be non-negative"));
                }
            }
            Ok(v)
        }
        Some(BandwidthChange::Adjust(delta)) => {
            let base = current.unwrap_or(0.0);
            let next = base + delta;
            if next < 0.0 {
                return Err(Error::invalid_argument("adjusted capacity would be negative"));
            }
            Ok(Some(next))
        }
    }
}

impl Network for Switch {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_terminal(&self, name: &str) -> Option<Terminal> {
        self.inner.lock().terminals_by_name.get(name).map(|r| r.terminal.clone())
    }

    fn get_terminals(&self) -> Vec<Terminal> {
        self.inner.lock().terminals_by_name.values().map(|r| r.terminal.clone()).collect()
    }

    fn new_service(&self, handle: Option<String>, auth_token: Option<AuthToken>) -> Option<Arc<dyn Service>> {
        let _ = auth_token; // verifying it is out of scope for this crate.
        let mut inner = self.inner.lock();
        if let Some(h) = &handle {
            if inner.handles.contains_key(h) {
                return None;
            }
        }
        let id = inner.next_service_id;
        inner.next_service_id += 1;
        inner.services.insert(id, ServiceState::new(handle.clone()));
        if let Some(h) = handle {
            inner.handles.insert(h, id);
        }
        drop(inner);
        log::debug!("switch {}: new service {}", self.name, id);
        Some(Arc::new(SwitchServiceHandle::new(self.arc(), id)))
    }

    fn get_service(&self, id: u64) -> Option<Arc<dyn Service>> {
        let inner = self.inner.lock();
        if inner.services.contains_key(&id) {
            Some(Arc::new(SwitchServiceHandle::new(self.arc(), id)))
        } else {
            None
        }
    }

    fn get_service_by_handle(&self, handle: &str) -> Option<Arc<dyn Service>> {
        let inner = self.inner.lock();
        inner
            .handles
            .get(handle)
            .copied()
            .map(|id| Arc::new(SwitchServiceHandle::new(self.arc(), id)) as Arc<dyn Service>)
    }

    fn get_service_ids(&self) -> Vec<u64> {
        self.inner.lock().services.keys().copied().collect()
    }

    fn get_model(&self, _min_bandwidth: f64) -> HashMap<Edge, ChordMetrics> {
        let terminals = self.get_terminals();
        let mut model = HashMap::new();
        for i in 0..terminals.len() {
            for j in (i + 1)..terminals.len() {
                model.insert(
                    Edge::new(terminals[i].clone(), terminals[j].clone()),
                    // An atomic switch's interior never reports zero weight: a
                    // unit baseline stands in for its (unspecified) internal
                    // fabric cost.
                    ChordMetrics { weight: 1.0 },
                );
            }
        }
        model
    }
}
