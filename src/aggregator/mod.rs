//! The aggregator: a composite network that owns trunks between terminals
//! of inferior networks and implements services by computing a spanning
//! tree over them.
//!
//! Structured the same way `switch` is: one `parking_lot::Mutex` covering
//! terminals, trunks and every service the aggregator owns, with `planner`
//! and `service` as child modules reaching into `Inner`'s private fields
//! directly rather than through an accessor surface.

mod planner;
mod service;

pub use service::AggregatorServiceHandle;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::identity::{Edge, Terminal};
use crate::network::{AuthToken, ChordMetrics, Network, Service};
use crate::trunk::Trunk;

use service::AggregatorServiceState;

struct TrunkRecord {
    start: Terminal,
    end: Terminal,
    trunk: Trunk,
}

struct Inner {
    exposed_terminals: HashMap<String, Terminal>,
    exposed_ids: HashSet<u64>,
    inferior_networks: Vec<Arc<dyn Network>>,
    /// Caches which inferior network owns a given (wrapped or trunk-anchor)
    /// terminal id, populated when the terminal is first referenced by
    /// `expose_terminal` or `add_trunk` — avoids rescanning every inferior
    /// network's terminal list on every plan.
    terminal_owner: HashMap<u64, usize>,
    trunks: HashMap<u64, TrunkRecord>,
    next_trunk_id: u64,
    services: HashMap<u64, AggregatorServiceState>,
    handles: HashMap<String, u64>,
    next_service_id: u64,
}

impl Inner {
    fn owner_index(&mut self, terminal: &Terminal) -> Option<usize> {
        if let Some(&idx) = self.terminal_owner.get(&terminal.id()) {
            return Some(idx);
        }
        for (idx, network) in self.inferior_networks.iter().enumerate() {
            if network.get_terminals().iter().any(|t| t.id() == terminal.id()) {
                self.terminal_owner.insert(terminal.id(), idx);
                return Some(idx);
            }
        }
        None
    }
}

/// A composite network that delegates via trunks to inferior networks.
pub struct Aggregator {
    name: String,
    self_weak: Weak<Aggregator>,
    executor: Arc<Executor>,
    inner: Mutex<Inner>,
}

impl Aggregator {
    pub fn new(name: impl Into<String>) -> Arc<Aggregator> {
        let name = name.into();
        Arc::new_cyclic(|weak| Aggregator {
            name,
            self_weak: weak.clone(),
            executor: Executor::new(),
            inner: Mutex::new(Inner {
                exposed_terminals: HashMap::new(),
                exposed_ids: HashSet::new(),
                inferior_networks: Vec::new(),
                terminal_owner: HashMap::new(),
                trunks: HashMap::new(),
                next_trunk_id: 1,
                services: HashMap::new(),
                handles: HashMap::new(),
                next_service_id: 1,
            }),
        })
    }

    fn arc(&self) -> Arc<Aggregator> {
        self.self_weak.upgrade().expect("aggregator dropped while a handle to it was still live")
    }

    /// Registers an inferior network this aggregator may route over. Must
    /// be called before exposing any of its terminals or trunking to them.
    pub fn add_inferior_network(&self, network: Arc<dyn Network>) {
        log::debug!("aggregator {}: added inferior network {}", self.name, network.name());
        self.inner.lock().inferior_networks.push(network);
    }

    /// Exposes one inferior-network terminal as an aggregator-owned
    /// terminal under `name`. Fails `NameInUse` if `name` is taken, or
    /// `UnknownTerminal` if `inner_terminal` does not belong to a
    /// registered inferior network.
    pub fn expose_terminal(&self, name: impl Into<String>, inner_terminal: Terminal) -> Result<Terminal> {
        let name = name.into();
        let mut inner = self.inner.lock();
        if inner.exposed_terminals.contains_key(&name) {
            return Err(Error::name_in_use(format!("terminal {} already exists", name)));
        }
        if inner.owner_index(&inner_terminal).is_none() {
            return Err(Error::unknown_terminal(format!(
                "{} does not belong to a registered inferior network",
                inner_terminal
            )));
        }
        let terminal = Terminal::new_aggregated(name.clone(), inner_terminal);
        inner.exposed_ids.insert(terminal.id());
        inner.exposed_terminals.insert(name, terminal.clone());
        Ok(terminal)
    }

    /// Adds a trunk between `start` and `end`, two terminals of (possibly
    /// different) registered inferior networks, with the given propagation
    /// `delay`. Returns a handle for further configuration
    /// (`define_label_range`, `provide_bandwidth`, ...).
    pub fn add_trunk(&self, start: Terminal, end: Terminal, delay: f64) -> Result<TrunkHandle> {
        if delay < 0.0 {
            return Err(Error::invalid_argument("trunk delay must be non-negative"));
        }
        let mut inner = self.inner.lock();
        if inner.owner_index(&start).is_none() {
            return Err(Error::unknown_terminal(format!("{} does not belong to a registered inferior network", start)));
        }
        if inner.owner_index(&end).is_none() {
            return Err(Error::unknown_terminal(format!("{} does not belong to a registered inferior network", end)));
        }
        let id = inner.next_trunk_id;
        inner.next_trunk_id += 1;
        inner.trunks.insert(id, TrunkRecord { start, end, trunk: Trunk::new(delay) });
        log::debug!("aggregator {}: added trunk {}", self.name, id);
        Ok(TrunkHandle { aggregator: self.arc(), id })
    }

}

/// A handle to one trunk, returned by [`Aggregator::add_trunk`].
///
/// Cheaply cloned; every method takes the owning aggregator's mutex for
/// the duration of the call — a trunk is mutated only under its owning
/// aggregator's mutex, never under one of its own.
#[derive(Clone)]
pub struct TrunkHandle {
    aggregator: Arc<Aggregator>,
    id: u64,
}

impl TrunkHandle {
    pub fn define_label_range(&self, start_base: i32, amount: u32, end_base: i32) -> Result<()> {
        let mut inner = self.aggregator.inner.lock();
        let record = inner.trunks.get_mut(&self.id).expect("trunk handle outlived its trunk");
        record.trunk.define_label_range(start_base, amount, end_base)
    }

    pub fn revoke_start_label_range(&self, start_base: i32, amount: u32) {
        let mut inner = self.aggregator.inner.lock();
        let record = inner.trunks.get_mut(&self.id).expect("trunk handle outlived its trunk");
        record.trunk.revoke_start_label_range(start_base, amount);
    }

    pub fn revoke_end_label_range(&self, end_base: i32, amount: u32) {
        let mut inner = self.aggregator.inner.lock();
        let record = inner.trunks.get_mut(&self.id).expect("trunk handle outlived its trunk");
        record.trunk.revoke_end_label_range(end_base, amount);
    }

    pub fn provide_bandwidth(&self, up: f64, down: f64) -> Result<()> {
        let mut inner = self.aggregator.inner.lock();
        let record = inner.trunks.get_mut(&self.id).expect("trunk handle outlived its trunk");
        record.trunk.provide_bandwidth(up, down)
    }

    pub fn withdraw_bandwidth(&self, up: f64, down: f64) -> Result<()> {
        let mut inner = self.aggregator.inner.lock();
        let record = inner.trunks.get_mut(&self.id).expect("trunk handle outlived its trunk");
        record.trunk.withdraw_bandwidth(up, down)
    }

    pub fn set_delay(&self, delay: f64) -> Result<()> {
        let mut inner = self.aggregator.inner.lock();
        let record = inner.trunks.get_mut(&self.id).expect("trunk handle outlived its trunk");
        record.trunk.set_delay(delay)
    }

    pub fn decommission(&self) {
        let mut inner = self.aggregator.inner.lock();
        inner.trunks.get_mut(&self.id).expect("trunk handle outlived its trunk").trunk.decommission();
    }

    pub fn recommission(&self) {
        let mut inner = self.aggregator.inner.lock();
        inner.trunks.get_mut(&self.id).expect("trunk handle outlived its trunk").trunk.recommission();
    }

    pub fn is_commissioned(&self) -> bool {
        let inner = self.aggregator.inner.lock();
        inner.trunks[&self.id].trunk.is_commissioned()
    }

    /// The other end of a tunnel named by either end's circuit, or `None`
    /// if `circuit` belongs to neither terminal of this trunk.
    pub fn peer(&self, circuit: &crate::identity::Circuit) -> Result<Option<crate::identity::Circuit>> {
        let inner = self.aggregator.inner.lock();
        let record = &inner.trunks[&self.id];
        let from_end = if circuit.terminal().id() == record.start.id() {
            false
        } else if circuit.terminal().id() == record.end.id() {
            true
        } else {
            return Err(Error::invalid_argument("circuit belongs to neither terminal of this trunk"));
        };
        match record.trunk.peer_label(circuit.label(), from_end) {
            Ok(peer_label) => {
                let peer_terminal = if from_end { record.start.clone() } else { record.end.clone() };
                Ok(Some(crate::identity::Circuit::new(peer_terminal, peer_label)))
            }
            Err(_) => Ok(None),
        }
    }
}

impl Network for Aggregator {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_terminal(&self, name: &str) -> Option<Terminal> {
        self.inner.lock().exposed_terminals.get(name).cloned()
    }

    fn get_terminals(&self) -> Vec<Terminal> {
        self.inner.lock().exposed_terminals.values().cloned().collect()
    }

    fn new_service(&self, handle: Option<String>, auth_token: Option<AuthToken>) -> Option<Arc<dyn Service>> {
        let _ = auth_token;
        let mut inner = self.inner.lock();
        if let Some(h) = &handle {
            if inner.handles.contains_key(h) {
                return None;
            }
        }
        let id = inner.next_service_id;
        inner.next_service_id += 1;
        inner.services.insert(id, AggregatorServiceState::new(handle.clone()));
        if let Some(h) = handle {
            inner.handles.insert(h, id);
        }
        drop(inner);
        log::debug!("aggregator {}: new service {}", self.name, id);
        Some(Arc::new(AggregatorServiceHandle::new(self.arc(), id)))
    }

    fn get_service(&self, id: u64) -> Option<Arc<dyn Service>> {
        let inner = self.inner.lock();
        if inner.services.contains_key(&id) {
            Some(Arc::new(AggregatorServiceHandle::new(self.arc(), id)))
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
            .map(|id| Arc::new(AggregatorServiceHandle::new(self.arc(), id)) as Arc<dyn Service>)
    }

    fn get_service_ids(&self) -> Vec<u64> {
        self.inner.lock().services.keys().copied().collect()
    }

    fn get_model(&self, min_bandwidth: f64) -> HashMap<Edge, ChordMetrics> {
        let mut inner = self.inner.lock();
        let (vertices, edges, _) = planner::build_graph(&mut inner, min_bandwidth, &HashSet::new());
        let exposed: Vec<Terminal> = inner.exposed_terminals.values().cloned().collect();
        drop(inner);

        let mut model = HashMap::new();
        for i in 0..exposed.len() {
            for j in (i + 1)..exposed.len() {
                let a = &exposed[i];
                let b = &exposed[j];
                let (wa, wb) = match (a.wrapped(), b.wrapped()) {
                    (Some(wa), Some(wb)) => (wa.clone(), wb.clone()),
                    _ => continue,
                };
                let fib = crate::graph::Fib::compute(wb.clone(), &vertices, &edges);
                if let Some(way) = fib.way(&wa) {
                    model.insert(Edge::new(a.clone(), b.clone()), ChordMetrics { weight: way.distance.max(f64::MIN_POSITIVE) });
                }
            }
        }
        model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::Switch;

    #[test]
    fn expose_terminal_requires_registered_inferior() {
        let agg = Aggregator::new("agg1");
        let sw = Switch::new("sw1");
        let t1 = sw.add_terminal("t1", None).unwrap();
        assert!(matches!(agg.expose_terminal("A.T1", t1.clone()), Err(Error::UnknownTerminal(_))));
        agg.add_inferior_network(sw.clone());
        assert!(agg.expose_terminal("A.T1", t1).is_ok());
    }

    #[test]
    fn expose_terminal_rejects_duplicate_name() {
        let agg = Aggregator::new("agg1");
        let sw = Switch::new("sw1");
        agg.add_inferior_network(sw.clone());
        let t1 = sw.add_terminal("t1", None).unwrap();
        let t2 = sw.add_terminal("t2", None).unwrap();
        agg.expose_terminal("A.T1", t1).unwrap();
        assert!(matches!(agg.expose_terminal("A.T1", t2), Err(Error::NameInUse(_))));
    }

    #[test]
    fn trunk_peer_roundtrips_through_label_bijection() {
        let agg = Aggregator::new("agg1");
        let sw1 = Switch::new("sw1");
        let sw2 = Switch::new("sw2");
        agg.add_inferior_network(sw1.clone());
        agg.add_inferior_network(sw2.clone());
        let t1 = sw1.add_terminal("t1", None).unwrap();
        let t2 = sw2.add_terminal("t2", None).unwrap();
        let trunk = agg.add_trunk(t1.clone(), t2.clone(), 0.001).unwrap();
        trunk.define_label_range(0, 4, 10).unwrap();
        let peer = trunk.peer(&crate::identity::Circuit::new(t1, 1)).unwrap().unwrap();
        assert_eq!(peer.terminal().id(), t2.id());
        assert_eq!(peer.label(), 11);
    }
}
