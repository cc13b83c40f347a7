//! Per-service state machine for an atomic network's services.
//!
//! A switch service never delegates to anything further down — it is the
//! leaf case of the aggregator's tree of `Service` handles, so there is no
//! sub-client bookkeeping here the way `aggregator::service` needs. What
//! remains is the capacity check on `define` and the stable/transitional
//! status machine every `Service` implementation walks through.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::listener::Listener;
use crate::network::Service;
use crate::segment::{sanitize, Segment};
use crate::status::{Intent, Status};

use super::{Inner, Switch};

/// Minimum per-circuit ingress after sanitizing a switch-side definition.
const MIN_PROD: f64 = 0.01;

pub(super) struct ServiceState {
    pub(super) handle: Option<String>,
    intent: Intent,
    pub(super) segment: Option<Segment>,
    active: bool,
    released: bool,
    last_emitted: Option<Status>,
    listeners: Vec<Arc<dyn Listener>>,
}

impl ServiceState {
    pub(super) fn new(handle: Option<String>) -> ServiceState {
        ServiceState {
            handle,
            intent: Intent::Inactive,
            segment: None,
            active: false,
            released: false,
            last_emitted: None,
            listeners: Vec::new(),
        }
    }

    fn current_status(&self) -> Status {
        if self.released {
            Status::Released
        } else if self.segment.is_none() {
            Status::Dormant
        } else if self.active {
            Status::Active
        } else {
            Status::Inactive
        }
    }
}

/// The public handle to one switch-side service.
///
/// Cheaply cloned; every method takes the switch's mutex for the duration
/// of the call — one mutex covers the switch's terminals, counters and
/// every service it owns.
pub struct SwitchServiceHandle {
    switch: Arc<Switch>,
    id: u64,
}

impl SwitchServiceHandle {
    pub(super) fn new(switch: Arc<Switch>, id: u64) -> SwitchServiceHandle {
        SwitchServiceHandle { switch, id }
    }

    /// Emits `status` to every listener (via the switch's executor) if it
    /// differs from the last status emitted for this service — debounced
    /// by last-emitted so a no-op transition never reaches a listener.
    fn emit(inner: &mut Inner, executor: &Arc<crate::executor::Executor>, id: u64, status: Status) {
        let svc = match inner.services.get_mut(&id) {
            Some(s) => s,
            None => return,
        };
        if svc.last_emitted == Some(status) {
            return;
        }
        svc.last_emitted = Some(status);
        let listeners = svc.listeners.clone();
        let executor = executor.clone();
        for listener in listeners {
            executor.spawn(move || listener.on_status(status));
        }
    }
}

impl Service for SwitchServiceHandle {
    fn id(&self) -> u64 {
        self.id
    }

    fn handle(&self) -> Option<String> {
        self.switch.inner.lock().services.get(&self.id).and_then(|s| s.handle.clone())
    }

    fn status(&self) -> Status {
        self.switch
            .inner
            .lock()
            .services
            .get(&self.id)
            .map(|s| s.current_status())
            .unwrap_or(Status::Released)
    }

    fn define(&self, segment: Segment) -> Result<()> {
        let mut inner = self.switch.inner.lock();

        {
            let svc = inner.services.get(&self.id).ok_or_else(|| Error::illegal_state("service released"))?;
            if svc.released {
                return Err(Error::illegal_state("service already released"));
            }
            if svc.intent == Intent::Release {
                return Err(Error::illegal_state("define after release"));
            }
        }

        // Every circuit's terminal must belong to this switch.
        for circuit in segment.circuits() {
            if !inner.terminal_ids.contains(&circuit.terminal().id()) {
                return Err(Error::invalid_service(format!(
                    "circuit {} does not belong to this switch",
                    circuit
                )));
            }
        }

        let sanitized = sanitize(&segment, MIN_PROD);

        // Admission: the new segment's per-terminal totals, added to every
        // other currently-defined service's usage on the same terminal,
        // must not exceed that terminal's capacity.
        let mut per_terminal: std::collections::HashMap<u64, (f64, f64)> = std::collections::HashMap::new();
        for (circuit, flow) in sanitized.iter() {
            let entry = per_terminal.entry(circuit.terminal().id()).or_insert((0.0, 0.0));
            entry.0 += flow.ingress();
            entry.1 += flow.egress();
        }
        for (&terminal_id, &(new_ingress, new_egress)) in &per_terminal {
            let (other_ingress, other_egress) = inner.used_by_others(terminal_id, self.id);
            let record = inner
                .find_terminal(terminal_id)
                .expect("circuit validated above to belong to this switch");
            if let Some(cap) = record.ingress_capacity {
                if other_ingress + new_ingress > cap {
                    return Err(Error::invalid_service(format!(
                        "terminal {} would exceed ingress capacity ({} + {} > {})",
                        record.terminal,
                        other_ingress,
                        new_ingress,
                        cap
                    )));
                }
            }
            if let Some(cap) = record.egress_capacity {
                if other_egress + new_egress > cap {
                    return Err(Error::invalid_service(format!(
                        "terminal {} would exceed egress capacity ({} + {} > {})",
                        record.terminal,
                        other_egress,
                        new_egress,
                        cap
                    )));
                }
            }
        }

        let svc = inner.services.get_mut(&self.id).expect("checked above");
        svc.segment = Some(sanitized);
        let wants_active = svc.intent == Intent::Active;

        log::debug!("switch {}: service {} defined", self.switch_name(), self.id);
        Self::emit(&mut inner, &self.switch.executor, self.id, Status::Establishing);
        Self::emit(&mut inner, &self.switch.executor, self.id, Status::Inactive);

        if wants_active {
            let svc = inner.services.get_mut(&self.id).expect("checked above");
            svc.active = true;
            Self::emit(&mut inner, &self.switch.executor, self.id, Status::Activating);
            Self::emit(&mut inner, &self.switch.executor, self.id, Status::Active);
        }
        Ok(())
    }

    fn activate(&self) -> Result<()> {
        let mut inner = self.switch.inner.lock();
        let svc = inner.services.get_mut(&self.id).ok_or_else(|| Error::illegal_state("service released"))?;
        if svc.released {
            return Err(Error::illegal_state("service already released"));
        }
        svc.intent = Intent::Active;
        let defined = svc.segment.is_some();
        let already_active = svc.active;
        if defined && !already_active {
            let svc = inner.services.get_mut(&self.id).unwrap();
            svc.active = true;
            Self::emit(&mut inner, &self.switch.executor, self.id, Status::Activating);
            Self::emit(&mut inner, &self.switch.executor, self.id, Status::Active);
        }
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        let mut inner = self.switch.inner.lock();
        let svc = inner.services.get_mut(&self.id).ok_or_else(|| Error::illegal_state("service released"))?;
        if svc.released {
            return Err(Error::illegal_state("service already released"));
        }
        if svc.intent != Intent::Release {
            svc.intent = Intent::Inactive;
        }
        let was_active = svc.active;
        if was_active {
            let svc = inner.services.get_mut(&self.id).unwrap();
            svc.active = false;
            Self::emit(&mut inner, &self.switch.executor, self.id, Status::Deactivating);
            Self::emit(&mut inner, &self.switch.executor, self.id, Status::Inactive);
        }
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let mut inner = self.switch.inner.lock();
        let svc = inner.services.get_mut(&self.id).ok_or_else(|| Error::illegal_state("service released"))?;
        if svc.released {
            return Err(Error::illegal_state("service already released"));
        }
        if svc.intent == Intent::Release {
            return Err(Error::illegal_state("reset after release"));
        }
        if svc.segment.is_none() {
            return Ok(());
        }
        let was_active = svc.active;
        if was_active {
            let svc = inner.services.get_mut(&self.id).unwrap();
            svc.active = false;
            Self::emit(&mut inner, &self.switch.executor, self.id, Status::Deactivating);
            Self::emit(&mut inner, &self.switch.executor, self.id, Status::Inactive);
        }
        let svc = inner.services.get_mut(&self.id).unwrap();
        svc.segment = None;
        svc.intent = Intent::Inactive;
        Self::emit(&mut inner, &self.switch.executor, self.id, Status::Releasing);
        Self::emit(&mut inner, &self.switch.executor, self.id, Status::Dormant);
        Ok(())
    }

    fn release(&self) {
        let mut inner = self.switch.inner.lock();
        let svc = match inner.services.get_mut(&self.id) {
            Some(s) => s,
            None => return,
        };
        if svc.released {
            return;
        }
        if svc.active {
            svc.active = false;
            Self::emit(&mut inner, &self.switch.executor, self.id, Status::Deactivating);
            Self::emit(&mut inner, &self.switch.executor, self.id, Status::Inactive);
        }
        let svc = inner.services.get_mut(&self.id).unwrap();
        svc.intent = Intent::Release;
        Self::emit(&mut inner, &self.switch.executor, self.id, Status::Releasing);

        let handle = svc.handle.clone();
        svc.released = true;
        svc.listeners.clear();
        Self::emit(&mut inner, &self.switch.executor, self.id, Status::Released);

        inner.services.remove(&self.id);
        if let Some(h) = handle {
            inner.handles.remove(&h);
        }
        log::debug!("switch {}: service {} released", self.switch_name(), self.id);
    }

    fn add_listener(&self, listener: Arc<dyn Listener>) {
        let mut inner = self.switch.inner.lock();
        if let Some(svc) = inner.services.get_mut(&self.id) {
            svc.listeners.push(listener);
        }
    }

    fn errors(&self) -> Vec<String> {
        // Switch-side services never delegate further; admission failures
        // surface synchronously from `define`, so there is nothing to
        // accumulate here.
        Vec::new()
    }
}

impl SwitchServiceHandle {
    fn switch_name(&self) -> &str {
        &self.switch.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{Circuit, Terminal, TrafficFlow};

    fn make() -> (Arc<Switch>, Terminal) {
        let sw = Switch::new("sw1");
        let t1 = sw.add_terminal("t1", None).unwrap();
        (sw, t1)
    }

    #[test]
    fn define_activate_release_sequence() {
        let (sw, t1) = make();
        let svc = sw.new_service(None, None).unwrap();
        assert_eq!(svc.status(), Status::Dormant);

        let mut seg = Segment::new();
        seg.insert(Circuit::new(t1.clone(), 1), TrafficFlow::new(5.0, 5.0).unwrap());
        svc.define(seg).unwrap();
        assert_eq!(svc.status(), Status::Inactive);

        svc.activate().unwrap();
        assert_eq!(svc.status(), Status::Active);

        svc.deactivate().unwrap();
        assert_eq!(svc.status(), Status::Inactive);

        svc.release();
        assert_eq!(svc.status(), Status::Released);
    }

    #[test]
    fn activate_before_define_is_applied_on_define() {
        let (sw, t1) = make();
        let svc = sw.new_service(None, None).unwrap();
        svc.activate().unwrap();
        assert_eq!(svc.status(), Status::Dormant, "activate before define has nothing to activate yet");

        let mut seg = Segment::new();
        seg.insert(Circuit::new(t1, 1), TrafficFlow::new(1.0, 1.0).unwrap());
        svc.define(seg).unwrap();
        assert_eq!(svc.status(), Status::Active, "deferred activate applies once defined");
    }

    #[test]
    fn release_from_active_always_reaches_released() {
        let (sw, t1) = make();
        let svc = sw.new_service(None, None).unwrap();
        let mut seg = Segment::new();
        seg.insert(Circuit::new(t1, 1), TrafficFlow::new(1.0, 1.0).unwrap());
        svc.define(seg).unwrap();
        svc.activate().unwrap();
        svc.release();
        assert_eq!(svc.status(), Status::Released);
    }

    #[test]
    fn define_rejects_foreign_circuit() {
        let (sw, _t1) = make();
        let foreign = Terminal::new_atomic("elsewhere");
        let svc = sw.new_service(None, None).unwrap();
        let mut seg = Segment::new();
        seg.insert(Circuit::new(foreign, 1), TrafficFlow::new(1.0, 1.0).unwrap());
        assert!(matches!(svc.define(seg), Err(Error::InvalidService(_))));
    }
}
