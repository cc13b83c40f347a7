//! The aggregator service state machine: sub-service fanout, status
//! aggregation, intent reconciliation, and the release/abort flow.
//!
//! A sub-client never holds a strong reference back to its parent
//! aggregator — its [`SubForwarder`] listener carries only a `Weak`, and
//! drops even that once its sub-service reaches `RELEASED`, so no cycle
//! outlives the parent service (design notes, "cyclic references").

use std::sync::{Arc, Weak};

use parking_lot::Mutex as PlMutex;

use crate::error::{Error, Result};
use crate::identity::Circuit;
use crate::listener::Listener;
use crate::network::Service;
use crate::segment::{sanitize, Segment};
use crate::status::{Intent, Status};

use super::{planner, Aggregator, Inner};

const MIN_PROD: f64 = 0.01;

struct SubClient {
    service: Arc<dyn Service>,
    last_stable: Status,
    ever_failed: bool,
}

pub(super) struct AggregatorServiceState {
    pub(super) handle: Option<String>,
    intent: Intent,
    segment: Option<Segment>,
    tunnels: Vec<(u64, Circuit)>,
    sub_clients: Vec<SubClient>,
    activation_issued: bool,
    /// Set by `release()` when it had to deactivate still-active
    /// sub-services before the actual release flow can begin; cleared
    /// once that deactivation completes and `begin_release` runs.
    pending_release_after_deactivate: bool,
    /// Set by `reset()` when it had to deactivate still-active
    /// sub-services before the teardown proper can begin; cleared once
    /// that deactivation completes and `begin_reset` runs.
    pending_reset_after_deactivate: bool,
    /// Set for the duration of a `reset()` call: from the moment it is
    /// invoked until `finish_reset` clears the definition and emits
    /// `DORMANT`. A second `reset()` call while one is already in flight
    /// is a no-op.
    reset_in_progress: bool,
    cascade_triggered: bool,
    errors: Vec<String>,
    last_emitted: Option<Status>,
    listeners: Vec<Arc<dyn Listener>>,
}

impl AggregatorServiceState {
    pub(super) fn new(handle: Option<String>) -> AggregatorServiceState {
        AggregatorServiceState {
            handle,
            intent: Intent::Inactive,
            segment: None,
            tunnels: Vec::new(),
            sub_clients: Vec::new(),
            activation_issued: false,
            pending_release_after_deactivate: false,
            pending_reset_after_deactivate: false,
            reset_in_progress: false,
            cascade_triggered: false,
            errors: Vec::new(),
            last_emitted: None,
            listeners: Vec::new(),
        }
    }

    /// `(dormantCount, inactiveCount, activeCount, failedCount,
    /// releasedCount)`. `failedCount` is sticky (a sub-client that ever
    /// reported `FAILED` stays counted there even after later reporting
    /// `RELEASED`); the others reflect only the current `last_stable`.
    fn counts(&self) -> (usize, usize, usize, usize, usize) {
        let mut c = (0, 0, 0, 0, 0);
        for sc in &self.sub_clients {
            if sc.ever_failed {
                c.3 += 1;
            }
            match sc.last_stable {
                Status::Dormant if !sc.ever_failed => c.0 += 1,
                Status::Inactive if !sc.ever_failed => c.1 += 1,
                Status::Active if !sc.ever_failed => c.2 += 1,
                Status::Released => c.4 += 1,
                _ => {}
            }
        }
        c
    }

    fn derive(&self) -> Status {
        let n = self.sub_clients.len();
        let (dormant, _inactive, active, failed, released) = self.counts();
        if self.intent == Intent::Release {
            return if n == 0 || released == n { Status::Released } else { Status::Releasing };
        }
        if failed > 0 {
            return Status::Failed;
        }
        if self.segment.is_none() {
            return Status::Dormant;
        }
        if dormant > 0 {
            return Status::Establishing;
        }
        if self.intent == Intent::Active {
            return if active < n { Status::Activating } else { Status::Active };
        }
        if active > 0 {
            Status::Deactivating
        } else {
            Status::Inactive
        }
    }
}

/// A listener installed on one sub-service, forwarding its status reports
/// back to the parent aggregator service. Carries only a `Weak` reference
/// and clears even that once the sub-service reaches `RELEASED`.
struct SubForwarder {
    aggregator: PlMutex<Option<Weak<Aggregator>>>,
    service_id: u64,
    sub_service_id: u64,
}

impl Listener for SubForwarder {
    fn on_status(&self, status: Status) {
        let weak = {
            let mut guard = self.aggregator.lock();
            if status == Status::Released {
                guard.take()
            } else {
                guard.clone()
            }
        };
        if let Some(weak) = weak {
            if let Some(aggregator) = weak.upgrade() {
                AggregatorServiceHandle::on_sub_status(&aggregator, self.service_id, self.sub_service_id, status);
            }
        }
    }
}

/// The public handle to one aggregator-side service.
pub struct AggregatorServiceHandle {
    aggregator: Arc<Aggregator>,
    id: u64,
}

impl AggregatorServiceHandle {
    pub(super) fn new(aggregator: Arc<Aggregator>, id: u64) -> AggregatorServiceHandle {
        AggregatorServiceHandle { aggregator, id }
    }

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

    /// Re-derives and emits the current status for `id`, with no other
    /// side effects. Safe to call after any state mutation.
    fn emit_derived(inner: &mut Inner, executor: &Arc<crate::executor::Executor>, id: u64) {
        let status = match inner.services.get(&id) {
            Some(s) => s.derive(),
            None => return,
        };
        Self::emit(inner, executor, id, status);
    }

    /// Returns all tunnels a service holds to their trunks and clears the
    /// service's own record of them.
    fn release_tunnels(inner: &mut Inner, id: u64) {
        let tunnels = match inner.services.get_mut(&id) {
            Some(s) => std::mem::take(&mut s.tunnels),
            None => return,
        };
        for (trunk_id, start_circuit) in tunnels {
            if let Some(record) = inner.trunks.get_mut(&trunk_id) {
                if let Err(e) = record.trunk.release_tunnel(start_circuit.label(), false) {
                    log::warn!("aggregator: releasing tunnel on trunk {} failed: {}", trunk_id, e);
                }
            }
        }
    }

    /// Runs the release procedure proper: emits `RELEASING`, returns
    /// tunnels, and propagates `release()` to every sub-service.
    fn begin_release(aggregator: &Arc<Aggregator>, id: u64) {
        let mut inner = aggregator.inner.lock();
        {
            let svc = match inner.services.get_mut(&id) {
                Some(s) => s,
                None => return,
            };
            svc.intent = Intent::Release;
        }
        Self::emit(&mut inner, &aggregator.executor, id, Status::Releasing);
        Self::release_tunnels(&mut inner, id);

        let subs: Vec<Arc<dyn Service>> = inner
            .services
            .get(&id)
            .map(|s| s.sub_clients.iter().map(|sc| sc.service.clone()).collect())
            .unwrap_or_default();
        for sub in &subs {
            sub.release();
        }

        if subs.is_empty() {
            drop(inner);
            Self::finish_release(aggregator, id);
        }
    }

    /// Clears the service entirely and emits the final `RELEASED`.
    fn finish_release(aggregator: &Arc<Aggregator>, id: u64) {
        let mut inner = aggregator.inner.lock();
        Self::emit(&mut inner, &aggregator.executor, id, Status::Released);
        if let Some(svc) = inner.services.remove(&id) {
            if let Some(h) = svc.handle {
                inner.handles.remove(&h);
            }
        }
    }

    /// Runs the reset teardown proper: emits `RELEASING`, returns
    /// tunnels, and releases every sub-service — unlike `begin_release`,
    /// the service itself is kept: `finish_reset` leaves it usable again.
    fn begin_reset(aggregator: &Arc<Aggregator>, id: u64) {
        let mut inner = aggregator.inner.lock();
        Self::emit(&mut inner, &aggregator.executor, id, Status::Releasing);
        Self::release_tunnels(&mut inner, id);

        let subs: Vec<Arc<dyn Service>> = inner
            .services
            .get(&id)
            .map(|s| s.sub_clients.iter().map(|sc| sc.service.clone()).collect())
            .unwrap_or_default();
        for sub in &subs {
            sub.release();
        }

        if subs.is_empty() {
            drop(inner);
            Self::finish_reset(aggregator, id);
        }
    }

    /// Clears the definition and sub-clients, then emits `DORMANT`. The
    /// service remains registered and may be `define`d again.
    fn finish_reset(aggregator: &Arc<Aggregator>, id: u64) {
        let mut inner = aggregator.inner.lock();
        if let Some(svc) = inner.services.get_mut(&id) {
            svc.intent = Intent::Inactive;
            svc.segment = None;
            svc.tunnels.clear();
            svc.sub_clients.clear();
            svc.activation_issued = false;
            svc.pending_reset_after_deactivate = false;
            svc.reset_in_progress = false;
            svc.cascade_triggered = false;
            svc.errors.clear();
        }
        Self::emit(&mut inner, &aggregator.executor, id, Status::Dormant);
    }

    /// Called from a sub-service's listener (via [`SubForwarder`], off the
    /// aggregator's mutex) whenever a sub-service reports a new status.
    fn on_sub_status(aggregator: &Arc<Aggregator>, service_id: u64, sub_service_id: u64, status: Status) {
        if !status.is_stable() || status == Status::Dormant {
            // Transitional and DORMANT reports never move counters.
            return;
        }

        let mut inner = aggregator.inner.lock();
        let svc = match inner.services.get_mut(&service_id) {
            Some(s) => s,
            None => return,
        };
        let sub_errors = match svc.sub_clients.iter_mut().find(|sc| sc.service.id() == sub_service_id) {
            Some(sc) => {
                sc.last_stable = status;
                if status == Status::Failed {
                    sc.ever_failed = true;
                    Some(sc.service.errors())
                } else {
                    None
                }
            }
            None => return,
        };

        if let Some(errors) = sub_errors {
            svc.errors.extend(errors);
            if !svc.cascade_triggered {
                svc.cascade_triggered = true;
                if svc.intent != Intent::Release {
                    svc.intent = Intent::Abort;
                }
                let targets: Vec<Arc<dyn Service>> = svc
                    .sub_clients
                    .iter()
                    .filter(|sc| !matches!(sc.last_stable, Status::Failed | Status::Released))
                    .map(|sc| sc.service.clone())
                    .collect();
                Self::release_tunnels(&mut inner, service_id);
                for t in &targets {
                    let _ = t.deactivate();
                }
                Self::emit(&mut inner, &aggregator.executor, service_id, Status::Failed);
            }
            return;
        }

        // Not a failure report: re-check whether a pending action is now
        // due, then emit whatever status that leaves us in.
        let (dormant, inactive, _active, failed, released) = inner.services[&service_id].counts();
        let n = inner.services[&service_id].sub_clients.len();
        let intent = inner.services[&service_id].intent;
        let activation_issued = inner.services[&service_id].activation_issued;
        let pending_release = inner.services[&service_id].pending_release_after_deactivate;
        let pending_reset = inner.services[&service_id].pending_reset_after_deactivate;
        let reset_in_progress = inner.services[&service_id].reset_in_progress;
        let cascade_triggered = inner.services[&service_id].cascade_triggered;

        if cascade_triggered {
            if intent == Intent::Release && released == n && n > 0 {
                drop(inner);
                Self::finish_release(aggregator, service_id);
                return;
            }
            if reset_in_progress && pending_reset && inactive + failed == n {
                let svc = inner.services.get_mut(&service_id).unwrap();
                svc.pending_reset_after_deactivate = false;
                drop(inner);
                Self::begin_reset(aggregator, service_id);
                return;
            }
            if reset_in_progress && !pending_reset && released == n && n > 0 {
                drop(inner);
                Self::finish_reset(aggregator, service_id);
                return;
            }
        } else if intent == Intent::Active && dormant == 0 && !activation_issued {
            let svc = inner.services.get_mut(&service_id).unwrap();
            svc.activation_issued = true;
            let targets: Vec<Arc<dyn Service>> = svc.sub_clients.iter().map(|sc| sc.service.clone()).collect();
            Self::emit(&mut inner, &aggregator.executor, service_id, Status::Activating);
            for t in &targets {
                let _ = t.activate();
            }
        } else if intent == Intent::Release && pending_release && inactive + failed == n {
            let svc = inner.services.get_mut(&service_id).unwrap();
            svc.pending_release_after_deactivate = false;
            drop(inner);
            Self::begin_release(aggregator, service_id);
            return;
        } else if intent == Intent::Release && !pending_release && released == n && n > 0 {
            drop(inner);
            Self::finish_release(aggregator, service_id);
            return;
        } else if reset_in_progress && pending_reset && inactive + failed == n {
            let svc = inner.services.get_mut(&service_id).unwrap();
            svc.pending_reset_after_deactivate = false;
            drop(inner);
            Self::begin_reset(aggregator, service_id);
            return;
        } else if reset_in_progress && !pending_reset && released == n && n > 0 {
            drop(inner);
            Self::finish_reset(aggregator, service_id);
            return;
        }

        Self::emit_derived(&mut inner, &aggregator.executor, service_id);
    }
}

impl Service for AggregatorServiceHandle {
    fn id(&self) -> u64 {
        self.id
    }

    fn handle(&self) -> Option<String> {
        self.aggregator.inner.lock().services.get(&self.id).and_then(|s| s.handle.clone())
    }

    fn status(&self) -> Status {
        self.aggregator.inner.lock().services.get(&self.id).map(|s| s.derive()).unwrap_or(Status::Released)
    }

    fn define(&self, segment: Segment) -> Result<()> {
        let mut inner = self.aggregator.inner.lock();
        {
            let svc = inner.services.get(&self.id).ok_or_else(|| Error::illegal_state("service released"))?;
            if svc.intent == Intent::Release {
                return Err(Error::illegal_state("define after release"));
            }
            if svc.segment.is_some() {
                return Err(Error::illegal_state("service already defined"));
            }
        }
        for circuit in segment.circuits() {
            if !inner.exposed_ids.contains(&circuit.terminal().id()) {
                return Err(Error::invalid_service(format!(
                    "circuit {} does not reference a terminal of this aggregator",
                    circuit
                )));
            }
        }

        let sanitized = sanitize(&segment, MIN_PROD);
        let plan = planner::plan(&mut inner, &sanitized)?;

        let mut sub_clients = Vec::new();
        let mut failure: Option<Error> = None;
        for (network, sub_segment) in &plan.sub_segments {
            match network.new_service(None, None) {
                None => {
                    failure = Some(Error::invalid_service("inferior network rejected sub-service creation"));
                    break;
                }
                Some(sub_service) => {
                    let forwarder: Arc<dyn Listener> = Arc::new(SubForwarder {
                        aggregator: PlMutex::new(Some(Arc::downgrade(&self.aggregator))),
                        service_id: self.id,
                        sub_service_id: sub_service.id(),
                    });
                    sub_service.add_listener(forwarder);
                    if let Err(e) = sub_service.define(sub_segment.clone()) {
                        sub_service.release();
                        failure = Some(e);
                        break;
                    }
                    sub_clients.push(SubClient { service: sub_service, last_stable: Status::Dormant, ever_failed: false });
                }
            }
        }

        if let Some(e) = failure {
            for sc in &sub_clients {
                sc.service.release();
            }
            for tunnel in &plan.tunnels {
                if let Some(record) = inner.trunks.get_mut(&tunnel.trunk_id) {
                    let _ = record.trunk.release_tunnel(tunnel.start_circuit.label(), false);
                }
            }
            return Err(e);
        }

        let svc = inner.services.get_mut(&self.id).expect("checked above");
        svc.segment = Some(sanitized);
        svc.tunnels = plan.tunnels.iter().map(|t| (t.trunk_id, t.start_circuit.clone())).collect();
        svc.sub_clients = sub_clients;
        let wants_active = svc.intent == Intent::Active;

        log::debug!("aggregator {}: service {} defined", self.aggregator.name, self.id);
        Self::emit(&mut inner, &self.aggregator.executor, self.id, Status::Establishing);

        if wants_active {
            let dormant = inner.services[&self.id].counts().0;
            if dormant == 0 {
                let svc = inner.services.get_mut(&self.id).unwrap();
                svc.activation_issued = true;
                let targets: Vec<Arc<dyn Service>> = svc.sub_clients.iter().map(|sc| sc.service.clone()).collect();
                Self::emit(&mut inner, &self.aggregator.executor, self.id, Status::Activating);
                for t in &targets {
                    let _ = t.activate();
                }
            }
        }
        Self::emit_derived(&mut inner, &self.aggregator.executor, self.id);
        Ok(())
    }

    fn activate(&self) -> Result<()> {
        let mut inner = self.aggregator.inner.lock();
        let svc = inner.services.get_mut(&self.id).ok_or_else(|| Error::illegal_state("service released"))?;
        if svc.counts().3 > 0 {
            return Err(Error::illegal_state("activate after failure"));
        }
        if svc.intent == Intent::Release {
            return Err(Error::illegal_state("activate after release"));
        }
        svc.intent = Intent::Active;

        let defined = svc.segment.is_some();
        let dormant = svc.counts().0;
        if defined && dormant == 0 && !svc.activation_issued {
            svc.activation_issued = true;
            let targets: Vec<Arc<dyn Service>> = svc.sub_clients.iter().map(|sc| sc.service.clone()).collect();
            Self::emit(&mut inner, &self.aggregator.executor, self.id, Status::Activating);
            for t in &targets {
                let _ = t.activate();
            }
        }
        Self::emit_derived(&mut inner, &self.aggregator.executor, self.id);
        Ok(())
    }

    fn deactivate(&self) -> Result<()> {
        let mut inner = self.aggregator.inner.lock();
        let svc = inner.services.get_mut(&self.id).ok_or_else(|| Error::illegal_state("service released"))?;
        if svc.intent != Intent::Release {
            svc.intent = Intent::Inactive;
        }
        svc.activation_issued = false;
        let targets: Vec<Arc<dyn Service>> = svc
            .sub_clients
            .iter()
            .filter(|sc| !matches!(sc.last_stable, Status::Inactive | Status::Failed | Status::Released))
            .map(|sc| sc.service.clone())
            .collect();
        for t in &targets {
            let _ = t.deactivate();
        }
        Self::emit_derived(&mut inner, &self.aggregator.executor, self.id);
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        let aggregator = self.aggregator.clone();
        let id = self.id;
        let mut inner = aggregator.inner.lock();
        let svc = inner.services.get_mut(&id).ok_or_else(|| Error::illegal_state("service released"))?;
        if svc.intent == Intent::Release {
            return Err(Error::illegal_state("reset after release"));
        }
        if svc.segment.is_none() {
            return Ok(());
        }
        if svc.reset_in_progress {
            // A reset is already in flight; let it run to completion.
            return Ok(());
        }
        svc.reset_in_progress = true;
        let active_count = svc.counts().2;
        if active_count > 0 {
            svc.pending_reset_after_deactivate = true;
            Self::emit(&mut inner, &aggregator.executor, id, Status::Deactivating);
            let targets: Vec<Arc<dyn Service>> = inner.services[&id]
                .sub_clients
                .iter()
                .filter(|sc| !matches!(sc.last_stable, Status::Inactive | Status::Failed | Status::Released))
                .map(|sc| sc.service.clone())
                .collect();
            for t in &targets {
                let _ = t.deactivate();
            }
            drop(inner);
        } else {
            drop(inner);
            Self::begin_reset(&aggregator, id);
        }
        Ok(())
    }

    fn release(&self) {
        let aggregator = self.aggregator.clone();
        let id = self.id;
        let mut inner = aggregator.inner.lock();
        let svc = match inner.services.get_mut(&id) {
            Some(s) => s,
            None => return,
        };
        if svc.intent == Intent::Release {
            return;
        }
        let active_count = svc.counts().2;
        if svc.intent == Intent::Active && active_count > 0 {
            svc.intent = Intent::Release;
            svc.pending_release_after_deactivate = true;
            Self::emit(&mut inner, &aggregator.executor, id, Status::Deactivating);
            let targets: Vec<Arc<dyn Service>> = inner.services[&id]
                .sub_clients
                .iter()
                .filter(|sc| !matches!(sc.last_stable, Status::Inactive | Status::Failed | Status::Released))
                .map(|sc| sc.service.clone())
                .collect();
            for t in &targets {
                let _ = t.deactivate();
            }
            drop(inner);
        } else {
            drop(inner);
            Self::begin_release(&aggregator, id);
        }
    }

    fn add_listener(&self, listener: Arc<dyn Listener>) {
        let mut inner = self.aggregator.inner.lock();
        if let Some(svc) = inner.services.get_mut(&self.id) {
            svc.listeners.push(listener);
        }
    }

    fn errors(&self) -> Vec<String> {
        self.aggregator.inner.lock().services.get(&self.id).map(|s| s.errors.clone()).unwrap_or_default()
    }
}
