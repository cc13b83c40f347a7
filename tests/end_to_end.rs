//! End-to-end scenarios exercising the aggregator/switch/trunk/service
//! machinery together, one `#[test]` per numbered scenario.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use netfabric::executor::Executor;
use netfabric::switch::BandwidthChange;
use netfabric::{
    AuthToken, Aggregator, ChordMetrics, Circuit, Edge, Error, Listener, Network, Segment,
    Service, Status, Switch, Terminal, TrafficFlow,
};

/// Collects every status reported to it, in delivery order.
#[derive(Default)]
struct Recorder(Mutex<Vec<Status>>);

impl Listener for Recorder {
    fn on_status(&self, status: Status) {
        self.0.lock().unwrap().push(status);
    }
}

impl Recorder {
    fn new() -> Arc<Recorder> {
        Arc::new(Recorder::default())
    }

    /// Gives the background executor thread a moment to drain pending
    /// notifications before inspecting what was recorded.
    fn settle(&self) -> Vec<Status> {
        thread::sleep(Duration::from_millis(150));
        self.0.lock().unwrap().clone()
    }
}

#[test]
fn single_trunk_two_terminal_service() {
    let agg = Aggregator::new("A");
    let s1 = Switch::new("S1");
    let s2 = Switch::new("S2");
    agg.add_inferior_network(s1.clone());
    agg.add_inferior_network(s2.clone());

    let t1 = s1.add_terminal("t1", None).unwrap();
    let t2 = s2.add_terminal("t2", None).unwrap();
    s1.modify_bandwidth("t1", Some(BandwidthChange::Set(Some(10.0))), Some(BandwidthChange::Set(Some(10.0)))).unwrap();
    s2.modify_bandwidth("t2", Some(BandwidthChange::Set(Some(10.0))), Some(BandwidthChange::Set(Some(10.0)))).unwrap();

    let trunk = agg.add_trunk(t1.clone(), t2.clone(), 0.001).unwrap();
    trunk.define_label_range(1, 8, 1).unwrap();
    trunk.provide_bandwidth(10.0, 10.0).unwrap();

    let a_t1 = agg.expose_terminal("A.T1", t1).unwrap();
    let a_t2 = agg.expose_terminal("A.T2", t2).unwrap();

    let svc = agg.new_service(None, None).unwrap();
    let rec = Recorder::new();
    svc.add_listener(rec.clone());

    let mut seg = Segment::new();
    seg.insert(Circuit::new(a_t1, 1), TrafficFlow::new(5.0, 2.0).unwrap());
    seg.insert(Circuit::new(a_t2, 1), TrafficFlow::new(5.0, 2.0).unwrap());
    svc.define(seg).unwrap();

    let after_define = rec.settle();
    assert_eq!(after_define, vec![Status::Establishing, Status::Inactive]);

    svc.activate().unwrap();
    let after_activate = rec.settle();
    assert_eq!(&after_activate[after_define.len()..], &[Status::Activating, Status::Active]);

    svc.release();
    let after_release = rec.settle();
    assert_eq!(after_release.last().copied(), Some(Status::Released));
    assert!(after_release.contains(&Status::Deactivating));
    assert!(after_release.contains(&Status::Releasing));

    // The tunnel's 2/2 bandwidth must have been fully returned: a full
    // withdrawal of the trunk's original capacity must now succeed.
    trunk.withdraw_bandwidth(10.0, 10.0).unwrap();
}

#[test]
fn asymmetric_bandwidth_admission_failure() {
    let agg = Aggregator::new("A");
    let s1 = Switch::new("S1");
    let s2 = Switch::new("S2");
    agg.add_inferior_network(s1.clone());
    agg.add_inferior_network(s2.clone());

    let t1 = s1.add_terminal("t1", None).unwrap();
    let t2 = s2.add_terminal("t2", None).unwrap();

    let trunk = agg.add_trunk(t1.clone(), t2.clone(), 0.001).unwrap();
    trunk.define_label_range(1, 8, 1).unwrap();
    // Upstream has plenty; downstream is starved — a symmetric 5/5 request
    // must be rejected rather than silently clamped.
    trunk.provide_bandwidth(5.0, 1.0).unwrap();

    let a_t1 = agg.expose_terminal("A.T1", t1).unwrap();
    let a_t2 = agg.expose_terminal("A.T2", t2).unwrap();

    let svc = agg.new_service(None, None).unwrap();
    let mut seg = Segment::new();
    seg.insert(Circuit::new(a_t1, 1), TrafficFlow::new(5.0, 5.0).unwrap());
    seg.insert(Circuit::new(a_t2, 1), TrafficFlow::new(5.0, 5.0).unwrap());

    let err = svc.define(seg).unwrap_err();
    assert!(matches!(err, Error::InvalidService(_)));

    // No tunnel was allocated: the full original capacity is still there
    // to withdraw.
    trunk.withdraw_bandwidth(5.0, 1.0).unwrap();
}

#[test]
fn capacity_rejection_at_switch() {
    let sw = Switch::new("S1");
    let t1 = sw.add_terminal("t1", None).unwrap();
    sw.modify_bandwidth("t1", Some(BandwidthChange::Set(Some(3.0))), None).unwrap();

    let svc1 = sw.new_service(None, None).unwrap();
    let mut seg1 = Segment::new();
    seg1.insert(Circuit::new(t1.clone(), 1), TrafficFlow::new(2.0, 0.0).unwrap());
    svc1.define(seg1).unwrap();
    assert_eq!(svc1.status(), Status::Inactive);

    let svc2 = sw.new_service(None, None).unwrap();
    let mut seg2 = Segment::new();
    seg2.insert(Circuit::new(t1, 2), TrafficFlow::new(2.0, 0.0).unwrap());
    let err = svc2.define(seg2).unwrap_err();
    match err {
        Error::InvalidService(msg) => assert!(msg.contains("ingress capacity"), "message was: {}", msg),
        other => panic!("expected InvalidService, got {:?}", other),
    }
}

/// A minimal inferior network whose single service can be driven to
/// `FAILED` directly, standing in for a real switch/aggregator service
/// suffering a fault the aggregator must cascade from. Listener delivery
/// runs through its own [`Executor`] (never synchronously) for the same
/// reason every real `Network` implementation in this crate does: a
/// sub-service's `define`/`activate`/`release` is called while the
/// aggregator still holds its own mutex, and a synchronous callback into
/// `on_sub_status` from that same call would deadlock reacquiring it.
struct FakeService {
    id: u64,
    handle: Option<String>,
    executor: Arc<Executor>,
    listeners: Mutex<Vec<Arc<dyn Listener>>>,
    status: Mutex<Status>,
    errors: Mutex<Vec<String>>,
}

impl FakeService {
    fn notify(&self, status: Status) {
        *self.status.lock().unwrap() = status;
        for listener in self.listeners.lock().unwrap().iter().cloned() {
            self.executor.spawn(move || listener.on_status(status));
        }
    }

    fn force_fail(&self, reason: &str) {
        self.errors.lock().unwrap().push(reason.to_string());
        self.notify(Status::Failed);
    }
}

impl Service for FakeService {
    fn id(&self) -> u64 {
        self.id
    }

    fn handle(&self) -> Option<String> {
        self.handle.clone()
    }

    fn status(&self) -> Status {
        *self.status.lock().unwrap()
    }

    fn define(&self, _segment: Segment) -> netfabric::Result<()> {
        self.notify(Status::Establishing);
        self.notify(Status::Inactive);
        Ok(())
    }

    fn activate(&self) -> netfabric::Result<()> {
        self.notify(Status::Activating);
        self.notify(Status::Active);
        Ok(())
    }

    fn deactivate(&self) -> netfabric::Result<()> {
        self.notify(Status::Deactivating);
        self.notify(Status::Inactive);
        Ok(())
    }

    fn reset(&self) -> netfabric::Result<()> {
        self.notify(Status::Releasing);
        self.notify(Status::Dormant);
        Ok(())
    }

    fn release(&self) {
        self.notify(Status::Releasing);
        self.notify(Status::Released);
    }

    fn add_listener(&self, listener: Arc<dyn Listener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

struct FakeNetwork {
    name: String,
    terminal: Terminal,
    executor: Arc<Executor>,
    services: Mutex<HashMap<u64, Arc<FakeService>>>,
    next_id: Mutex<u64>,
}

impl FakeNetwork {
    fn new(name: &str) -> (Arc<FakeNetwork>, Terminal) {
        let terminal = Terminal::new_atomic(format!("{}.t", name));
        let net = Arc::new(FakeNetwork {
            name: name.to_string(),
            terminal: terminal.clone(),
            executor: Executor::new(),
            services: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
        });
        (net, terminal)
    }

    fn only_service(&self) -> Arc<FakeService> {
        let services = self.services.lock().unwrap();
        assert_eq!(services.len(), 1);
        services.values().next().unwrap().clone()
    }
}

impl Network for FakeNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_terminal(&self, name: &str) -> Option<Terminal> {
        if self.terminal.name() == name {
            Some(self.terminal.clone())
        } else {
            None
        }
    }

    fn get_terminals(&self) -> Vec<Terminal> {
        vec![self.terminal.clone()]
    }

    fn new_service(&self, handle: Option<String>, _auth_token: Option<AuthToken>) -> Option<Arc<dyn Service>> {
        let mut services = self.services.lock().unwrap();
        let mut next_id = self.next_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        let svc = Arc::new(FakeService {
            id,
            handle,
            executor: self.executor.clone(),
            listeners: Mutex::new(Vec::new()),
            status: Mutex::new(Status::Dormant),
            errors: Mutex::new(Vec::new()),
        });
        services.insert(id, svc.clone());
        Some(svc)
    }

    fn get_service(&self, id: u64) -> Option<Arc<dyn Service>> {
        self.services.lock().unwrap().get(&id).map(|s| s.clone() as Arc<dyn Service>)
    }

    fn get_service_by_handle(&self, handle: &str) -> Option<Arc<dyn Service>> {
        self.services
            .lock()
            .unwrap()
            .values()
            .find(|s| s.handle.as_deref() == Some(handle))
            .map(|s| s.clone() as Arc<dyn Service>)
    }

    fn get_service_ids(&self) -> Vec<u64> {
        self.services.lock().unwrap().keys().copied().collect()
    }

    fn get_model(&self, _min_bandwidth: f64) -> HashMap<Edge, ChordMetrics> {
        HashMap::new()
    }
}

#[test]
fn sub_service_failure_cascades() {
    let agg = Aggregator::new("A");
    let (net1, t1) = FakeNetwork::new("N1");
    let (net2, t2) = FakeNetwork::new("N2");
    agg.add_inferior_network(net1.clone());
    agg.add_inferior_network(net2.clone());

    let trunk = agg.add_trunk(t1.clone(), t2.clone(), 0.001).unwrap();
    trunk.define_label_range(1, 8, 1).unwrap();
    trunk.provide_bandwidth(10.0, 10.0).unwrap();

    let a_t1 = agg.expose_terminal("A.T1", t1).unwrap();
    let a_t2 = agg.expose_terminal("A.T2", t2).unwrap();

    let svc = agg.new_service(None, None).unwrap();
    let rec = Recorder::new();
    svc.add_listener(rec.clone());

    let mut seg = Segment::new();
    seg.insert(Circuit::new(a_t1, 1), TrafficFlow::new(5.0, 2.0).unwrap());
    seg.insert(Circuit::new(a_t2, 1), TrafficFlow::new(5.0, 2.0).unwrap());
    svc.define(seg).unwrap();
    svc.activate().unwrap();
    rec.settle();

    let sub1 = net1.only_service();
    let sub2 = net2.only_service();
    assert_eq!(sub1.status(), Status::Active);
    assert_eq!(sub2.status(), Status::Active);

    sub2.force_fail("simulated fault");
    rec.settle();

    assert_eq!(svc.status(), Status::Failed);
    assert_eq!(svc.errors(), vec!["simulated fault".to_string()]);
    // The surviving sub-service must have been told to stand down.
    assert_eq!(sub1.status(), Status::Inactive);

    let statuses = rec.settle();
    assert_eq!(statuses.iter().filter(|&&s| s == Status::Failed).count(), 1, "FAILED must be emitted exactly once");

    // The trunk's tunnel must have been released: a full withdrawal of
    // its original bandwidth now succeeds.
    trunk.withdraw_bandwidth(10.0, 10.0).unwrap();

    svc.release();
    let after_release = rec.settle();
    assert!(after_release.contains(&Status::Releasing));
    assert_eq!(after_release.last().copied(), Some(Status::Released));
}

#[test]
fn handle_uniqueness() {
    let sw = Switch::new("S1");
    let first = sw.new_service(Some("h".into()), None);
    assert!(first.is_some());
    let second = sw.new_service(Some("h".into()), None);
    assert!(second.is_none());

    let by_handle = sw.get_service_by_handle("h").unwrap();
    assert_eq!(by_handle.id(), first.unwrap().id());
}

#[test]
fn label_bijection_defense() {
    let agg = Aggregator::new("A");
    let s1 = Switch::new("S1");
    let s2 = Switch::new("S2");
    agg.add_inferior_network(s1.clone());
    agg.add_inferior_network(s2.clone());
    let t1 = s1.add_terminal("t1", None).unwrap();
    let t2 = s2.add_terminal("t2", None).unwrap();

    let trunk = agg.add_trunk(t1.clone(), t2.clone(), 0.001).unwrap();
    trunk.define_label_range(0, 4, 10).unwrap();
    let err = trunk.define_label_range(2, 2, 20).unwrap_err();
    assert!(matches!(err, Error::NameInUse(_)));
    // State must be unchanged by the rejected overlapping range.
    let peer = trunk.peer(&Circuit::new(t1.clone(), 2)).unwrap().unwrap();
    assert_eq!(peer.label(), 12);

    trunk.define_label_range(4, 4, 14).unwrap();
    let peer = trunk.peer(&Circuit::new(t1, 5)).unwrap().unwrap();
    assert_eq!(peer.terminal().id(), t2.id());
    assert_eq!(peer.label(), 15);
}
