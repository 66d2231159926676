/// End-to-end recovery scenarios against the simulated firmware.
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::fixtures::{fast_config, port_wwpn, TestRig, NS_WWPN};
use fc_recovery::sim::{SimFault, SimTransport};
use fc_recovery::trace::TraceEvent;
use fc_recovery::{
    ErpEngine, ErpError, FabricTopology, HwRequestKind, Status, TargetRef, Transport, Wwpn,
};

#[test]
fn test_unit_reopen_on_healthy_stack() {
    let rig = TestRig::fabric(1, 1);
    let unit = rig.unit(0, 0);

    rig.engine
        .request_reopen(&TargetRef::Unit(Arc::clone(&unit)), Status::empty(), "test")
        .unwrap();
    rig.settle();

    // The unit was not open, so the close step is skipped entirely.
    assert_eq!(rig.sim.count(HwRequestKind::CloseUnit), 0);
    assert_eq!(rig.sim.count(HwRequestKind::OpenUnit), 1);

    let status = unit.status().load();
    assert!(status.contains(Status::OPEN));
    assert!(status.contains(Status::UNBLOCKED));

    // A unit success generates no follow-up actions.
    assert!(rig.engine.trace().by_event(TraceEvent::FollowUp).is_empty());

    // The port was never touched.
    assert!(!rig.port(0).status().contains(Status::OPEN));
}

#[test]
fn test_port_failure_ladder_ends_in_permanent_failure() {
    // Retry max is 2 (fast_config): the third port-level failure marks the
    // port permanently failed. Point-to-point keeps the name server out of
    // the picture.
    let rig = TestRig::point_to_point(1);
    rig.sim.inject(SimFault::Fail, HwRequestKind::OpenPort, 10);

    let port = rig.port(0);
    rig.engine
        .request_reopen(&TargetRef::Port(Arc::clone(&port)), Status::empty(), "test")
        .unwrap();
    rig.settle();

    let status = port.status().load();
    assert!(status.contains(Status::ERP_FAILED));
    assert!(!status.contains(Status::UNBLOCKED));
    assert!(!status.contains(Status::OPEN));

    // The failure ladder: port open failed, forced reopen failed (nothing
    // physically open), adapter recovered, port open failed again.
    let admitted: Vec<_> = rig
        .engine
        .trace()
        .by_event(TraceEvent::Admitted)
        .iter()
        .map(|r| r.detail.clone())
        .collect();
    assert!(admitted.contains(&"reopen-port-forced".to_string()));
    assert!(admitted.contains(&"reopen-adapter".to_string()));
    assert_eq!(rig.sim.count(HwRequestKind::OpenPort), 2);

    // A later unit reopen escalates to the failed port and is refused;
    // the failure propagates to the unit.
    let unit = rig.unit(0, 0);
    let result = rig
        .engine
        .request_reopen(&TargetRef::Unit(Arc::clone(&unit)), Status::empty(), "test");
    assert!(matches!(result, Err(ErpError::TargetFailed(_))));
    assert!(unit.status().contains(Status::ERP_FAILED));
    assert!(!unit.status().contains(Status::UNBLOCKED));
}

#[test]
fn test_adapter_success_fans_out_to_ports_and_units() {
    let rig = TestRig::fabric(2, 1);

    rig.engine
        .request_reopen(
            &TargetRef::Adapter(Arc::clone(&rig.adapter)),
            Status::empty(),
            "test",
        )
        .unwrap();
    rig.settle();

    // Exactly two port follow-ups (the name server is opened on demand,
    // not fanned out to) and one unit follow-up per port.
    let follow_ups = rig.engine.trace().by_event(TraceEvent::FollowUp);
    let port_follow_ups = follow_ups.iter().filter(|r| r.detail == "reopen-port").count();
    let unit_follow_ups = follow_ups.iter().filter(|r| r.detail == "reopen-unit").count();
    assert_eq!(port_follow_ups, 2);
    assert_eq!(unit_follow_ups, 2);

    for i in 0..2 {
        let port = rig.port(i);
        assert!(port.status().contains(Status::OPEN), "port {} not open", i);
        assert!(port.status().contains(Status::UNBLOCKED));
        let unit = rig.unit(i, 0);
        assert!(unit.status().contains(Status::OPEN), "unit {} not open", i);
        assert!(unit.status().contains(Status::UNBLOCKED));
    }

    let (downs, ups) = rig.sim.queue_cycles();
    assert_eq!((downs, ups), (1, 1));
    assert_eq!(rig.sim.buffer_refills(), 1);
}

#[test]
fn test_port_parks_until_nameserver_recovery_succeeds() {
    let rig = TestRig::fabric(1, 0);
    let port = rig.port(0);

    rig.engine
        .request_reopen(&TargetRef::Port(Arc::clone(&port)), Status::empty(), "test")
        .unwrap();
    rig.settle();

    assert!(port.status().contains(Status::OPEN));
    assert_eq!(port.did(), Some(common::fixtures::port_did(0)));
    assert!(rig
        .adapter
        .nameserver_port()
        .unwrap()
        .status()
        .contains(Status::OPEN));

    // The GID_PN lookup must happen exactly once, strictly after the
    // name-server port opened, and the port open strictly after that.
    let calls = rig.sim.calls();
    assert_eq!(
        calls,
        vec![
            HwRequestKind::OpenPort,
            HwRequestKind::NameServerLookup,
            HwRequestKind::OpenPort,
        ]
    );
}

#[test]
fn test_request_timeout_is_retried_through_the_ladder() {
    let rig = TestRig::fabric(1, 1);
    rig.sim.inject(SimFault::Timeout, HwRequestKind::OpenUnit, 1);

    let unit = rig.unit(0, 0);
    rig.engine
        .request_reopen(&TargetRef::Unit(Arc::clone(&unit)), Status::empty(), "test")
        .unwrap();
    rig.settle();

    // First open never completed; its deadline fired, the unit action
    // failed, and the port-level follow-up eventually reopened the unit.
    assert_eq!(rig.sim.count(HwRequestKind::OpenUnit), 2);
    assert!(unit.status().contains(Status::OPEN));
    assert!(unit.status().contains(Status::UNBLOCKED));
}

#[test]
fn test_unknown_wwpn_is_a_permanent_failure() {
    // A port the name server has never heard of: bad configuration.
    let sim = Arc::new(SimTransport::fabric());
    let engine = ErpEngine::new(Arc::clone(&sim) as Arc<dyn Transport>, fast_config());
    let adapter = engine.attach_adapter("fc-test");
    adapter.set_fabric_topology(FabricTopology::Fabric);
    engine.add_port(&adapter, NS_WWPN, true);
    let port = engine.add_port(&adapter, port_wwpn(0), false);

    engine
        .request_reopen(&TargetRef::Port(Arc::clone(&port)), Status::empty(), "test")
        .unwrap();
    assert!(engine.wait_for_quiescence_timeout(&adapter, Duration::from_secs(10)));

    assert!(port.status().contains(Status::ERP_FAILED));
    assert!(port.status().contains(Status::INVALID_WWPN));
    // Permanent failure stops the ladder: one lookup, no open, no retry.
    assert_eq!(sim.count(HwRequestKind::NameServerLookup), 1);
    assert_eq!(sim.count(HwRequestKind::OpenPort), 1); // name server only

    engine.detach_adapter(&adapter).unwrap();
}

#[test]
fn test_point_to_point_peer_mismatch_fails_permanently() {
    let sim = Arc::new(SimTransport::point_to_point(
        port_wwpn(0),
        common::fixtures::port_did(0),
    ));
    let engine = ErpEngine::new(Arc::clone(&sim) as Arc<dyn Transport>, fast_config());
    let adapter = engine.attach_adapter("fc-test");
    adapter.set_fabric_topology(FabricTopology::PointToPoint {
        peer_wwpn: port_wwpn(0),
        peer_did: common::fixtures::port_did(0),
    });
    // Configured WWPN does not match the wire peer.
    let port = engine.add_port(&adapter, Wwpn(0xdead_beef_0000_0001), false);

    engine
        .request_reopen(&TargetRef::Port(Arc::clone(&port)), Status::empty(), "test")
        .unwrap();
    assert!(engine.wait_for_quiescence_timeout(&adapter, Duration::from_secs(10)));

    assert!(port.status().contains(Status::ERP_FAILED));
    assert_eq!(sim.count(HwRequestKind::OpenPort), 0);

    engine.detach_adapter(&adapter).unwrap();
}

#[test]
fn test_exchange_port_data_unsupported_is_tolerated() {
    let rig = TestRig::fabric(1, 0);
    rig.sim.without_port_data();

    rig.engine
        .request_reopen(
            &TargetRef::Adapter(Arc::clone(&rig.adapter)),
            Status::empty(),
            "test",
        )
        .unwrap();
    rig.settle();

    // Older firmware without exchange-port-data still recovers fully.
    let status = rig.adapter.status().load();
    assert!(status.contains(Status::QUEUES_UP));
    assert!(status.contains(Status::XCONFIG_OK));
    assert!(!status.contains(Status::XPORT_OK));
    assert!(status.contains(Status::UNBLOCKED));
    assert!(rig.port(0).status().contains(Status::OPEN));
}

#[test]
fn test_host_connection_init_is_retried_with_backoff() {
    let rig = TestRig::fabric(1, 0);
    rig.sim.host_connection_initializing(2);

    rig.engine
        .request_reopen(
            &TargetRef::Adapter(Arc::clone(&rig.adapter)),
            Status::empty(),
            "test",
        )
        .unwrap();
    rig.settle();

    // Two "still initializing" answers, then success on the third request.
    assert_eq!(rig.sim.count(HwRequestKind::ExchangeConfig), 3);
    assert!(rig.adapter.status().contains(Status::XCONFIG_OK));
    assert!(rig.adapter.status().contains(Status::UNBLOCKED));
}

#[test]
fn test_host_connection_never_ready_fails_the_adapter() {
    let rig = TestRig::fabric(1, 0);
    rig.sim.host_connection_initializing(1000);

    rig.engine
        .request_reopen(
            &TargetRef::Adapter(Arc::clone(&rig.adapter)),
            Status::empty(),
            "test",
        )
        .unwrap();
    rig.settle();

    let status = rig.adapter.status().load();
    assert!(status.contains(Status::ERP_FAILED));
    assert!(!status.contains(Status::UNBLOCKED));
}

#[test]
fn test_shutdown_then_reopen_cycle() {
    let rig = TestRig::fabric(1, 1);

    rig.engine
        .request_reopen(
            &TargetRef::Adapter(Arc::clone(&rig.adapter)),
            Status::empty(),
            "bring up",
        )
        .unwrap();
    rig.settle();
    assert!(rig.adapter.status().contains(Status::QUEUES_UP));

    // Shutdown closes without reopening and generates no follow-ups.
    rig.engine
        .request_shutdown(
            &TargetRef::Adapter(Arc::clone(&rig.adapter)),
            Status::empty(),
            "maintenance",
        )
        .unwrap();
    rig.settle();

    let status = rig.adapter.status().load();
    assert!(!status.contains(Status::RUNNING));
    assert!(!status.contains(Status::QUEUES_UP));

    // Reopen restores the running bit and recovers the whole stack.
    rig.engine
        .request_reopen(
            &TargetRef::Adapter(Arc::clone(&rig.adapter)),
            Status::empty(),
            "back online",
        )
        .unwrap();
    rig.settle();

    assert!(rig.adapter.status().contains(Status::RUNNING));
    assert!(rig.adapter.status().contains(Status::QUEUES_UP));
    assert!(rig.port(0).status().contains(Status::OPEN));
    assert!(rig.unit(0, 0).status().contains(Status::OPEN));
}
