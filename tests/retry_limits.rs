/// Retry budgets, permanent-failure marking, and follow-up chains.
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::fixtures::TestRig;
use fc_recovery::sim::SimFault;
use fc_recovery::trace::TraceEvent;
use fc_recovery::{HwRequestKind, Status, TargetRef};
use proptest::prelude::*;

#[test]
fn test_retry_budget_allows_n_plus_one_failures() {
    // max_retries = 2: the third consecutive unit failure is the permanent
    // one. Each failure bounces through a port-level follow-up that
    // succeeds and hands the unit another attempt.
    let rig = TestRig::fabric(1, 1);
    rig.sim.inject(SimFault::Fail, HwRequestKind::OpenUnit, 100);

    let unit = rig.unit(0, 0);
    rig.engine
        .request_reopen(&TargetRef::Unit(Arc::clone(&unit)), Status::empty(), "test")
        .unwrap();
    rig.settle();

    assert_eq!(rig.sim.count(HwRequestKind::OpenUnit), 3);
    assert!(unit.status().contains(Status::ERP_FAILED));
    assert!(!unit.status().contains(Status::UNBLOCKED));

    // The port itself stayed healthy through all of it.
    let port = rig.port(0);
    assert!(port.status().contains(Status::OPEN));
    assert!(!port.status().contains(Status::ERP_FAILED));
}

#[test]
fn test_success_resets_the_retry_budget() {
    let rig = TestRig::fabric(1, 1);
    let unit = rig.unit(0, 0);

    // One failure, then recovery succeeds.
    rig.sim.inject(SimFault::Fail, HwRequestKind::OpenUnit, 1);
    rig.engine
        .request_reopen(&TargetRef::Unit(Arc::clone(&unit)), Status::empty(), "first")
        .unwrap();
    rig.settle();
    assert!(unit.status().contains(Status::OPEN));

    // Two more failures fit in the budget only if the earlier success
    // reset the counter (2 + 1 would otherwise exceed max_retries = 2).
    rig.sim.inject(SimFault::Fail, HwRequestKind::OpenUnit, 2);
    rig.engine
        .request_reopen(&TargetRef::Unit(Arc::clone(&unit)), Status::empty(), "second")
        .unwrap();
    rig.settle();

    assert!(unit.status().contains(Status::OPEN));
    assert!(!unit.status().contains(Status::ERP_FAILED));
}

#[test]
fn test_unit_failure_follows_up_at_port_level() {
    let rig = TestRig::fabric(1, 1);
    rig.sim.inject(SimFault::Fail, HwRequestKind::OpenUnit, 1);

    let unit = rig.unit(0, 0);
    rig.engine
        .request_reopen(&TargetRef::Unit(Arc::clone(&unit)), Status::empty(), "test")
        .unwrap();
    rig.settle();

    // The unit's own problem is treated as a port-level symptom.
    let follow_ups = rig.engine.trace().by_event(TraceEvent::FollowUp);
    assert!(follow_ups.iter().any(|r| r.detail == "reopen-port"));
    assert!(unit.status().contains(Status::OPEN));
}

#[test]
fn test_forced_success_reopens_the_port() {
    let rig = TestRig::fabric(1, 0);
    let port = rig.port(0);

    rig.engine
        .request_reopen(&TargetRef::Port(Arc::clone(&port)), Status::empty(), "open")
        .unwrap();
    rig.settle();
    assert!(port.status().contains(Status::OPEN));

    rig.engine
        .request_forced_reopen(&port, Status::empty(), "link test failed")
        .unwrap();
    rig.settle();

    // Forced close succeeded and the follow-up reopened the port.
    assert!(port.status().contains(Status::OPEN));
    assert!(rig
        .engine
        .trace()
        .by_event(TraceEvent::FollowUp)
        .iter()
        .any(|r| r.detail == "reopen-port"));
    assert!(rig.sim.count(HwRequestKind::ClosePhysicalPort) == 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Arbitrary request interleavings must always quiesce with every
    /// action slot released and the outstanding counter at zero.
    #[test]
    fn prop_request_storms_never_leak_slots(ops in proptest::collection::vec(0u8..6, 1..12)) {
        let rig = TestRig::fabric(2, 1);

        for op in ops {
            let result = match op {
                0 => rig.engine.request_reopen(
                    &TargetRef::Unit(rig.unit(0, 0)),
                    Status::empty(),
                    "storm",
                ),
                1 => rig.engine.request_reopen(
                    &TargetRef::Port(rig.port(0)),
                    Status::empty(),
                    "storm",
                ),
                2 => rig.engine.request_reopen(
                    &TargetRef::Adapter(Arc::clone(&rig.adapter)),
                    Status::empty(),
                    "storm",
                ),
                3 => rig.engine.request_shutdown(
                    &TargetRef::Port(rig.port(1)),
                    Status::empty(),
                    "storm",
                ),
                4 => rig.engine.request_forced_reopen(&rig.port(0), Status::empty(), "storm"),
                _ => {
                    rig.engine.mark_failed(&TargetRef::Port(rig.port(1)), "storm");
                    Ok(fc_recovery::Disposition::Dropped)
                }
            };
            // Refusals on failed targets are part of the storm.
            let _ = result;
        }

        prop_assert!(rig
            .engine
            .wait_for_quiescence_timeout(&rig.adapter, Duration::from_secs(10)));

        prop_assert!(!rig.adapter.status().contains(Status::ERP_IN_USE));
        for port in rig.adapter.ports() {
            prop_assert!(!port.status().contains(Status::ERP_IN_USE));
            for unit in port.units() {
                prop_assert!(!unit.status().contains(Status::ERP_IN_USE));
            }
        }
    }
}
