// Outcome propagation: retry budgets, permanent-failure marking,
// unblocking, and follow-up action generation.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::engine::EngineShared;
use crate::topology::{Status, TargetRef};
use crate::trace::TraceEvent;

use super::action::{ActionFlags, ActionKind, ActionOutcome, ErpAction, ErpStep};
use super::admission;

/// Apply retry-counter and failure rules to the action's target and return
/// the effective outcome.
///
/// A succeeded action resets the retry budget and re-enables I/O; a failed
/// action consumes budget and, once the budget is exhausted, permanently
/// fails the target. Either way, a target carrying the permanent-failure
/// mark forces the outcome to Exit and stays blocked: a nominally
/// successful teardown of a failed target must not unblock it.
pub(crate) fn check_target(
    shared: &Arc<EngineShared>,
    action: &Arc<ErpAction>,
    outcome: ActionOutcome,
) -> ActionOutcome {
    let target = action.target();

    match outcome {
        ActionOutcome::Succeeded => {
            target.retries().store(0, Ordering::SeqCst);
            target.status().set(Status::UNBLOCKED);
        }
        ActionOutcome::Failed => {
            let failures = target.retries().fetch_add(1, Ordering::SeqCst) + 1;
            if failures > shared.config.max_retries {
                admission::mark_target_failed(shared, &target, "retry budget exhausted");
            }
        }
        ActionOutcome::Exit | ActionOutcome::Dismissed => {}
    }

    if matches!(outcome, ActionOutcome::Succeeded | ActionOutcome::Failed)
        && target.status().contains(Status::ERP_FAILED)
    {
        target.status().clear(Status::UNBLOCKED);
        return ActionOutcome::Exit;
    }

    outcome
}

/// Generate the follow-up actions the finished action implies.
///
/// Called by the worker after finalization, without the action lock held:
/// every follow-up goes through normal admission.
pub(crate) fn follow_up(
    shared: &Arc<EngineShared>,
    action: &Arc<ErpAction>,
    outcome: ActionOutcome,
) {
    // Actions parked on the name-server port are woken once its recovery
    // concludes, successfully or not; the parked strategy re-inspects the
    // port's status to decide between lookup and failure.
    if action.kind() == ActionKind::ReopenPort
        && action.port().map(|p| p.is_nameserver()).unwrap_or(false)
    {
        wake_nameserver_waiters(action);
    }

    if matches!(outcome, ActionOutcome::Exit | ActionOutcome::Dismissed) {
        return;
    }

    // A close-only action is an endpoint (shutdown or recovery of a target
    // that is administratively down); it never re-opens anything below it.
    if action.flags().contains(ActionFlags::CLOSE_ONLY) {
        return;
    }

    let adapter = action.adapter();
    let reason = format!("follow-up of {} {}", action.kind(), outcome);

    let requests: Vec<(ActionKind, TargetRef)> = match (action.kind(), outcome) {
        (ActionKind::ReopenAdapter, ActionOutcome::Succeeded) => adapter
            .ports()
            .into_iter()
            .filter(|p| !p.is_nameserver())
            .map(|p| (ActionKind::ReopenPort, TargetRef::Port(p)))
            .collect(),
        (ActionKind::ReopenAdapter, ActionOutcome::Failed) => {
            vec![(
                ActionKind::ReopenAdapter,
                TargetRef::Adapter(Arc::clone(adapter)),
            )]
        }
        (ActionKind::ReopenPortForced, ActionOutcome::Succeeded) => action
            .port()
            .map(|p| {
                vec![(
                    ActionKind::ReopenPort,
                    TargetRef::Port(Arc::clone(p)),
                )]
            })
            .unwrap_or_default(),
        (ActionKind::ReopenPortForced, ActionOutcome::Failed) => {
            vec![(
                ActionKind::ReopenAdapter,
                TargetRef::Adapter(Arc::clone(adapter)),
            )]
        }
        (ActionKind::ReopenPort, ActionOutcome::Succeeded) => action
            .port()
            .map(|p| {
                p.units()
                    .into_iter()
                    .map(|u| (ActionKind::ReopenUnit, TargetRef::Unit(u)))
                    .collect()
            })
            .unwrap_or_default(),
        (ActionKind::ReopenPort, ActionOutcome::Failed) => action
            .port()
            .map(|p| {
                vec![(
                    ActionKind::ReopenPortForced,
                    TargetRef::Port(Arc::clone(p)),
                )]
            })
            .unwrap_or_default(),
        (ActionKind::ReopenUnit, ActionOutcome::Succeeded) => Vec::new(),
        (ActionKind::ReopenUnit, ActionOutcome::Failed) => action
            .unit()
            .and_then(|u| u.port())
            .map(|p| {
                vec![(
                    ActionKind::ReopenPort,
                    TargetRef::Port(p),
                )]
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    for (kind, target) in requests {
        shared
            .trace
            .record(adapter.name(), &target, TraceEvent::FollowUp, kind.to_string());
        // Drops and already-failed refusals are expected here; the trace
        // records them.
        if let Err(err) = admission::trigger(shared, kind, &target, Status::empty(), false, &reason)
        {
            tracing::debug!(
                adapter = adapter.name(),
                target = %target,
                kind = %kind,
                error = %err,
                "Follow-up recovery not admitted"
            );
        }
    }
}

/// Move every action parked on the name-server back to the ready queue.
fn wake_nameserver_waiters(ns_action: &Arc<ErpAction>) {
    let adapter = ns_action.adapter();
    let mut queues = adapter.erp.lock();
    let parked: Vec<_> = queues
        .running
        .iter()
        .filter(|a| a.step() == ErpStep::PortWaitingOnNameserver)
        .cloned()
        .collect();
    for waiter in parked {
        tracing::debug!(
            adapter = adapter.name(),
            target = %waiter.target(),
            "Waking recovery action parked on name server"
        );
        adapter.erp.resume(&mut queues, &waiter);
    }
}
