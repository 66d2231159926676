// Escalation and admission control.
//
// A requested (kind, target) pair is evaluated bottom-up: a request against
// an unhealthy parent is escalated to the parent's level, a request against
// a target that already has an action in flight is dropped (the in-flight
// action's follow-up logic covers it), and a request against a permanently
// failed target is refused while the failure mark is propagated downward.
// Admission claims the target's slot, dismisses everything the new action
// supersedes, and appends to the ready queue.

use std::sync::Arc;

use crate::engine::{Disposition, EngineShared};
use crate::topology::{Adapter, Status, TargetRef};
use crate::trace::TraceEvent;
use crate::{ErpError, ErpResult};

use super::action::{ActionFlags, ActionKind, ErpAction};
use super::queues::ErpQueues;

/// Outcome of the escalation decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Escalation {
    /// Admit this (possibly escalated) kind against this target.
    Admit(ActionKind, TargetRef),
    /// A compatible action is already in flight; drop the request.
    Drop,
}

/// Decide what actually gets queued for a requested (kind, target) pair.
///
/// Reads status bits only; mutation happens later in [`trigger`] under the
/// same lock this is called under.
pub(crate) fn escalate(want: ActionKind, target: &TargetRef) -> ErpResult<Escalation> {
    let mut need = want;
    let mut chosen = target.clone();

    // Unit level: a unit under an unhealthy port is serviced at port level.
    if need == ActionKind::ReopenUnit {
        if let TargetRef::Unit(unit) = chosen.clone() {
            if unit.status().contains(Status::ERP_IN_USE) {
                return Ok(Escalation::Drop);
            }
            let port = unit
                .port()
                .ok_or_else(|| ErpError::AdapterDetached("unit has no port".into()))?;
            let p_status = port.status().load();
            if !p_status.contains(Status::RUNNING) || p_status.contains(Status::ERP_FAILED) {
                need = ActionKind::ReopenPort;
                chosen = TargetRef::Port(port);
            }
        }
    }

    // Port level: a port under an unhealthy adapter is serviced at adapter
    // level. A forced reopen is never dropped in favour of an in-flight
    // plain reopen; forced always wins.
    if matches!(
        need,
        ActionKind::ReopenPort | ActionKind::ReopenPortForced
    ) {
        if let TargetRef::Port(port) = chosen.clone() {
            if port.status().contains(Status::ERP_IN_USE) && need != ActionKind::ReopenPortForced {
                return Ok(Escalation::Drop);
            }
            let adapter = port
                .adapter()
                .ok_or_else(|| ErpError::AdapterDetached("port has no adapter".into()))?;
            let a_status = adapter.status().load();
            if !a_status.contains(Status::RUNNING) || a_status.contains(Status::ERP_FAILED) {
                need = ActionKind::ReopenAdapter;
                chosen = TargetRef::Adapter(adapter);
            }
        }
    }

    if need == ActionKind::ReopenAdapter {
        if let TargetRef::Adapter(adapter) = &chosen {
            if adapter.status().contains(Status::ERP_IN_USE) {
                return Ok(Escalation::Drop);
            }
        }
    }

    Ok(Escalation::Admit(need, chosen))
}

/// Request recovery for a target. The single entry path behind
/// `request_reopen`, `request_forced_reopen`, `request_shutdown`, and every
/// internally generated follow-up.
///
/// `set_running` distinguishes a reopen (the caller wants the target up
/// afterwards) from a shutdown or internal follow-up.
pub(crate) fn trigger(
    shared: &Arc<EngineShared>,
    want: ActionKind,
    target: &TargetRef,
    clear: Status,
    set_running: bool,
    reason: &str,
) -> ErpResult<Disposition> {
    let adapter = target
        .owning_adapter()
        .ok_or_else(|| ErpError::AdapterDetached(target.to_string()))?;

    // Outer configuration-wide lock: the ownership tree must not change
    // while we walk it.
    let _config = shared.config_lock.read().unwrap();
    let mut queues = adapter.erp.lock();
    if queues.shutdown {
        return Err(ErpError::AdapterDetached(adapter.name().to_string()));
    }

    shared
        .trace
        .record(adapter.name(), target, TraceEvent::Trigger, reason);

    // The failed mark is read before the caller's clear mask is applied, so
    // a shutdown both reports the refusal and re-arms the target for a
    // later reopen.
    let was_failed = target.status().contains(Status::ERP_FAILED);
    if was_failed {
        propagate_failure(shared, target);
    }
    block(target, clear);
    if set_running {
        target.status().set(Status::RUNNING);
    }
    if was_failed {
        shared.trace.record(
            adapter.name(),
            target,
            TraceEvent::Refused,
            "target permanently failed",
        );
        return Err(ErpError::TargetFailed(target.to_string()));
    }

    let (need, chosen) = match escalate(want, target)? {
        Escalation::Drop => {
            tracing::debug!(
                adapter = adapter.name(),
                target = %target,
                requested = %want,
                "Recovery request dropped, compatible action already in flight"
            );
            shared
                .trace
                .record(adapter.name(), target, TraceEvent::Dropped, want.to_string());
            return Ok(Disposition::Dropped);
        }
        Escalation::Admit(need, chosen) => (need, chosen),
    };

    if chosen != *target {
        tracing::info!(
            adapter = adapter.name(),
            requested = %want,
            escalated = %need,
            target = %chosen,
            "Recovery request escalated"
        );
        shared
            .trace
            .record(adapter.name(), &chosen, TraceEvent::Escalated, need.to_string());

        // The escalated target itself may already be beyond recovery; the
        // failure then covers the requested target too.
        if chosen.status().contains(Status::ERP_FAILED) {
            propagate_failure(shared, &chosen);
            shared.trace.record(
                adapter.name(),
                &chosen,
                TraceEvent::Refused,
                "escalation target permanently failed",
            );
            return Err(ErpError::TargetFailed(chosen.to_string()));
        }
        block(&chosen, Status::empty());
    }

    // A stronger action pre-empts everything it subsumes.
    dismiss_within(shared, &adapter, &mut queues, &chosen);

    let action = match &chosen {
        TargetRef::Adapter(a) => ErpAction::new(need, reason, Arc::clone(a), None, None),
        TargetRef::Port(p) => {
            ErpAction::new(need, reason, Arc::clone(&adapter), Some(Arc::clone(p)), None)
        }
        TargetRef::Unit(u) => {
            let port = u
                .port()
                .ok_or_else(|| ErpError::AdapterDetached("unit has no port".into()))?;
            ErpAction::new(
                need,
                reason,
                Arc::clone(&adapter),
                Some(port),
                Some(Arc::clone(u)),
            )
        }
    };

    if !chosen.status().contains(Status::RUNNING) {
        action.set_flags(ActionFlags::CLOSE_ONLY);
    }

    let claimed = if need == ActionKind::ReopenPortForced {
        // Forced reopen displaces an in-flight plain reopen; the displaced
        // action was dismissed above and its release is now inert.
        chosen.slot().takeover(&action);
        true
    } else {
        chosen.slot().claim(&action)
    };
    if !claimed {
        let holder = chosen.slot().occupant().map(|a| a.kind().to_string());
        tracing::error!(
            adapter = adapter.name(),
            target = %chosen,
            holder = ?holder,
            "Internal bug: slot still claimed after subtree dismissal"
        );
        return Ok(Disposition::Dropped);
    }
    chosen.status().set(Status::ERP_IN_USE);

    adapter.erp.enqueue_ready(&mut queues, Arc::clone(&action));
    shared
        .trace
        .record(adapter.name(), &chosen, TraceEvent::Admitted, need.to_string());
    tracing::info!(
        adapter = adapter.name(),
        target = %chosen,
        kind = %need,
        reason,
        "Recovery action admitted"
    );

    Ok(Disposition::Queued(need))
}

/// Block the target (disable I/O) and apply the caller's clear mask.
fn block(target: &TargetRef, clear: Status) {
    target.status().clear(Status::UNBLOCKED | clear);
}

/// Mark the target and everything below it permanently failed and blocked.
pub(crate) fn propagate_failure(shared: &Arc<EngineShared>, target: &TargetRef) {
    mark_target_failed(shared, target, "failure propagated");
    match target {
        TargetRef::Adapter(adapter) => {
            for port in adapter.ports() {
                propagate_failure(shared, &TargetRef::Port(port));
            }
        }
        TargetRef::Port(port) => {
            for unit in port.units() {
                propagate_failure(shared, &TargetRef::Unit(unit));
            }
        }
        TargetRef::Unit(_) => {}
    }
}

/// Set the permanent-failure mark on one target.
pub(crate) fn mark_target_failed(shared: &Arc<EngineShared>, target: &TargetRef, reason: &str) {
    let previous = target.status().set(Status::ERP_FAILED);
    target.status().clear(Status::UNBLOCKED);
    if !previous.contains(Status::ERP_FAILED) {
        if let Some(adapter) = target.owning_adapter() {
            shared
                .trace
                .record(adapter.name(), target, TraceEvent::MarkedFailed, reason);
        }
        tracing::warn!(target = %target, reason, "Target marked permanently failed");
    }
}

/// Dismiss every queued or running action on `scope` or a subordinate
/// target. Ready actions are finalized in place; running actions are
/// flagged and moved to the ready-queue head so the worker finalizes them
/// before anything else runs.
pub(crate) fn dismiss_within(
    shared: &Arc<EngineShared>,
    adapter: &Arc<Adapter>,
    queues: &mut ErpQueues,
    scope: &TargetRef,
) {
    let ready_victims: Vec<_> = queues
        .ready
        .iter()
        .filter(|a| a.is_within(scope))
        .cloned()
        .collect();
    for action in ready_victims {
        action.set_flags(ActionFlags::DISMISSED);
        queues.remove_from_ready(&action);
        release_slot(&action);
        adapter.erp.retire(queues);
        shared.trace.record(
            adapter.name(),
            action.target(),
            TraceEvent::Dismissed,
            format!("{} (queued)", action.kind()),
        );
        tracing::debug!(
            adapter = adapter.name(),
            target = %action.target(),
            kind = %action.kind(),
            "Dismissed queued recovery action"
        );
    }

    let running_victims: Vec<_> = queues
        .running
        .iter()
        .filter(|a| a.is_within(scope))
        .cloned()
        .collect();
    for action in running_victims {
        action.set_flags(ActionFlags::DISMISSED);
        // The outstanding hardware request, if any, is inert from here on:
        // its completion no longer applies status changes.
        adapter.erp.resume(queues, &action);
        shared.trace.record(
            adapter.name(),
            action.target(),
            TraceEvent::Dismissed,
            format!("{} (running)", action.kind()),
        );
        tracing::debug!(
            adapter = adapter.name(),
            target = %action.target(),
            kind = %action.kind(),
            "Dismissed running recovery action"
        );
    }
}

/// Release the action's slot claim and mirror bit, if it still holds them.
pub(crate) fn release_slot(action: &Arc<ErpAction>) {
    let target = action.target();
    if target.slot().release(action) {
        target.status().clear(Status::ERP_IN_USE);
    }
}
