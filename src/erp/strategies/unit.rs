// Unit recovery: close if open, reopen unless close-only. No fabric
// involvement; open and close are single hardware calls with verification.

use std::sync::Arc;

use crate::engine::EngineShared;
use crate::erp::action::{ActionFlags, ActionOutcome, ErpAction, ErpStep, StepOutcome};
use crate::topology::{Status, Unit};
use crate::transport::HwRequestKind;

use super::issue;

pub(crate) fn run(shared: &Arc<EngineShared>, action: &Arc<ErpAction>) -> StepOutcome {
    let unit = match action.unit() {
        Some(unit) => Arc::clone(unit),
        None => {
            tracing::error!("Internal bug: unit recovery without a unit reference");
            return StepOutcome::Done(ActionOutcome::Failed);
        }
    };

    if action.flags().contains(ActionFlags::TIMED_OUT) {
        return StepOutcome::Done(ActionOutcome::Failed);
    }

    match action.step() {
        ErpStep::Uninitialized => {
            if unit.status.contains(Status::OPEN) {
                return issue(
                    shared,
                    action,
                    HwRequestKind::CloseUnit,
                    ErpStep::UnitClosing,
                    |transport, req| transport.close_unit(req),
                );
            }
            closed(shared, action, &unit)
        }
        ErpStep::UnitClosing => {
            if unit.status.contains(Status::OPEN) {
                // Close did not take effect.
                return StepOutcome::Done(ActionOutcome::Failed);
            }
            closed(shared, action, &unit)
        }
        ErpStep::UnitOpening => {
            if unit.status.contains(Status::OPEN) {
                StepOutcome::Done(ActionOutcome::Succeeded)
            } else {
                StepOutcome::Done(ActionOutcome::Failed)
            }
        }
        step => {
            tracing::error!(
                target = %action.target(),
                step = %step,
                "Internal bug: impossible step for unit recovery"
            );
            StepOutcome::Done(ActionOutcome::Failed)
        }
    }
}

/// The unit is verified closed; stop here for close-only, otherwise open.
fn closed(shared: &Arc<EngineShared>, action: &Arc<ErpAction>, _unit: &Arc<Unit>) -> StepOutcome {
    if action.flags().contains(ActionFlags::CLOSE_ONLY) {
        return StepOutcome::Done(ActionOutcome::Succeeded);
    }

    issue(
        shared,
        action,
        HwRequestKind::OpenUnit,
        ErpStep::UnitOpening,
        |transport, req| transport.open_unit(req),
    )
}
