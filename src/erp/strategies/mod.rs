// Per-level recovery strategies.
//
// A strategy invocation performs exactly one slice of its state machine: it
// inspects the status bits its last hardware request's completion left
// behind, decides the next step, and either issues the next request
// (suspending the action) or yields a terminal outcome. The worker re-runs
// the strategy every time a completion, timeout, or deferral wakes the
// action.

pub(crate) mod adapter;
pub(crate) mod port;
pub(crate) mod unit;

use std::sync::Arc;
use std::time::Instant;

use crate::engine::EngineShared;
use crate::transport::{HwRequest, HwRequestKind, Transport, TransportError};

use super::action::{ActionKind, ActionOutcome, ErpAction, ErpStep, StepOutcome, WakeKind};

/// Run one slice of the action's state machine.
pub(crate) fn run_step(shared: &Arc<EngineShared>, action: &Arc<ErpAction>) -> StepOutcome {
    let step = action.step();
    tracing::debug!(
        adapter = action.adapter().name(),
        target = %action.target(),
        kind = %action.kind(),
        step = %step,
        "Running recovery step"
    );

    let outcome = match action.kind() {
        ActionKind::ReopenAdapter => adapter::run(shared, action),
        ActionKind::ReopenPortForced => port::run_forced(shared, action),
        ActionKind::ReopenPort => port::run(shared, action),
        ActionKind::ReopenUnit => unit::run(shared, action),
    };

    if let StepOutcome::Done(result) = outcome {
        tracing::debug!(
            adapter = action.adapter().name(),
            target = %action.target(),
            kind = %action.kind(),
            outcome = %result,
            "Recovery strategy finished"
        );
    }
    outcome
}

/// Issue an asynchronous hardware request and suspend the action.
///
/// The action's step advances to `next_step` and its request token and
/// timeout deadline are recorded *before* the transport call, so a
/// completion delivered inline from within the call is handled normally.
/// On synchronous failure the step is rolled back so a deferred retry
/// re-enters the same step.
pub(super) fn issue<F>(
    shared: &Arc<EngineShared>,
    action: &Arc<ErpAction>,
    kind: HwRequestKind,
    next_step: ErpStep,
    call: F,
) -> StepOutcome
where
    F: FnOnce(&dyn Transport, HwRequest) -> Result<(), TransportError>,
{
    let request = HwRequest::new(kind, Arc::clone(action));
    let token = request.token();

    let previous_step;
    {
        let mut state = action.state.lock().unwrap();
        previous_step = state.step;
        state.step = next_step;
        state.hw_token = Some(token);
        state.wake_at = Some(Instant::now() + shared.config.request_timeout);
        state.wake_kind = WakeKind::RequestTimeout;
    }

    match call(shared.transport.as_ref(), request) {
        Ok(()) => StepOutcome::Continues,
        Err(err) => {
            {
                let mut state = action.state.lock().unwrap();
                if state.hw_token == Some(token) {
                    state.hw_token = None;
                    state.wake_at = None;
                    state.step = previous_step;
                }
            }
            match err {
                TransportError::NoMemory => {
                    tracing::debug!(
                        adapter = action.adapter().name(),
                        request = %kind,
                        "Hardware request deferred, out of memory"
                    );
                    StepOutcome::NoMemory
                }
                TransportError::Rejected(msg) => {
                    tracing::warn!(
                        adapter = action.adapter().name(),
                        target = %action.target(),
                        request = %kind,
                        error = %msg,
                        "Hardware request rejected"
                    );
                    StepOutcome::Done(ActionOutcome::Failed)
                }
            }
        }
    }
}

/// Park the action without an outstanding hardware request (used while
/// waiting on a nested name-server action).
pub(super) fn park(action: &Arc<ErpAction>, step: ErpStep) -> StepOutcome {
    let mut state = action.state.lock().unwrap();
    state.step = step;
    state.hw_token = None;
    state.wake_at = None;
    StepOutcome::Continues
}
