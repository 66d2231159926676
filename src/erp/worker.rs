// The recovery worker: one dedicated thread per adapter, the sole driver of
// action execution.
//
// The worker also owns the clock: request timeouts and low-memory deferrals
// are deadlines on suspended actions, and the worker sleeps no longer than
// the nearest one. A worker never terminates on action failure, only on an
// explicit shutdown request at adapter detach.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crate::engine::EngineShared;
use crate::topology::{Adapter, Status, TargetRef};
use crate::trace::TraceEvent;

use super::action::{ActionFlags, ActionKind, ActionOutcome, ErpAction, StepOutcome, WakeKind};
use super::queues::ErpQueues;
use super::{admission, outcome, strategies};

pub(crate) fn spawn(adapter: Arc<Adapter>, shared: Arc<EngineShared>) -> JoinHandle<()> {
    let name = format!("{}-erp", adapter.name());
    thread::Builder::new()
        .name(name)
        .spawn(move || run(adapter, shared))
        .expect("failed to spawn recovery worker thread")
}

fn run(adapter: Arc<Adapter>, shared: Arc<EngineShared>) {
    tracing::debug!(adapter = adapter.name(), "Recovery worker started");

    loop {
        let action = {
            let mut queues = adapter.erp.lock();
            loop {
                if queues.shutdown {
                    tracing::debug!(adapter = adapter.name(), "Recovery worker exiting");
                    return;
                }

                expire_deadlines(&adapter, &mut queues);

                if let Some(action) = queues.ready.pop_front() {
                    queues.running.push(Arc::clone(&action));
                    break action;
                }

                let deadline = nearest_deadline(&queues);
                queues = adapter.erp.wait_for_work(queues, deadline);
            }
        };

        // A dismissal may have arrived while the action sat in the ready
        // queue; it then finalizes without ever running.
        if action.is_dismissed() {
            let result = finalize(&shared, &adapter, &action, ActionOutcome::Dismissed);
            outcome::follow_up(&shared, &action, result);
            continue;
        }

        match strategies::run_step(&shared, &action) {
            StepOutcome::Continues => {}
            StepOutcome::NoMemory => defer_low_memory(&shared, &adapter, &action),
            StepOutcome::Done(result) => {
                let result = finalize(&shared, &adapter, &action, result);
                outcome::follow_up(&shared, &action, result);
            }
        }
    }
}

/// Wake suspended actions whose deadline has passed.
fn expire_deadlines(adapter: &Arc<Adapter>, queues: &mut ErpQueues) {
    let now = Instant::now();
    let expired: Vec<_> = queues
        .running
        .iter()
        .filter(|a| {
            a.state
                .lock()
                .unwrap()
                .wake_at
                .map(|at| at <= now)
                .unwrap_or(false)
        })
        .cloned()
        .collect();

    for action in expired {
        let kind = {
            let mut state = action.state.lock().unwrap();
            state.wake_at = None;
            let kind = state.wake_kind;
            if kind == WakeKind::RequestTimeout {
                // The outstanding request is dead to us; a late completion
                // no longer matches.
                state.hw_token = None;
            }
            kind
        };

        match kind {
            WakeKind::RequestTimeout => {
                action.set_flags(ActionFlags::TIMED_OUT);
                tracing::warn!(
                    adapter = adapter.name(),
                    target = %action.target(),
                    kind = %action.kind(),
                    "Hardware request timed out"
                );
            }
            WakeKind::LowMemoryRetry => {
                action.clear_flags(ActionFlags::LOW_MEMORY);
                tracing::debug!(
                    adapter = adapter.name(),
                    target = %action.target(),
                    "Low-memory deferral elapsed, retrying"
                );
            }
        }
        adapter.erp.resume(queues, &action);
    }
}

/// The soonest deadline among suspended actions, if any.
fn nearest_deadline(queues: &ErpQueues) -> Option<Instant> {
    queues
        .running
        .iter()
        .filter_map(|a| a.state.lock().unwrap().wake_at)
        .min()
}

/// Park the action on a low-memory deferral. If the whole adapter is
/// memory-starved, force a fresh adapter recovery to release pooled
/// resources end-to-end.
fn defer_low_memory(shared: &Arc<EngineShared>, adapter: &Arc<Adapter>, action: &Arc<ErpAction>) {
    let everything_starved = {
        let mut queues = adapter.erp.lock();
        action.set_flags(ActionFlags::LOW_MEMORY);
        {
            let mut state = action.state.lock().unwrap();
            state.wake_at = Some(Instant::now() + shared.config.low_memory_delay);
            state.wake_kind = WakeKind::LowMemoryRetry;
        }
        tracing::debug!(
            adapter = adapter.name(),
            target = %action.target(),
            delay = %humantime::format_duration(shared.config.low_memory_delay),
            "Recovery step deferred, out of memory"
        );
        queues.all_low_memory()
    };

    if everything_starved && action.kind() != ActionKind::ReopenAdapter {
        tracing::warn!(
            adapter = adapter.name(),
            "Every outstanding recovery is memory-starved, forcing adapter recovery"
        );
        if let Err(err) = admission::trigger(
            shared,
            ActionKind::ReopenAdapter,
            &TargetRef::Adapter(Arc::clone(adapter)),
            Status::empty(),
            false,
            "adapter-wide memory starvation",
        ) {
            tracing::debug!(
                adapter = adapter.name(),
                error = %err,
                "Forced adapter recovery not admitted"
            );
        }
    }
}

/// Apply outcome rules, dequeue, release the slot, and signal quiescence.
/// Returns the effective outcome follow-up generation should use.
fn finalize(
    shared: &Arc<EngineShared>,
    adapter: &Arc<Adapter>,
    action: &Arc<ErpAction>,
    result: ActionOutcome,
) -> ActionOutcome {
    let mut queues = adapter.erp.lock();

    // A dismissal always wins over a concurrently delivered completion.
    let result = if action.is_dismissed() {
        ActionOutcome::Dismissed
    } else {
        outcome::check_target(shared, action, result)
    };

    queues.remove_from_ready(action);
    queues.remove_from_running(action);
    admission::release_slot(action);
    adapter.erp.retire(&mut queues);

    shared.trace.record(
        adapter.name(),
        action.target(),
        TraceEvent::Finalized,
        result.to_string(),
    );
    tracing::info!(
        adapter = adapter.name(),
        target = %action.target(),
        kind = %action.kind(),
        outcome = %result,
        "Recovery action finalized"
    );

    if queues.is_quiesced() {
        shared.trace.record(
            adapter.name(),
            TargetRef::Adapter(Arc::clone(adapter)),
            TraceEvent::Quiesced,
            "",
        );
        tracing::debug!(adapter = adapter.name(), "Recovery quiesced");
    }

    result
}
