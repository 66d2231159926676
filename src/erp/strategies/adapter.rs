// Adapter recovery: tear everything down, then bring the queues, the
// firmware configuration, and the status-buffer pool back up.

use std::sync::Arc;
use std::thread;

use crate::engine::EngineShared;
use crate::erp::action::{ActionFlags, ActionOutcome, ErpAction, ErpStep, StepOutcome};
use crate::erp::backoff::ExponentialBackoff;
use crate::topology::{Adapter, Status};
use crate::transport::{HwRequestKind, TransportError};

use super::issue;

pub(crate) fn run(shared: &Arc<EngineShared>, action: &Arc<ErpAction>) -> StepOutcome {
    let adapter = Arc::clone(action.adapter());

    if action.flags().contains(ActionFlags::TIMED_OUT) {
        return fail_settled(shared, &adapter, "hardware request timed out");
    }

    match action.step() {
        ErpStep::Uninitialized => close_then_open(shared, action, &adapter),
        ErpStep::AdapterExchangingConfig => after_exchange_config(shared, action, &adapter),
        ErpStep::AdapterExchangingPortData => after_exchange_port_data(shared, action, &adapter),
        step => {
            tracing::error!(
                adapter = adapter.name(),
                step = %step,
                "Internal bug: impossible step for adapter recovery"
            );
            StepOutcome::Done(ActionOutcome::Failed)
        }
    }
}

/// Closing phase, then (unless close-only) queue bring-up and the first
/// exchange-config request.
fn close_then_open(
    shared: &Arc<EngineShared>,
    action: &Arc<ErpAction>,
    adapter: &Arc<Adapter>,
) -> StepOutcome {
    // Teardown is best-effort and discards in-flight unrelated requests.
    shared.transport.tear_queues_down(adapter);
    adapter.status.clear(
        Status::QUEUES_UP | Status::XCONFIG_OK | Status::XPORT_OK | Status::HOST_CON_INIT,
    );
    tracing::debug!(adapter = adapter.name(), "Adapter queues torn down");

    if action.flags().contains(ActionFlags::CLOSE_ONLY) {
        // Closed as requested.
        return StepOutcome::Done(ActionOutcome::Succeeded);
    }

    match shared.transport.bring_queues_up(adapter) {
        Ok(()) => {
            adapter.status.set(Status::QUEUES_UP);
        }
        Err(TransportError::NoMemory) => return StepOutcome::NoMemory,
        Err(TransportError::Rejected(msg)) => {
            return fail_settled(shared, adapter, &format!("queue bring-up failed: {}", msg));
        }
    }

    action.step_attempts.store(0, std::sync::atomic::Ordering::SeqCst);
    issue_exchange_config(shared, action)
}

fn issue_exchange_config(shared: &Arc<EngineShared>, action: &Arc<ErpAction>) -> StepOutcome {
    issue(
        shared,
        action,
        HwRequestKind::ExchangeConfig,
        ErpStep::AdapterExchangingConfig,
        |transport, req| transport.exchange_config_data(req),
    )
}

/// Exchange-config completed (or the device asked for patience).
fn after_exchange_config(
    shared: &Arc<EngineShared>,
    action: &Arc<ErpAction>,
    adapter: &Arc<Adapter>,
) -> StepOutcome {
    if adapter.status.contains(Status::HOST_CON_INIT) {
        let attempt = action
            .step_attempts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1;
        if attempt > shared.config.exchange_config_retries {
            return fail_settled(shared, adapter, "host connection still initializing");
        }

        let backoff = ExponentialBackoff::new(
            shared.config.exchange_config_backoff_base,
            shared.config.exchange_config_backoff_max,
        );
        let delay = backoff.delay_for(attempt - 1);
        tracing::info!(
            adapter = adapter.name(),
            attempt,
            delay = %humantime::format_duration(delay),
            "Host connection initializing, retrying exchange-config"
        );
        thread::sleep(delay);
        return issue_exchange_config(shared, action);
    }

    if !adapter.status.contains(Status::XCONFIG_OK) {
        return fail_settled(shared, adapter, "exchange-config failed");
    }

    issue(
        shared,
        action,
        HwRequestKind::ExchangePortData,
        ErpStep::AdapterExchangingPortData,
        |transport, req| transport.exchange_port_data(req),
    )
}

/// Exchange-port-data completed. Older firmware does not implement the
/// call; any non-success here is tolerated and only a timeout fails the
/// action (handled before dispatch).
fn after_exchange_port_data(
    shared: &Arc<EngineShared>,
    _action: &Arc<ErpAction>,
    adapter: &Arc<Adapter>,
) -> StepOutcome {
    if !adapter.status.contains(Status::XPORT_OK) {
        tracing::warn!(
            adapter = adapter.name(),
            "Exchange-port-data unsupported or failed, continuing without it"
        );
    }

    shared.transport.refill_status_buffers(adapter);
    tracing::info!(adapter = adapter.name(), "Adapter recovered");
    StepOutcome::Done(ActionOutcome::Succeeded)
}

/// Terminal failure with a settle delay, so a firmware that is mid-reset is
/// not hot-looped against by the re-admission follow-up.
fn fail_settled(shared: &Arc<EngineShared>, adapter: &Arc<Adapter>, why: &str) -> StepOutcome {
    tracing::warn!(
        adapter = adapter.name(),
        why,
        settle = %humantime::format_duration(shared.config.failed_settle_delay),
        "Adapter recovery failed, settling"
    );
    thread::sleep(shared.config.failed_settle_delay);
    StepOutcome::Done(ActionOutcome::Failed)
}
