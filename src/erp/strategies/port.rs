// Port recovery: close if open, then reopen by the route the fabric
// topology dictates. The well-known name-server port opens directly at its
// reserved address; ordinary ports open at the peer address (point-to-point)
// or at the address a GID_PN lookup resolves (switched fabric), parking on a
// nested name-server recovery when the name server itself is closed.
//
// Forced reopen only forces the physical link-level close; it never opens.

use std::sync::Arc;

use crate::engine::EngineShared;
use crate::erp::action::{ActionFlags, ActionKind, ActionOutcome, ErpAction, ErpStep, StepOutcome};
use crate::erp::admission;
use crate::topology::{Port, Status, TargetRef};
use crate::transport::HwRequestKind;
use crate::FabricTopology;

use super::{issue, park};

pub(crate) fn run(shared: &Arc<EngineShared>, action: &Arc<ErpAction>) -> StepOutcome {
    let port = match action.port() {
        Some(port) => Arc::clone(port),
        None => {
            tracing::error!("Internal bug: port recovery without a port reference");
            return StepOutcome::Done(ActionOutcome::Failed);
        }
    };

    if action.flags().contains(ActionFlags::TIMED_OUT) {
        return StepOutcome::Done(ActionOutcome::Failed);
    }

    match action.step() {
        ErpStep::Uninitialized => {
            if port.status.contains(Status::OPEN) {
                return issue(
                    shared,
                    action,
                    HwRequestKind::ClosePort,
                    ErpStep::PortClosing,
                    |transport, req| transport.close_port(req),
                );
            }
            closed(shared, action, &port)
        }
        ErpStep::PortClosing => {
            if port.status.contains(Status::OPEN) {
                // Close did not take effect.
                return StepOutcome::Done(ActionOutcome::Failed);
            }
            closed(shared, action, &port)
        }
        ErpStep::PortWaitingOnNameserver => open_ordinary(shared, action, &port),
        ErpStep::PortLookup => after_lookup(shared, action, &port),
        ErpStep::PortOpening => verify_open(&port),
        step => {
            tracing::error!(
                target = %action.target(),
                step = %step,
                "Internal bug: impossible step for port recovery"
            );
            StepOutcome::Done(ActionOutcome::Failed)
        }
    }
}

/// The port is verified closed; stop here for close-only, otherwise start
/// the open phase.
fn closed(shared: &Arc<EngineShared>, action: &Arc<ErpAction>, port: &Arc<Port>) -> StepOutcome {
    if action.flags().contains(ActionFlags::CLOSE_ONLY) {
        return StepOutcome::Done(ActionOutcome::Succeeded);
    }

    if port.is_nameserver() {
        // Well-known port: open directly at its reserved address.
        return issue(
            shared,
            action,
            HwRequestKind::OpenPort,
            ErpStep::PortOpening,
            |transport, req| transport.open_port(req),
        );
    }

    open_ordinary(shared, action, port)
}

/// Open an ordinary port by the route the topology dictates.
fn open_ordinary(
    shared: &Arc<EngineShared>,
    action: &Arc<ErpAction>,
    port: &Arc<Port>,
) -> StepOutcome {
    let adapter = action.adapter();

    match adapter.fabric_topology() {
        FabricTopology::PointToPoint {
            peer_wwpn,
            peer_did,
        } => {
            if port.wwpn() != peer_wwpn {
                // Mismatched wiring is a configuration error, not a
                // transient fault; only an administrative shutdown/reopen
                // clears it.
                tracing::error!(
                    adapter = adapter.name(),
                    port = %port.wwpn(),
                    peer = %peer_wwpn,
                    "Point-to-point peer mismatch"
                );
                admission::mark_target_failed(
                    shared,
                    &TargetRef::Port(Arc::clone(port)),
                    "point-to-point peer mismatch",
                );
                return StepOutcome::Done(ActionOutcome::Failed);
            }
            port.set_did(peer_did);
            issue(
                shared,
                action,
                HwRequestKind::OpenPort,
                ErpStep::PortOpening,
                |transport, req| transport.open_port(req),
            )
        }
        FabricTopology::Fabric => {
            let ns_port = match adapter.nameserver_port() {
                Some(ns) => ns,
                None => {
                    tracing::error!(
                        adapter = adapter.name(),
                        "No name-server port configured for fabric topology"
                    );
                    return StepOutcome::Done(ActionOutcome::Failed);
                }
            };

            if ns_port.status.contains(Status::OPEN) {
                return issue(
                    shared,
                    action,
                    HwRequestKind::NameServerLookup,
                    ErpStep::PortLookup,
                    |transport, req| transport.name_server_lookup(req),
                );
            }
            if ns_port.status.contains(Status::ERP_FAILED) {
                return StepOutcome::Done(ActionOutcome::Failed);
            }

            // Bring the name server up first and park until its recovery
            // concludes. A drop here means its recovery is already on the
            // way.
            if let Err(err) = admission::trigger(
                shared,
                ActionKind::ReopenPort,
                &TargetRef::Port(Arc::clone(&ns_port)),
                Status::empty(),
                false,
                "name server needed for lookup",
            ) {
                tracing::debug!(
                    adapter = adapter.name(),
                    error = %err,
                    "Name-server recovery not admitted"
                );
                return StepOutcome::Done(ActionOutcome::Failed);
            }
            tracing::debug!(
                adapter = adapter.name(),
                port = %port.wwpn(),
                "Parked waiting on name-server recovery"
            );
            park(action, ErpStep::PortWaitingOnNameserver)
        }
        FabricTopology::Unknown => {
            tracing::warn!(
                adapter = adapter.name(),
                port = %port.wwpn(),
                "Fabric topology unknown, adapter recovery has not completed"
            );
            StepOutcome::Done(ActionOutcome::Failed)
        }
    }
}

/// GID_PN lookup completed.
fn after_lookup(
    shared: &Arc<EngineShared>,
    action: &Arc<ErpAction>,
    port: &Arc<Port>,
) -> StepOutcome {
    if port.did().is_none() {
        if port.status.contains(Status::INVALID_WWPN) {
            // The fabric does not know this WWPN: bad configuration.
            admission::mark_target_failed(
                shared,
                &TargetRef::Port(Arc::clone(port)),
                "WWPN unknown to name server",
            );
        }
        return StepOutcome::Done(ActionOutcome::Failed);
    }

    issue(
        shared,
        action,
        HwRequestKind::OpenPort,
        ErpStep::PortOpening,
        |transport, req| transport.open_port(req),
    )
}

/// Open completed; both the open bit and a known address are required.
fn verify_open(port: &Arc<Port>) -> StepOutcome {
    if port.status.contains(Status::OPEN) && port.status.contains(Status::DID_KNOWN) {
        StepOutcome::Done(ActionOutcome::Succeeded)
    } else {
        StepOutcome::Done(ActionOutcome::Failed)
    }
}

/// Forced physical close of a port, used when the link state itself is
/// suspect.
pub(crate) fn run_forced(shared: &Arc<EngineShared>, action: &Arc<ErpAction>) -> StepOutcome {
    let port = match action.port() {
        Some(port) => Arc::clone(port),
        None => {
            tracing::error!("Internal bug: forced port recovery without a port reference");
            return StepOutcome::Done(ActionOutcome::Failed);
        }
    };

    if action.flags().contains(ActionFlags::TIMED_OUT) {
        return StepOutcome::Done(ActionOutcome::Failed);
    }

    match action.step() {
        ErpStep::Uninitialized => {
            if !port
                .status
                .intersects(Status::OPEN | Status::PHYSICALLY_OPEN)
            {
                // Nothing to force-close.
                return StepOutcome::Done(ActionOutcome::Failed);
            }
            issue(
                shared,
                action,
                HwRequestKind::ClosePhysicalPort,
                ErpStep::PhysicalPortClosing,
                |transport, req| transport.close_physical_port(req),
            )
        }
        ErpStep::PhysicalPortClosing => {
            if port.status.contains(Status::PHYSICALLY_OPEN) {
                StepOutcome::Done(ActionOutcome::Failed)
            } else {
                StepOutcome::Done(ActionOutcome::Succeeded)
            }
        }
        step => {
            tracing::error!(
                target = %action.target(),
                step = %step,
                "Internal bug: impossible step for forced port recovery"
            );
            StepOutcome::Done(ActionOutcome::Failed)
        }
    }
}
