// Hardware/transport collaborator boundary.
//
// Every asynchronous call hands the transport a request token; the transport
// either fails synchronously (resource or validation error) or issues the
// request and later reports the result through `HwRequest::complete`, which
// applies status bits to the owning targets and wakes the action's worker.
// A completion whose token no longer matches the action's outstanding
// request (timed out, dismissed, already finalized) is inert.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::erp::action::ErpAction;
use crate::topology::{Adapter, FabricTopology, FcAddress, Port, Status, Unit};

/// Synchronous failure of a transport call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// A required allocation failed; the caller schedules a deferred retry.
    #[error("out of memory issuing hardware request")]
    NoMemory,

    /// The request could not be issued (validation or firmware rejection).
    #[error("hardware request rejected: {0}")]
    Rejected(String),
}

/// Which hardware call a request token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwRequestKind {
    OpenUnit,
    CloseUnit,
    OpenPort,
    ClosePort,
    ClosePhysicalPort,
    ExchangeConfig,
    ExchangePortData,
    NameServerLookup,
}

impl fmt::Display for HwRequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HwRequestKind::OpenUnit => "open-unit",
            HwRequestKind::CloseUnit => "close-unit",
            HwRequestKind::OpenPort => "open-port",
            HwRequestKind::ClosePort => "close-port",
            HwRequestKind::ClosePhysicalPort => "close-physical-port",
            HwRequestKind::ExchangeConfig => "exchange-config",
            HwRequestKind::ExchangePortData => "exchange-port-data",
            HwRequestKind::NameServerLookup => "name-server-lookup",
        };
        f.write_str(name)
    }
}

/// Result reported by the firmware for a completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The request did what it was asked to do.
    Success,
    /// The request executed but the firmware reported failure.
    Failure,
    /// Exchange-config: the device is still initializing its host
    /// connection; the caller should retry after a delay.
    HostConnectionInitializing,
    /// Exchange-config success with the discovered fabric topology.
    ConfigOk(FabricTopology),
    /// Exchange-port-data: the firmware does not implement the call.
    Unsupported,
    /// Name-server lookup resolved the WWPN to a fabric address.
    Resolved(FcAddress),
    /// Name-server lookup: no such WWPN registered (bad configuration).
    WwpnUnknown,
}

/// Token for one in-flight hardware request.
///
/// Owns strong references (through the action) on every target the request
/// touches, so completion can never race target teardown.
pub struct HwRequest {
    token: Uuid,
    kind: HwRequestKind,
    action: Arc<ErpAction>,
}

impl HwRequest {
    pub(crate) fn new(kind: HwRequestKind, action: Arc<ErpAction>) -> Self {
        Self {
            token: Uuid::new_v4(),
            kind,
            action,
        }
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn kind(&self) -> HwRequestKind {
        self.kind
    }

    pub fn adapter(&self) -> &Arc<Adapter> {
        self.action.adapter()
    }

    pub fn port(&self) -> Option<&Arc<Port>> {
        self.action.port()
    }

    pub fn unit(&self) -> Option<&Arc<Unit>> {
        self.action.unit()
    }

    /// Deliver the firmware's result for this request.
    ///
    /// Applies status bits to the owning targets and moves the suspended
    /// action back to the ready queue. Safe to call from any thread,
    /// including inline from within the transport call itself. Late or
    /// duplicate completions are dropped.
    pub fn complete(self, completion: Completion) {
        let adapter = Arc::clone(self.action.adapter());
        let mut queues = adapter.erp.lock();

        {
            let mut state = self.action.state.lock().unwrap();
            if state.hw_token != Some(self.token) {
                tracing::debug!(
                    adapter = adapter.name(),
                    request = %self.kind,
                    "Dropping stale hardware completion"
                );
                return;
            }
            state.hw_token = None;
            state.wake_at = None;
        }

        if !self.action.is_dismissed() {
            self.apply(&completion);
        }

        tracing::debug!(
            adapter = adapter.name(),
            request = %self.kind,
            completion = ?completion,
            "Hardware request completed"
        );

        adapter.erp.resume(&mut queues, &self.action);
    }

    /// Map (request kind, completion) onto target status bits.
    fn apply(&self, completion: &Completion) {
        let adapter = self.action.adapter();
        match (self.kind, completion) {
            (HwRequestKind::OpenUnit, Completion::Success) => {
                if let Some(unit) = self.action.unit() {
                    unit.status.set(Status::OPEN);
                }
            }
            (HwRequestKind::CloseUnit, Completion::Success) => {
                if let Some(unit) = self.action.unit() {
                    unit.status.clear(Status::OPEN);
                }
            }
            (HwRequestKind::OpenPort, Completion::Success) => {
                if let Some(port) = self.action.port() {
                    port.status.set(Status::OPEN | Status::PHYSICALLY_OPEN);
                }
            }
            (HwRequestKind::ClosePort, Completion::Success) => {
                if let Some(port) = self.action.port() {
                    port.status.clear(Status::OPEN);
                }
            }
            (HwRequestKind::ClosePhysicalPort, Completion::Success) => {
                if let Some(port) = self.action.port() {
                    port.status.clear(Status::OPEN | Status::PHYSICALLY_OPEN);
                }
            }
            (HwRequestKind::ExchangeConfig, Completion::ConfigOk(topology)) => {
                adapter.set_fabric_topology(*topology);
                adapter.status.clear(Status::HOST_CON_INIT);
                adapter.status.set(Status::XCONFIG_OK);
            }
            (HwRequestKind::ExchangeConfig, Completion::HostConnectionInitializing) => {
                adapter.status.set(Status::HOST_CON_INIT);
                adapter.status.clear(Status::XCONFIG_OK);
            }
            (HwRequestKind::ExchangeConfig, Completion::Failure) => {
                adapter.status.clear(Status::XCONFIG_OK);
            }
            (HwRequestKind::ExchangePortData, Completion::Success) => {
                adapter.status.set(Status::XPORT_OK);
            }
            (HwRequestKind::ExchangePortData, Completion::Unsupported)
            | (HwRequestKind::ExchangePortData, Completion::Failure) => {
                // Tolerated; the adapter strategy logs and proceeds.
            }
            (HwRequestKind::NameServerLookup, Completion::Resolved(did)) => {
                if let Some(port) = self.action.port() {
                    port.status.clear(Status::INVALID_WWPN);
                    port.set_did(*did);
                }
            }
            (HwRequestKind::NameServerLookup, Completion::WwpnUnknown) => {
                if let Some(port) = self.action.port() {
                    port.clear_did();
                    port.status.set(Status::INVALID_WWPN);
                }
            }
            (HwRequestKind::NameServerLookup, Completion::Failure) => {
                if let Some(port) = self.action.port() {
                    port.clear_did();
                }
            }
            (_, Completion::Failure) => {
                // Open/close failure leaves the bits as they are; the
                // strategy's verification step observes the miss.
            }
            (kind, completion) => {
                tracing::error!(
                    adapter = adapter.name(),
                    request = %kind,
                    completion = ?completion,
                    "Internal bug: completion does not match request kind"
                );
            }
        }
    }
}

impl fmt::Debug for HwRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HwRequest")
            .field("token", &self.token)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// The hardware transport collaborator.
///
/// Asynchronous calls either fail synchronously or issue the request and
/// report the result later via [`HwRequest::complete`]. Queue setup and
/// teardown are synchronous; status-buffer refill is fire-and-forget.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send + Sync {
    fn open_unit(&self, req: HwRequest) -> Result<(), TransportError>;
    fn close_unit(&self, req: HwRequest) -> Result<(), TransportError>;
    fn open_port(&self, req: HwRequest) -> Result<(), TransportError>;
    fn close_port(&self, req: HwRequest) -> Result<(), TransportError>;
    fn close_physical_port(&self, req: HwRequest) -> Result<(), TransportError>;
    fn exchange_config_data(&self, req: HwRequest) -> Result<(), TransportError>;
    fn exchange_port_data(&self, req: HwRequest) -> Result<(), TransportError>;
    fn name_server_lookup(&self, req: HwRequest) -> Result<(), TransportError>;

    /// Bring the adapter's command/response queues up.
    fn bring_queues_up(&self, adapter: &Adapter) -> Result<(), TransportError>;

    /// Tear the queues down, discarding any in-flight unrelated requests.
    /// Best-effort; never fails.
    fn tear_queues_down(&self, adapter: &Adapter);

    /// Refill the asynchronous status-notification buffer pool.
    fn refill_status_buffers(&self, adapter: &Adapter);
}
