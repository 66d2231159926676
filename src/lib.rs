// Allow uppercase acronyms for industry-standard terms like WWPN, LUN, ERP
#![allow(clippy::upper_case_acronyms)]

pub mod engine;
pub mod erp;
pub mod sim;
pub mod topology;
pub mod trace;
pub mod transport;

// Re-export the main engine surface for convenience
pub use engine::{Disposition, ErpEngine};
pub use erp::action::{ActionKind, ActionOutcome, ErpStep};
pub use topology::{Adapter, FabricTopology, FcAddress, Lun, Port, Status, TargetRef, Unit, Wwpn};
pub use transport::{Completion, HwRequest, HwRequestKind, Transport, TransportError};

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the recovery entry points.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErpError {
    /// The target (after escalation) carries the permanent-failure mark;
    /// nothing was queued. Only an administrative shutdown/reopen clears it.
    #[error("recovery target has permanently failed: {0}")]
    TargetFailed(String),

    /// The adapter was detached or its recovery worker is gone.
    #[error("adapter detached: {0}")]
    AdapterDetached(String),

    /// An identity string (WWPN) could not be parsed.
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
}

pub type ErpResult<T> = Result<T, ErpError>;

/// Tunables of the recovery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Consecutive failures a target may accumulate before it is marked
    /// permanently failed.
    pub max_retries: u32,

    /// Exchange-config attempts while the firmware reports its host
    /// connection as still initializing.
    pub exchange_config_retries: u32,

    /// Deadline for every asynchronous hardware request.
    pub request_timeout: Duration,

    /// Settle time after a failed adapter recovery, so a firmware that is
    /// mid-reset is not hot-looped against.
    pub failed_settle_delay: Duration,

    /// Deferral before retrying a step that hit resource exhaustion.
    pub low_memory_delay: Duration,

    /// Base delay of the exchange-config retry backoff.
    pub exchange_config_backoff_base: Duration,

    /// Cap of the exchange-config retry backoff.
    pub exchange_config_backoff_max: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            exchange_config_retries: 6,
            request_timeout: Duration::from_secs(10),
            failed_settle_delay: Duration::from_secs(1),
            low_memory_delay: Duration::from_millis(500),
            exchange_config_backoff_base: Duration::from_millis(50),
            exchange_config_backoff_max: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod lib_tests;
