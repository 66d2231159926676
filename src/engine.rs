// The recovery engine: public entry points, topology lifecycle, and the
// configuration-wide lock shared by all adapters.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::erp::action::ActionKind;
use crate::erp::{admission, worker};
use crate::topology::{Adapter, Lun, Port, Status, TargetRef, Unit, Wwpn};
use crate::trace::RecoveryTrace;
use crate::transport::Transport;
use crate::{ErpError, ErpResult, RecoveryConfig};

/// What became of a recovery request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// An action of this (possibly escalated) kind was appended to the
    /// ready queue.
    Queued(ActionKind),
    /// The request was merged into an action already in flight.
    Dropped,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Queued(kind) => write!(f, "queued {}", kind),
            Disposition::Dropped => f.write_str("dropped"),
        }
    }
}

/// State shared between the engine handle and every worker thread.
pub(crate) struct EngineShared {
    pub config: RecoveryConfig,
    pub transport: Arc<dyn Transport>,
    pub trace: RecoveryTrace,
    /// Outer configuration-wide lock protecting the ownership tree. Held
    /// shared during admission and dismissal, exclusively while the tree
    /// changes.
    pub config_lock: RwLock<()>,
}

/// The error-recovery engine.
///
/// Owns the adapters, their worker threads, and the recovery trace. All
/// entry points are safe to call from any thread and return immediately;
/// they only enqueue and signal.
pub struct ErpEngine {
    shared: Arc<EngineShared>,
    adapters: RwLock<Vec<Arc<Adapter>>>,
}

impl ErpEngine {
    pub fn new(transport: Arc<dyn Transport>, config: RecoveryConfig) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                config,
                transport,
                trace: RecoveryTrace::default(),
                config_lock: RwLock::new(()),
            }),
            adapters: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.shared.config
    }

    pub fn trace(&self) -> &RecoveryTrace {
        &self.shared.trace
    }

    /// Attach an adapter and start its recovery worker.
    pub fn attach_adapter(&self, name: impl Into<String>) -> Arc<Adapter> {
        let _guard = self.shared.config_lock.write().unwrap();
        let adapter = Adapter::new(name);
        let handle = worker::spawn(Arc::clone(&adapter), Arc::clone(&self.shared));
        *adapter.worker.lock().unwrap() = Some(handle);
        self.adapters.write().unwrap().push(Arc::clone(&adapter));
        tracing::info!(adapter = adapter.name(), "Adapter attached");
        adapter
    }

    /// Detach an adapter: dismiss outstanding recovery, drain, and tear the
    /// worker down cooperatively.
    pub fn detach_adapter(&self, adapter: &Arc<Adapter>) -> ErpResult<()> {
        {
            let _config = self.shared.config_lock.read().unwrap();
            let mut queues = adapter.erp.lock();
            admission::dismiss_within(
                &self.shared,
                adapter,
                &mut queues,
                &TargetRef::Adapter(Arc::clone(adapter)),
            );
        }

        // Dismissed running actions still need the worker to finalize them.
        adapter
            .erp
            .wait_quiesced_timeout(self.shared.config.request_timeout * 2);

        adapter.erp.request_shutdown();
        let handle = adapter.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        let _guard = self.shared.config_lock.write().unwrap();
        let mut adapters = self.adapters.write().unwrap();
        adapters.retain(|a| !Arc::ptr_eq(a, adapter));
        tracing::info!(adapter = adapter.name(), "Adapter detached");
        Ok(())
    }

    pub fn adapters(&self) -> Vec<Arc<Adapter>> {
        self.adapters.read().unwrap().clone()
    }

    pub fn find_adapter(&self, name: &str) -> Option<Arc<Adapter>> {
        self.adapters
            .read()
            .unwrap()
            .iter()
            .find(|a| a.name() == name)
            .cloned()
    }

    /// Configure a remote port on the adapter.
    pub fn add_port(&self, adapter: &Arc<Adapter>, wwpn: Wwpn, is_nameserver: bool) -> Arc<Port> {
        let _guard = self.shared.config_lock.write().unwrap();
        let port = adapter.attach_port(wwpn, is_nameserver);
        tracing::info!(
            adapter = adapter.name(),
            port = %wwpn,
            nameserver = is_nameserver,
            "Port configured"
        );
        port
    }

    /// Configure a logical unit on the port.
    pub fn add_unit(&self, port: &Arc<Port>, lun: Lun) -> Arc<Unit> {
        let _guard = self.shared.config_lock.write().unwrap();
        let unit = port.attach_unit(lun);
        tracing::info!(port = %port.wwpn(), lun = %lun, "Unit configured");
        unit
    }

    /// Remove a port from the configuration. Outstanding recovery on the
    /// port or its units is dismissed first; actions still holding
    /// references keep the port alive until they finalize.
    pub fn remove_port(&self, port: &Arc<Port>) -> ErpResult<()> {
        let adapter = port
            .adapter()
            .ok_or_else(|| ErpError::AdapterDetached("port has no adapter".into()))?;
        {
            let _config = self.shared.config_lock.read().unwrap();
            let mut queues = adapter.erp.lock();
            admission::dismiss_within(
                &self.shared,
                &adapter,
                &mut queues,
                &TargetRef::Port(Arc::clone(port)),
            );
        }
        let _guard = self.shared.config_lock.write().unwrap();
        adapter.detach_port(port.wwpn());
        tracing::info!(adapter = adapter.name(), port = %port.wwpn(), "Port removed");
        Ok(())
    }

    /// Remove a unit from the configuration, dismissing its recovery first.
    pub fn remove_unit(&self, unit: &Arc<Unit>) -> ErpResult<()> {
        let port = unit
            .port()
            .ok_or_else(|| ErpError::AdapterDetached("unit has no port".into()))?;
        let adapter = port
            .adapter()
            .ok_or_else(|| ErpError::AdapterDetached("port has no adapter".into()))?;
        {
            let _config = self.shared.config_lock.read().unwrap();
            let mut queues = adapter.erp.lock();
            admission::dismiss_within(
                &self.shared,
                &adapter,
                &mut queues,
                &TargetRef::Unit(Arc::clone(unit)),
            );
        }
        let _guard = self.shared.config_lock.write().unwrap();
        port.detach_unit(unit.lun());
        tracing::info!(port = %port.wwpn(), lun = %unit.lun(), "Unit removed");
        Ok(())
    }

    /// Request recovery of a target: close it and bring it back up.
    ///
    /// `clear` names status bits to clear on the target first, to force a
    /// clean re-evaluation.
    pub fn request_reopen(
        &self,
        target: &TargetRef,
        clear: Status,
        reason: &str,
    ) -> ErpResult<Disposition> {
        let want = match target {
            TargetRef::Adapter(_) => ActionKind::ReopenAdapter,
            TargetRef::Port(_) => ActionKind::ReopenPort,
            TargetRef::Unit(_) => ActionKind::ReopenUnit,
        };
        admission::trigger(&self.shared, want, target, clear, true, reason)
    }

    /// Force a physical link-level close-and-reopen of a port, e.g. after a
    /// failed lightweight link test.
    pub fn request_forced_reopen(
        &self,
        port: &Arc<Port>,
        clear: Status,
        reason: &str,
    ) -> ErpResult<Disposition> {
        admission::trigger(
            &self.shared,
            ActionKind::ReopenPortForced,
            &TargetRef::Port(Arc::clone(port)),
            clear,
            true,
            reason,
        )
    }

    /// Take a target down cleanly and reset its failure state: a reopen
    /// with both the running and the permanent-failure bits cleared.
    pub fn request_shutdown(
        &self,
        target: &TargetRef,
        clear: Status,
        reason: &str,
    ) -> ErpResult<Disposition> {
        let want = match target {
            TargetRef::Adapter(_) => ActionKind::ReopenAdapter,
            TargetRef::Port(_) => ActionKind::ReopenPort,
            TargetRef::Unit(_) => ActionKind::ReopenUnit,
        };
        admission::trigger(
            &self.shared,
            want,
            target,
            clear | Status::RUNNING | Status::ERP_FAILED,
            false,
            reason,
        )
    }

    /// Administratively mark a target permanently failed and blocked.
    pub fn mark_failed(&self, target: &TargetRef, reason: &str) {
        let _config = self.shared.config_lock.read().unwrap();
        admission::mark_target_failed(&self.shared, target, reason);
    }

    /// Block until the adapter has no recovery actions queued or running.
    pub fn wait_for_quiescence(&self, adapter: &Arc<Adapter>) {
        adapter.erp.wait_quiesced();
    }

    /// Like [`Self::wait_for_quiescence`] with a deadline; returns true on
    /// quiescence.
    pub fn wait_for_quiescence_timeout(&self, adapter: &Arc<Adapter>, timeout: Duration) -> bool {
        adapter.erp.wait_quiesced_timeout(timeout)
    }
}

impl Drop for ErpEngine {
    /// Workers are cooperatively stopped so no thread outlives the engine.
    fn drop(&mut self) {
        let adapters: Vec<_> = self.adapters.read().unwrap().clone();
        for adapter in adapters {
            adapter.erp.request_shutdown();
            let handle = adapter.worker.lock().unwrap().take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
    }
}

impl fmt::Debug for ErpEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErpEngine")
            .field("adapters", &self.adapters.read().unwrap().len())
            .finish_non_exhaustive()
    }
}
