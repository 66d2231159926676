// Recovery action value object and the per-target action slot.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bitflags::bitflags;
use uuid::Uuid;

use crate::topology::{Adapter, Port, TargetRef, Unit};

/// The closed set of recovery action kinds, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    ReopenAdapter,
    ReopenPortForced,
    ReopenPort,
    ReopenUnit,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionKind::ReopenAdapter => "reopen-adapter",
            ActionKind::ReopenPortForced => "reopen-port-forced",
            ActionKind::ReopenPort => "reopen-port",
            ActionKind::ReopenUnit => "reopen-unit",
        };
        f.write_str(name)
    }
}

/// Sub-state of an action while it executes.
///
/// A step names the hardware call whose completion the action is waiting
/// for (or, for `WaitingOnNameserver`, the nested action it is parked on).
/// Steps only advance forward within one kind's fixed sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErpStep {
    Uninitialized,
    AdapterExchangingConfig,
    AdapterExchangingPortData,
    PhysicalPortClosing,
    PortClosing,
    PortWaitingOnNameserver,
    PortLookup,
    PortOpening,
    UnitClosing,
    UnitOpening,
}

impl fmt::Display for ErpStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErpStep::Uninitialized => "uninitialized",
            ErpStep::AdapterExchangingConfig => "exchanging-config",
            ErpStep::AdapterExchangingPortData => "exchanging-port-data",
            ErpStep::PhysicalPortClosing => "physical-port-closing",
            ErpStep::PortClosing => "port-closing",
            ErpStep::PortWaitingOnNameserver => "waiting-on-nameserver",
            ErpStep::PortLookup => "nameserver-lookup",
            ErpStep::PortOpening => "port-opening",
            ErpStep::UnitClosing => "unit-closing",
            ErpStep::UnitOpening => "unit-opening",
        };
        f.write_str(name)
    }
}

bitflags! {
    /// Per-action status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ActionFlags: u32 {
        /// Superseded by a stronger action; finalize without effect.
        const DISMISSED  = 0x0001;
        /// The outstanding hardware request expired.
        const TIMED_OUT  = 0x0002;
        /// A step could not allocate; a deferred retry is scheduled.
        const LOW_MEMORY = 0x0004;
        /// Only tear the target down, never attempt to bring it back up.
        const CLOSE_ONLY = 0x0008;
    }
}

/// What a single strategy invocation produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A hardware request is outstanding; the action stays in the running
    /// queue until a completion or timeout re-signals it.
    Continues,
    /// Resource exhaustion; the worker schedules a deferred retry.
    NoMemory,
    /// The action reached a terminal outcome.
    Done(ActionOutcome),
}

/// Terminal outcome of a recovery action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Succeeded,
    Failed,
    /// Finished without retry semantics (target failed or being removed).
    Exit,
    Dismissed,
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ActionOutcome::Succeeded => "succeeded",
            ActionOutcome::Failed => "failed",
            ActionOutcome::Exit => "exit",
            ActionOutcome::Dismissed => "dismissed",
        };
        f.write_str(name)
    }
}

/// Why the worker last woke a suspended action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WakeKind {
    /// Deadline expiry means the hardware request timed out.
    RequestTimeout,
    /// Deadline expiry means the low-memory deferral elapsed.
    LowMemoryRetry,
}

/// Mutable execution state of an action.
///
/// Locked after the adapter's action lock wherever both are held.
#[derive(Debug)]
pub(crate) struct ActionState {
    pub step: ErpStep,
    /// Identity of the outstanding hardware request; completions whose
    /// token no longer matches are inert.
    pub hw_token: Option<Uuid>,
    pub wake_at: Option<Instant>,
    pub wake_kind: WakeKind,
}

/// One in-flight recovery operation against exactly one target.
pub struct ErpAction {
    id: Uuid,
    kind: ActionKind,
    reason: String,
    adapter: Arc<Adapter>,
    port: Option<Arc<Port>>,
    unit: Option<Arc<Unit>>,
    flags: AtomicU32,
    /// Attempts of the current retryable step (exchange-config).
    pub(crate) step_attempts: AtomicU32,
    pub(crate) state: Mutex<ActionState>,
}

impl ErpAction {
    pub(crate) fn new(
        kind: ActionKind,
        reason: impl Into<String>,
        adapter: Arc<Adapter>,
        port: Option<Arc<Port>>,
        unit: Option<Arc<Unit>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            kind,
            reason: reason.into(),
            adapter,
            port,
            unit,
            flags: AtomicU32::new(0),
            step_attempts: AtomicU32::new(0),
            state: Mutex::new(ActionState {
                step: ErpStep::Uninitialized,
                hw_token: None,
                wake_at: None,
                wake_kind: WakeKind::RequestTimeout,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> ActionKind {
        self.kind
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn adapter(&self) -> &Arc<Adapter> {
        &self.adapter
    }

    pub fn port(&self) -> Option<&Arc<Port>> {
        self.port.as_ref()
    }

    pub fn unit(&self) -> Option<&Arc<Unit>> {
        self.unit.as_ref()
    }

    /// The target this action recovers.
    pub fn target(&self) -> TargetRef {
        match self.kind {
            ActionKind::ReopenAdapter => TargetRef::Adapter(Arc::clone(&self.adapter)),
            ActionKind::ReopenPortForced | ActionKind::ReopenPort => {
                TargetRef::Port(Arc::clone(self.port.as_ref().expect("port action without port")))
            }
            ActionKind::ReopenUnit => {
                TargetRef::Unit(Arc::clone(self.unit.as_ref().expect("unit action without unit")))
            }
        }
    }

    pub fn flags(&self) -> ActionFlags {
        ActionFlags::from_bits_truncate(self.flags.load(Ordering::SeqCst))
    }

    pub(crate) fn set_flags(&self, flags: ActionFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    pub(crate) fn clear_flags(&self, flags: ActionFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    pub fn is_dismissed(&self) -> bool {
        self.flags().contains(ActionFlags::DISMISSED)
    }

    pub fn step(&self) -> ErpStep {
        self.state.lock().unwrap().step
    }

    /// True when this action's target lies within the subtree rooted at
    /// `target` (same target, or owned by it).
    pub(crate) fn is_within(&self, target: &TargetRef) -> bool {
        match (target, self.kind) {
            (TargetRef::Adapter(a), _) => Arc::ptr_eq(a, &self.adapter),
            (TargetRef::Port(p), ActionKind::ReopenPort | ActionKind::ReopenPortForced) => self
                .port
                .as_ref()
                .map(|own| Arc::ptr_eq(own, p))
                .unwrap_or(false),
            (TargetRef::Port(p), ActionKind::ReopenUnit) => self
                .unit
                .as_ref()
                .and_then(|u| u.port())
                .map(|own| Arc::ptr_eq(&own, p))
                .unwrap_or(false),
            (TargetRef::Unit(u), ActionKind::ReopenUnit) => self
                .unit
                .as_ref()
                .map(|own| Arc::ptr_eq(own, u))
                .unwrap_or(false),
            _ => false,
        }
    }
}

impl fmt::Debug for ErpAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErpAction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("target", &self.target())
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}

/// The per-target single-action slot.
///
/// At most one recovery action may be outstanding per target; the slot makes
/// that a structural property. The `ERP_IN_USE` status bit mirrors slot
/// occupancy for cheap advisory reads.
pub struct ActionSlot(Mutex<Option<Arc<ErpAction>>>);

impl ActionSlot {
    pub fn new() -> Self {
        Self(Mutex::new(None))
    }

    /// Claim the slot for `action`. Fails if another action holds it.
    pub(crate) fn claim(&self, action: &Arc<ErpAction>) -> bool {
        let mut slot = self.0.lock().unwrap();
        if slot.is_some() {
            return false;
        }
        *slot = Some(Arc::clone(action));
        true
    }

    /// Claim the slot for `action`, displacing any current occupant.
    ///
    /// Used by forced port reopen, which wins over an in-flight plain
    /// reopen. The displaced action is returned so the caller can dismiss
    /// it; its later release is a no-op because the identity no longer
    /// matches.
    pub(crate) fn takeover(&self, action: &Arc<ErpAction>) -> Option<Arc<ErpAction>> {
        let mut slot = self.0.lock().unwrap();
        slot.replace(Arc::clone(action))
    }

    /// Release the slot if `action` is the current occupant.
    pub(crate) fn release(&self, action: &ErpAction) -> bool {
        let mut slot = self.0.lock().unwrap();
        match slot.as_ref() {
            Some(current) if current.id() == action.id() => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn occupant(&self) -> Option<Arc<ErpAction>> {
        self.0.lock().unwrap().clone()
    }
}

impl Default for ActionSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{Lun, Wwpn};

    fn action_for_unit() -> (Arc<Adapter>, Arc<Port>, Arc<Unit>, Arc<ErpAction>) {
        let adapter = Adapter::new("fc0");
        let port = adapter.attach_port(Wwpn(0x1), false);
        let unit = port.attach_unit(Lun(0x0));
        let action = ErpAction::new(
            ActionKind::ReopenUnit,
            "test",
            Arc::clone(&adapter),
            Some(Arc::clone(&port)),
            Some(Arc::clone(&unit)),
        );
        (adapter, port, unit, action)
    }

    #[test]
    fn test_slot_claim_release_cycle() {
        let (_a, _p, unit, action) = action_for_unit();

        assert!(unit.slot.claim(&action));
        assert!(!unit.slot.claim(&action), "slot must refuse double claim");
        assert!(unit.slot.release(&action));
        assert!(unit.slot.occupant().is_none());
    }

    #[test]
    fn test_slot_release_requires_matching_identity() {
        let (adapter, port, unit, first) = action_for_unit();
        let second = ErpAction::new(
            ActionKind::ReopenUnit,
            "test",
            adapter,
            Some(port),
            Some(Arc::clone(&unit)),
        );

        assert!(unit.slot.claim(&first));
        assert!(!unit.slot.release(&second), "stranger must not release");
        assert!(unit.slot.occupant().is_some());
        assert!(unit.slot.release(&first));
    }

    #[test]
    fn test_slot_takeover_displaces_occupant() {
        let adapter = Adapter::new("fc0");
        let port = adapter.attach_port(Wwpn(0x2), false);
        let plain = ErpAction::new(
            ActionKind::ReopenPort,
            "test",
            Arc::clone(&adapter),
            Some(Arc::clone(&port)),
            None,
        );
        let forced = ErpAction::new(
            ActionKind::ReopenPortForced,
            "test",
            adapter,
            Some(Arc::clone(&port)),
            None,
        );

        assert!(port.slot.claim(&plain));
        let displaced = port.slot.takeover(&forced).unwrap();
        assert_eq!(displaced.id(), plain.id());

        // The displaced action's release must not free the new claim.
        assert!(!port.slot.release(&plain));
        assert!(port.slot.occupant().is_some());
        assert!(port.slot.release(&forced));
    }

    #[test]
    fn test_action_flags_set_and_clear() {
        let (_a, _p, _u, action) = action_for_unit();

        assert!(!action.is_dismissed());
        action.set_flags(ActionFlags::DISMISSED | ActionFlags::CLOSE_ONLY);
        assert!(action.is_dismissed());
        assert!(action.flags().contains(ActionFlags::CLOSE_ONLY));
        action.clear_flags(ActionFlags::CLOSE_ONLY);
        assert!(!action.flags().contains(ActionFlags::CLOSE_ONLY));
    }

    #[test]
    fn test_is_within_subtree() {
        let adapter = Adapter::new("fc0");
        let port = adapter.attach_port(Wwpn(0x3), false);
        let other_port = adapter.attach_port(Wwpn(0x4), false);
        let unit = port.attach_unit(Lun(0x0));

        let unit_action = ErpAction::new(
            ActionKind::ReopenUnit,
            "test",
            Arc::clone(&adapter),
            Some(Arc::clone(&port)),
            Some(Arc::clone(&unit)),
        );

        assert!(unit_action.is_within(&TargetRef::Adapter(Arc::clone(&adapter))));
        assert!(unit_action.is_within(&TargetRef::Port(Arc::clone(&port))));
        assert!(unit_action.is_within(&TargetRef::Unit(Arc::clone(&unit))));
        assert!(!unit_action.is_within(&TargetRef::Port(other_port)));
    }
}
