// Recovery target entities: Adapter owns Ports, Port owns Units.
//
// Children keep weak back-references to their parents; recovery actions hold
// strong references on every level they touch, so a port or unit is never
// freed while an action still references it.

pub mod status;

pub use status::{AtomicStatus, Status};

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::JoinHandle;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::erp::action::ActionSlot;
use crate::erp::queues::ErpChannel;
use crate::ErpError;

/// World-wide port name, the stable 64-bit identity of a remote port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Wwpn(pub u64);

impl fmt::Display for Wwpn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl FromStr for Wwpn {
    type Err = ErpError;

    /// Accepts `0x5005076300c7a8d1`, bare hex, or the colon form
    /// `50:05:07:63:00:c7:a8:d1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static FORMS: std::sync::OnceLock<(Regex, Regex)> = std::sync::OnceLock::new();
        let (hex, colons) = FORMS.get_or_init(|| {
            (
                Regex::new(r"^(?:0x)?([0-9a-fA-F]{16})$").expect("static pattern"),
                Regex::new(r"^([0-9a-fA-F]{2})((?::[0-9a-fA-F]{2}){7})$").expect("static pattern"),
            )
        });

        if let Some(caps) = hex.captures(s) {
            let value = u64::from_str_radix(&caps[1], 16)
                .map_err(|_| ErpError::InvalidIdentity(s.to_string()))?;
            return Ok(Wwpn(value));
        }
        if colons.is_match(s) {
            let joined: String = s.split(':').collect();
            let value = u64::from_str_radix(&joined, 16)
                .map_err(|_| ErpError::InvalidIdentity(s.to_string()))?;
            return Ok(Wwpn(value));
        }
        Err(ErpError::InvalidIdentity(s.to_string()))
    }
}

/// 24-bit fabric address (D_ID) assigned by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FcAddress(pub u32);

impl FcAddress {
    /// Well-known address of the fabric directory (name) server.
    pub const NAME_SERVER: FcAddress = FcAddress(0x00FF_FFFC);

    pub fn is_well_known(&self) -> bool {
        self.0 >= 0x00FF_FFF0
    }
}

impl fmt::Display for FcAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:06x}", self.0 & 0x00FF_FFFF)
    }
}

/// FCP logical unit number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lun(pub u64);

impl fmt::Display for Lun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

/// Fabric topology reported by exchange-config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricTopology {
    /// Not known yet; exchange-config has not completed.
    Unknown,
    /// Two directly connected ports, no switch. The peer identity is the
    /// only valid remote port.
    PointToPoint { peer_wwpn: Wwpn, peer_did: FcAddress },
    /// Switched fabric; remote addresses are resolved via the name server.
    Fabric,
}

/// The host-side Fibre-Channel adapter.
///
/// Owns its ports, the recovery queues, and the dedicated worker thread that
/// executes recovery actions for this adapter.
pub struct Adapter {
    name: String,
    pub(crate) status: AtomicStatus,
    pub(crate) retries: AtomicU32,
    pub(crate) topology: Mutex<FabricTopology>,
    pub(crate) ports: RwLock<Vec<Arc<Port>>>,
    pub(crate) slot: ActionSlot,
    pub(crate) erp: ErpChannel,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
}

impl Adapter {
    pub(crate) fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            status: AtomicStatus::default(),
            retries: AtomicU32::new(0),
            topology: Mutex::new(FabricTopology::Unknown),
            ports: RwLock::new(Vec::new()),
            slot: ActionSlot::new(),
            erp: ErpChannel::new(),
            worker: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> &AtomicStatus {
        &self.status
    }

    pub fn fabric_topology(&self) -> FabricTopology {
        *self.topology.lock().unwrap()
    }

    /// Record the fabric topology. Learned from exchange-config during
    /// adapter recovery; embedders and simulations may seed it directly.
    pub fn set_fabric_topology(&self, topology: FabricTopology) {
        *self.topology.lock().unwrap() = topology;
    }

    /// Snapshot of the currently configured ports.
    pub fn ports(&self) -> Vec<Arc<Port>> {
        self.ports.read().unwrap().clone()
    }

    pub fn find_port(&self, wwpn: Wwpn) -> Option<Arc<Port>> {
        self.ports
            .read()
            .unwrap()
            .iter()
            .find(|p| p.wwpn() == wwpn)
            .cloned()
    }

    /// The fabric name-server well-known port, if configured.
    pub fn nameserver_port(&self) -> Option<Arc<Port>> {
        self.ports
            .read()
            .unwrap()
            .iter()
            .find(|p| p.is_nameserver())
            .cloned()
    }

    pub(crate) fn attach_port(self: &Arc<Self>, wwpn: Wwpn, is_nameserver: bool) -> Arc<Port> {
        let port = Arc::new(Port {
            wwpn,
            is_nameserver,
            did: AtomicU32::new(0),
            status: AtomicStatus::default(),
            retries: AtomicU32::new(0),
            slot: ActionSlot::new(),
            units: RwLock::new(Vec::new()),
            adapter: Arc::downgrade(self),
        });
        if is_nameserver {
            port.set_did(FcAddress::NAME_SERVER);
        }
        self.ports
            .write()
            .unwrap()
            .push(Arc::clone(&port));
        port
    }

    pub(crate) fn detach_port(&self, wwpn: Wwpn) -> Option<Arc<Port>> {
        let mut ports = self.ports.write().unwrap();
        let idx = ports.iter().position(|p| p.wwpn() == wwpn)?;
        Some(ports.remove(idx))
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("name", &self.name)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// A remote Fibre-Channel port reachable over the fabric.
pub struct Port {
    wwpn: Wwpn,
    is_nameserver: bool,
    did: AtomicU32,
    pub(crate) status: AtomicStatus,
    pub(crate) retries: AtomicU32,
    pub(crate) slot: ActionSlot,
    pub(crate) units: RwLock<Vec<Arc<Unit>>>,
    pub(crate) adapter: Weak<Adapter>,
}

impl Port {
    pub fn wwpn(&self) -> Wwpn {
        self.wwpn
    }

    pub fn is_nameserver(&self) -> bool {
        self.is_nameserver
    }

    pub fn status(&self) -> &AtomicStatus {
        &self.status
    }

    /// Last known fabric address, gated by the `DID_KNOWN` status bit.
    pub fn did(&self) -> Option<FcAddress> {
        if self.status.contains(Status::DID_KNOWN) {
            Some(FcAddress(self.did.load(Ordering::SeqCst)))
        } else {
            None
        }
    }

    pub(crate) fn set_did(&self, did: FcAddress) {
        self.did.store(did.0, Ordering::SeqCst);
        self.status.set(Status::DID_KNOWN);
    }

    pub(crate) fn clear_did(&self) {
        self.status.clear(Status::DID_KNOWN);
    }

    pub fn adapter(&self) -> Option<Arc<Adapter>> {
        self.adapter.upgrade()
    }

    pub fn units(&self) -> Vec<Arc<Unit>> {
        self.units.read().unwrap().clone()
    }

    pub fn find_unit(&self, lun: Lun) -> Option<Arc<Unit>> {
        self.units
            .read()
            .unwrap()
            .iter()
            .find(|u| u.lun() == lun)
            .cloned()
    }

    pub(crate) fn attach_unit(self: &Arc<Self>, lun: Lun) -> Arc<Unit> {
        let unit = Arc::new(Unit {
            lun,
            status: AtomicStatus::default(),
            retries: AtomicU32::new(0),
            slot: ActionSlot::new(),
            port: Arc::downgrade(self),
        });
        self.units
            .write()
            .unwrap()
            .push(Arc::clone(&unit));
        unit
    }

    pub(crate) fn detach_unit(&self, lun: Lun) -> Option<Arc<Unit>> {
        let mut units = self.units.write().unwrap();
        let idx = units.iter().position(|u| u.lun() == lun)?;
        Some(units.remove(idx))
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Port")
            .field("wwpn", &self.wwpn)
            .field("nameserver", &self.is_nameserver)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// A logical unit exposed by a remote port.
pub struct Unit {
    lun: Lun,
    pub(crate) status: AtomicStatus,
    pub(crate) retries: AtomicU32,
    pub(crate) slot: ActionSlot,
    pub(crate) port: Weak<Port>,
}

impl Unit {
    pub fn lun(&self) -> Lun {
        self.lun
    }

    pub fn status(&self) -> &AtomicStatus {
        &self.status
    }

    pub fn port(&self) -> Option<Arc<Port>> {
        self.port.upgrade()
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("lun", &self.lun)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// A reference to any recovery target level.
#[derive(Clone)]
pub enum TargetRef {
    Adapter(Arc<Adapter>),
    Port(Arc<Port>),
    Unit(Arc<Unit>),
}

impl TargetRef {
    pub fn status(&self) -> &AtomicStatus {
        match self {
            TargetRef::Adapter(a) => &a.status,
            TargetRef::Port(p) => &p.status,
            TargetRef::Unit(u) => &u.status,
        }
    }

    pub(crate) fn retries(&self) -> &AtomicU32 {
        match self {
            TargetRef::Adapter(a) => &a.retries,
            TargetRef::Port(p) => &p.retries,
            TargetRef::Unit(u) => &u.retries,
        }
    }

    pub(crate) fn slot(&self) -> &ActionSlot {
        match self {
            TargetRef::Adapter(a) => &a.slot,
            TargetRef::Port(p) => &p.slot,
            TargetRef::Unit(u) => &u.slot,
        }
    }

    /// The adapter that owns this target, if the ownership chain is intact.
    pub fn owning_adapter(&self) -> Option<Arc<Adapter>> {
        match self {
            TargetRef::Adapter(a) => Some(Arc::clone(a)),
            TargetRef::Port(p) => p.adapter(),
            TargetRef::Unit(u) => u.port().and_then(|p| p.adapter()),
        }
    }
}

impl PartialEq for TargetRef {
    /// Identity comparison: two references are equal when they point at the
    /// same entity.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TargetRef::Adapter(a), TargetRef::Adapter(b)) => Arc::ptr_eq(a, b),
            (TargetRef::Port(a), TargetRef::Port(b)) => Arc::ptr_eq(a, b),
            (TargetRef::Unit(a), TargetRef::Unit(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for TargetRef {}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRef::Adapter(a) => write!(f, "adapter {}", a.name()),
            TargetRef::Port(p) => write!(f, "port {}", p.wwpn()),
            TargetRef::Unit(u) => match u.port() {
                Some(p) => write!(f, "unit {} on port {}", u.lun(), p.wwpn()),
                None => write!(f, "unit {} (orphaned)", u.lun()),
            },
        }
    }
}

impl fmt::Debug for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
