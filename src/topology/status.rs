// Atomic status bitsets shared by adapter, port, and unit.
//
// Recovery decisions that matter are always made under the adapter's action
// lock; lock-free reads of these bits are allowed for coarse admission
// heuristics and logging, and must be treated as potentially stale.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Status bits carried by every recovery target.
    ///
    /// The common bits (`RUNNING`, `UNBLOCKED`, `ERP_FAILED`, `ERP_IN_USE`,
    /// `OPEN`) apply to all three levels; the remaining bits are only
    /// meaningful for the level noted on each.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        /// Target is configured and allowed to be (re)opened.
        const RUNNING            = 0x0000_0001;
        /// I/O to the target is administratively enabled.
        const UNBLOCKED          = 0x0000_0002;
        /// Retry budget exhausted or unambiguous configuration failure.
        const ERP_FAILED         = 0x0000_0004;
        /// A recovery action currently holds this target's slot.
        const ERP_IN_USE         = 0x0000_0008;
        /// Port/unit: logged in / opened with the firmware.
        const OPEN               = 0x0000_0010;

        /// Port: physical link-level login is established.
        const PHYSICALLY_OPEN    = 0x0000_0100;
        /// Port: fabric address (D_ID) is known.
        const DID_KNOWN          = 0x0000_0200;
        /// Port: name server reported the WWPN as unknown.
        const INVALID_WWPN       = 0x0000_0400;

        /// Adapter: command/response queues are up.
        const QUEUES_UP          = 0x0001_0000;
        /// Adapter: firmware still initializing its host connection.
        const HOST_CON_INIT      = 0x0002_0000;
        /// Adapter: exchange-config completed successfully.
        const XCONFIG_OK         = 0x0004_0000;
        /// Adapter: exchange-port-data completed successfully.
        const XPORT_OK           = 0x0008_0000;
    }
}

impl Status {
    /// Bits every freshly attached target starts with.
    pub fn initial() -> Status {
        Status::RUNNING
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lock-free container for a target's [`Status`] bits.
pub struct AtomicStatus(AtomicU32);

impl AtomicStatus {
    pub fn new(initial: Status) -> Self {
        Self(AtomicU32::new(initial.bits()))
    }

    /// Snapshot of the current bits.
    pub fn load(&self) -> Status {
        Status::from_bits_truncate(self.0.load(Ordering::SeqCst))
    }

    /// True when all bits of `mask` are set.
    pub fn contains(&self, mask: Status) -> bool {
        self.load().contains(mask)
    }

    /// True when at least one bit of `mask` is set.
    pub fn intersects(&self, mask: Status) -> bool {
        self.load().intersects(mask)
    }

    /// Set every bit of `mask`, returning the previous snapshot.
    pub fn set(&self, mask: Status) -> Status {
        Status::from_bits_truncate(self.0.fetch_or(mask.bits(), Ordering::SeqCst))
    }

    /// Clear every bit of `mask`, returning the previous snapshot.
    pub fn clear(&self, mask: Status) -> Status {
        Status::from_bits_truncate(self.0.fetch_and(!mask.bits(), Ordering::SeqCst))
    }
}

impl fmt::Debug for AtomicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.load())
    }
}

impl Default for AtomicStatus {
    fn default() -> Self {
        Self::new(Status::initial())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_status_is_running_only() {
        let status = AtomicStatus::default();
        assert!(status.contains(Status::RUNNING));
        assert!(!status.contains(Status::UNBLOCKED));
        assert!(!status.contains(Status::ERP_FAILED));
    }

    #[test]
    fn test_set_and_clear_return_previous_snapshot() {
        let status = AtomicStatus::new(Status::RUNNING);

        let before = status.set(Status::OPEN | Status::DID_KNOWN);
        assert_eq!(before, Status::RUNNING);
        assert!(status.contains(Status::OPEN | Status::DID_KNOWN));

        let before = status.clear(Status::OPEN);
        assert!(before.contains(Status::OPEN));
        assert!(!status.contains(Status::OPEN));
        assert!(status.contains(Status::DID_KNOWN));
    }

    #[test]
    fn test_intersects_matches_any_bit() {
        let status = AtomicStatus::new(Status::RUNNING);
        assert!(status.intersects(Status::RUNNING | Status::OPEN));
        assert!(!status.intersects(Status::OPEN | Status::ERP_FAILED));
    }
}
