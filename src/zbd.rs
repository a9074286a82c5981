// vim: tw=80
//! The contract shared by every zoned block device in a RAID set.
//!
//! A zoned block device divides its address space into fixed-size zones,
//! most of which require sequential writes: every write must land at the
//! zone's current write pointer, and space is reclaimed only by resetting a
//! whole zone.  `ZonedBackend` is the capability every backend must provide,
//! and the RAID device itself implements it, so RAID devices may be nested.

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::types::*;

/// Zone resource limits reported by a device at open time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OpenLimits {
    /// Maximum number of zones that may be active (open or closed) at once
    pub max_active_zones: u32,
    /// Maximum number of zones that may be open at once
    pub max_open_zones: u32,
}

impl OpenLimits {
    /// Combine two devices' limits into the limits of the aggregate.
    ///
    /// The aggregate must not admit more concurrency than any member
    /// tolerates, so each field is the minimum.
    pub fn combine(self, other: Self) -> Self {
        OpenLimits {
            max_active_zones: self.max_active_zones
                .min(other.max_active_zones),
            max_open_zones: self.max_open_zones.min(other.max_open_zones),
        }
    }
}

/// Outcome of resetting a zone.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZoneReset {
    /// The device took the zone offline instead of rewinding it
    pub offline: bool,
    /// The zone's maximum capacity after the reset, in bytes
    pub max_capacity: u64,
}

/// A zone's type, fixed at format time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZoneType {
    /// Randomly writable, no write pointer
    Conventional = 0x1,
    /// Sequential-write-required: writes must land at the write pointer
    SeqWriteRequired = 0x2,
    /// Sequential writes preferred but not enforced
    SeqWritePreferred = 0x3,
}

/// A zone's condition, as reported by the device's zone table.
// The discriminants are the kernel's zone condition codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZoneCond {
    NotWp = 0x0,
    Empty = 0x1,
    ImplicitOpen = 0x2,
    ExplicitOpen = 0x3,
    Closed = 0x4,
    ReadOnly = 0xD,
    Full = 0xE,
    Offline = 0xF,
}

/// One zone's descriptor within a [`ZoneList`] snapshot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZoneInfo {
    /// First byte of the zone within its device's address space
    pub start: u64,
    /// Length of the zone in bytes
    pub len: u64,
    /// Usable capacity in bytes.  Never greater than `len`.
    pub capacity: u64,
    /// Write pointer.  Always within `[start, start + capacity]`.
    pub wp: u64,
    pub zone_type: ZoneType,
    pub cond: ZoneCond,
    /// Device-specific flag bits, passed through verbatim
    pub flags: u32,
}

impl ZoneInfo {
    /// Is any zone resource (open or closed) consumed by this zone?
    pub fn is_active(&self) -> bool {
        matches!(self.cond,
                 ZoneCond::ImplicitOpen | ZoneCond::ExplicitOpen |
                 ZoneCond::Closed)
    }

    pub fn is_offline(&self) -> bool {
        self.cond == ZoneCond::Offline
    }

    pub fn is_open(&self) -> bool {
        matches!(self.cond, ZoneCond::ImplicitOpen | ZoneCond::ExplicitOpen)
    }

    /// Does this zone require sequential writes?
    pub fn is_swr(&self) -> bool {
        self.zone_type == ZoneType::SeqWriteRequired
    }

    pub fn is_writable(&self) -> bool {
        match self.cond {
            // Conventional zones have no write pointer to violate
            ZoneCond::NotWp => true,
            ZoneCond::Empty | ZoneCond::ImplicitOpen | ZoneCond::ExplicitOpen |
            ZoneCond::Closed => self.wp < self.start + self.capacity,
            ZoneCond::ReadOnly | ZoneCond::Full | ZoneCond::Offline => false,
        }
    }
}

/// An ordered snapshot of a device's zone table.
///
/// The snapshot is only as fresh as the `list_zones` call that produced it.
#[derive(Clone, Debug)]
pub struct ZoneList {
    zones: Box<[ZoneInfo]>,
}

impl ZoneList {
    pub fn count(&self) -> ZoneT {
        self.zones.len() as ZoneT
    }

    pub fn get(&self, idx: ZoneT) -> Option<&ZoneInfo> {
        self.zones.get(idx as usize)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ZoneInfo> {
        self.zones.iter()
    }
}

impl From<Vec<ZoneInfo>> for ZoneList {
    fn from(zones: Vec<ZoneInfo>) -> Self {
        ZoneList { zones: zones.into_boxed_slice() }
    }
}

impl std::ops::Index<ZoneT> for ZoneList {
    type Output = ZoneInfo;

    fn index(&self, idx: ZoneT) -> &ZoneInfo {
        &self.zones[idx as usize]
    }
}

/// A zoned block device, either a concrete backend or a RAID aggregate.
///
/// Positions are bytes within the device's own address space.  Short reads
/// and short writes are permitted; a write advances the containing zone's
/// write pointer by exactly the returned count.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ZonedBackend: Send + Sync {
    /// The device's name, e.g. `dev:nullb0` or `raid0:dev:nullb0,dev:nullb1`
    fn name(&self) -> String;

    /// Size of the smallest addressable unit, in bytes
    fn block_size(&self) -> u32;

    /// Size of every zone, in bytes
    fn zone_size(&self) -> u64;

    /// Number of zones in the device
    fn nr_zones(&self) -> ZoneT;

    /// Total size of the device's address space, in bytes
    fn total_bytes(&self) -> u64 {
        u64::from(self.nr_zones()) * self.zone_size()
    }

    /// Open the device for I/O.
    async fn open(&mut self, readonly: bool, exclusive: bool)
        -> Result<OpenLimits>;

    /// Read up to `buf.len()` bytes at `pos`, returning the count read.
    async fn read_at(&self, buf: IoVecMut, pos: u64, direct: bool)
        -> Result<usize>;

    /// Write `buf` at `pos`, returning the count written.
    ///
    /// `pos` must equal the containing zone's write pointer if the zone is
    /// sequential-write-required.
    async fn write_at(&self, buf: IoVec, pos: u64) -> Result<usize>;

    /// Rewind the write pointer of the zone beginning at `start`.
    async fn reset_zone(&self, start: u64) -> Result<ZoneReset>;

    /// Transition the zone beginning at `start` to FULL.
    async fn finish_zone(&self, start: u64) -> Result<()>;

    /// Transition the zone beginning at `start` to CLOSED.
    async fn close_zone(&self, start: u64) -> Result<()>;

    /// Drop any cached pages for the given range.  `len` must be a multiple
    /// of the block size.
    async fn invalidate_cache(&self, pos: u64, len: u64) -> Result<()>;

    /// Take a snapshot of the device's zone table.
    async fn list_zones(&self) -> Result<ZoneList>;
}

// LCOV_EXCL_STOP
