// vim: tw=80

//! zraid RAID layer
//!
//! This aggregates several identically-shaped zoned block devices into one
//! logical zoned device, preserving sequential-write semantics through the
//! address translation of whichever RAID mode the set was assembled with.

use std::{
    cmp,
    fmt,
    str::FromStr,
    sync::RwLock,
};

use async_trait::async_trait;
use enum_primitive_derive::Primitive;
use futures::future;
use tracing::{debug, info};

use crate::{
    types::*,
    zbd::*,
};

mod auto;
mod concat;
mod stripe;

pub use self::auto::{
    RaidMapEntry,
    RaidModeEntry,
    decode_mode_map,
    decode_zone_map,
    encode_mode_map,
    encode_zone_map,
};
use self::auto::AutoLayout;

/// Logical zones reserved at the front of an auto-mode device for the upper
/// layer's metadata.  They are pinned to passthrough mappings and no policy
/// applies to them.
pub const META_ZONES: ZoneT = 3;

/// The aggregation policy governing a whole device, or a single logical zone
/// in auto mode.
// The discriminants are the persisted mode tags and must never be reordered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Primitive)]
pub enum RaidMode {
    /// Passthrough to a single sub-zone.  Only valid as a per-zone policy.
    None = 0,
    /// Backends' address spaces placed end to end
    Concat = 1,
    /// Block-granular striping across all backends
    Stripe = 2,
    /// Every write goes to all backends
    Mirror = 3,
    /// Per-zone policy, driven by a persistent mapping table
    Auto = 4,
}

impl fmt::Display for RaidMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RaidMode::None => "none",
            RaidMode::Concat => "c",
            RaidMode::Stripe => "0",
            RaidMode::Mirror => "1",
            RaidMode::Auto => "a",
        };
        f.write_str(s)
    }
}

impl FromStr for RaidMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "c" => Ok(RaidMode::Concat),
            "0" => Ok(RaidMode::Stripe),
            "1" => Ok(RaidMode::Mirror),
            "a" => Ok(RaidMode::Auto),
            _ => Err(Error::EINVAL),
        }
    }
}

/// One backend I/O produced by address translation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Segment {
    /// Index of the backend to address
    pub dev: usize,
    /// Position within the backend's address space
    pub pos: u64,
    pub len: usize,
}

/// The shape shared by every backend of a RAID set, plus the logical zone
/// size derived from it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Geometry {
    pub ndev: usize,
    pub block_size: u32,
    /// Logical zone size
    pub zone_size: u64,
    /// Zone size of each backend
    pub backend_zone_size: u64,
}

/// `RaidDevice`: N zoned backends behind the façade of one logical zoned
/// device.
///
/// The façade implements [`ZonedBackend`] itself, so RAID devices may be
/// nested.  Assemble one with [`RaidDevice::assemble`], then [`open`] it
/// before any I/O.
///
/// [`open`]: ZonedBackend::open
pub struct RaidDevice {
    mode: RaidMode,

    /// Underlying zoned devices.  Order is important!
    devices: Vec<Box<dyn ZonedBackend>>,

    block_sz: u32,
    zone_sz: u64,
    nr_zones: ZoneT,

    /// Auto-mode policy state.  `None` unless `mode` is [`RaidMode::Auto`].
    // One lock covers the maps and the synthesized zone table; it is never
    // held across suspension points.
    auto: Option<RwLock<AutoLayout>>,
}

impl RaidDevice {
    /// Compose a RAID device from its backends.
    ///
    /// The backends must all have the same geometry, which is enforced when
    /// the device is opened.
    pub fn assemble(mode: RaidMode, devices: Vec<Box<dyn ZonedBackend>>)
        -> Result<Self>
    {
        if devices.is_empty() || mode == RaidMode::None {
            return Err(Error::EINVAL);
        }
        for d in &devices {
            info!("RAID backend: {}", d.name());
        }
        let auto = if mode == RaidMode::Auto {
            Some(RwLock::new(AutoLayout::default()))
        } else {
            None
        };
        let mut dev = RaidDevice {
            mode,
            devices,
            block_sz: 0,
            zone_sz: 0,
            nr_zones: 0,
            auto,
        };
        dev.sync_geometry();
        Ok(dev)
    }

    pub fn mode(&self) -> RaidMode {
        self.mode
    }

    /// Recompute the logical geometry from the backends'.
    fn sync_geometry(&mut self) {
        let first = &self.devices[0];
        self.block_sz = first.block_size();
        self.zone_sz = first.zone_size();
        self.nr_zones = first.nr_zones();
        match self.mode {
            RaidMode::Concat => {
                self.nr_zones = self.devices.iter()
                    .map(|d| d.nr_zones())
                    .sum();
            }
            RaidMode::Stripe | RaidMode::Auto => {
                // Each logical zone interleaves one sub-zone per backend
                self.zone_sz *= self.devices.len() as u64;
            }
            RaidMode::Mirror => {}
            RaidMode::None => unreachable!(),
        }
    }

    fn ndev(&self) -> usize {
        self.devices.len()
    }

    /// Bytes of address space per backend
    fn dev_bytes(&self) -> u64 {
        self.devices[0].total_bytes()
    }

    fn backend_zone_size(&self) -> u64 {
        match self.mode {
            RaidMode::Stripe | RaidMode::Auto => {
                self.zone_sz / self.ndev() as u64
            }
            _ => self.zone_sz,
        }
    }

    fn geometry(&self) -> Geometry {
        Geometry {
            ndev: self.ndev(),
            block_size: self.block_sz,
            zone_size: self.zone_sz,
            backend_zone_size: self.backend_zone_size(),
        }
    }

    fn auto_layout(&self) -> &RwLock<AutoLayout> {
        self.auto.as_ref().expect("not an auto-mode device")
    }

    /// Translate a request within one logical zone of an auto-mode device.
    fn auto_segments(&self, pos: u64, len: usize) -> Vec<Segment> {
        let geom = self.geometry();
        self.auto_layout().read().unwrap().segments(&geom, pos, len)
    }

    /// The map entries and policy of the auto-mode zone starting at `start`.
    fn auto_zone_entries(&self, start: u64) -> (Vec<RaidMapEntry>, RaidMode) {
        let z = (start / self.zone_sz) as usize;
        let layout = self.auto_layout().read().unwrap();
        (layout.entries(self.ndev(), z).to_vec(), layout.zone_mode(z))
    }

    /// Rebuild the synthesized zone table from fresh backend zone tables.
    async fn resync_zones(&self) -> Result<()> {
        let mut lists = Vec::with_capacity(self.ndev());
        for d in &self.devices {
            lists.push(d.list_zones().await?);
        }
        let geom = self.geometry();
        let mut layout = self.auto_layout().write().unwrap();
        layout.zones = auto::synthesize(&layout.zone_map, &layout.mode_map,
                                        &lists, &geom);
        Ok(())
    }

    /// Issue every segment's read concurrently and await them all.
    ///
    /// The failure reported is the lowest-index one; on a short read the
    /// consistent prefix is returned.
    async fn read_segments(&self, mut buf: IoVecMut, segs: Vec<Segment>,
                           direct: bool) -> Result<usize>
    {
        let mut futs = Vec::with_capacity(segs.len());
        let mut lens = Vec::with_capacity(segs.len());
        for seg in &segs {
            let chunk = buf.split_to(seg.len);
            lens.push(seg.len);
            futs.push(self.devices[seg.dev].read_at(chunk, seg.pos, direct));
        }
        let results = future::join_all(futs).await;
        let mut total = 0;
        for (r, len) in results.into_iter().zip(lens) {
            let count = r?;
            total += count;
            if count < len {
                break;
            }
        }
        Ok(total)
    }

    /// Issue every segment's write, sequentially and in address order, as
    /// sequential-write zones require.
    async fn write_segments(&self, buf: IoVec, segs: Vec<Segment>)
        -> Result<usize>
    {
        let mut total = 0;
        let mut off = 0;
        for seg in segs {
            let chunk = buf.slice(off, off + seg.len);
            let count = self.devices[seg.dev].write_at(chunk, seg.pos).await?;
            total += count;
            off += seg.len;
            if count < seg.len {
                // Short write; the caller must re-issue the remainder
                break;
            }
        }
        Ok(total)
    }

    async fn read_auto(&self, mut buf: IoVecMut, mut pos: u64, direct: bool)
        -> Result<usize>
    {
        // Split at logical zone boundaries, then translate per-zone
        let mut total = 0;
        while !buf.is_empty() {
            let span = cmp::min(buf.len() as u64,
                                self.zone_sz - pos % self.zone_sz) as usize;
            let chunk = buf.split_to(span);
            let segs = self.auto_segments(pos, span);
            let count = self.read_segments(chunk, segs, direct).await?;
            total += count;
            if count < span {
                break;
            }
            pos += span as u64;
        }
        Ok(total)
    }

    async fn write_auto(&self, buf: IoVec, pos: u64) -> Result<usize> {
        let mut total = 0;
        let mut off = 0;
        while off < buf.len() {
            let zpos = pos + off as u64;
            let span = cmp::min((buf.len() - off) as u64,
                                self.zone_sz - zpos % self.zone_sz) as usize;
            let chunk = buf.slice(off, off + span);
            let segs = self.auto_segments(zpos, span);
            let count = self.write_segments(chunk, segs).await?;
            total += count;
            if count < span {
                break;
            }
            off += span;
        }
        Ok(total)
    }

    /// Serialize the auto-mode zone map and mode map for stable storage.
    pub fn encode_layout(&self) -> Result<(Vec<u8>, Vec<u8>)> {
        let layout = self.auto.as_ref().ok_or(Error::EINVAL)?
            .read().unwrap();
        Ok((auto::encode_zone_map(&layout.zone_map),
            auto::encode_mode_map(&layout.mode_map)))
    }

    /// Replace the auto-mode layout with one read back from stable storage.
    ///
    /// Overwrites the default layout built at open time.
    pub async fn restore_layout(&self, zone_map: &[u8], mode_map: &[u8])
        -> Result<()>
    {
        let zm = auto::decode_zone_map(zone_map)?;
        let mm = auto::decode_mode_map(mode_map)?;
        let ndev = self.ndev();
        let sub_zones = self.devices[0].nr_zones();
        if zm.len() != self.nr_zones as usize * ndev ||
           mm.len() != self.nr_zones as usize
        {
            return Err(Error::EINVAL);
        }
        if zm.iter().any(|e| e.device_idx as usize >= ndev ||
                             e.sub_zone_idx >= sub_zones)
        {
            return Err(Error::EINVAL);
        }
        {
            let mut layout = self.auto.as_ref().ok_or(Error::EINVAL)?
                .write().unwrap();
            layout.zone_map = zm;
            layout.mode_map = mm;
        }
        self.resync_zones().await
    }

    /// The write pointer of logical zone `zone`.
    pub async fn zone_write_pointer(&self, zone: ZoneT) -> Result<u64> {
        let zl = self.list_zones().await?;
        zl.get(zone).map(|zi| zi.wp).ok_or(Error::EINVAL)
    }

    /// The maximum capacity of logical zone `zone`, in bytes.
    pub async fn zone_max_capacity(&self, zone: ZoneT) -> Result<u64> {
        let zl = self.list_zones().await?;
        zl.get(zone).map(|zi| zi.capacity).ok_or(Error::EINVAL)
    }
}

#[async_trait]
impl ZonedBackend for RaidDevice {
    fn name(&self) -> String {
        let children = self.devices.iter()
            .map(|d| d.name())
            .collect::<Vec<_>>()
            .join(",");
        format!("raid{}:{}", self.mode, children)
    }

    fn block_size(&self) -> u32 {
        self.block_sz
    }

    fn zone_size(&self) -> u64 {
        self.zone_sz
    }

    fn nr_zones(&self) -> ZoneT {
        self.nr_zones
    }

    async fn open(&mut self, readonly: bool, exclusive: bool)
        -> Result<OpenLimits>
    {
        info!("Open(readonly={readonly}, exclusive={exclusive})");
        let mut limits: Option<OpenLimits> = None;
        for i in 0..self.devices.len() {
            let l = self.devices[i].open(readonly, exclusive).await?;
            let d = &self.devices[i];
            info!("{} opened, sz={:#x}, nr_zones={:#x}, zone_sz={:#x} \
                   blk_sz={:#x} max_active_zones={:#x}, max_open_zones={:#x}",
                  d.name(), d.total_bytes(), d.nr_zones(), d.zone_size(),
                  d.block_size(), l.max_active_zones, l.max_open_zones);
            let first = &self.devices[0];
            if d.block_size() != first.block_size() ||
               d.zone_size() != first.zone_size() ||
               d.nr_zones() != first.nr_zones()
            {
                return Err(Error::EGEOMETRY);
            }
            limits = Some(match limits {
                Some(prev) => prev.combine(l),
                None => l,
            });
        }
        self.sync_geometry();
        info!("after Open(): nr_zones={:#x}, zone_sz={:#x} blk_sz={:#x}",
              self.nr_zones, self.zone_sz, self.block_sz);
        if self.mode == RaidMode::Auto {
            let layout = AutoLayout::generate(self.ndev(), self.nr_zones)?;
            *self.auto_layout().write().unwrap() = layout;
            self.resync_zones().await?;
        }
        Ok(limits.expect("assemble() requires at least one backend"))
    }

    async fn read_at(&self, buf: IoVecMut, pos: u64, direct: bool)
        -> Result<usize>
    {
        match self.mode {
            RaidMode::Concat => {
                let seg = concat::locate(self.dev_bytes(), self.ndev(), pos,
                                         buf.len())?;
                self.devices[seg.dev].read_at(buf, seg.pos, direct).await
            }
            // Reads are served by the first backend only
            RaidMode::Mirror => {
                self.devices[0].read_at(buf, pos, direct).await
            }
            RaidMode::Stripe => {
                let segs = stripe::segments(self.ndev(), self.block_sz, pos,
                                            buf.len());
                self.read_segments(buf, segs, direct).await
            }
            RaidMode::Auto => self.read_auto(buf, pos, direct).await,
            RaidMode::None => unreachable!(),
        }
    }

    async fn write_at(&self, buf: IoVec, pos: u64) -> Result<usize> {
        match self.mode {
            RaidMode::Concat => {
                let seg = concat::locate(self.dev_bytes(), self.ndev(), pos,
                                         buf.len())?;
                self.devices[seg.dev].write_at(buf, seg.pos).await
            }
            RaidMode::Mirror => {
                // One identical write per backend, issued in order; the
                // returned count is the shortest any backend accepted.
                let mut written = buf.len();
                for d in &self.devices {
                    let count = d.write_at(buf.clone(), pos).await?;
                    written = cmp::min(written, count);
                }
                Ok(written)
            }
            RaidMode::Stripe => {
                let segs = stripe::segments(self.ndev(), self.block_sz, pos,
                                            buf.len());
                self.write_segments(buf, segs).await
            }
            RaidMode::Auto => self.write_auto(buf, pos).await,
            RaidMode::None => unreachable!(),
        }
    }

    async fn reset_zone(&self, start: u64) -> Result<ZoneReset> {
        debug!("reset_zone(start={start:#x})");
        assert_eq!(start % self.zone_sz, 0,
                   "reset must target a zone start");
        match self.mode {
            RaidMode::Concat => {
                let seg = concat::locate(self.dev_bytes(), self.ndev(), start,
                                         0)?;
                self.devices[seg.dev].reset_zone(seg.pos).await
            }
            RaidMode::Mirror => {
                let mut offline = false;
                let mut max_capacity = 0;
                for d in &self.devices {
                    let r = d.reset_zone(start).await?;
                    offline |= r.offline;
                    max_capacity = r.max_capacity;
                }
                Ok(ZoneReset { offline, max_capacity })
            }
            RaidMode::Stripe => {
                assert_eq!(start % u64::from(self.block_sz), 0);
                let sub_start = start / self.ndev() as u64;
                let mut offline = false;
                let mut max_capacity = 0;
                for d in &self.devices {
                    let r = d.reset_zone(sub_start).await?;
                    offline |= r.offline;
                    max_capacity = r.max_capacity;
                }
                // Scale the backends' common capacity exactly once
                Ok(ZoneReset {
                    offline,
                    max_capacity: max_capacity * self.ndev() as u64,
                })
            }
            RaidMode::Auto => {
                let (entries, zmode) = self.auto_zone_entries(start);
                let bzs = self.backend_zone_size();
                let mut offline = false;
                let mut max_capacity = 0;
                for e in &entries {
                    let sub_start = u64::from(e.sub_zone_idx) * bzs;
                    let r = self.devices[e.device_idx as usize]
                        .reset_zone(sub_start).await?;
                    debug!("reset device {} zone {}", e.device_idx,
                           e.sub_zone_idx);
                    offline |= r.offline;
                    max_capacity = r.max_capacity;
                }
                let scale = match zmode {
                    RaidMode::Stripe | RaidMode::Concat =>
                        self.ndev() as u64,
                    _ => 1,
                };
                {
                    // The zone's content is gone; its mapping is valid again
                    let z = (start / self.zone_sz) as usize;
                    let ndev = self.ndev();
                    let mut layout = self.auto_layout().write().unwrap();
                    for e in layout.zone_map[z * ndev..(z + 1) * ndev]
                        .iter_mut()
                    {
                        e.invalid = 0;
                    }
                }
                self.resync_zones().await?;
                Ok(ZoneReset { offline, max_capacity: max_capacity * scale })
            }
            RaidMode::None => unreachable!(),
        }
    }

    /// Transition a logical zone to FULL.
    ///
    /// Fan-out modes apply this to every backend sub-zone with at-least-once
    /// semantics: the first failure is returned without rolling back the
    /// backends that already succeeded, and the caller converges by
    /// re-issuing.
    async fn finish_zone(&self, start: u64) -> Result<()> {
        debug!("finish_zone(start={start:#x})");
        assert_eq!(start % self.zone_sz, 0,
                   "finish must target a zone start");
        match self.mode {
            RaidMode::Concat => {
                let seg = concat::locate(self.dev_bytes(), self.ndev(), start,
                                         0)?;
                self.devices[seg.dev].finish_zone(seg.pos).await
            }
            RaidMode::Mirror => {
                for d in &self.devices {
                    d.finish_zone(start).await?;
                }
                Ok(())
            }
            RaidMode::Stripe => {
                assert_eq!(start % u64::from(self.block_sz), 0);
                let sub_start = start / self.ndev() as u64;
                for d in &self.devices {
                    d.finish_zone(sub_start).await?;
                }
                Ok(())
            }
            RaidMode::Auto => {
                let (entries, _) = self.auto_zone_entries(start);
                let bzs = self.backend_zone_size();
                for e in &entries {
                    self.devices[e.device_idx as usize]
                        .finish_zone(u64::from(e.sub_zone_idx) * bzs)
                        .await?;
                }
                self.resync_zones().await
            }
            RaidMode::None => unreachable!(),
        }
    }

    /// Transition a logical zone to CLOSED.
    ///
    /// Same at-least-once fan-out semantics as [`finish_zone`].
    ///
    /// [`finish_zone`]: Self::finish_zone
    async fn close_zone(&self, start: u64) -> Result<()> {
        debug!("close_zone(start={start:#x})");
        assert_eq!(start % self.zone_sz, 0,
                   "close must target a zone start");
        match self.mode {
            RaidMode::Concat => {
                let seg = concat::locate(self.dev_bytes(), self.ndev(), start,
                                         0)?;
                self.devices[seg.dev].close_zone(seg.pos).await
            }
            RaidMode::Mirror => {
                for d in &self.devices {
                    d.close_zone(start).await?;
                }
                Ok(())
            }
            RaidMode::Stripe => {
                assert_eq!(start % u64::from(self.block_sz), 0);
                let sub_start = start / self.ndev() as u64;
                for d in &self.devices {
                    d.close_zone(sub_start).await?;
                }
                Ok(())
            }
            RaidMode::Auto => {
                let (entries, _) = self.auto_zone_entries(start);
                let bzs = self.backend_zone_size();
                for e in &entries {
                    self.devices[e.device_idx as usize]
                        .close_zone(u64::from(e.sub_zone_idx) * bzs)
                        .await?;
                }
                self.resync_zones().await
            }
            RaidMode::None => unreachable!(),
        }
    }

    async fn invalidate_cache(&self, pos: u64, len: u64) -> Result<()> {
        assert_eq!(len % u64::from(self.block_sz), 0,
                   "invalidation length must be block-aligned");
        match self.mode {
            RaidMode::Concat => {
                let seg = concat::locate(self.dev_bytes(), self.ndev(), pos,
                                         len as usize)?;
                self.devices[seg.dev].invalidate_cache(seg.pos, len).await
            }
            RaidMode::Mirror => {
                for d in &self.devices {
                    d.invalidate_cache(pos, len).await?;
                }
                Ok(())
            }
            RaidMode::Stripe => {
                let sub_pos = stripe::backend_pos(self.ndev(), self.block_sz,
                                                  pos);
                let sub_len = len / self.ndev() as u64;
                for d in &self.devices {
                    d.invalidate_cache(sub_pos, sub_len).await?;
                }
                Ok(())
            }
            RaidMode::Auto => {
                assert_eq!(pos % self.zone_sz, 0);
                assert_eq!(len % self.zone_sz, 0);
                let bzs = self.backend_zone_size();
                let first_zone = pos / self.zone_sz;
                let zones = len / self.zone_sz;
                for z in first_zone..first_zone + zones {
                    let (entries, _) =
                        self.auto_zone_entries(z * self.zone_sz);
                    for e in &entries {
                        self.devices[e.device_idx as usize]
                            .invalidate_cache(u64::from(e.sub_zone_idx) * bzs,
                                              bzs)
                            .await?;
                    }
                }
                self.resync_zones().await
            }
            RaidMode::None => unreachable!(),
        }
    }

    async fn list_zones(&self) -> Result<ZoneList> {
        match self.mode {
            RaidMode::Concat => {
                // Concatenate the backends' tables, rebasing each zone into
                // the logical address space
                let mut zones =
                    Vec::with_capacity(self.nr_zones as usize);
                let mut base = 0;
                for d in &self.devices {
                    let zl = d.list_zones().await?;
                    for zi in zl.iter() {
                        let start = base + zi.start;
                        zones.push(ZoneInfo {
                            start,
                            wp: start + (zi.wp - zi.start),
                            ..*zi
                        });
                    }
                    base += d.total_bytes();
                }
                Ok(ZoneList::from(zones))
            }
            RaidMode::Mirror => self.devices[0].list_zones().await,
            RaidMode::Stripe => {
                let mut lists = Vec::with_capacity(self.ndev());
                for d in &self.devices {
                    lists.push(d.list_zones().await?);
                }
                let ndev = self.ndev() as u64;
                let zones = lists[0].iter().enumerate().map(|(i, z0)| {
                    let start = i as u64 * self.zone_sz;
                    // A striped zone is full when every sub-zone is; its
                    // progress is the linearized total of theirs
                    let progress = lists.iter()
                        .map(|zl| zl[i as ZoneT].wp - zl[i as ZoneT].start)
                        .sum::<u64>();
                    ZoneInfo {
                        start,
                        len: z0.len * ndev,
                        capacity: z0.capacity * ndev,
                        wp: start + progress,
                        ..*z0
                    }
                }).collect::<Vec<_>>();
                Ok(ZoneList::from(zones))
            }
            RaidMode::Auto => {
                self.resync_zones().await?;
                let layout = self.auto_layout().read().unwrap();
                Ok(ZoneList::from(layout.zones.to_vec()))
            }
            RaidMode::None => unreachable!(),
        }
    }
}

// LCOV_EXCL_STOP
