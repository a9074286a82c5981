// vim: tw=80
//! Per-zone policy engine for auto-mode RAID sets.
//!
//! In auto mode every logical zone independently adopts one of the RAID
//! policies, and a persistent mapping table records which backend sub-zones
//! compose it.  A logical zone spans N backend sub-zones, one per slot; the
//! table guarantees that a data zone's N sub-zones live on N distinct
//! backends.

use std::{cmp, collections::VecDeque};

use byteorder::{ByteOrder, LittleEndian};
use num_traits::{FromPrimitive, ToPrimitive};

use crate::{
    types::*,
    zbd::{ZoneInfo, ZoneList},
};
use super::{Geometry, META_ZONES, RaidMode, Segment};

/// One slot of the persistent zone map: which backend sub-zone backs slot
/// `s` of logical zone `z`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RaidMapEntry {
    pub device_idx: u32,
    pub sub_zone_idx: u32,
    pub invalid: u16,
}

impl RaidMapEntry {
    /// Size of one entry in the on-disk encoding
    pub const ENCODED_LEN: usize = 10;

    fn encode_into(&self, out: &mut Vec<u8>) {
        let mut rec = [0u8; Self::ENCODED_LEN];
        LittleEndian::write_u32(&mut rec[0..4], self.device_idx);
        LittleEndian::write_u32(&mut rec[4..8], self.sub_zone_idx);
        LittleEndian::write_u16(&mut rec[8..10], self.invalid);
        out.extend_from_slice(&rec);
    }

    fn decode(rec: &[u8]) -> Self {
        RaidMapEntry {
            device_idx: LittleEndian::read_u32(&rec[0..4]),
            sub_zone_idx: LittleEndian::read_u32(&rec[4..8]),
            invalid: LittleEndian::read_u16(&rec[8..10]),
        }
    }
}

/// One logical zone's policy in the persistent mode map.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RaidModeEntry {
    pub mode: RaidMode,
    pub option: u32,
}

impl RaidModeEntry {
    /// Size of one entry in the on-disk encoding
    pub const ENCODED_LEN: usize = 8;

    fn encode_into(&self, out: &mut Vec<u8>) {
        let mut rec = [0u8; Self::ENCODED_LEN];
        // The tag values are part of the on-disk contract
        LittleEndian::write_u32(&mut rec[0..4], self.mode.to_u32().unwrap());
        LittleEndian::write_u32(&mut rec[4..8], self.option);
        out.extend_from_slice(&rec);
    }

    fn decode(rec: &[u8]) -> Result<Self> {
        let tag = LittleEndian::read_u32(&rec[0..4]);
        let mode = RaidMode::from_u32(tag).ok_or(Error::EINVAL)?;
        Ok(RaidModeEntry {
            mode,
            option: LittleEndian::read_u32(&rec[4..8]),
        })
    }
}

/// Encode a zone map as a flat array of fixed-width little-endian records.
pub fn encode_zone_map(map: &[RaidMapEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(map.len() * RaidMapEntry::ENCODED_LEN);
    for entry in map {
        entry.encode_into(&mut out);
    }
    out
}

pub fn decode_zone_map(buf: &[u8]) -> Result<Vec<RaidMapEntry>> {
    if buf.len() % RaidMapEntry::ENCODED_LEN != 0 {
        return Err(Error::EINVAL);
    }
    Ok(buf.chunks_exact(RaidMapEntry::ENCODED_LEN)
        .map(RaidMapEntry::decode)
        .collect())
}

/// Encode a mode map as a flat array of fixed-width little-endian records.
pub fn encode_mode_map(map: &[RaidModeEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(map.len() * RaidModeEntry::ENCODED_LEN);
    for entry in map {
        entry.encode_into(&mut out);
    }
    out
}

pub fn decode_mode_map(buf: &[u8]) -> Result<Vec<RaidModeEntry>> {
    if buf.len() % RaidModeEntry::ENCODED_LEN != 0 {
        return Err(Error::EINVAL);
    }
    buf.chunks_exact(RaidModeEntry::ENCODED_LEN)
        .map(RaidModeEntry::decode)
        .collect()
}

/// The auto-mode policy state: both persistent maps plus the synthesized
/// logical zone table derived from them.
///
/// All three are guarded by one lock in [`super::RaidDevice`]; the zone
/// table is recomputed after any mutation.
#[derive(Debug, Default)]
pub(super) struct AutoLayout {
    /// `nr_zones × N` map entries, indexed by `zone × N + slot`
    pub zone_map: Vec<RaidMapEntry>,
    /// One policy per logical zone
    pub mode_map: Vec<RaidModeEntry>,
    /// Synthesized logical zone table.  Derived state only.
    pub zones: Box<[ZoneInfo]>,
}

impl AutoLayout {
    /// Build the deterministic default layout for a set of `ndev` backends
    /// with `nr_zones` zones each.
    ///
    /// The first [`META_ZONES`] logical zones are pinned to passthrough
    /// mappings in NONE mode for the upper layer's metadata: meta zone `i`
    /// lives on backend 0's sub-zone `i`, which the allocator below never
    /// hands out again.  The remaining zones are laid out by a round-robin
    /// walk over the backends, each zone taking one sub-zone from N distinct
    /// backends, defaulting to STRIPE.
    pub fn generate(ndev: usize, nr_zones: ZoneT) -> Result<Self> {
        let meta = cmp::min(META_ZONES, nr_zones);
        let mut zone_map =
            Vec::with_capacity(nr_zones as usize * ndev);
        let mut mode_map = Vec::with_capacity(nr_zones as usize);
        for i in 0..meta {
            for _slot in 0..ndev {
                zone_map.push(RaidMapEntry {
                    device_idx: 0,
                    sub_zone_idx: i,
                    invalid: 0,
                });
            }
            mode_map.push(RaidModeEntry { mode: RaidMode::None, option: 0 });
        }

        // Round-robin rotation of backends, and each backend's FIFO of
        // still-unassigned sub-zones.  Backend 0 lost its first `meta`
        // sub-zones to the meta mappings above.
        let mut rotation: VecDeque<usize> = (0..ndev).collect();
        let mut avail: Vec<VecDeque<ZoneT>> = (0..ndev)
            .map(|i| {
                let first = if i == 0 { meta } else { 0 };
                (first..nr_zones).collect()
            }).collect();
        for _zone in meta..nr_zones {
            for _slot in 0..ndev {
                let d = rotation.pop_front().ok_or(Error::ENOSPC)?;
                let d_next = (d + 1) % ndev;
                let sub_zone_idx = if let Some(ti) = avail[d].pop_front() {
                    rotation.push_back(d_next);
                    ti
                } else {
                    // The rotation outran this backend's supply; take the
                    // next backend's head instead and drop the slot from the
                    // rotation.
                    avail[d_next].pop_front().ok_or(Error::ENOSPC)?
                };
                zone_map.push(RaidMapEntry {
                    device_idx: d as u32,
                    sub_zone_idx,
                    invalid: 0,
                });
            }
            mode_map.push(RaidModeEntry {
                mode: RaidMode::Stripe,
                option: 0,
            });
        }
        Ok(AutoLayout { zone_map, mode_map, zones: Box::default() })
    }

    /// The N map entries composing logical zone `z`.
    pub fn entries(&self, ndev: usize, z: usize) -> &[RaidMapEntry] {
        &self.zone_map[z * ndev..(z + 1) * ndev]
    }

    pub fn zone_mode(&self, z: usize) -> RaidMode {
        self.mode_map[z].mode
    }

    /// Translate `(pos, len)` into backend segments, in address order.
    ///
    /// The request must lie within a single logical zone; the façade splits
    /// larger requests at zone boundaries first.  STRIPE zones stripe at
    /// block granularity across their slots; the other policies pass each
    /// offset through to the sub-zone containing it.
    pub fn segments(&self, geom: &Geometry, mut pos: u64, mut len: usize)
        -> Vec<Segment>
    {
        let ndev = geom.ndev;
        let z = (pos / geom.zone_size) as usize;
        debug_assert!(len == 0 ||
                      (pos + len as u64 - 1) / geom.zone_size == z as u64);
        let entries = self.entries(ndev, z);
        let bs = u64::from(geom.block_size);
        let bzs = geom.backend_zone_size;
        let mut segs = Vec::new();
        match self.zone_mode(z) {
            RaidMode::Stripe => {
                let blocks_per_zone = geom.zone_size / bs;
                while len > 0 {
                    let seg_len = cmp::min(len, (bs - pos % bs) as usize);
                    let block_in_zone = (pos / bs) % blocks_per_zone;
                    let e = &entries[(block_in_zone % ndev as u64) as usize];
                    let mapped = u64::from(e.sub_zone_idx) * bzs
                        + (block_in_zone / ndev as u64) * bs
                        + pos % bs;
                    segs.push(Segment {
                        dev: e.device_idx as usize,
                        pos: mapped,
                        len: seg_len,
                    });
                    pos += seg_len as u64;
                    len -= seg_len;
                }
            }
            _ => {
                // NONE, CONCAT, and MIRROR zones pass through to the
                // sub-zone containing the offset.
                while len > 0 {
                    let off = pos % geom.zone_size;
                    let e = &entries[(off / bzs) as usize];
                    let seg_len = cmp::min(len, (bzs - off % bzs) as usize);
                    let mapped = u64::from(e.sub_zone_idx) * bzs + off % bzs;
                    segs.push(Segment {
                        dev: e.device_idx as usize,
                        pos: mapped,
                        len: seg_len,
                    });
                    pos += seg_len as u64;
                    len -= seg_len;
                }
            }
        }
        segs
    }
}

/// Rebuild the synthesized logical zone table from the maps and a snapshot
/// of every backend's zone table.
///
/// STRIPE and CONCAT zones aggregate all N sub-zones: their write pointer is
/// the linearized total of per-sub-zone progress and their capacity scales
/// by N.  MIRROR and NONE zones pass a single sub-zone through.
pub(super) fn synthesize(zone_map: &[RaidMapEntry],
                         mode_map: &[RaidModeEntry],
                         lists: &[ZoneList],
                         geom: &Geometry) -> Box<[ZoneInfo]>
{
    let ndev = geom.ndev;
    let mut zones = Vec::with_capacity(mode_map.len());
    for (z, mode_entry) in mode_map.iter().enumerate() {
        let entries = &zone_map[z * ndev..(z + 1) * ndev];
        let first = &entries[0];
        let fz = lists[first.device_idx as usize][first.sub_zone_idx];
        let start = z as u64 * geom.zone_size;
        let (progress, capacity) = match mode_entry.mode {
            RaidMode::Stripe | RaidMode::Concat => {
                let sum = entries.iter().map(|e| {
                    let zi = &lists[e.device_idx as usize][e.sub_zone_idx];
                    zi.wp - zi.start
                }).sum::<u64>();
                (sum, fz.capacity * ndev as u64)
            }
            _ => (fz.wp - fz.start, fz.capacity),
        };
        zones.push(ZoneInfo {
            start,
            len: capacity,
            capacity,
            wp: start + progress,
            zone_type: fz.zone_type,
            cond: fz.cond,
            flags: fz.flags,
        });
    }
    zones.into_boxed_slice()
}

// LCOV_EXCL_STOP
