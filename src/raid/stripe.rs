// vim: tw=80
//! Address translation for striped RAID sets.
//!
//! The stripe unit is one block.  Logical block `b` lives on backend
//! `b mod N` at backend block `b / N`, so one logical zone is the
//! interleaving of the same-index zone on every backend.

use std::cmp;

use crate::util::*;
use super::Segment;

/// The backend holding the block containing `pos`.
pub(super) fn device_index(ndev: usize, block_size: u32, pos: u64) -> usize {
    ((pos / u64::from(block_size)) % ndev as u64) as usize
}

/// `pos` translated into the address space of the backend holding its block.
pub(super) fn backend_pos(ndev: usize, block_size: u32, pos: u64) -> u64 {
    let bs = u64::from(block_size);
    (pos / bs / ndev as u64) * bs + pos % bs
}

/// Split `(pos, len)` into per-block backend segments, in address order.
pub(super) fn segments(ndev: usize, block_size: u32, mut pos: u64,
                       mut len: usize) -> Vec<Segment>
{
    let bs = u64::from(block_size);
    let mut segs = Vec::with_capacity(
        div_roundup(len, block_size as usize) + 1);
    while len > 0 {
        let seg_len = cmp::min(len, (bs - pos % bs) as usize);
        segs.push(Segment {
            dev: device_index(ndev, block_size, pos),
            pos: backend_pos(ndev, block_size, pos),
            len: seg_len,
        });
        pos += seg_len as u64;
        len -= seg_len;
    }
    segs
}

// LCOV_EXCL_STOP
