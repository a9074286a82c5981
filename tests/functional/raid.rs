// vim: tw=80
//! End-to-end tests of the RAID layer over in-memory zoned backends.

use std::sync::Arc;

use divbuf::DivBufShared;
use pretty_assertions::assert_eq;
use rand::{Rng, thread_rng};
use rstest::rstest;
use zraid::{
    raid::{decode_mode_map, decode_zone_map, RaidDevice, RaidMode,
           META_ZONES},
    types::*,
    zbd::*,
};

use super::util::{SimBackend, SimHandle};

const BS: u32 = 4096;
const BZS: u64 = 0x10_0000;
const NZONES: ZoneT = 8;
const NDEV: usize = 4;

struct Harness {
    raid: RaidDevice,
    sims: Vec<SimHandle>,
}

async fn harness(mode: RaidMode, ndev: usize) -> Harness {
    let sims = (0..ndev).map(|i| {
        SimHandle(Arc::new(SimBackend::new(&format!("dev:sim{i}"), BS, BZS, NZONES)))
    }).collect::<Vec<_>>();
    let devices = sims.iter()
        .map(|s| Box::new(s.clone()) as Box<dyn ZonedBackend>)
        .collect::<Vec<_>>();
    let mut raid = RaidDevice::assemble(mode, devices).unwrap();
    raid.open(false, false).await.unwrap();
    Harness { raid, sims }
}

fn random_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    thread_rng().fill(&mut payload[..]);
    payload
}

fn iovec(payload: &[u8]) -> IoVec {
    DivBufShared::from(payload.to_vec()).try_const().unwrap()
}

async fn read_back(raid: &RaidDevice, pos: u64, len: usize) -> Vec<u8> {
    let dbs = DivBufShared::from(vec![0u8; len]);
    let count = raid.read_at(dbs.try_mut().unwrap(), pos, false).await
        .unwrap();
    assert_eq!(count, len);
    dbs.try_const().unwrap().to_vec()
}

// A striped write lands one block per backend, in round-robin order, and
// reads back intact.
#[tokio::test]
async fn stripe_write_read() {
    let h = harness(RaidMode::Stripe, NDEV).await;
    // Stream 3 MiB to push every backend's zone-0 write pointer to 0xC0000
    let fill = vec![0u8; 0x30_0000];
    assert_eq!(h.raid.write_at(iovec(&fill), 0).await.unwrap(), 0x30_0000);

    let payload = random_payload(16384);
    assert_eq!(h.raid.write_at(iovec(&payload), 0x30_0000).await.unwrap(),
               16384);
    for (i, sim) in h.sims.iter().enumerate() {
        assert_eq!(&sim.contents(0xC_0000, 4096)[..],
                   &payload[i * 4096..(i + 1) * 4096]);
    }
    assert_eq!(read_back(&h.raid, 0x30_0000, 16384).await, payload);
}

// The logical write pointer of a striped zone advances by exactly the
// number of bytes written.
#[tokio::test]
async fn stripe_write_pointer() {
    let h = harness(RaidMode::Stripe, NDEV).await;
    let fill = vec![0u8; 0x30_0000];
    h.raid.write_at(iovec(&fill), 0).await.unwrap();
    h.raid.write_at(iovec(&random_payload(16384)), 0x30_0000).await
        .unwrap();
    assert_eq!(h.raid.zone_write_pointer(0).await.unwrap(), 0x30_4000);
    assert_eq!(h.raid.zone_max_capacity(0).await.unwrap(),
               NDEV as u64 * BZS);
}

// A concatenated request routes to the backend owning its address range.
#[tokio::test]
async fn concat_routing() {
    let h = harness(RaidMode::Concat, NDEV).await;
    let payload = random_payload(4096);
    // 0x900000 is zone 1 of backend 1
    assert_eq!(h.raid.write_at(iovec(&payload), 0x90_0000).await.unwrap(),
               4096);
    assert_eq!(&h.sims[1].contents(0x10_0000, 4096)[..], &payload[..]);
    assert_eq!(read_back(&h.raid, 0x90_0000, 4096).await, payload);
    assert_eq!(h.raid.zone_write_pointer(9).await.unwrap(),
               0x90_0000 + 4096);
}

// A mirrored write is replicated on every backend, and resetting the zone
// rewinds them all.
#[tokio::test]
async fn mirror_replicates() {
    let h = harness(RaidMode::Mirror, NDEV).await;
    let payload = random_payload(4096);
    assert_eq!(h.raid.write_at(iovec(&payload), 0).await.unwrap(), 4096);
    for sim in &h.sims {
        assert_eq!(&sim.contents(0, 4096)[..], &payload[..]);
    }
    assert_eq!(h.raid.zone_write_pointer(0).await.unwrap(), 4096);

    h.raid.reset_zone(0).await.unwrap();
    assert_eq!(h.raid.zone_write_pointer(0).await.unwrap(), 0);
    // The zone accepts writes from the start again
    assert_eq!(h.raid.write_at(iovec(&payload), 0).await.unwrap(), 4096);
}

// Opening an auto-mode device with no saved layout builds the round-robin
// default: every data zone's slots land on distinct backends, and the first
// data zone takes backend 0's first free sub-zone.
#[tokio::test]
async fn auto_default_layout() {
    let h = harness(RaidMode::Auto, NDEV).await;
    let (zm, mm) = h.raid.encode_layout().unwrap();
    let zone_map = decode_zone_map(&zm).unwrap();
    let mode_map = decode_mode_map(&mm).unwrap();

    let zone3 = &zone_map[3 * NDEV..4 * NDEV];
    assert_eq!(zone3.iter().map(|e| e.device_idx).collect::<Vec<_>>(),
               vec![0, 1, 2, 3]);
    assert_eq!(zone3.iter().map(|e| e.sub_zone_idx).collect::<Vec<_>>(),
               vec![3, 0, 0, 0]);
    for z in META_ZONES as usize..NZONES as usize {
        let mut devs = zone_map[z * NDEV..(z + 1) * NDEV].iter()
            .map(|e| e.device_idx)
            .collect::<Vec<_>>();
        devs.sort_unstable();
        assert_eq!(devs, vec![0, 1, 2, 3], "zone {z}");
    }
    for z in 0..META_ZONES as usize {
        assert_eq!(mode_map[z].mode, RaidMode::None);
    }
    for z in META_ZONES as usize..NZONES as usize {
        assert_eq!(mode_map[z].mode, RaidMode::Stripe);
    }
}

// Writing a striped auto zone routes one block to each mapped sub-zone.
#[tokio::test]
async fn auto_stripe_within_zone() {
    let h = harness(RaidMode::Auto, NDEV).await;
    let zone_sz = NDEV as u64 * BZS;
    let payload = random_payload(NDEV * BS as usize);
    let pos = 3 * zone_sz;
    assert_eq!(h.raid.write_at(iovec(&payload), pos).await.unwrap(),
               payload.len());
    // Zone 3's slots are backend 0 sub-zone 3, then sub-zone 0 of backends
    // 1..3
    let subs = [3u64, 0, 0, 0];
    for (i, sim) in h.sims.iter().enumerate() {
        assert_eq!(&sim.contents(subs[i] * BZS, 4096)[..],
                   &payload[i * 4096..(i + 1) * 4096],
                   "backend {i}");
    }
    assert_eq!(read_back(&h.raid, pos, payload.len()).await, payload);
    assert_eq!(h.raid.zone_write_pointer(3).await.unwrap(),
               pos + payload.len() as u64);
}

// Meta zones pass through to a single backend sub-zone.
#[tokio::test]
async fn auto_meta_passthrough() {
    let h = harness(RaidMode::Auto, NDEV).await;
    let payload = random_payload(8192);
    assert_eq!(h.raid.write_at(iovec(&payload), 0).await.unwrap(), 8192);
    assert_eq!(&h.sims[0].contents(0, 8192)[..], &payload[..]);
    // Meta zone 1 lives on backend 0, sub-zone 1, which the data-zone
    // allocator never reuses
    let zone_sz = NDEV as u64 * BZS;
    assert_eq!(h.raid.write_at(iovec(&payload), zone_sz).await.unwrap(),
               8192);
    assert_eq!(&h.sims[0].contents(BZS, 8192)[..], &payload[..]);
    // Passthrough zones report a single sub-zone's capacity
    assert_eq!(h.raid.zone_max_capacity(0).await.unwrap(), BZS);
}

// An auto-mode layout survives the encode/decode round trip onto a freshly
// assembled device.
#[tokio::test]
async fn auto_layout_restore() {
    let h = harness(RaidMode::Auto, NDEV).await;
    let (zm, mm) = h.raid.encode_layout().unwrap();

    let h2 = harness(RaidMode::Auto, NDEV).await;
    h2.raid.restore_layout(&zm, &mm).await.unwrap();
    let (zm2, mm2) = h2.raid.encode_layout().unwrap();
    assert_eq!(zm, zm2);
    assert_eq!(mm, mm2);

    // The restored device maps I/O exactly as the original did
    let zone_sz = NDEV as u64 * BZS;
    let payload = random_payload(16384);
    h2.raid.write_at(iovec(&payload), 3 * zone_sz).await.unwrap();
    assert_eq!(&h2.sims[0].contents(3 * BZS, 4096)[..], &payload[..4096]);
}

// Anything written can be read back, in every mode.
#[rstest]
#[case::concat(RaidMode::Concat)]
#[case::stripe(RaidMode::Stripe)]
#[case::mirror(RaidMode::Mirror)]
#[case::auto(RaidMode::Auto)]
#[tokio::test]
async fn write_read_roundtrip(#[case] mode: RaidMode) {
    let h = harness(mode, NDEV).await;
    let payload = random_payload(65536);
    assert_eq!(h.raid.write_at(iovec(&payload), 0).await.unwrap(), 65536);
    assert_eq!(read_back(&h.raid, 0, 65536).await, payload);
}

// A write advances the logical write pointer by exactly its length, and a
// reset rewinds it to the zone start.
#[rstest]
#[case::concat(RaidMode::Concat)]
#[case::stripe(RaidMode::Stripe)]
#[case::mirror(RaidMode::Mirror)]
#[case::auto(RaidMode::Auto)]
#[tokio::test]
async fn reset_rewinds_write_pointer(#[case] mode: RaidMode) {
    let h = harness(mode, NDEV).await;
    let payload = random_payload(16384);
    h.raid.write_at(iovec(&payload), 0).await.unwrap();
    assert_eq!(h.raid.zone_write_pointer(0).await.unwrap(), 16384);

    let reset = h.raid.reset_zone(0).await.unwrap();
    assert!(!reset.offline);
    assert_eq!(reset.max_capacity,
               h.raid.zone_max_capacity(0).await.unwrap());
    assert_eq!(h.raid.zone_write_pointer(0).await.unwrap(), 0);
}

// Finishing a striped zone transitions every sub-zone, and the logical zone
// reports FULL.
#[tokio::test]
async fn stripe_finish_marks_full() {
    let h = harness(RaidMode::Stripe, NDEV).await;
    h.raid.write_at(iovec(&random_payload(16384)), 0).await.unwrap();
    h.raid.finish_zone(0).await.unwrap();
    let zl = h.raid.list_zones().await.unwrap();
    assert_eq!(zl[0].cond, ZoneCond::Full);
    assert!(!zl[0].is_writable());
    assert!(zl[1].is_writable());
}

#[tokio::test]
async fn invalidate_cache_smoke() {
    let h = harness(RaidMode::Stripe, NDEV).await;
    h.raid.invalidate_cache(0, NDEV as u64 * BZS).await.unwrap();

    let h = harness(RaidMode::Auto, NDEV).await;
    h.raid.invalidate_cache(0, NDEV as u64 * BZS).await.unwrap();
}
