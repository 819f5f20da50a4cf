//! Recovery-path scenarios: header arbitration, torn and corrupted
//! logs, idempotent write-back.

use rfs_block::{ByteDevice, CacheBuf, InlinePump, MemByteDevice};
use rfs_error::{Result, WalError};
use rfs_journal::{DeallocRecord, Journal, JournalConfig, JournalHooks, LogGeometry, Replay};
use rfs_types::BlockNumber;
use std::sync::Arc;

const DEV_LEN: usize = 1 << 20;
const LOG_OFF: u64 = 512 * 1024;
const LOG_LEN: u64 = 128 * 1024;
const FS_BSIZE: usize = 4096;

struct NopHooks;

impl JournalHooks for NopHooks {
    fn flush(&self, _deallocs: &[DeallocRecord]) -> Result<()> {
        Ok(())
    }

    fn flush_abort(&self) {}
}

fn geometry() -> LogGeometry {
    LogGeometry {
        log_off: LOG_OFF,
        log_len: LOG_LEN,
        log_bshift: 9,
        fs_bshift: 12,
    }
}

fn seeded_device() -> (Arc<MemByteDevice>, Arc<dyn ByteDevice>) {
    let mem = Arc::new(MemByteDevice::new(DEV_LEN));
    let dev: Arc<dyn ByteDevice> = mem.clone();
    (mem, dev)
}

fn start_journal(dev: &Arc<dyn ByteDevice>) -> Arc<Journal> {
    Journal::start(
        Arc::clone(dev),
        Arc::clone(dev),
        Arc::new(InlinePump),
        Arc::new(NopHooks),
        geometry(),
        JournalConfig::default(),
        None,
    )
    .expect("start journal")
}

fn log_one_block(dev: &Arc<dyn ByteDevice>, addr: u64, fill: u8) {
    let jnl = start_journal(dev);
    let buf = CacheBuf::new(BlockNumber(addr), vec![fill; FS_BSIZE]);
    let txn = jnl.begin().expect("begin");
    txn.add_buf(&buf);
    txn.end();
    jnl.flush(false).expect("flush");
}

#[test]
fn clean_log_replays_empty() {
    let (_, dev) = seeded_device();
    let jnl = start_journal(&dev);
    drop(jnl);

    let replay = Replay::start(Arc::clone(&dev), LOG_OFF, LOG_LEN).expect("replay");
    assert_eq!(replay.block_count(), 0);
    assert!(replay.inodes().is_empty());
    assert_eq!(replay.generation(), 1);
}

#[test]
fn uninitialized_region_is_a_format_error() {
    let (_, dev) = seeded_device();
    assert!(matches!(
        Replay::start(Arc::clone(&dev), LOG_OFF, LOG_LEN),
        Err(WalError::Format(_))
    ));
}

#[test]
fn torn_second_slot_falls_back_to_first() {
    let (_, dev) = seeded_device();
    let jnl = start_journal(&dev);
    drop(jnl);

    // Startup left generation 0 in slot 0 and generation 1 in slot 1.
    // Tear slot 1; arbitration must fall back to slot 0.
    dev.write_all_at(LOG_OFF + 512, &[0xFF_u8; 64]).expect("tear");
    let replay = Replay::start(Arc::clone(&dev), LOG_OFF, LOG_LEN).expect("replay");
    assert_eq!(replay.generation(), 0);
    assert_eq!(replay.block_count(), 0);
}

#[test]
fn unknown_record_tag_is_a_format_error() {
    let (_, dev) = seeded_device();
    log_one_block(&dev, 3, 0xAB);

    // First record descriptor sits at the start of the data area.
    dev.write_all_at(LOG_OFF + 1024, &0xDEAD_BEEF_u32.to_le_bytes())
        .expect("clobber tag");
    assert!(matches!(
        Replay::start(Arc::clone(&dev), LOG_OFF, LOG_LEN),
        Err(WalError::Format(_))
    ));
}

#[test]
fn record_length_mismatch_is_corruption() {
    let (_, dev) = seeded_device();
    log_one_block(&dev, 3, 0xAB);

    // Shrink the block-list record's self-reported length.
    dev.write_all_at(LOG_OFF + 1024 + 4, &512_u32.to_le_bytes())
        .expect("clobber len");
    let err = Replay::start(Arc::clone(&dev), LOG_OFF, LOG_LEN).expect_err("corrupt");
    assert!(matches!(err, WalError::Corruption { offset: 1024, .. }));
}

#[test]
fn write_back_is_idempotent() {
    let (mem, dev) = seeded_device();
    log_one_block(&dev, 6, 0x5A);
    dev.write_all_at(6 << 12, &[0_u8; FS_BSIZE]).expect("wipe");

    let replay = Replay::start(Arc::clone(&dev), LOG_OFF, LOG_LEN).expect("replay");
    replay.write_back(dev.as_ref()).expect("first pass");
    let first = mem.contents();
    // A crash during recovery reruns replay from scratch.
    let replay = Replay::start(Arc::clone(&dev), LOG_OFF, LOG_LEN).expect("replay again");
    replay.write_back(dev.as_ref()).expect("second pass");
    assert_eq!(mem.contents(), first);
    assert!(first[(6 << 12)..(6 << 12) + FS_BSIZE]
        .iter()
        .all(|&b| b == 0x5A));
}

#[test]
fn replay_reads_individual_blocks() {
    let (_, dev) = seeded_device();
    log_one_block(&dev, 8, 0x7E);

    let replay = Replay::start(Arc::clone(&dev), LOG_OFF, LOG_LEN).expect("replay");
    assert!(replay.can_read(8));
    assert!(!replay.can_read(9));
    let mut img = vec![0_u8; FS_BSIZE];
    replay.read(8, &mut img).expect("read");
    assert!(img.iter().all(|&b| b == 0x7E));
    assert!(replay.read(9, &mut img).is_err());
}
