//! Offline crash recovery.
//!
//! Replay runs before the filesystem mounts. It arbitrates the two
//! commit header slots, scans the committed window of the circular log
//! from tail to head building a last-write-wins map of filesystem
//! blocks, honors revocation records, and recovers the inode liveness
//! list. [`Replay::write_back`] then pushes the surviving block images
//! to the filesystem device.
//!
//! Replay only ever writes to the filesystem device; the log itself is
//! left untouched so recovery is idempotent and can be re-run after a
//! crash during recovery.

use crate::records::{
    self, CommitHeader, RecordHead, TAG_BLOCKS, TAG_INODES, TAG_REVOCATIONS,
};
use rfs_block::ByteDevice;
use rfs_error::{Result, WalError};
use rfs_types::{u64_to_usize, BlockSize, InodeNumber};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Recovered log state, ready for inspection or write-back.
pub struct Replay {
    dev: Arc<dyn ByteDevice>,
    log_off: u64,
    circ_off: u64,
    circ_size: u64,
    log_bshift: u32,
    fs_bshift: u32,
    generation: u32,
    /// Filesystem block address to log offset of its newest image.
    blocks: BTreeMap<u64, u64>,
    inodes: Vec<(InodeNumber, u32)>,
    inodes_head: u64,
    inodes_tail: u64,
}

impl std::fmt::Debug for Replay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replay")
            .field("generation", &self.generation)
            .field("blocks", &self.blocks.len())
            .field("inodes", &self.inodes.len())
            .finish_non_exhaustive()
    }
}

impl Replay {
    /// Read and arbitrate the commit headers, then scan the committed
    /// window of the log.
    ///
    /// The first header slot must decode; a log that never committed is
    /// a format error. The second slot supersedes the first only when
    /// it decodes cleanly and carries a higher generation, so a torn
    /// write of either slot falls back to the other.
    pub fn start(dev: Arc<dyn ByteDevice>, log_off: u64, log_len: u64) -> Result<Self> {
        let mut probe = vec![0_u8; records::COMMIT_HEADER_SIZE];
        dev.read_exact_at(log_off, &mut probe)?;
        let first = CommitHeader::decode(&probe)
            .map_err(|e| WalError::Format(format!("commit header slot 0: {e}")))?;

        let log_bsize = BlockSize::from_shift(first.log_bshift)
            .map_err(|e| WalError::Format(format!("commit header block shift: {e}")))?;
        let blocklen = log_bsize.get_u64();

        let mut slot1 = vec![0_u8; records::COMMIT_HEADER_SIZE];
        dev.read_exact_at(log_off + blocklen, &mut slot1)?;
        let header = match CommitHeader::decode(&slot1) {
            Ok(second) if second.generation.0 > first.generation.0 => second,
            _ => first,
        };

        if header.circ_off != 2 * blocklen
            || header.circ_size == 0
            || header.circ_off + header.circ_size > log_len
        {
            return Err(WalError::Format(
                "commit header geometry does not fit the log region".to_owned(),
            ));
        }
        if header.fs_bshift < header.log_bshift {
            return Err(WalError::Format(
                "commit header fs block smaller than log block".to_owned(),
            ));
        }

        tracing::info!(
            target: "rwl::replay",
            generation = header.generation.0,
            head = header.head,
            tail = header.tail,
            "replaying log"
        );

        let mut replay = Self {
            dev,
            log_off,
            circ_off: header.circ_off,
            circ_size: header.circ_size,
            log_bshift: header.log_bshift,
            fs_bshift: header.fs_bshift,
            generation: header.generation.0,
            blocks: BTreeMap::new(),
            inodes: Vec::new(),
            inodes_head: 0,
            inodes_tail: 0,
        };
        replay.process(header.tail, header.head)?;
        Ok(replay)
    }

    fn process(&mut self, tail: u64, head: u64) -> Result<()> {
        if head == 0 && tail == 0 {
            return Ok(());
        }
        let blocklen = 1_usize << self.log_bshift;
        let fs_bsize = 1_u64 << self.fs_bshift;
        let mut scratch = vec![0_u8; blocklen];
        let mut off = tail;
        while off != head {
            let record_start = off;
            self.circ_read(&mut scratch, off)?;
            off = self.circ_advance(off, blocklen as u64);
            let rec = RecordHead::decode(&scratch)
                .map_err(|e| records::corrupt(record_start, &e))?;
            match rec.tag {
                TAG_BLOCKS => {
                    let runs = records::decode_block_runs(&scratch, rec.count)
                        .map_err(|e| records::corrupt(record_start, &e))?;
                    for run in runs {
                        let nblks = u64::from(run.len) >> self.fs_bshift;
                        for j in 0..nblks {
                            self.blocks.insert(run.addr.0 + j, off);
                            off = self.circ_advance(off, fs_bsize);
                        }
                    }
                }
                TAG_REVOCATIONS => {
                    let runs = records::decode_block_runs(&scratch, rec.count)
                        .map_err(|e| records::corrupt(record_start, &e))?;
                    for run in runs {
                        let nblks = u64::from(run.len) >> self.fs_bshift;
                        for j in 0..nblks {
                            self.blocks.remove(&(run.addr.0 + j));
                        }
                    }
                }
                TAG_INODES => {
                    // The tail marks where the live list starts: the
                    // last record with the clear flag. Continuation
                    // records only move the head, so the recovered span
                    // covers the whole list.
                    if rec.flag != 0 {
                        self.inodes.clear();
                        self.inodes_tail = record_start;
                    }
                    let entries = records::decode_inode_entries(&scratch, rec.count)
                        .map_err(|e| records::corrupt(record_start, &e))?;
                    self.inodes.extend(entries);
                    self.inodes_head = off;
                }
                other => {
                    return Err(WalError::Format(format!(
                        "unknown log record tag {other:#x} at offset {record_start}"
                    )));
                }
            }
            // The record's own length must account for exactly the
            // bytes consumed.
            let expected = self.circ_advance(record_start, u64::from(rec.len));
            if expected != off {
                return Err(WalError::Corruption {
                    offset: record_start,
                    detail: "corrupted records".to_owned(),
                });
            }
        }
        tracing::info!(
            target: "rwl::replay",
            blocks = self.blocks.len(),
            inodes = self.inodes.len(),
            "log scan complete"
        );
        Ok(())
    }

    /// Write every surviving block image to the filesystem device.
    pub fn write_back(&self, fs_dev: &dyn ByteDevice) -> Result<()> {
        let fs_bsize = 1_usize << self.fs_bshift;
        let mut buf = vec![0_u8; fs_bsize];
        for (&addr, &off) in &self.blocks {
            self.circ_read(&mut buf, off)?;
            fs_dev.write_all_at(addr << self.fs_bshift, &buf)?;
        }
        fs_dev.sync()?;
        tracing::info!(
            target: "rwl::replay",
            blocks = self.blocks.len(),
            "write-back complete"
        );
        Ok(())
    }

    /// Whether the log holds an image of filesystem block `addr`.
    #[must_use]
    pub fn can_read(&self, addr: u64) -> bool {
        self.blocks.contains_key(&addr)
    }

    /// Read the logged image of filesystem block `addr` into `buf`,
    /// which must be exactly one filesystem block.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), 1_usize << self.fs_bshift);
        let off = *self
            .blocks
            .get(&addr)
            .ok_or_else(|| WalError::Format(format!("block {addr} not in log")))?;
        self.circ_read(buf, off)
    }

    /// Generation of the winning commit header.
    #[must_use]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Recovered inode liveness list.
    #[must_use]
    pub fn inodes(&self) -> &[(InodeNumber, u32)] {
        &self.inodes
    }

    /// Log offset just past the recovered inode list.
    #[must_use]
    pub fn inodes_head(&self) -> u64 {
        self.inodes_head
    }

    /// Log offset of the last inode record.
    #[must_use]
    pub fn inodes_tail(&self) -> u64 {
        self.inodes_tail
    }

    /// Number of distinct filesystem blocks with logged images.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn circ_read(&self, buf: &mut [u8], off: u64) -> Result<()> {
        let end = self.circ_off + self.circ_size;
        let mut off = if off < self.circ_off { self.circ_off } else { off };
        let mut filled = 0_usize;
        while filled < buf.len() {
            let room = u64_to_usize(end - off, "circ read span")
                .map_err(|e| WalError::Format(e.to_string()))?;
            let take = room.min(buf.len() - filled);
            self.dev
                .read_exact_at(self.log_off + off, &mut buf[filled..filled + take])?;
            filled += take;
            off += take as u64;
            if off == end {
                off = self.circ_off;
            }
        }
        Ok(())
    }

    fn circ_advance(&self, off: u64, len: u64) -> u64 {
        let off = if off < self.circ_off { self.circ_off } else { off };
        let end = self.circ_off + self.circ_size;
        debug_assert!(off < end);
        let span = end - off;
        if len < span {
            off + len
        } else {
            self.circ_off + (len - span) % self.circ_size
        }
    }
}
