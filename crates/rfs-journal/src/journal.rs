//! Write-ahead journal core.
//!
//! A `Journal` owns a circular log region on the journal device plus
//! the in-memory transaction state: the set of dirty metadata buffers
//! registered for the current transaction, the deallocation ledger,
//! the inode liveness table, and the queue of committed transactions
//! whose metadata writes are still in flight.
//!
//! # Locking
//!
//! Three locks, always acquired in this order:
//!
//! 1. `gate` — transaction gate. Mutators hold it shared for the span
//!    of a transaction ([`Journal::begin`] to [`Txn::end`]); the flush
//!    engine holds it exclusive, so a flush sees a quiescent
//!    transaction set.
//! 2. `writer` — the buffered log writer, only taken by the flush and
//!    truncate paths (gate held exclusive).
//! 3. `state` — everything mutable. Held only for short critical
//!    sections, never across I/O.
//!
//! Asynchronous metadata completions ([`Journal::biodone`]) take only
//! `state`.

use crate::arena::{Arena, Cookie};
use crate::circ;
use crate::records::{self, BlockRun};
use crate::replay::Replay;
use crate::writer::LogWriter;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use rfs_block::{ByteDevice, CacheBuf, DeviceCaps, WriteJob, WritePump};
use rfs_error::{Result, WalError};
use rfs_types::{
    align_down, div_round_up, BlockNumber, BlockSize, InodeNumber, PAGE_SHIFT,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest single device I/O the journal issues.
pub const MAX_IO: usize = 64 * 1024;

/// Placement of the log region on the journal device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogGeometry {
    /// Byte offset of the region start on the journal device.
    pub log_off: u64,
    /// Region length in bytes, headers included.
    pub log_len: u64,
    /// Log device block shift.
    pub log_bshift: u32,
    /// Filesystem block shift.
    pub fs_bshift: u32,
}

/// Journal tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Memory budget for dirty journaled buffers; half of it becomes
    /// the buffer-bytes ceiling.
    pub mem_budget: usize,
    /// Ceiling on registered buffer count.
    pub max_buf_count: usize,
    /// Staging buffers in the log writer pool.
    pub iobuf_count: usize,
    /// Size of each staging buffer.
    pub iobuf_len: usize,
    /// Issue disk cache flushes around commits.
    pub flush_disk_cache: bool,
    /// Trust FUA-capable devices and skip the post-commit cache flush.
    pub allow_fua_dpo: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            mem_budget: 16 * 1024 * 1024,
            max_buf_count: 8192,
            iobuf_count: 4,
            iobuf_len: MAX_IO,
            flush_disk_cache: true,
            allow_fua_dpo: false,
        }
    }
}

/// A block range scheduled for deallocation once the current
/// transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeallocRecord {
    /// First filesystem block of the range.
    pub addr: BlockNumber,
    /// Range length in bytes.
    pub len: u32,
}

/// Filesystem callbacks invoked by the flush engine.
pub trait JournalHooks: Send + Sync {
    /// Called at the start of a flush with the pending deallocations.
    /// The filesystem gets a chance to push dependent state down
    /// before the transaction is written.
    fn flush(&self, deallocs: &[DeallocRecord]) -> Result<()>;

    /// Called when a flush fails after the callback above succeeded.
    fn flush_abort(&self);
}

/// Derived capacity limits, fixed at start.
#[derive(Debug, Clone, Copy)]
struct Limits {
    bufbytes_max: usize,
    bufcount_max: usize,
    dealloc_lim: usize,
}

#[derive(Debug)]
struct Entry {
    id: u64,
    bufcount: usize,
    reclaimable_bytes: u64,
    /// Completions that reported failure. They never decrement
    /// `bufcount`, so the entry stays pinned.
    errored: usize,
}

#[derive(Debug, Default)]
struct Stats {
    commits: AtomicU64,
    meta_writes: AtomicU64,
    cache_flushes: AtomicU64,
}

/// Point-in-time counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Commit headers written.
    pub commits: u64,
    /// Log device writes submitted.
    pub journal_writes: u64,
    /// Log writer reclaims that found an already-completed write.
    pub journal_write_nowait: u64,
    /// Asynchronous metadata write completions.
    pub meta_writes: u64,
    /// Disk cache flushes issued.
    pub cache_flushes: u64,
}

struct State {
    head: u64,
    tail: u64,
    generation: u32,
    reserved: u64,
    reclaimable: u64,
    error_count: usize,
    unsynced: u64,
    bufbytes: usize,
    bcount: usize,
    bufcount: usize,
    lock_count: usize,
    bufs: VecDeque<Arc<CacheBuf>>,
    deallocs: Arena<DeallocRecord>,
    inodes: HashMap<u64, u32>,
    entries: VecDeque<Entry>,
    detached: HashMap<u64, usize>,
    next_entry_id: u64,
}

pub struct Journal {
    dev: Arc<dyn ByteDevice>,
    fs_dev: Arc<dyn ByteDevice>,
    pump: Arc<dyn WritePump>,
    hooks: Arc<dyn JournalHooks>,
    cfg: JournalConfig,
    caps: DeviceCaps,
    log_off: u64,
    circ_off: u64,
    circ_size: u64,
    log_bshift: u32,
    fs_bshift: u32,
    limits: Limits,
    gate: RwLock<()>,
    writer: Mutex<LogWriter>,
    state: Mutex<State>,
    space_cond: Condvar,
    stats: Stats,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("log_off", &self.log_off)
            .field("circ_off", &self.circ_off)
            .field("circ_size", &self.circ_size)
            .field("log_bshift", &self.log_bshift)
            .field("fs_bshift", &self.fs_bshift)
            .finish_non_exhaustive()
    }
}

impl Journal {
    /// Validate geometry, derive limits, and bring the journal online.
    ///
    /// When `replay` carries recovered inodes, their on-disk list is
    /// reused: the inodes are re-registered, the log positions itself
    /// just past the recovered list, and the first commit header of the
    /// new incarnation supersedes the recovered one.
    pub fn start(
        dev: Arc<dyn ByteDevice>,
        fs_dev: Arc<dyn ByteDevice>,
        pump: Arc<dyn WritePump>,
        hooks: Arc<dyn JournalHooks>,
        geometry: LogGeometry,
        cfg: JournalConfig,
        replay: Option<&Replay>,
    ) -> Result<Arc<Self>> {
        let log_bsize = BlockSize::from_shift(geometry.log_bshift)
            .map_err(|e| WalError::InvalidGeometry(format!("log block shift: {e}")))?;
        BlockSize::from_shift(geometry.fs_bshift)
            .map_err(|e| WalError::InvalidGeometry(format!("fs block shift: {e}")))?;
        if geometry.fs_bshift < geometry.log_bshift {
            return Err(WalError::Unsupported(
                "fs block smaller than log block".to_owned(),
            ));
        }
        let blocklen = log_bsize.get_u64();
        let circ_off = 2 * blocklen;
        if geometry.log_len < circ_off {
            return Err(WalError::TooSmall(geometry.log_len));
        }
        let circ_size = align_down(geometry.log_len - circ_off, blocklen)
            .ok_or_else(|| WalError::InvalidGeometry("log block size not a power of two".to_owned()))?;
        if circ_size < MAX_IO as u64 {
            return Err(WalError::TooSmall(geometry.log_len));
        }
        let end = geometry
            .log_off
            .checked_add(geometry.log_len)
            .ok_or_else(|| WalError::InvalidGeometry("log region overflows".to_owned()))?;
        if end > dev.len_bytes() {
            return Err(WalError::OutOfBounds {
                offset: geometry.log_off,
                len: geometry.log_len as usize,
                device_len: dev.len_bytes(),
            });
        }

        let fs_bsize = 1_usize << geometry.fs_bshift;
        let round_shift = PAGE_SHIFT.max(geometry.log_bshift).max(geometry.fs_bshift);
        let bufbytes_max = align_down(
            circ_size.min((cfg.mem_budget / 2) as u64),
            1_u64 << round_shift,
        )
        .unwrap_or(0) as usize;
        if bufbytes_max == 0 {
            return Err(WalError::TooSmall(geometry.log_len));
        }
        let limits = Limits {
            bufbytes_max,
            bufcount_max: cfg.max_buf_count,
            dealloc_lim: bufbytes_max / fs_bsize / 2,
        };

        let caps = dev.cache_caps();
        let writer = LogWriter::new(
            Arc::clone(&dev),
            Arc::clone(&pump),
            cfg.iobuf_count,
            cfg.iobuf_len,
        );

        let jnl = Arc::new(Self {
            dev,
            fs_dev,
            pump,
            hooks,
            cfg,
            caps,
            log_off: geometry.log_off,
            circ_off,
            circ_size,
            log_bshift: geometry.log_bshift,
            fs_bshift: geometry.fs_bshift,
            limits,
            gate: RwLock::new(()),
            writer: Mutex::new(writer),
            state: Mutex::new(State {
                head: 0,
                tail: 0,
                generation: 0,
                reserved: 0,
                reclaimable: 0,
                error_count: 0,
                unsynced: 0,
                bufbytes: 0,
                bcount: 0,
                bufcount: 0,
                lock_count: 0,
                bufs: VecDeque::new(),
                deallocs: Arena::new(limits.dealloc_lim),
                inodes: HashMap::new(),
                entries: VecDeque::new(),
                detached: HashMap::new(),
                next_entry_id: 0,
            }),
            space_cond: Condvar::new(),
            stats: Stats::default(),
        });

        if let Some(replay) = replay {
            jnl.state.lock().generation = replay.generation().wrapping_add(1);
            if !replay.inodes().is_empty() {
                jnl.start_flush_inodes(replay)?;
            }
        }

        // Make the (possibly empty) starting state durable so a crash
        // before the first flush replays cleanly.
        {
            let mut writer = jnl.writer.lock();
            let (head, tail) = {
                let s = jnl.state.lock();
                (s.head, s.tail)
            };
            jnl.write_commit(&mut writer, head, tail)?;
        }

        tracing::info!(
            target: "rwl::journal",
            log_off = jnl.log_off,
            circ_off = jnl.circ_off,
            circ_size = jnl.circ_size,
            bufbytes_max = jnl.limits.bufbytes_max,
            bufcount_max = jnl.limits.bufcount_max,
            dealloc_lim = jnl.limits.dealloc_lim,
            "journal started"
        );
        Ok(jnl)
    }

    /// Flush everything out and shut down.
    ///
    /// Registered inodes mean live unlinked files; without `force` the
    /// journal refuses to stop while any remain. With `force`, errors
    /// and leftovers are discarded.
    pub fn stop(self: &Arc<Self>, force: bool) -> Result<()> {
        if let Err(e) = self.flush(true) {
            if !force {
                return Err(e);
            }
            tracing::warn!(target: "rwl::journal", error = %e, "final flush failed, discarding");
            self.discard();
        }
        let inodes_remain = !self.state.lock().inodes.is_empty();
        if inodes_remain {
            if !force {
                return Err(WalError::Busy("inodes still registered".to_owned()));
            }
            self.discard();
        }
        let s = self.state.lock();
        debug_assert_eq!(s.bufcount, 0);
        debug_assert_eq!(s.bufbytes, 0);
        debug_assert_eq!(s.bcount, 0);
        debug_assert!(s.deallocs.is_empty());
        debug_assert!(s.inodes.is_empty());
        debug_assert_eq!(s.lock_count, 0);
        tracing::info!(target: "rwl::journal", "journal stopped");
        Ok(())
    }

    /// Open a transaction.
    ///
    /// If the pending transaction has grown past half of any limit, an
    /// asynchronous flush is kicked first so writers cannot outrun the
    /// log.
    pub fn begin(self: &Arc<Self>) -> Result<Txn<'_>> {
        let doflush = {
            let s = self.state.lock();
            s.bufbytes + s.lock_count * MAX_IO > self.limits.bufbytes_max / 2
                || s.bufcount + s.lock_count * 10 > self.limits.bufcount_max / 2
                || self.transaction_len_locked(&s) > self.circ_size / 2
                || s.deallocs.len() >= self.limits.dealloc_lim / 2
        };
        if doflush {
            self.flush(false)?;
        }
        let gate = self.gate.read();
        self.state.lock().lock_count += 1;
        Ok(Txn {
            jnl: self.as_ref(),
            _gate: gate,
        })
    }

    /// Write the pending transaction to the log and commit it.
    ///
    /// With `wait`, also blocks until every previously committed
    /// transaction has finished its metadata writes and the log has
    /// drained back to its reserve.
    pub fn flush(self: &Arc<Self>, wait: bool) -> Result<()> {
        if !wait && self.state.lock().bufcount == 0 {
            return Ok(());
        }
        let _gate = self.gate.write();
        let result = self.flush_gated(wait);
        if let Err(error) = &result {
            tracing::error!(target: "rwl::journal", %error, "flush failed");
            self.hooks.flush_abort();
        }
        result
    }

    fn flush_gated(self: &Arc<Self>, wait: bool) -> Result<()> {
        let dealloc_snapshot: Vec<DeallocRecord> = {
            let s = self.state.lock();
            s.deallocs.iter().map(|(_, d)| *d).collect()
        };
        self.hooks.flush(&dealloc_snapshot)?;

        let (bufcount, flushsize) = {
            let s = self.state.lock();
            (s.bufcount, self.transaction_len_locked(&s))
        };
        if bufcount == 0 {
            if wait {
                let reserved = self.state.lock().reserved;
                self.truncate(self.circ_size - reserved)?;
            }
            return Ok(());
        }

        assert!(
            flushsize <= self.circ_size - self.state.lock().reserved,
            "transaction of {flushsize} bytes exceeds log capacity"
        );
        self.truncate(flushsize)?;

        let mut writer = self.writer.lock();
        let (head0, tail0, bufs): (u64, u64, Vec<Arc<CacheBuf>>) = {
            let s = self.state.lock();
            (s.head, s.tail, s.bufs.iter().map(Arc::clone).collect())
        };

        let mut off = head0;
        off = self.write_blocks(&mut writer, &bufs, off)?;
        off = self.write_revocations(&mut writer, off)?;
        let (off, reserved) = self.write_inodes(&mut writer, off)?;

        let (head, tail) = circ::advance_head(self.circ_size, self.circ_off, flushsize, head0, tail0);
        debug_assert_eq!(head, off, "log offset accounting");
        let delta = self.state.lock().reclaimable;
        let (head, tail) = circ::advance_tail(self.circ_size, self.circ_off, delta, head, tail);

        self.write_commit(&mut writer, head, tail)?;

        let (entry_id, to_write) = {
            let mut s = self.state.lock();
            s.reserved = reserved;
            s.head = head;
            s.tail = tail;
            s.reclaimable -= delta;
            s.unsynced += s.bufbytes as u64;
            let entry_id = s.next_entry_id;
            s.next_entry_id += 1;
            let bufcount = s.bufcount;
            s.entries.push_back(Entry {
                id: entry_id,
                bufcount,
                reclaimable_bytes: flushsize,
                errored: 0,
            });
            let to_write: Vec<Arc<CacheBuf>> = s.bufs.drain(..).collect();
            s.bufbytes = 0;
            s.bcount = 0;
            s.bufcount = 0;
            (entry_id, to_write)
        };
        drop(writer);

        tracing::debug!(
            target: "rwl::journal",
            entry_id,
            bufs = to_write.len(),
            flushsize,
            head,
            tail,
            "transaction committed"
        );

        for buf in to_write {
            buf.unpin();
            let data = buf.snapshot();
            let bufsize = buf.bufsize() as u64;
            let this = Arc::clone(self);
            self.pump.submit(WriteJob {
                dev: Arc::clone(&self.fs_dev),
                offset: buf.addr().0 << self.fs_bshift,
                data,
                done: Box::new(move |res| this.biodone(entry_id, bufsize, res)),
            });
        }

        if wait {
            let reserved = self.state.lock().reserved;
            self.truncate(self.circ_size - reserved)?;
        }
        Ok(())
    }

    /// Abandon all pending and committed-but-unsynced state.
    ///
    /// Buffers are released, the dealloc ledger and inode table are
    /// cleared, and committed entries are detached so late metadata
    /// completions are absorbed silently. The on-disk log position is
    /// left alone; a crash after a discard replays whatever was last
    /// committed.
    pub fn discard(&self) {
        let _gate = self.gate.write();
        let dealloc_snapshot: Vec<DeallocRecord> = {
            let s = self.state.lock();
            s.deallocs.iter().map(|(_, d)| *d).collect()
        };
        if let Err(error) = self.hooks.flush(&dealloc_snapshot) {
            tracing::warn!(target: "rwl::journal", %error, "flush callback failed during discard");
        }
        let mut s = self.state.lock();
        s.inodes.clear();
        for buf in s.bufs.drain(..) {
            buf.unpin();
        }
        s.deallocs.drain_with(|_| ());
        while let Some(entry) = s.entries.pop_front() {
            // Failed completions already fired; only writes still in
            // flight can arrive after the detach.
            let outstanding = entry.bufcount - entry.errored;
            if outstanding > 0 {
                s.detached.insert(entry.id, outstanding);
            }
        }
        s.error_count = 0;
        s.bufbytes = 0;
        s.bcount = 0;
        s.bufcount = 0;
        self.space_cond.notify_all();
        tracing::warn!(target: "rwl::journal", "journal state discarded");
    }

    /// Completion of one asynchronous metadata write.
    ///
    /// Log space for a committed transaction becomes reclaimable only
    /// once every metadata write of that transaction and all earlier
    /// ones have completed.
    fn biodone(&self, entry_id: u64, bufsize: u64, result: Result<()>) {
        let mut s = self.state.lock();
        self.stats.meta_writes.fetch_add(1, Ordering::Relaxed);
        s.unsynced = s.unsynced.saturating_sub(bufsize);

        if let Some(remaining) = s.detached.get_mut(&entry_id) {
            *remaining -= 1;
            if *remaining == 0 {
                s.detached.remove(&entry_id);
            }
            return;
        }
        let Some(pos) = s.entries.iter().position(|e| e.id == entry_id) else {
            tracing::warn!(target: "rwl::journal", entry_id, "completion for unknown entry");
            return;
        };
        if let Err(error) = &result {
            // The home copy is stale, so the log image must never be
            // overwritten. Leave the entry pinned; the error sticks
            // until the journal is discarded.
            if s.entries[pos].errored == 0 {
                s.error_count += 1;
                tracing::error!(target: "rwl::journal", entry_id, %error, "metadata write failed");
                self.space_cond.notify_all();
            }
            s.entries[pos].errored += 1;
            return;
        }
        s.entries[pos].bufcount -= 1;
        if s.entries[pos].bufcount > 0 {
            return;
        }
        let mut delta = 0_u64;
        while let Some(front) = s.entries.front() {
            if front.bufcount != 0 {
                break;
            }
            delta += front.reclaimable_bytes;
            s.entries.pop_front();
        }
        if delta > 0 {
            s.reclaimable += delta;
            self.space_cond.notify_all();
        }
    }

    /// Move the tail until at least `minfree` bytes are free, waiting
    /// for in-flight metadata writes as needed, and commit the new
    /// position.
    fn truncate(&self, minfree: u64) -> Result<()> {
        debug_assert!(minfree <= self.circ_size);
        let (delta, head, tail) = {
            let mut s = self.state.lock();
            let avail = circ::space_free(self.circ_size, s.head, s.tail);
            if avail >= minfree {
                return Ok(());
            }
            let needed = minfree - avail;
            while s.error_count == 0 && s.reclaimable < needed {
                self.space_cond.wait(&mut s);
            }
            if s.error_count > 0 {
                return Err(WalError::Io(std::io::Error::other(
                    "journal metadata write failed",
                )));
            }
            let mut delta = s.reclaimable;
            if s.entries.is_empty() && delta >= s.reserved {
                delta -= s.reserved;
            }
            if delta == 0 {
                return Ok(());
            }
            let (head, tail) =
                circ::advance_tail(self.circ_size, self.circ_off, delta, s.head, s.tail);
            (delta, head, tail)
        };
        {
            let mut writer = self.writer.lock();
            self.write_commit(&mut writer, head, tail)?;
        }
        let mut s = self.state.lock();
        s.head = head;
        s.tail = tail;
        s.reclaimable -= delta;
        tracing::trace!(target: "rwl::journal", delta, head, tail, "log truncated");
        Ok(())
    }

    fn start_flush_inodes(self: &Arc<Self>, replay: &Replay) -> Result<()> {
        tracing::info!(
            target: "rwl::journal",
            count = replay.inodes().len(),
            "reusing recovered inode list"
        );
        let len = {
            let mut s = self.state.lock();
            for (ino, mode) in replay.inodes() {
                s.inodes.insert(ino.0, *mode);
            }
            self.transaction_len_locked(&s)
        };
        // The rewritten list must fit without overwriting the recovered
        // one, which stays authoritative until the next commit.
        if len > circ::space_free(self.circ_size, replay.inodes_head(), replay.inodes_tail()) {
            return Err(WalError::TooSmall(len));
        }
        {
            let mut s = self.state.lock();
            s.head = replay.inodes_head();
            s.tail = replay.inodes_head();
            s.reclaimable = len;
            s.reserved = len;
        }
        let mut writer = self.writer.lock();
        let head0 = replay.inodes_head();
        let (off, reserved) = self.write_inodes(&mut writer, head0)?;
        drop(writer);
        let mut s = self.state.lock();
        s.head = off;
        debug_assert_eq!(reserved, len);
        debug_assert_ne!(s.head, s.tail);
        debug_assert_ne!(s.head, 0);
        Ok(())
    }

    // -- record writers ------------------------------------------------

    fn write_blocks(
        &self,
        writer: &mut LogWriter,
        bufs: &[Arc<CacheBuf>],
        mut off: u64,
    ) -> Result<u64> {
        let blocklen = self.log_bsize();
        let per = records::entries_per_block(blocklen);
        for chunk in bufs.chunks(per) {
            let payloads: Vec<Vec<u8>> = chunk.iter().map(|b| b.snapshot()).collect();
            let mut runs = Vec::with_capacity(chunk.len());
            let mut total = blocklen;
            for (buf, data) in chunk.iter().zip(&payloads) {
                runs.push(BlockRun {
                    addr: buf.addr(),
                    len: data.len() as u32,
                });
                total += data.len();
            }
            let desc =
                records::encode_block_descriptor(records::TAG_BLOCKS, &runs, blocklen, total as u32);
            off = self.circ_write(writer, off, &desc)?;
            for data in &payloads {
                off = self.circ_write(writer, off, data)?;
            }
        }
        Ok(off)
    }

    /// Write revocation records and retire the ledger entries they
    /// cover. After a successful flush the ledger is empty.
    fn write_revocations(&self, writer: &mut LogWriter, mut off: u64) -> Result<u64> {
        let mut pending = Vec::new();
        self.state.lock().deallocs.drain_with(|d| pending.push(d));
        let blocklen = self.log_bsize();
        let per = records::entries_per_block(blocklen);
        for chunk in pending.chunks(per) {
            let runs: Vec<BlockRun> = chunk
                .iter()
                .map(|d| BlockRun {
                    addr: d.addr,
                    len: d.len,
                })
                .collect();
            let desc = records::encode_block_descriptor(
                records::TAG_REVOCATIONS,
                &runs,
                blocklen,
                blocklen as u32,
            );
            off = self.circ_write(writer, off, &desc)?;
        }
        Ok(off)
    }

    /// Write the inode list. Always writes at least one record, with
    /// the clear flag on the first, so replay resets its list at every
    /// transaction. Returns the new offset and the reserve the list
    /// claims.
    fn write_inodes(&self, writer: &mut LogWriter, mut off: u64) -> Result<(u64, u64)> {
        let inodes: Vec<(InodeNumber, u32)> = {
            let s = self.state.lock();
            s.inodes
                .iter()
                .map(|(ino, mode)| (InodeNumber(*ino), *mode))
                .collect()
        };
        let blocklen = self.log_bsize();
        let per = records::entries_per_block(blocklen);
        if inodes.is_empty() {
            let desc = records::encode_inode_descriptor(&[], true, blocklen);
            off = self.circ_write(writer, off, &desc)?;
            return Ok((off, 0));
        }
        let mut clear = true;
        for chunk in inodes.chunks(per) {
            let desc = records::encode_inode_descriptor(chunk, clear, blocklen);
            clear = false;
            off = self.circ_write(writer, off, &desc)?;
        }
        let reserved = div_round_up(inodes.len() as u64, per as u64) * blocklen as u64;
        Ok((off, reserved))
    }

    /// Flush the log, write the commit header into the slot selected by
    /// the generation number, and advance the generation. Generation
    /// zero commits twice so both header slots become valid before the
    /// first real transaction can be torn.
    fn write_commit(&self, writer: &mut LogWriter, head: u64, tail: u64) -> Result<()> {
        let blocklen = self.log_bsize();
        loop {
            writer.flush(true)?;
            self.cache_sync("pre-commit")?;
            let generation = self.state.lock().generation;
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            let hdr = records::CommitHeader {
                generation: rfs_types::Generation(generation),
                log_bshift: self.log_bshift,
                fs_bshift: self.fs_bshift,
                head,
                tail,
                circ_off: self.circ_off,
                circ_size: self.circ_size,
                time_sec: now.as_secs(),
                time_nsec: now.subsec_nanos(),
            };
            let slot = u64::from(generation % 2) * blocklen as u64;
            writer.write(&hdr.encode(blocklen), self.log_off + slot)?;
            writer.flush(true)?;
            if !self.use_fua() {
                self.cache_sync("post-commit")?;
            }
            self.stats.commits.fetch_add(1, Ordering::Relaxed);
            self.state.lock().generation = generation.wrapping_add(1);
            tracing::debug!(target: "rwl::journal", generation, head, tail, "commit header written");
            if generation != 0 {
                return Ok(());
            }
        }
    }

    /// Write into the circular data area, wrapping at the end. Offsets
    /// below the data area (the empty sentinel) start at its beginning.
    fn circ_write(&self, writer: &mut LogWriter, off: u64, data: &[u8]) -> Result<u64> {
        let end = self.circ_off + self.circ_size;
        let mut off = if off < self.circ_off { self.circ_off } else { off };
        let mut data = data;
        while !data.is_empty() {
            let take = ((end - off) as usize).min(data.len());
            writer.write(&data[..take], self.log_off + off)?;
            data = &data[take..];
            off += take as u64;
            if off == end {
                off = self.circ_off;
            }
        }
        Ok(off)
    }

    fn cache_sync(&self, when: &str) -> Result<()> {
        if !self.cfg.flush_disk_cache || !self.caps.write_cache {
            return Ok(());
        }
        self.stats.cache_flushes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: "rwl::journal", when, "disk cache flush");
        self.dev.sync()
    }

    fn use_fua(&self) -> bool {
        self.cfg.allow_fua_dpo && self.caps.fua
    }

    /// Bytes one flush of the current pending state would occupy:
    /// payload plus block-list, revocation, and inode descriptors. The
    /// inode list always costs at least one block.
    fn transaction_len_locked(&self, s: &State) -> u64 {
        let blocklen = self.log_bsize() as u64;
        let per = records::entries_per_block(self.log_bsize()) as u64;
        let mut len = s.bcount as u64;
        len += div_round_up(s.bufcount as u64, per) * blocklen;
        len += div_round_up(s.deallocs.len() as u64, per) * blocklen;
        len += div_round_up(s.inodes.len() as u64, per).max(1) * blocklen;
        len
    }

    // -- introspection -------------------------------------------------

    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        let writer = self.writer.lock();
        StatsSnapshot {
            commits: self.stats.commits.load(Ordering::Relaxed),
            journal_writes: writer.writes(),
            journal_write_nowait: writer.nowait_reclaims(),
            meta_writes: self.stats.meta_writes.load(Ordering::Relaxed),
            cache_flushes: self.stats.cache_flushes.load(Ordering::Relaxed),
        }
    }

    /// Bytes of log space currently free.
    #[must_use]
    pub fn space_free(&self) -> u64 {
        let s = self.state.lock();
        circ::space_free(self.circ_size, s.head, s.tail)
    }

    /// Bytes of log space currently used.
    #[must_use]
    pub fn space_used(&self) -> u64 {
        let s = self.state.lock();
        circ::space_used(self.circ_size, s.head, s.tail)
    }

    /// Usable bytes in the circular data area.
    #[must_use]
    pub fn circ_size(&self) -> u64 {
        self.circ_size
    }

    /// Committed transactions whose metadata writes are still pending.
    #[must_use]
    pub fn pending_entries(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Multi-line state dump for diagnostics.
    #[must_use]
    pub fn dump(&self) -> String {
        use std::fmt::Write as _;
        let s = self.state.lock();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "journal: head {} tail {} generation {} reserved {} reclaimable {}",
            s.head, s.tail, s.generation, s.reserved, s.reclaimable
        );
        let _ = writeln!(
            out,
            "pending: bufcount {} bufbytes {} bcount {} deallocs {} inodes {} lock_count {}",
            s.bufcount,
            s.bufbytes,
            s.bcount,
            s.deallocs.len(),
            s.inodes.len(),
            s.lock_count
        );
        let _ = writeln!(
            out,
            "entries: {} detached {} error_count {} unsynced {}",
            s.entries.len(),
            s.detached.len(),
            s.error_count,
            s.unsynced
        );
        drop(s);
        let st = self.stats();
        let _ = writeln!(
            out,
            "stats: commits {} journal_writes {} nowait {} meta_writes {} cache_flushes {}",
            st.commits, st.journal_writes, st.journal_write_nowait, st.meta_writes, st.cache_flushes
        );
        out
    }

    fn log_bsize(&self) -> usize {
        1_usize << self.log_bshift
    }

    fn fs_bsize(&self) -> usize {
        1_usize << self.fs_bshift
    }
}

/// An open transaction. Holds the gate shared; dropped (or ended) when
/// the caller is done mutating.
pub struct Txn<'a> {
    jnl: &'a Journal,
    _gate: RwLockReadGuard<'a, ()>,
}

impl std::fmt::Debug for Txn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn").finish_non_exhaustive()
    }
}

impl Txn<'_> {
    /// Register a dirty metadata buffer with the pending transaction.
    /// Re-adding a registered buffer refreshes its accounting.
    pub fn add_buf(&self, buf: &Arc<CacheBuf>) {
        debug_assert_eq!(buf.bcount() % self.jnl.fs_bsize(), 0);
        let mut s = self.jnl.state.lock();
        if buf.is_pinned() {
            if let Some(pos) = s.bufs.iter().position(|b| b.id() == buf.id()) {
                let old = s.bufs.remove(pos).expect("position is in range");
                s.bufbytes -= old.bufsize();
                s.bcount -= old.bcount();
                s.bufcount -= 1;
            }
        }
        buf.pin();
        s.bufbytes += buf.bufsize();
        s.bcount += buf.bcount();
        s.bufcount += 1;
        s.bufs.push_back(Arc::clone(buf));
        tracing::trace!(
            target: "rwl::journal",
            buf = buf.id().0,
            addr = buf.addr().0,
            bcount = buf.bcount(),
            "buffer registered"
        );
    }

    /// Drop a buffer from the pending transaction.
    pub fn remove_buf(&self, buf: &Arc<CacheBuf>) {
        let mut s = self.jnl.state.lock();
        let Some(pos) = s.bufs.iter().position(|b| b.id() == buf.id()) else {
            tracing::warn!(
                target: "rwl::journal",
                buf = buf.id().0,
                "remove of unregistered buffer"
            );
            return;
        };
        let old = s.bufs.remove(pos).expect("position is in range");
        s.bufbytes -= old.bufsize();
        s.bcount -= old.bcount();
        s.bufcount -= 1;
        old.unpin();
    }

    /// Adjust accounting after a registered buffer changed size.
    pub fn resize_buf(&self, buf: &Arc<CacheBuf>, old_size: usize, old_count: usize) {
        let mut s = self.jnl.state.lock();
        debug_assert!(s.bufs.iter().any(|b| b.id() == buf.id()));
        s.bufbytes = s.bufbytes - old_size + buf.bufsize();
        s.bcount = s.bcount - old_count + buf.bcount();
    }

    /// Record a block range to free once the pending transaction
    /// commits. A full ledger is a retryable condition: flush and try
    /// again. With `force`, the limit is bypassed for callers that are
    /// past the point of no return.
    pub fn register_deallocation(&self, addr: BlockNumber, len: u32, force: bool) -> Result<Cookie> {
        let mut s = self.jnl.state.lock();
        let record = DeallocRecord { addr, len };
        let cookie = if force {
            s.deallocs.insert_forced(record)?
        } else {
            s.deallocs.insert(record)?
        };
        tracing::trace!(
            target: "rwl::journal",
            addr = addr.0,
            len,
            "deallocation registered"
        );
        Ok(cookie)
    }

    /// Withdraw a recorded deallocation, e.g. when the block range is
    /// reallocated within the same transaction.
    pub fn unregister_deallocation(&self, cookie: Cookie) {
        let removed = self.jnl.state.lock().deallocs.remove(cookie);
        debug_assert!(removed.is_some(), "stale dealloc cookie");
    }

    /// Mark an inode live-but-unlinked so replay can finish the
    /// deletion after a crash.
    pub fn register_inode(&self, ino: InodeNumber, mode: u32) {
        self.jnl.state.lock().inodes.insert(ino.0, mode);
    }

    /// The inode reached link count zero for real (or was relinked).
    pub fn unregister_inode(&self, ino: InodeNumber) {
        self.jnl.state.lock().inodes.remove(&ino.0);
    }

    /// Close the transaction.
    pub fn end(self) {
        let s = self.jnl.state.lock();
        let len = self.jnl.transaction_len_locked(&s);
        assert!(
            len <= self.jnl.circ_size - s.reserved,
            "transaction of {len} bytes exceeds log capacity"
        );
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        self.jnl.state.lock().lock_count -= 1;
    }
}
