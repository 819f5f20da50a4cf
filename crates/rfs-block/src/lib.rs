#![forbid(unsafe_code)]
//! Device seams used by the journal.
//!
//! Provides the `ByteDevice` trait with write-cache capability reporting,
//! a file-backed implementation, an in-memory implementation for tests
//! and tools, a fault-injecting wrapper, the lent buffer-cache buffer
//! type, and the asynchronous write pump.

use parking_lot::Mutex;
use rfs_error::{Result, WalError};
use rfs_types::{BlockNumber, BufId};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

mod pump;

pub use pump::{InlinePump, ThreadedPump, WriteCompletion, WriteJob, WritePump};

/// Write-cache behavior of a device.
///
/// Mirrors what a disk reports: whether a volatile write cache sits in
/// front of the media, and whether per-write cache-bypass hints (FUA,
/// DPO) are honored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCaps {
    /// A volatile write cache is present; durability requires `sync`.
    pub write_cache: bool,
    /// Force Unit Access writes are supported.
    pub fua: bool,
    /// Disable Page Out hint is supported.
    pub dpo: bool,
}

impl DeviceCaps {
    /// Conservative default: assume a write cache, no FUA/DPO.
    #[must_use]
    pub const fn write_cached() -> Self {
        Self {
            write_cache: true,
            fua: false,
            dpo: false,
        }
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush the device write cache to stable storage.
    fn sync(&self) -> Result<()>;

    /// Write-cache capabilities. Defaults to the conservative guess.
    fn cache_caps(&self) -> DeviceCaps {
        DeviceCaps::write_cached()
    }
}

fn check_bounds(offset: u64, len: usize, device_len: u64) -> Result<()> {
    let len_u64 = u64::try_from(len).map_err(|_| WalError::OutOfBounds {
        offset,
        len,
        device_len,
    })?;
    let end = offset.checked_add(len_u64).ok_or(WalError::OutOfBounds {
        offset,
        len,
        device_len,
    })?;
    if end > device_len {
        return Err(WalError::OutOfBounds {
            offset,
            len,
            device_len,
        });
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(WalError::ReadOnly);
        }
        check_bounds(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory byte device for tests, recovery tooling, and benchmarks.
#[derive(Debug)]
pub struct MemByteDevice {
    bytes: Mutex<Vec<u8>>,
    caps: DeviceCaps,
    syncs: AtomicU64,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::with_caps(len, DeviceCaps::write_cached())
    }

    #[must_use]
    pub fn with_caps(len: usize, caps: DeviceCaps) -> Self {
        Self {
            bytes: Mutex::new(vec![0_u8; len]),
            caps,
            syncs: AtomicU64::new(0),
        }
    }

    /// Number of `sync` calls observed.
    #[must_use]
    pub fn sync_count(&self) -> u64 {
        self.syncs.load(Ordering::Relaxed)
    }

    /// Copy of the full device contents.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        check_bounds(offset, buf.len(), bytes.len() as u64)?;
        let offset = rfs_types::u64_to_usize(offset, "offset")
            .map_err(|e| WalError::Format(e.to_string()))?;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        check_bounds(offset, buf.len(), bytes.len() as u64)?;
        let offset = rfs_types::u64_to_usize(offset, "offset")
            .map_err(|e| WalError::Format(e.to_string()))?;
        bytes[offset..offset + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn cache_caps(&self) -> DeviceCaps {
        self.caps
    }
}

/// Wrapper that injects write failures after a countdown.
///
/// Used to exercise the journal's sticky-error path: once armed, a
/// fixed number of writes are allowed through, then every write fails.
#[derive(Debug)]
pub struct FaultDevice<D> {
    inner: D,
    fail_after: AtomicUsize,
    armed: AtomicBool,
}

impl<D: ByteDevice> FaultDevice<D> {
    #[must_use]
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            fail_after: AtomicUsize::new(0),
            armed: AtomicBool::new(false),
        }
    }

    /// Allow `n` more writes, then fail every write after them.
    pub fn fail_after_writes(&self, n: usize) {
        self.fail_after.store(n, Ordering::SeqCst);
        self.armed.store(true, Ordering::SeqCst);
    }

    /// Stop injecting failures.
    pub fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

impl<D: ByteDevice> ByteDevice for FaultDevice<D> {
    fn len_bytes(&self) -> u64 {
        self.inner.len_bytes()
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact_at(offset, buf)
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if self.armed.load(Ordering::SeqCst) {
            let remaining = self
                .fail_after
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    Some(v.saturating_sub(1))
                })
                .unwrap_or(0);
            if remaining == 0 {
                return Err(WalError::Io(std::io::Error::other("injected write fault")));
            }
        }
        self.inner.write_all_at(offset, buf)
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn cache_caps(&self) -> DeviceCaps {
        self.inner.cache_caps()
    }
}

static NEXT_BUF_ID: AtomicU64 = AtomicU64::new(1);

/// A buffer-cache buffer lent to the journal for the duration of a
/// transaction.
///
/// The filesystem owns the buffer; the journal pins it (keeps it from
/// being written back or recycled) between `add_buf` and either
/// `remove_buf` or the flush that logs it. Accounting uses two sizes:
/// `bufsize` is the allocated storage and `bcount` the valid prefix
/// that will be logged and written back.
#[derive(Debug)]
pub struct CacheBuf {
    id: BufId,
    addr: BlockNumber,
    data: Mutex<Vec<u8>>,
    bcount: AtomicUsize,
    pinned: AtomicBool,
}

impl CacheBuf {
    /// Create a buffer targeting filesystem block `addr` with `data` as
    /// its full valid contents.
    #[must_use]
    pub fn new(addr: BlockNumber, data: Vec<u8>) -> Arc<Self> {
        let bcount = data.len();
        Arc::new(Self {
            id: BufId(NEXT_BUF_ID.fetch_add(1, Ordering::Relaxed)),
            addr,
            data: Mutex::new(data),
            bcount: AtomicUsize::new(bcount),
            pinned: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn id(&self) -> BufId {
        self.id
    }

    /// Target block on the filesystem device, in filesystem blocks.
    #[must_use]
    pub fn addr(&self) -> BlockNumber {
        self.addr
    }

    /// Allocated storage size in bytes.
    #[must_use]
    pub fn bufsize(&self) -> usize {
        self.data.lock().len()
    }

    /// Valid bytes to be logged and written back.
    #[must_use]
    pub fn bcount(&self) -> usize {
        self.bcount.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Acquire)
    }

    pub fn pin(&self) {
        self.pinned.store(true, Ordering::Release);
    }

    pub fn unpin(&self) {
        self.pinned.store(false, Ordering::Release);
    }

    /// Overwrite bytes within the valid region.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.data.lock();
        let end = offset + bytes.len();
        assert!(end <= data.len(), "write past end of buffer");
        data[offset..end].copy_from_slice(bytes);
    }

    /// Replace the backing storage, returning the previous
    /// `(bufsize, bcount)` for accounting adjustments.
    pub fn replace_data(&self, data: Vec<u8>) -> (usize, usize) {
        let mut guard = self.data.lock();
        let old_size = guard.len();
        let old_count = self.bcount.swap(data.len(), Ordering::AcqRel);
        *guard = data;
        (old_size, old_count)
    }

    /// Copy of the valid prefix, as it will appear in the log.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        let data = self.data.lock();
        let bcount = self.bcount.load(Ordering::Acquire).min(data.len());
        data[..bcount].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_device_round_trips() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(&[0_u8; 8192]).expect("fill");
        tmp.flush().expect("flush");

        let dev = FileByteDevice::open(tmp.path()).expect("open");
        assert_eq!(dev.len_bytes(), 8192);

        dev.write_all_at(512, &[7_u8; 512]).expect("write");
        let mut buf = [0_u8; 512];
        dev.read_exact_at(512, &mut buf).expect("read");
        assert_eq!(buf, [7_u8; 512]);
        dev.sync().expect("sync");
    }

    #[test]
    fn file_device_rejects_out_of_bounds() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(&[0_u8; 1024]).expect("fill");
        tmp.flush().expect("flush");

        let dev = FileByteDevice::open(tmp.path()).expect("open");
        let mut buf = [0_u8; 512];
        assert!(matches!(
            dev.read_exact_at(1000, &mut buf),
            Err(WalError::OutOfBounds { .. })
        ));
        assert!(matches!(
            dev.write_all_at(u64::MAX, &buf),
            Err(WalError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn mem_device_round_trips_and_counts_syncs() {
        let dev = MemByteDevice::new(4096);
        dev.write_all_at(100, b"hello").expect("write");
        let mut buf = [0_u8; 5];
        dev.read_exact_at(100, &mut buf).expect("read");
        assert_eq!(&buf, b"hello");

        dev.sync().expect("sync");
        dev.sync().expect("sync");
        assert_eq!(dev.sync_count(), 2);
    }

    #[test]
    fn fault_device_fails_after_countdown() {
        let dev = FaultDevice::new(MemByteDevice::new(4096));
        dev.write_all_at(0, &[1_u8; 16]).expect("unarmed write");

        dev.fail_after_writes(2);
        dev.write_all_at(0, &[2_u8; 16]).expect("write 1 of 2");
        dev.write_all_at(0, &[3_u8; 16]).expect("write 2 of 2");
        assert!(dev.write_all_at(0, &[4_u8; 16]).is_err());
        assert!(dev.write_all_at(0, &[5_u8; 16]).is_err());

        dev.disarm();
        dev.write_all_at(0, &[6_u8; 16]).expect("disarmed write");
    }

    #[test]
    fn cache_buf_pin_and_snapshot() {
        let buf = CacheBuf::new(BlockNumber(42), vec![0xAB_u8; 1024]);
        assert_eq!(buf.addr(), BlockNumber(42));
        assert_eq!(buf.bufsize(), 1024);
        assert_eq!(buf.bcount(), 1024);
        assert!(!buf.is_pinned());

        buf.pin();
        assert!(buf.is_pinned());

        buf.write_at(0, &[0xCD_u8; 4]);
        let snap = buf.snapshot();
        assert_eq!(&snap[..4], &[0xCD_u8; 4]);
        assert_eq!(snap.len(), 1024);

        let (old_size, old_count) = buf.replace_data(vec![0_u8; 2048]);
        assert_eq!((old_size, old_count), (1024, 1024));
        assert_eq!(buf.bufsize(), 2048);

        buf.unpin();
        assert!(!buf.is_pinned());
    }

    #[test]
    fn cache_buf_ids_are_unique() {
        let a = CacheBuf::new(BlockNumber(1), vec![0; 16]);
        let b = CacheBuf::new(BlockNumber(1), vec![0; 16]);
        assert_ne!(a.id(), b.id());
    }
}
