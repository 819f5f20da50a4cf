//! On-disk record codecs.
//!
//! All records are little-endian and sized in whole log-device blocks.
//! The commit header occupies one block in each of the two reserved
//! header slots at the start of the log region; the slot written
//! alternates with the generation number, and recovery picks the slot
//! with the larger generation.
//!
//! Record layout (one log block per descriptor):
//!
//! | offset | field | notes |
//! |--------|-------|-------|
//! | 0      | tag   | `RWLH` / `RWLB` / `RWLR` / `RWLI` |
//! | 4      | len   | total record length incl. payload, block multiple |
//! | 8      | count | entries in this descriptor |
//! | 12     | flag  | inode list: clear marker; otherwise zero |
//! | 16..   | entries | 16 bytes each |
//!
//! Block-list and revocation entries are `(daddr: u64, dlen: u32, pad)`;
//! inode entries are `(inumber: u64, imode: u32, pad)`. A block-list
//! descriptor is followed by the raw contents of each described buffer;
//! revocation and inode descriptors have no payload.
//!
//! The commit header carries a checksum field that is currently always
//! written as zero and ignored on read; torn-header detection relies on
//! the double-slot scheme alone.

use rfs_error::WalError;
use rfs_types::{
    put_le_u32, put_le_u64, read_le_u32, read_le_u64, BlockNumber, Generation, InodeNumber,
    ParseError,
};

/// Commit header tag ("RWLH").
pub const TAG_HEADER: u32 = 0x5257_4C48;
/// Block-list record tag ("RWLB").
pub const TAG_BLOCKS: u32 = 0x5257_4C42;
/// Revocation record tag ("RWLR").
pub const TAG_REVOCATIONS: u32 = 0x5257_4C52;
/// Inode-list record tag ("RWLI").
pub const TAG_INODES: u32 = 0x5257_4C49;

/// On-disk format version understood by this build.
pub const FORMAT_VERSION: u32 = 1;

/// Bytes occupied by the fixed part of every record descriptor.
pub const RECORD_HEAD_SIZE: usize = 16;
/// Bytes per descriptor entry (block, revocation, or inode).
pub const RECORD_ENTRY_SIZE: usize = 16;

/// Fixed commit-header size; the rest of the header block is zero.
pub const COMMIT_HEADER_SIZE: usize = 80;

/// Entries that fit in one descriptor block of `block_len` bytes.
#[must_use]
pub fn entries_per_block(block_len: usize) -> usize {
    (block_len - RECORD_HEAD_SIZE) / RECORD_ENTRY_SIZE
}

/// Commit header: the mutable state of the circular log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitHeader {
    pub generation: Generation,
    pub log_bshift: u32,
    pub fs_bshift: u32,
    pub head: u64,
    pub tail: u64,
    pub circ_off: u64,
    pub circ_size: u64,
    pub time_sec: u64,
    pub time_nsec: u32,
}

impl CommitHeader {
    /// Encode into a freshly zeroed block of `block_len` bytes.
    #[must_use]
    pub fn encode(&self, block_len: usize) -> Vec<u8> {
        debug_assert!(block_len >= COMMIT_HEADER_SIZE);
        let mut buf = vec![0_u8; block_len];
        put_le_u32(&mut buf, 0, TAG_HEADER);
        put_le_u32(&mut buf, 4, u32::try_from(block_len).unwrap_or(0));
        put_le_u32(&mut buf, 8, FORMAT_VERSION);
        put_le_u32(&mut buf, 12, 0); // checksum, not yet computed
        put_le_u32(&mut buf, 16, self.generation.0);
        put_le_u32(&mut buf, 20, self.log_bshift);
        put_le_u32(&mut buf, 24, self.fs_bshift);
        put_le_u64(&mut buf, 32, self.head);
        put_le_u64(&mut buf, 40, self.tail);
        put_le_u64(&mut buf, 48, self.circ_off);
        put_le_u64(&mut buf, 56, self.circ_size);
        put_le_u64(&mut buf, 64, self.time_sec);
        put_le_u32(&mut buf, 72, self.time_nsec);
        buf
    }

    /// Decode a header block, validating tag and version.
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        let tag = read_le_u32(data, 0)?;
        if tag != TAG_HEADER {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(TAG_HEADER),
                actual: u64::from(tag),
            });
        }
        let version = read_le_u32(data, 8)?;
        if version != FORMAT_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unknown commit header version",
            });
        }
        Ok(Self {
            generation: Generation(read_le_u32(data, 16)?),
            log_bshift: read_le_u32(data, 20)?,
            fs_bshift: read_le_u32(data, 24)?,
            head: read_le_u64(data, 32)?,
            tail: read_le_u64(data, 40)?,
            circ_off: read_le_u64(data, 48)?,
            circ_size: read_le_u64(data, 56)?,
            time_sec: read_le_u64(data, 64)?,
            time_nsec: read_le_u32(data, 72)?,
        })
    }
}

/// Fixed head shared by all record descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHead {
    pub tag: u32,
    pub len: u32,
    pub count: u32,
    pub flag: u32,
}

impl RecordHead {
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            tag: read_le_u32(data, 0)?,
            len: read_le_u32(data, 4)?,
            count: read_le_u32(data, 8)?,
            flag: read_le_u32(data, 12)?,
        })
    }
}

/// One described run of filesystem blocks: start address and byte length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRun {
    pub addr: BlockNumber,
    pub len: u32,
}

/// Encode a block-list or revocation descriptor block.
///
/// `total_len` is the full record length including any payload that
/// follows this descriptor, already padded to a block multiple.
#[must_use]
pub fn encode_block_descriptor(
    tag: u32,
    runs: &[BlockRun],
    block_len: usize,
    total_len: u32,
) -> Vec<u8> {
    debug_assert!(runs.len() <= entries_per_block(block_len));
    let mut buf = vec![0_u8; block_len];
    put_le_u32(&mut buf, 0, tag);
    put_le_u32(&mut buf, 4, total_len);
    put_le_u32(&mut buf, 8, u32::try_from(runs.len()).unwrap_or(0));
    put_le_u32(&mut buf, 12, 0);
    let mut off = RECORD_HEAD_SIZE;
    for run in runs {
        put_le_u64(&mut buf, off, run.addr.0);
        put_le_u32(&mut buf, off + 8, run.len);
        off += RECORD_ENTRY_SIZE;
    }
    buf
}

/// Decode the entry table of a block-list or revocation descriptor.
pub fn decode_block_runs(data: &[u8], count: u32) -> Result<Vec<BlockRun>, ParseError> {
    let count = count as usize;
    if count > entries_per_block(data.len()) {
        return Err(ParseError::InvalidField {
            field: "count",
            reason: "more entries than fit in one descriptor block",
        });
    }
    let mut runs = Vec::with_capacity(count);
    let mut off = RECORD_HEAD_SIZE;
    for _ in 0..count {
        runs.push(BlockRun {
            addr: BlockNumber(read_le_u64(data, off)?),
            len: read_le_u32(data, off + 8)?,
        });
        off += RECORD_ENTRY_SIZE;
    }
    Ok(runs)
}

/// Encode an inode-list descriptor block.
#[must_use]
pub fn encode_inode_descriptor(
    inodes: &[(InodeNumber, u32)],
    clear: bool,
    block_len: usize,
) -> Vec<u8> {
    debug_assert!(inodes.len() <= entries_per_block(block_len));
    let mut buf = vec![0_u8; block_len];
    put_le_u32(&mut buf, 0, TAG_INODES);
    put_le_u32(&mut buf, 4, u32::try_from(block_len).unwrap_or(0));
    put_le_u32(&mut buf, 8, u32::try_from(inodes.len()).unwrap_or(0));
    put_le_u32(&mut buf, 12, u32::from(clear));
    let mut off = RECORD_HEAD_SIZE;
    for (ino, mode) in inodes {
        put_le_u64(&mut buf, off, ino.0);
        put_le_u32(&mut buf, off + 8, *mode);
        off += RECORD_ENTRY_SIZE;
    }
    buf
}

/// Decode the entry table of an inode-list descriptor.
pub fn decode_inode_entries(
    data: &[u8],
    count: u32,
) -> Result<Vec<(InodeNumber, u32)>, ParseError> {
    let count = count as usize;
    if count > entries_per_block(data.len()) {
        return Err(ParseError::InvalidField {
            field: "count",
            reason: "more entries than fit in one descriptor block",
        });
    }
    let mut inodes = Vec::with_capacity(count);
    let mut off = RECORD_HEAD_SIZE;
    for _ in 0..count {
        inodes.push((
            InodeNumber(read_le_u64(data, off)?),
            read_le_u32(data, off + 8)?,
        ));
        off += RECORD_ENTRY_SIZE;
    }
    Ok(inodes)
}

/// Map a parse failure at a known log offset to a corruption error.
pub(crate) fn corrupt(offset: u64, err: &ParseError) -> WalError {
    WalError::Corruption {
        offset,
        detail: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: usize = 512;

    #[test]
    fn commit_header_round_trip() {
        let hdr = CommitHeader {
            generation: Generation(7),
            log_bshift: 9,
            fs_bshift: 12,
            head: 1536,
            tail: 1024,
            circ_off: 1024,
            circ_size: 3072,
            time_sec: 1_724_000_000,
            time_nsec: 123_456_789,
        };
        let buf = hdr.encode(BLOCK);
        assert_eq!(buf.len(), BLOCK);
        let decoded = CommitHeader::decode(&buf).expect("decode");
        assert_eq!(decoded, hdr);
        // checksum field stays zero
        assert_eq!(read_le_u32(&buf, 12).unwrap(), 0);
    }

    #[test]
    fn commit_header_rejects_bad_tag_and_version() {
        let hdr = CommitHeader {
            generation: Generation(0),
            log_bshift: 9,
            fs_bshift: 9,
            head: 0,
            tail: 0,
            circ_off: 1024,
            circ_size: 3072,
            time_sec: 0,
            time_nsec: 0,
        };
        let mut buf = hdr.encode(BLOCK);
        buf[0] ^= 0xFF;
        assert!(matches!(
            CommitHeader::decode(&buf),
            Err(ParseError::InvalidMagic { .. })
        ));

        let mut buf = hdr.encode(BLOCK);
        put_le_u32(&mut buf, 8, 99);
        assert!(matches!(
            CommitHeader::decode(&buf),
            Err(ParseError::InvalidField { field: "version", .. })
        ));
    }

    #[test]
    fn block_descriptor_round_trip() {
        let runs = vec![
            BlockRun {
                addr: BlockNumber(100),
                len: 4096,
            },
            BlockRun {
                addr: BlockNumber(7),
                len: 512,
            },
        ];
        let buf = encode_block_descriptor(TAG_BLOCKS, &runs, BLOCK, 512 + 4096 + 512);
        let head = RecordHead::decode(&buf).expect("head");
        assert_eq!(head.tag, TAG_BLOCKS);
        assert_eq!(head.len, 5120);
        assert_eq!(head.count, 2);
        assert_eq!(head.flag, 0);
        assert_eq!(decode_block_runs(&buf, head.count).expect("runs"), runs);
    }

    #[test]
    fn revocation_descriptor_uses_own_tag() {
        let runs = vec![BlockRun {
            addr: BlockNumber(55),
            len: 1024,
        }];
        let buf = encode_block_descriptor(TAG_REVOCATIONS, &runs, BLOCK, BLOCK as u32);
        let head = RecordHead::decode(&buf).expect("head");
        assert_eq!(head.tag, TAG_REVOCATIONS);
        assert_eq!(head.len as usize, BLOCK);
    }

    #[test]
    fn inode_descriptor_round_trip() {
        let inodes = vec![(InodeNumber(12), 0o100_644), (InodeNumber(99), 0o040_755)];
        let buf = encode_inode_descriptor(&inodes, true, BLOCK);
        let head = RecordHead::decode(&buf).expect("head");
        assert_eq!(head.tag, TAG_INODES);
        assert_eq!(head.count, 2);
        assert_eq!(head.flag, 1);
        assert_eq!(
            decode_inode_entries(&buf, head.count).expect("inodes"),
            inodes
        );

        let buf = encode_inode_descriptor(&[], false, BLOCK);
        let head = RecordHead::decode(&buf).expect("head");
        assert_eq!(head.count, 0);
        assert_eq!(head.flag, 0);
    }

    #[test]
    fn entry_capacity_matches_layout() {
        assert_eq!(entries_per_block(512), 31);
        assert_eq!(entries_per_block(4096), 255);
        // A full descriptor round-trips.
        let runs: Vec<BlockRun> = (0..31)
            .map(|i| BlockRun {
                addr: BlockNumber(i),
                len: 512,
            })
            .collect();
        let buf = encode_block_descriptor(TAG_BLOCKS, &runs, 512, 512);
        assert_eq!(decode_block_runs(&buf, 31).expect("runs"), runs);
        // One more than fits is rejected on decode.
        assert!(decode_block_runs(&buf, 32).is_err());
    }
}
