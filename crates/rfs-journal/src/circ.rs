//! Circular queue offset arithmetic.
//!
//! The log occupies a linear byte range `[off, off + size)`; `head` and
//! `tail` are linear byte offsets into that range with one twist: the
//! value `0` is a sentinel. `head == tail == 0` means the queue is
//! empty, and a non-zero `head == tail` means it is completely full.
//! Consequently a valid non-empty offset is always in `[off, off + size)`
//! and never `0` (the reserved header blocks before `off` make `0`
//! unreachable for real data).
//!
//! Head only moves in `advance_head` (appending records) and tail only
//! in `advance_tail` (reclaiming space), which also maintain the
//! sentinel transitions.

/// Number of bytes used in a circular queue of `size` total bytes,
/// from `tail` to `head`.
#[must_use]
pub fn space_used(size: u64, head: u64, tail: u64) -> u64 {
    if tail == 0 {
        debug_assert_eq!(head, 0);
        return 0;
    }
    ((head + (size - 1) - tail) % size) + 1
}

/// Number of bytes free in a circular queue of `size` total bytes, in
/// which everything from `tail` to `head` is used.
#[must_use]
pub fn space_free(size: u64, head: u64, tail: u64) -> u64 {
    size - space_used(size, head, tail)
}

/// Byte offset `delta` bytes past `oldoff` in a circular queue of
/// `size` bytes starting at `off`.
///
/// An `oldoff` of `0` (the empty sentinel) is taken to be the queue
/// start for a non-zero `delta`.
#[must_use]
pub fn advance(size: u64, off: u64, oldoff: u64, delta: u64) -> u64 {
    debug_assert!(delta <= size);
    debug_assert!(oldoff == 0 || oldoff >= off);
    debug_assert!(oldoff < size + off);

    let newoff = if oldoff == 0 && delta != 0 {
        off + delta
    } else if oldoff + delta < size + off {
        oldoff + delta
    } else {
        (oldoff + delta) - size
    };

    debug_assert!(delta != 0 || newoff == oldoff);
    debug_assert!(delta == 0 || newoff != 0);
    debug_assert!(newoff == 0 || newoff >= off);
    debug_assert!(newoff < size + off);
    newoff
}

/// New `(head, tail)` after appending `delta` bytes at the head.
///
/// When the queue transitions from empty, the tail snaps to the queue
/// start.
#[must_use]
pub fn advance_head(size: u64, off: u64, delta: u64, head: u64, tail: u64) -> (u64, u64) {
    debug_assert!(delta <= space_free(size, head, tail));
    let head = advance(size, off, head, delta);
    let tail = if tail == 0 && head != 0 { off } else { tail };
    (head, tail)
}

/// New `(head, tail)` after reclaiming `delta` bytes at the tail.
///
/// When the tail catches up with the head the queue collapses to the
/// empty sentinel.
#[must_use]
pub fn advance_tail(size: u64, off: u64, delta: u64, head: u64, tail: u64) -> (u64, u64) {
    debug_assert!(delta <= space_used(size, head, tail));
    let tail = advance(size, off, tail, delta);
    if head == tail {
        (0, 0)
    } else {
        (head, tail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Geometry used throughout: 8 blocks of 512 bytes, two reserved for
    // commit headers. Usable ring is 3072 bytes starting at offset 1024.
    const SIZE: u64 = 3072;
    const OFF: u64 = 1024;

    #[test]
    fn empty_queue_sentinel() {
        assert_eq!(space_used(SIZE, 0, 0), 0);
        assert_eq!(space_free(SIZE, 0, 0), SIZE);
    }

    #[test]
    fn full_queue_when_head_equals_nonzero_tail() {
        assert_eq!(space_used(SIZE, OFF + 512, OFF + 512), SIZE);
        assert_eq!(space_free(SIZE, OFF + 512, OFF + 512), 0);
    }

    #[test]
    fn used_plus_free_is_size() {
        // Identity holds for every head/tail placement, including the
        // sentinels.
        let mut placements = vec![(0, 0)];
        for head_block in 0..6 {
            for tail_block in 0..6 {
                placements.push((OFF + head_block * 512, OFF + tail_block * 512));
            }
        }
        for (head, tail) in placements {
            if tail == 0 && head != 0 {
                continue;
            }
            assert_eq!(
                space_used(SIZE, head, tail) + space_free(SIZE, head, tail),
                SIZE,
                "head={head} tail={tail}"
            );
        }
    }

    #[test]
    fn advance_from_empty_lands_past_queue_start() {
        assert_eq!(advance(SIZE, OFF, 0, 512), OFF + 512);
    }

    #[test]
    fn advance_wraps_to_queue_start() {
        // From the last block, advancing one block wraps to OFF.
        assert_eq!(advance(SIZE, OFF, OFF + SIZE - 512, 512), OFF);
        // Zero delta is the identity.
        assert_eq!(advance(SIZE, OFF, OFF + 512, 0), OFF + 512);
        // Advancing by the full size returns to the same offset.
        assert_eq!(advance(SIZE, OFF, OFF + 512, SIZE), OFF + 512);
    }

    #[test]
    fn advance_head_snaps_tail_from_sentinel() {
        let (head, tail) = advance_head(SIZE, OFF, 1024, 0, 0);
        assert_eq!(head, OFF + 1024);
        assert_eq!(tail, OFF);
        assert_eq!(space_used(SIZE, head, tail), 1024);
    }

    #[test]
    fn advance_tail_collapses_to_sentinel() {
        let (head, tail) = advance_head(SIZE, OFF, 1024, 0, 0);
        let (head, tail) = advance_tail(SIZE, OFF, 1024, head, tail);
        assert_eq!((head, tail), (0, 0));
        assert_eq!(space_used(SIZE, head, tail), 0);
    }

    #[test]
    fn eight_block_scenario() {
        // Walk the published example: 8 x 512B region, ring of 3072
        // bytes at offset 1024. Append three 512-byte records, reclaim
        // two, append four more (wrapping), then drain.
        let (mut head, mut tail) = (0_u64, 0_u64);

        (head, tail) = advance_head(SIZE, OFF, 3 * 512, head, tail);
        assert_eq!((head, tail), (OFF + 1536, OFF));
        assert_eq!(space_used(SIZE, head, tail), 1536);

        (head, tail) = advance_tail(SIZE, OFF, 2 * 512, head, tail);
        assert_eq!((head, tail), (OFF + 1536, OFF + 1024));
        assert_eq!(space_free(SIZE, head, tail), 2560);

        (head, tail) = advance_head(SIZE, OFF, 4 * 512, head, tail);
        // 1536 + 2048 = 3584 -> wraps past OFF + SIZE to OFF + 512.
        assert_eq!((head, tail), (OFF + 512, OFF + 1024));
        assert_eq!(space_used(SIZE, head, tail), 2560);

        (head, tail) = advance_tail(SIZE, OFF, 2560, head, tail);
        assert_eq!((head, tail), (0, 0));
    }

    #[test]
    fn fill_completely_then_drain() {
        let (head, tail) = advance_head(SIZE, OFF, 512, 0, 0);
        let (head, tail) = advance_head(SIZE, OFF, SIZE - 512, head, tail);
        // Full: head == tail != 0.
        assert_eq!(head, tail);
        assert_ne!(head, 0);
        assert_eq!(space_free(SIZE, head, tail), 0);

        let (head, tail) = advance_tail(SIZE, OFF, SIZE, head, tail);
        assert_eq!((head, tail), (0, 0));
    }
}
