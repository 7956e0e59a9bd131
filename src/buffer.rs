//! A growable byte buffer capped by a memory limit, with independent
//! read/write cursors and reserve-with-compaction.
//!
//! Grounded in `original_source/c/src/DynamicBuffer.c`'s doubling
//! growth policy and full-deallocation-on-empty behavior, re-expressed
//! per spec.md §9 as a single owned buffer plus `usize` indices — no
//! raw pointers, no aliasing.
//!
//! Three cursors, not two: `read_off` (confirmed/consumed), `reserve_off`
//! (handed to a caller via `reserve` but not yet confirmed), `write_off`
//! (filled by the transport). `read_off <= reserve_off <= write_off <=
//! capacity <= memory_limit`. The gap `[read_off, write_off)` — not just
//! `[reserve_off, write_off)` — is what counts against `memory_limit`:
//! a caller that reserves several frames before confirming keeps that
//! span pinned, which is exactly the backlog [`crate::streams::BufferedIStream`]
//! needs to track so repeated reservations without a `confirm` eventually
//! report [`Error::MemoryLimitExceeded`] instead of growing unbounded.

use crate::error::Error;

pub(crate) struct BoundedBuffer {
    storage: Vec<u8>,
    memory_limit: usize,
    read_off: usize,
    reserve_off: usize,
    write_off: usize,
}

impl BoundedBuffer {
    pub(crate) fn new(memory_limit: usize) -> Self {
        Self { storage: Vec::new(), memory_limit, read_off: 0, reserve_off: 0, write_off: 0 }
    }

    pub(crate) fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    /// Changes the memory limit and empties the buffer, mirroring
    /// `DynamicBuffer_setMaxSize`'s full reset.
    pub(crate) fn set_memory_limit(&mut self, limit: usize) {
        self.memory_limit = limit;
        self.close();
    }

    pub(crate) fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub(crate) fn read_off(&self) -> usize {
        self.read_off
    }

    pub(crate) fn reserve_off(&self) -> usize {
        self.reserve_off
    }

    pub(crate) fn write_off(&self) -> usize {
        self.write_off
    }

    /// Bytes received but not yet confirmed — `[read_off, write_off)`.
    /// This, not the narrower `[reserve_off, write_off)` gap, is what
    /// `reserve` charges against `memory_limit`: bytes already handed
    /// out by a prior `reserve` call and still awaiting `confirm` remain
    /// "in use" and must keep counting against the budget, or a caller
    /// that reserves many frames before confirming would never see the
    /// buffer fill up.
    pub(crate) fn bytes_unread(&self) -> usize {
        self.write_off - self.read_off
    }

    /// Bytes received but not yet handed out by `reserve` —
    /// `[reserve_off, write_off)`.
    pub(crate) fn bytes_ahead_of_reserve(&self) -> usize {
        self.write_off - self.reserve_off
    }

    /// Zeros all three cursors without releasing the backing storage.
    pub(crate) fn reset(&mut self) {
        self.read_off = 0;
        self.reserve_off = 0;
        self.write_off = 0;
    }

    /// Fully releases the backing storage, matching `DynamicBuffer`
    /// freeing and nulling its pointer when resized to zero. Used when
    /// the channel closes: "`Closed` ⇒ no buffer is allocated."
    pub(crate) fn close(&mut self) {
        self.storage = Vec::new();
        self.reset();
    }

    /// Moves the unconfirmed region `[read_off, write_off)` to the front
    /// of the backing storage, preserving the relative position of
    /// `reserve_off` within it.
    fn compact_to_front(&mut self) {
        if self.read_off == 0 {
            return;
        }
        let unread = self.write_off - self.read_off;
        self.storage.copy_within(self.read_off..self.write_off, 0);
        self.write_off = unread;
        self.reserve_off -= self.read_off;
        self.read_off = 0;
    }

    /// Ensures `n` more bytes can be written starting at `write_off`,
    /// compacting and/or growing as needed. Growth is geometric (at
    /// least doubling), clamped to `memory_limit`.
    ///
    /// Returns `Err(MemoryLimitExceeded)` iff `n > memory_limit -
    /// bytes_unread` — the signal that the caller must flush (output
    /// side) or emit a partial batch (input side).
    pub(crate) fn reserve(&mut self, n: usize) -> Result<(), Error> {
        if self.write_off + n <= self.capacity() {
            return Ok(());
        }
        let unread = self.bytes_unread();
        if n > self.memory_limit.saturating_sub(unread) {
            return Err(Error::MemoryLimitExceeded { needed: unread + n, limit: self.memory_limit });
        }
        self.compact_to_front();
        if self.write_off + n > self.capacity() {
            let target = self.write_off + n;
            let mut new_cap = self.capacity().max(64);
            while new_cap < target {
                new_cap *= 2;
            }
            new_cap = new_cap.min(self.memory_limit).max(target);
            self.storage.resize(new_cap, 0);
        }
        Ok(())
    }

    /// Marks `n` additional bytes, starting at the old `write_off`, as
    /// filled.
    pub(crate) fn advance_write(&mut self, n: usize) {
        self.write_off += n;
    }

    /// Marks `n` bytes, starting at the old `write_off`'s
    /// already-confirmed counterpart, as filled — output-side alias of
    /// [`advance_write`](Self::advance_write) kept for call-site clarity.
    pub(crate) fn advance_read(&mut self, n: usize) {
        self.read_off += n;
    }

    /// Hands out the next `n` bytes starting at the reserve cursor and
    /// advances it, *without* advancing the confirm cursor. The bytes
    /// remain charged against `memory_limit` until [`confirm_reserved`]
    /// (Self::confirm_reserved) runs.
    pub(crate) fn take_reserved(&mut self, n: usize) -> &[u8] {
        let start = self.reserve_off;
        self.reserve_off += n;
        &self.storage[start..start + n]
    }

    /// Marks everything handed out by [`take_reserved`](Self::take_reserved)
    /// so far as consumed, then compacts: any residual read-ahead (bytes
    /// received but not yet reserved) moves to offset 0 and the reserve
    /// cursor zeros along with the confirm cursor.
    pub(crate) fn confirm_reserved(&mut self) {
        self.read_off = self.reserve_off;
        self.compact_to_front();
    }

    /// The writable region starting at `write_off`.
    pub(crate) fn writable_mut(&mut self) -> &mut [u8] {
        let off = self.write_off;
        &mut self.storage[off..]
    }

    /// Everything written so far, `[0, write_off)` — the span an
    /// output stream flushes.
    pub(crate) fn filled(&self) -> &[u8] {
        &self.storage[..self.write_off]
    }

    /// Overwrites `bytes.len()` bytes starting at `offset`, which must
    /// already lie within `[0, write_off)`. Used for the copy-then-patch
    /// batch-size back-patch (spec.md §9): a batch's header is written
    /// with a placeholder size and corrected once the batch closes.
    pub(crate) fn patch(&mut self, offset: usize, bytes: &[u8]) {
        self.storage[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invariants_hold_after_reserve() {
        let mut buf = BoundedBuffer::new(1024);
        buf.reserve(100).unwrap();
        buf.advance_write(100);
        assert!(buf.bytes_unread() + (buf.capacity() - buf.write_off()) <= buf.capacity());
        assert!(buf.capacity() <= buf.memory_limit());
    }

    #[test]
    fn reserve_fails_exactly_when_over_limit() {
        let mut buf = BoundedBuffer::new(100);
        assert!(buf.reserve(100).is_ok());
        buf.advance_write(100);
        assert!(buf.reserve(1).is_err());

        buf.advance_read(50);
        // 50 bytes unread remain; only 50 more can fit.
        assert!(buf.reserve(50).is_ok());
        let mut buf2 = BoundedBuffer::new(100);
        buf2.reserve(100).unwrap();
        buf2.advance_write(100);
        buf2.advance_read(50);
        assert!(buf2.reserve(51).is_err());
    }

    #[test]
    fn reserve_compacts_unread_region_to_front() {
        let mut buf = BoundedBuffer::new(1000);
        buf.reserve(100).unwrap();
        buf.advance_write(100);
        buf.advance_read(90);
        // Force growth past current capacity so compaction runs.
        buf.reserve(950).unwrap();
        assert_eq!(buf.read_off(), 0);
        assert_eq!(buf.write_off(), 10);
    }

    #[test]
    fn close_deallocates() {
        let mut buf = BoundedBuffer::new(1024);
        buf.reserve(100).unwrap();
        buf.advance_write(100);
        buf.close();
        assert_eq!(buf.capacity(), 0);
        assert_eq!(buf.write_off(), 0);
    }

    #[test]
    fn reserved_but_unconfirmed_bytes_still_count_against_the_limit() {
        // Reserving repeatedly without confirming must eventually fail
        // once the unconfirmed backlog reaches memory_limit, even though
        // each individual reservation is tiny — this is the mechanism
        // get_stream's accumulate-then-drain discipline depends on.
        let mut buf = BoundedBuffer::new(40);
        for _ in 0..4 {
            buf.reserve(10).unwrap();
            buf.advance_write(10);
            let _ = buf.take_reserved(10);
        }
        // 40 bytes reserved-but-unconfirmed; the buffer is full.
        assert!(buf.reserve(1).is_err());
        buf.confirm_reserved();
        // Confirming frees the backlog.
        assert!(buf.reserve(10).is_ok());
    }

    #[test]
    fn take_reserved_does_not_free_space_until_confirmed() {
        let mut buf = BoundedBuffer::new(1024);
        buf.reserve(20).unwrap();
        buf.advance_write(20);
        let _ = buf.take_reserved(10);
        assert_eq!(buf.bytes_ahead_of_reserve(), 10);
        assert_eq!(buf.bytes_unread(), 20);
        let _ = buf.take_reserved(10);
        assert_eq!(buf.bytes_ahead_of_reserve(), 0);
        assert_eq!(buf.bytes_unread(), 20);
        buf.confirm_reserved();
        assert_eq!(buf.bytes_unread(), 0);
    }
}
