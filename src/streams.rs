//! Reserve/confirm buffered adapters over [`BoundedBuffer`] + [`Transport`]:
//! [`BufferedOStream`] (reserve space, write, confirm, flush) and
//! [`BufferedIStream`] (reserve a read-ahead slice, confirm once a frame
//! is fully parsed).
//!
//! Grounded in `original_source/c/src/BufferedOStream.c` and
//! `BufferedIStream.c`. One deliberate divergence, recorded in
//! `DESIGN.md`: the original's two streams share a single `DynamicBuffer`
//! (valid there because the streams are never concurrently active); here
//! each stream owns its own [`BoundedBuffer`], per spec.md §9's
//! "no aliasing pointers escape the buffer owner" redesign note.

use crate::buffer::BoundedBuffer;
use crate::error::Error;
use crate::transport::Transport;

/// Reserve-then-write half of the two-layer buffered I/O model.
pub(crate) struct BufferedOStream {
    buffer: BoundedBuffer,
}

impl BufferedOStream {
    pub(crate) fn new(memory_limit: usize) -> Self {
        Self { buffer: BoundedBuffer::new(memory_limit) }
    }

    pub(crate) fn set_memory_limit(&mut self, limit: usize) {
        self.buffer.set_memory_limit(limit);
    }

    pub(crate) fn reset(&mut self) {
        self.buffer.reset();
    }

    pub(crate) fn close(&mut self) {
        self.buffer.close();
    }

    /// The number of bytes already confirmed (pending flush) plus the
    /// free space remaining before `memory_limit`. Used by the record
    /// serializer to size a best-effort write without growing the
    /// buffer first.
    pub(crate) fn bytes_available(&self) -> usize {
        self.buffer.capacity() - self.buffer.write_off()
    }

    /// Returns a writable slice of at least `n` bytes starting at the
    /// current write cursor, growing the buffer if needed.
    pub(crate) fn reserve(&mut self, n: usize) -> Result<&mut [u8], Error> {
        self.buffer.reserve(n)?;
        Ok(self.buffer.writable_mut())
    }

    /// Like [`reserve`](Self::reserve); on `MemoryLimitExceeded`, flushes
    /// confirmed bytes through `transport` and retries exactly once.
    pub(crate) fn reserve_flushing(&mut self, transport: &mut Transport, n: usize) -> Result<(), Error> {
        if self.buffer.reserve(n).is_ok() {
            return Ok(());
        }
        self.flush(transport)?;
        self.buffer.reserve(n)
    }

    /// Marks `n` bytes, starting at the old write cursor, as filled.
    pub(crate) fn confirm(&mut self, n: usize) {
        self.buffer.advance_write(n);
    }

    /// The write cursor, as an absolute offset from the start of the
    /// not-yet-flushed region. Used to remember where a batch header's
    /// `batch_size` field lives so it can be patched once the batch closes.
    pub(crate) fn write_cursor(&self) -> usize {
        self.buffer.write_off()
    }

    /// Overwrites already-confirmed bytes at `offset`, the copy-then-patch
    /// half of batch-size back-patching.
    pub(crate) fn patch(&mut self, offset: usize, bytes: &[u8]) {
        self.buffer.patch(offset, bytes);
    }

    /// Sends everything confirmed so far, then resets both cursors.
    pub(crate) fn flush(&mut self, transport: &mut Transport) -> Result<(), Error> {
        if self.buffer.write_off() > 0 {
            transport.send_all(self.buffer.filled())?;
            self.buffer.reset();
        }
        Ok(())
    }
}

/// Read-ahead-then-reserve half of the two-layer buffered I/O model.
pub(crate) struct BufferedIStream {
    buffer: BoundedBuffer,
}

impl BufferedIStream {
    pub(crate) fn new(memory_limit: usize) -> Self {
        Self { buffer: BoundedBuffer::new(memory_limit) }
    }

    pub(crate) fn set_memory_limit(&mut self, limit: usize) {
        self.buffer.set_memory_limit(limit);
    }

    pub(crate) fn reset(&mut self) {
        self.buffer.reset();
    }

    pub(crate) fn close(&mut self) {
        self.buffer.close();
    }

    /// Reads ahead through `transport` until at least `n` bytes sit
    /// beyond the reserve cursor, growing the buffer as needed, but does
    /// *not* hand any bytes out — no borrow of `self` escapes. Split out
    /// of [`reserve`](Self::reserve) so callers that need to retry after
    /// draining the accumulator (the `get_stream` "deliver and drain"
    /// loop) can do so without holding a slice borrow across the retry;
    /// doing the retry through `reserve` itself runs into the borrow
    /// checker's NLL "Problem Case #3", since the slice it would return
    /// holds `self` borrowed for the whole call.
    ///
    /// `Err(MemoryLimitExceeded)` if `n` can never fit; `Err(Receive)` on
    /// short read / FIN while more data was expected.
    pub(crate) fn ensure(&mut self, transport: &mut Transport, n: usize) -> Result<(), Error> {
        let ahead = self.buffer.bytes_ahead_of_reserve();
        if n > ahead {
            let shortfall = n - ahead;
            self.buffer.reserve(shortfall)?;
            let read = transport.recv_at_least(&mut self.buffer.writable_mut()[..shortfall], shortfall)?;
            self.buffer.advance_write(read);
            if read < shortfall {
                return Err(Error::Receive(std::io::Error::from(std::io::ErrorKind::UnexpectedEof)));
            }
        }
        Ok(())
    }

    /// Returns a read-only slice of exactly `n` bytes starting at the
    /// reserve cursor, reading ahead through `transport` as needed (see
    /// [`ensure`](Self::ensure)), and advances the reserve cursor by `n`.
    ///
    /// Bytes handed out here stay charged against the memory limit until
    /// [`confirm`](Self::confirm) runs — reserving several frames in a
    /// row without confirming is exactly how a caller accumulates a
    /// backlog large enough to trip `MemoryLimitExceeded`.
    pub(crate) fn reserve(&mut self, transport: &mut Transport, n: usize) -> Result<&[u8], Error> {
        self.ensure(transport, n)?;
        Ok(self.buffer.take_reserved(n))
    }

    /// Hands out `n` bytes already guaranteed available by a prior
    /// [`ensure`](Self::ensure) call, advancing the reserve cursor by
    /// `n`. Does not itself touch the transport.
    pub(crate) fn take_reserved(&mut self, n: usize) -> &[u8] {
        self.buffer.take_reserved(n)
    }

    /// Marks everything handed out by [`reserve`](Self::reserve) so far
    /// as consumed and compacts: any residual read-ahead moves to offset
    /// 0. Called once a frame (or a batch of frames) has been fully
    /// parsed and delivered.
    pub(crate) fn confirm(&mut self) {
        self.buffer.confirm_reserved();
    }
}
