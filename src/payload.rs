//! The payload adapter contract: the narrow, user-supplied interface
//! through which record payloads are (de)serialized. The core never
//! interprets payload bytes itself.

use std::fmt;

/// Error returned by a [`Payload::decode`] implementation. The
/// message is surfaced to the caller wrapped in
/// [`crate::Error::DeserializationError`].
#[derive(Debug)]
pub struct DecodeError(String);

impl DecodeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for DecodeError {}

/// The two-method capability a caller supplies to (de)serialize record
/// payloads: `encode`/`decode`. Implemented as a trait rather than a
/// pair of function pointers or a vtable — per spec.md §9's design
/// note, Rust's generics give monomorphized dispatch for free, so no
/// dynamic dispatch is needed; `Channel<P: Payload>` is generic over
/// the adapter.
pub trait Payload: Sized {
    /// Writes the serialized form of `self` into `out`, and **always**
    /// returns the total number of bytes the full serialization
    /// requires, even when `out` is too small to hold it (in which
    /// case no bytes are written). Two calls for the same logical
    /// value must report the same size.
    fn encode(&self, out: &mut [u8]) -> usize;

    /// Parses a payload out of `buf`. `buf` is exactly the record's
    /// payload slice (no key bytes, no length prefix).
    fn decode(buf: &[u8]) -> Result<Self, DecodeError>;
}

impl Payload for Vec<u8> {
    fn encode(&self, out: &mut [u8]) -> usize {
        if out.len() >= self.len() {
            out[..self.len()].copy_from_slice(self);
        }
        self.len()
    }

    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        Ok(buf.to_vec())
    }
}
