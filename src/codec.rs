//! Little-endian wire codec for the TStorage protocol: primitives, keys,
//! request/response headers, and record frames.
//!
//! Grounded in `original_source/c/src/Key.c`, `RequestHeader.c`,
//! `ResponseHeader.c`, and `Record.c`, which `memcpy` fixed-width fields in
//! host order (the original targets little-endian hosts only); this crate
//! makes the endianness explicit with `to_le_bytes`/`from_le_bytes` so the
//! wire format is correct on big-endian hosts too (spec.md §4.4's
//! "Endianness" clause, tested in [`tests::integers_round_trip_le`]).

use crate::error::{Error, Result};
use crate::key::Key;

/// `cmd` values in the request header (spec.md §4.4).
pub const CMD_GET: i32 = 1;
pub const CMD_PUTSAFE: i32 = 5;
pub const CMD_PUTASAFE: i32 = 6;
pub const CMD_GETACQ: i32 = 7;

/// Size of one serialized [`Key`]: `cid(4) + mid(8) + moid(4) + cap(8) + acq(8)`.
pub const KEY_SIZE: usize = 32;
/// Size of the request header: `cmd(4) + size(8)`.
pub const REQUEST_HEADER_SIZE: usize = 12;
/// Size of the response header's fixed part: `result(4) + size(8)`.
pub const RESPONSE_HEADER_SIZE: usize = 12;
/// The `i32 = -1` sentinel that terminates a PUT/PUTA body.
pub const BATCH_SENTINEL: i32 = -1;
/// The `rec_size = 0` marker that terminates a GET record stream.
pub const RECORD_STREAM_END: i32 = 0;

/// `INT32_MAX - 2*sizeof(i32) - 3*sizeof(i64)`, per spec.md §4.5/§6's
/// literal, repeated numeric value. See `DESIGN.md` for the discrepancy
/// this resolves against the naive single application of the formula.
pub const PAYLOAD_SIZE_MAX: usize = 2_147_483_583;

pub fn write_i32(buf: &mut [u8], v: i32) {
    buf[..4].copy_from_slice(&v.to_le_bytes());
}

pub fn write_i64(buf: &mut [u8], v: i64) {
    buf[..8].copy_from_slice(&v.to_le_bytes());
}

pub fn write_u64(buf: &mut [u8], v: u64) {
    buf[..8].copy_from_slice(&v.to_le_bytes());
}

pub fn read_i32(buf: &[u8]) -> i32 {
    i32::from_le_bytes(buf[..4].try_into().unwrap())
}

pub fn read_i64(buf: &[u8]) -> i64 {
    i64::from_le_bytes(buf[..8].try_into().unwrap())
}

pub fn read_u64(buf: &[u8]) -> u64 {
    u64::from_le_bytes(buf[..8].try_into().unwrap())
}

/// Serializes a [`Key`] into `buf[..32]` in wire field order (cid, mid,
/// moid, cap, acq). `buf` must be at least [`KEY_SIZE`] bytes.
pub fn write_key(buf: &mut [u8], key: &Key) {
    write_i32(&mut buf[0..4], key.cid);
    write_i64(&mut buf[4..12], key.mid);
    write_i32(&mut buf[12..16], key.moid);
    write_i64(&mut buf[16..24], key.cap);
    write_i64(&mut buf[24..32], key.acq);
}

/// Deserializes a [`Key`] from `buf[..32]`.
pub fn read_key(buf: &[u8]) -> Key {
    Key::new(
        read_i32(&buf[0..4]),
        read_i64(&buf[4..12]),
        read_i32(&buf[12..16]),
        read_i64(&buf[16..24]),
        read_i64(&buf[24..32]),
    )
}

/// Serializes the request header (`cmd`, `size`) per spec.md §4.4.
pub fn write_request_header(buf: &mut [u8], cmd: i32, size: u64) {
    write_i32(&mut buf[0..4], cmd);
    write_u64(&mut buf[4..12], size);
}

/// A deserialized response header: `result`, `size`, and (not included
/// here) `size` bytes of trailing `data` the caller reads separately.
#[derive(Debug, Clone, Copy)]
pub struct ResponseHeader {
    pub result: i32,
    pub size: u64,
}

pub fn read_response_header(buf: &[u8]) -> ResponseHeader {
    ResponseHeader { result: read_i32(&buf[0..4]), size: read_u64(&buf[4..12]) }
}

/// The fixed part of a PUT/PUTA record header, excluding `rec_size`
/// itself: `mid + moid + cap [+ acq]`.
fn record_header_fixed_size(with_acq: bool) -> usize {
    8 + 4 + 8 + if with_acq { 8 } else { 0 }
}

/// Size of a record frame's header (everything before the payload),
/// including the leading `rec_size` field.
pub fn record_header_size(with_acq: bool) -> usize {
    4 + record_header_fixed_size(with_acq)
}

/// Writes a PUT/PUTA record frame's header (not the payload, which the
/// caller has already placed at `buf[record_header_size(with_acq)..]`).
///
/// `rec_size` is "the size of everything after itself" (spec.md §4.4):
/// `record_header_fixed_size(with_acq) + payload_len`.
pub fn write_record_header(buf: &mut [u8], mid: i64, moid: i32, cap: i64, acq: Option<i64>, payload_len: usize) {
    let with_acq = acq.is_some();
    let rec_size = record_header_fixed_size(with_acq) + payload_len;
    write_i32(&mut buf[0..4], rec_size as i32);
    write_i64(&mut buf[4..12], mid);
    write_i32(&mut buf[12..16], moid);
    write_i64(&mut buf[16..24], cap);
    if let Some(acq) = acq {
        write_i64(&mut buf[24..32], acq);
    }
}

/// Writes the batch frame header (`cid`, `batch_size`) at `buf[..8]`.
pub fn write_batch_header(buf: &mut [u8], cid: i32, batch_size: i32) {
    write_i32(&mut buf[0..4], cid);
    write_i32(&mut buf[4..8], batch_size);
}

/// Size of the batch frame header: `cid(4) + batch_size(4)`.
pub const BATCH_HEADER_SIZE: usize = 8;

/// A GET response record frame's fixed-size prefix, decoded from
/// `buf[..32]`: `cid, mid, moid, cap, acq` (spec.md §4.4's "record stream
/// response"). `rec_size` (already consumed by the caller) determines
/// the trailing payload length: `rec_size - 32`.
pub struct RecordFrameHeader {
    pub key: Key,
}

pub fn read_record_frame_header(buf: &[u8]) -> Result<RecordFrameHeader> {
    if buf.len() < KEY_SIZE {
        return Err(Error::Unexpected(format!(
            "record frame header needs {KEY_SIZE} bytes, got {}",
            buf.len()
        )));
    }
    Ok(RecordFrameHeader { key: read_key(buf) })
}
