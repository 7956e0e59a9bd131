//! [`Channel`]: the conversational state machine over a [`Transport`].
//!
//! Grounded in `original_source/c/src/Channel.c`, which owns the socket,
//! the input/output buffers, and the five conversations (`open`, `put`,
//! `putAcq`, `get`, `getAcq`); the batch-grouping write algorithm follows
//! `RecordsSet.c`'s `writeCidBatch`/`commonWrite`, and the streaming GET
//! accumulate-then-drain discipline follows `reserveWithCallback`/
//! `RecordsSet_readWithCallback`.

use std::time::Duration;

use crate::codec;
use crate::error::{Error, Result, ServerCode};
use crate::key::KeyRange;
use crate::payload::Payload;
use crate::record::{Record, RecordsSet};
use crate::streams::{BufferedIStream, BufferedOStream};
use crate::transport::Transport;

/// `(1 << 25) + 56` bytes, matching `Channel.c`'s `DEFAULT_MEMORY_LIMIT`:
/// 32 MiB plus the header/key overhead of one GET request.
pub const DEFAULT_MEMORY_LIMIT: usize = (1usize << 25) + 56;

/// The default connect/send/receive timeout, matching `Channel.c`'s
/// `DEFAULT_TIMEOUT` of five seconds.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// A connected socket together with the buffers that ride on it. Exists
/// only while the channel is `Open`; dropping or closing it tears both
/// down at once, which is how `Closed ⇒ no buffer is allocated` holds.
struct ChannelConn {
    transport: Transport,
    output: BufferedOStream,
    input: BufferedIStream,
}

impl ChannelConn {
    fn close(&mut self) {
        self.transport.close();
        self.output.close();
        self.input.close();
    }
}

/// A client connection to one TStorage node, generic over the payload
/// type `P` its records carry.
///
/// ```no_run
/// use tstorage_client::{Channel, Key, KeyRange, Record, RecordsSet};
///
/// # fn main() -> tstorage_client::Result<()> {
/// let mut channel: Channel<Vec<u8>> = Channel::new("127.0.0.1", 1234);
/// channel.connect()?;
///
/// let mut records = RecordsSet::new();
/// records.push(Record::new(Key::new(1, 0, 0, 0, 0), b"hello".to_vec()));
/// let (acq_min, acq_max) = channel.put(&records)?;
/// println!("stored at acq range [{acq_min}, {acq_max})");
///
/// let (found, result) = channel.get(KeyRange::everything());
/// let confirmed_acq = result?;
/// println!("read {} records as of acq {confirmed_acq}", found.len());
///
/// channel.close()?;
/// # Ok(())
/// # }
/// ```
pub struct Channel<P> {
    host: String,
    port: u16,
    memory_limit: usize,
    timeout: Duration,
    conn: Option<ChannelConn>,
    on_send: Option<Box<dyn FnMut(i32)>>,
    on_recv: Option<Box<dyn FnMut(i32)>>,
    _payload: std::marker::PhantomData<fn() -> P>,
}

impl<P: Payload> Channel<P> {
    /// A new, unconnected channel targeting `host:port`, with the
    /// default memory limit and timeout. Call [`connect`](Self::connect)
    /// before issuing any conversation.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            timeout: DEFAULT_TIMEOUT,
            conn: None,
            on_send: None,
            on_recv: None,
            _payload: std::marker::PhantomData,
        }
    }

    /// Installs a hook invoked with each request's `cmd` just before it
    /// is flushed. Mirrors the trace points a caller would otherwise get
    /// only from packet capture; has no effect on protocol behavior.
    pub fn on_send(&mut self, hook: impl FnMut(i32) + 'static) {
        self.on_send = Some(Box::new(hook));
    }

    /// Installs a hook invoked with each response's `result` as soon as
    /// it is decoded.
    pub fn on_recv(&mut self, hook: impl FnMut(i32) + 'static) {
        self.on_recv = Some(Box::new(hook));
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Opens the TCP connection. `Error::InvalidInput` if already open.
    pub fn connect(&mut self) -> Result<()> {
        if self.conn.is_some() {
            return Err(Error::InvalidInput("channel is already open".into()));
        }
        let transport = Transport::open(&self.host, self.port, self.timeout)?;
        self.conn = Some(ChannelConn {
            transport,
            output: BufferedOStream::new(self.memory_limit),
            input: BufferedIStream::new(self.memory_limit),
        });
        Ok(())
    }

    /// Closes the connection. `Error::InvalidInput` if already closed.
    pub fn close(&mut self) -> Result<()> {
        match self.conn.take() {
            Some(mut conn) => {
                conn.close();
                Ok(())
            }
            None => Err(Error::InvalidInput("channel is already closed".into())),
        }
    }

    /// Changes the connect/send/receive timeout, applying it to the
    /// live socket if one is open.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        if let Some(conn) = self.conn.as_mut() {
            conn.transport.set_timeout(timeout)?;
        }
        Ok(())
    }

    /// Changes the buffer memory limit. Takes effect immediately on both
    /// buffers of a live connection; future `connect` calls pick it up
    /// for new buffers.
    pub fn set_memory_limit(&mut self, limit: usize) {
        self.memory_limit = limit;
        if let Some(conn) = self.conn.as_mut() {
            conn.output.set_memory_limit(limit);
            conn.input.set_memory_limit(limit);
        }
    }

    /// Writes `records`, grouped into batches by `cid`, with
    /// server-assigned acquisition times. Returns the `[acq_min, acq_max)`
    /// range the server stamped the batch with.
    pub fn put(&mut self, records: &RecordsSet<P>) -> Result<(i64, i64)> {
        self.run(|conn, on_send, on_recv| do_put(conn, records, codec::CMD_PUTSAFE, false, on_send, on_recv))
    }

    /// Writes `records` with caller-chosen `acq` values per record
    /// (each record's `key.acq` is sent verbatim instead of being
    /// assigned by the server).
    pub fn puta(&mut self, records: &RecordsSet<P>) -> Result<(i64, i64)> {
        self.run(|conn, on_send, on_recv| do_put(conn, records, codec::CMD_PUTASAFE, true, on_send, on_recv))
    }

    /// Reads every record in `range`, accumulating the full result set
    /// in memory before returning.
    ///
    /// Unlike the other conversations, a failure here does not discard
    /// partial progress: the records successfully decoded before the
    /// fault are still returned alongside the error.
    pub fn get(&mut self, range: KeyRange) -> (RecordsSet<P>, Result<i64>) {
        if let Err(e) = range.validate() {
            return (RecordsSet::new(), Err(e));
        }
        let conn = match self.conn.as_mut() {
            Some(conn) => conn,
            None => return (RecordsSet::new(), Err(Error::InvalidInput("channel is not open".into()))),
        };
        let (records, result) = do_get(conn, range, &mut self.on_send, &mut self.on_recv);
        if result.is_err() {
            self.abort();
        }
        (records, result)
    }

    /// Like [`get`](Self::get), but delivers records to `callback` in
    /// bounded-size batches as they are decoded rather than accumulating
    /// the whole result set. `callback` may be invoked zero or more
    /// times; its final invocation (with whatever is left, possibly
    /// empty) happens before this returns, success or failure.
    pub fn get_stream(&mut self, range: KeyRange, callback: &mut dyn FnMut(RecordsSet<P>)) -> Result<i64> {
        range.validate()?;
        let conn = self.conn.as_mut().ok_or_else(|| Error::InvalidInput("channel is not open".into()))?;
        let result = do_get_stream(conn, range, callback, &mut self.on_send, &mut self.on_recv);
        if result.is_err() {
            self.abort();
        }
        result
    }

    /// Reads nothing but the server's confirmed acquisition time for
    /// `range` — the same conversation as `get`, without the record
    /// stream.
    pub fn get_acq(&mut self, range: KeyRange) -> Result<i64> {
        range.validate()?;
        self.run(|conn, on_send, on_recv| do_get_acq(conn, range, on_send, on_recv))
    }

    /// Runs `f` against the live connection, closing it on any error per
    /// spec.md §7: "any non-`Ok` result from a conversation operation
    /// forces the channel closed."
    fn run<T>(
        &mut self,
        f: impl FnOnce(&mut ChannelConn, &mut Option<Box<dyn FnMut(i32)>>, &mut Option<Box<dyn FnMut(i32)>>) -> Result<T>,
    ) -> Result<T> {
        let conn = self.conn.as_mut().ok_or_else(|| Error::InvalidInput("channel is not open".into()))?;
        let result = f(conn, &mut self.on_send, &mut self.on_recv);
        if result.is_err() {
            self.abort();
        }
        result
    }

    fn abort(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close();
        }
    }
}

fn notify(hook: &mut Option<Box<dyn FnMut(i32)>>, value: i32) {
    if let Some(hook) = hook.as_mut() {
        hook(value);
    }
}

/// Tracks the currently-open batch's header position so its
/// placeholder `batch_size` can be patched once the batch closes.
struct BatchState {
    cid: i32,
    header_offset: usize,
    batch_size: i32,
}

fn close_batch(output: &mut BufferedOStream, batch: BatchState) {
    output.patch(batch.header_offset + 4, &batch.batch_size.to_le_bytes());
}

fn open_batch(conn: &mut ChannelConn, cid: i32) -> Result<BatchState> {
    conn.output.reserve_flushing(&mut conn.transport, codec::BATCH_HEADER_SIZE)?;
    let header_offset = conn.output.write_cursor();
    {
        let buf = conn.output.reserve(codec::BATCH_HEADER_SIZE)?;
        codec::write_batch_header(buf, cid, 0);
    }
    conn.output.confirm(codec::BATCH_HEADER_SIZE);
    Ok(BatchState { cid, header_offset, batch_size: 0 })
}

/// Serializes one record into the currently-open (or about-to-open)
/// batch, implementing the "ask for a best-effort buffer, retry on
/// overflow" discipline spec.md §1 calls out as the component's hard
/// part: the happy path encodes once, directly into the output buffer's
/// existing free space; growing the buffer or flushing the batch in
/// flight are both fallbacks, tried in that order.
fn write_record_grouped<P: Payload>(
    conn: &mut ChannelConn,
    batch: &mut Option<BatchState>,
    record: &Record<P>,
    with_acq: bool,
) -> Result<()> {
    if let Some(b) = batch.as_ref() {
        if b.cid != record.key.cid {
            close_batch(&mut conn.output, batch.take().unwrap());
        }
    }

    let header_size = codec::record_header_size(with_acq);
    let mut flushed_once = false;

    loop {
        if batch.is_none() {
            *batch = Some(open_batch(conn, record.key.cid)?);
        }

        let avail = conn.output.bytes_available();
        let guess = avail.saturating_sub(header_size);
        let buf = conn.output.reserve(header_size + guess)?;
        let payload_len = record.payload.encode(&mut buf[header_size..]);

        if payload_len > codec::PAYLOAD_SIZE_MAX {
            if let Some(b) = batch.take() {
                close_batch(&mut conn.output, b);
            }
            conn.output.flush(&mut conn.transport)?;
            return Err(Error::PayloadTooLarge { size: payload_len, max: codec::PAYLOAD_SIZE_MAX });
        }

        let total = header_size + payload_len;
        let grown = if payload_len <= guess { Ok(()) } else { conn.output.reserve(total).map(|_| ()) };

        match grown {
            Ok(()) => {
                if batch.as_ref().unwrap().batch_size as i64 + total as i64 > i32::MAX as i64 {
                    close_batch(&mut conn.output, batch.take().unwrap());
                    continue;
                }
                let buf = conn.output.reserve(total)?;
                if payload_len > guess {
                    let resized = record.payload.encode(&mut buf[header_size..]);
                    debug_assert_eq!(resized, payload_len);
                }
                codec::write_record_header(
                    &mut buf[..header_size],
                    record.key.mid,
                    record.key.moid,
                    record.key.cap,
                    with_acq.then_some(record.key.acq),
                    payload_len,
                );
                conn.output.confirm(total);
                batch.as_mut().unwrap().batch_size += total as i32;
                return Ok(());
            }
            Err(Error::MemoryLimitExceeded { needed, limit }) => {
                if flushed_once {
                    return Err(Error::MemoryLimitExceeded { needed, limit });
                }
                close_batch(&mut conn.output, batch.take().unwrap());
                conn.output.flush(&mut conn.transport)?;
                flushed_once = true;
            }
            Err(e) => return Err(e),
        }
    }
}

fn do_put<P: Payload>(
    conn: &mut ChannelConn,
    records: &RecordsSet<P>,
    cmd: i32,
    with_acq: bool,
    on_send: &mut Option<Box<dyn FnMut(i32)>>,
    on_recv: &mut Option<Box<dyn FnMut(i32)>>,
) -> Result<(i64, i64)> {
    notify(on_send, cmd);

    conn.output.reserve_flushing(&mut conn.transport, codec::REQUEST_HEADER_SIZE)?;
    {
        let buf = conn.output.reserve(codec::REQUEST_HEADER_SIZE)?;
        codec::write_request_header(buf, cmd, 0);
    }
    conn.output.confirm(codec::REQUEST_HEADER_SIZE);

    let mut batch: Option<BatchState> = None;
    for record in records {
        write_record_grouped(conn, &mut batch, record, with_acq)?;
    }
    if let Some(b) = batch.take() {
        close_batch(&mut conn.output, b);
    }

    conn.output.reserve_flushing(&mut conn.transport, 4)?;
    {
        let buf = conn.output.reserve(4)?;
        codec::write_i32(buf, codec::BATCH_SENTINEL);
    }
    conn.output.confirm(4);
    conn.output.flush(&mut conn.transport)?;

    let header = read_response_header(conn)?;
    notify(on_recv, header.result);
    if header.result != 0 {
        let _ = conn.transport.skip_exactly(header.size as usize);
        return Err(Error::Server(ServerCode::from_raw(header.result)));
    }
    let data = conn.input.reserve(&mut conn.transport, 16)?;
    let acq_min = codec::read_i64(&data[0..8]);
    let acq_max = codec::read_i64(&data[8..16]);
    conn.input.confirm();
    Ok((acq_min, acq_max))
}

fn write_get_request(conn: &mut ChannelConn, cmd: i32, range: KeyRange) -> Result<()> {
    let size = (2 * codec::KEY_SIZE) as u64;
    let total = codec::REQUEST_HEADER_SIZE + 2 * codec::KEY_SIZE;
    conn.output.reserve_flushing(&mut conn.transport, total)?;
    {
        let buf = conn.output.reserve(total)?;
        codec::write_request_header(&mut buf[..codec::REQUEST_HEADER_SIZE], cmd, size);
        let (min_buf, rest) = buf[codec::REQUEST_HEADER_SIZE..].split_at_mut(codec::KEY_SIZE);
        codec::write_key(min_buf, &range.min);
        codec::write_key(&mut rest[..codec::KEY_SIZE], &range.max);
    }
    conn.output.confirm(total);
    conn.output.flush(&mut conn.transport)
}

fn read_response_header(conn: &mut ChannelConn) -> Result<codec::ResponseHeader> {
    let buf = conn.input.reserve(&mut conn.transport, codec::RESPONSE_HEADER_SIZE)?;
    let header = codec::read_response_header(buf);
    conn.input.confirm();
    Ok(header)
}

fn do_get_acq(
    conn: &mut ChannelConn,
    range: KeyRange,
    on_send: &mut Option<Box<dyn FnMut(i32)>>,
    on_recv: &mut Option<Box<dyn FnMut(i32)>>,
) -> Result<i64> {
    notify(on_send, codec::CMD_GETACQ);
    write_get_request(conn, codec::CMD_GETACQ, range)?;
    let header = read_response_header(conn)?;
    notify(on_recv, header.result);
    if header.result != 0 {
        let _ = conn.transport.skip_exactly(header.size as usize);
        return Err(Error::Server(ServerCode::from_raw(header.result)));
    }
    let data = conn.input.reserve(&mut conn.transport, 8)?;
    let acq = codec::read_i64(&data[..8]);
    conn.input.confirm();
    Ok(acq)
}

/// Reads one frame's `rec_size` prefix; `Ok(None)` at the stream's
/// `rec_size = 0` terminator.
fn read_rec_size(conn: &mut ChannelConn) -> Result<Option<i32>> {
    let buf = conn.input.reserve(&mut conn.transport, 4)?;
    let rec_size = codec::read_i32(buf);
    conn.input.confirm();
    Ok(if rec_size == codec::RECORD_STREAM_END { None } else { Some(rec_size) })
}

fn read_one_record<P: Payload>(conn: &mut ChannelConn, rec_size: i32) -> Result<Record<P>> {
    if (rec_size as usize) < codec::KEY_SIZE {
        return Err(Error::Unexpected(format!("rec_size {rec_size} smaller than a key")));
    }
    let frame = conn.input.reserve(&mut conn.transport, rec_size as usize)?;
    let header = codec::read_record_frame_header(frame)?;
    let decoded = P::decode(&frame[codec::KEY_SIZE..]);
    conn.input.confirm();
    decoded.map(|payload| Record::new(header.key, payload)).map_err(|e| Error::DeserializationError(e.to_string()))
}

fn do_get<P: Payload>(
    conn: &mut ChannelConn,
    range: KeyRange,
    on_send: &mut Option<Box<dyn FnMut(i32)>>,
    on_recv: &mut Option<Box<dyn FnMut(i32)>>,
) -> (RecordsSet<P>, Result<i64>) {
    notify(on_send, codec::CMD_GET);
    if let Err(e) = write_get_request(conn, codec::CMD_GET, range) {
        return (RecordsSet::new(), Err(e));
    }

    let header1 = match read_response_header(conn) {
        Ok(h) => h,
        Err(e) => return (RecordsSet::new(), Err(e)),
    };
    notify(on_recv, header1.result);
    if header1.result != 0 {
        let _ = conn.transport.skip_exactly(header1.size as usize);
        return (RecordsSet::new(), Err(Error::Server(ServerCode::from_raw(header1.result))));
    }

    let mut records = RecordsSet::new();
    loop {
        match read_rec_size(conn) {
            Ok(None) => break,
            Ok(Some(rec_size)) => match read_one_record::<P>(conn, rec_size) {
                Ok(record) => records.push(record),
                Err(e) => return (records, Err(e)),
            },
            Err(e) => return (records, Err(e)),
        }
    }

    let header2 = match read_response_header(conn) {
        Ok(h) => h,
        Err(e) => return (records, Err(e)),
    };
    if header2.result != 0 {
        let _ = conn.transport.skip_exactly(header2.size as usize);
        return (records, Err(Error::Server(ServerCode::from_raw(header2.result))));
    }
    match conn.input.reserve(&mut conn.transport, 8) {
        Ok(data) => {
            let acq = codec::read_i64(&data[..8]);
            conn.input.confirm();
            (records, Ok(acq))
        }
        Err(e) => (records, Err(e)),
    }
}

/// Ensures `n` bytes are available for the next frame, delivering and
/// draining the accumulator first if the reservation alone would
/// exceed the memory limit. Surfaces `MemoryLimitExceeded` only if the
/// frame still does not fit against an empty buffer.
///
/// Returns `()`, not the reserved slice: `BufferedIStream::ensure`
/// never hands out a borrow, so this function's `conn.input`/
/// `conn.transport` re-borrows on the drain-and-retry path don't
/// conflict with a loan a borrow-returning probe would otherwise force
/// to live across them. Callers take the slice themselves afterward via
/// `conn.input.take_reserved(n)`, which performs exactly the one cursor
/// advance the successful probe (first or retried) already made room for.
fn reserve_or_drain<P: Payload>(
    conn: &mut ChannelConn,
    acc: &mut RecordsSet<P>,
    callback: &mut dyn FnMut(RecordsSet<P>),
    n: usize,
) -> Result<()> {
    match conn.input.ensure(&mut conn.transport, n) {
        Err(Error::MemoryLimitExceeded { needed, limit }) => {
            if !acc.is_empty() {
                callback(std::mem::take(acc));
            }
            conn.input.confirm();
            conn.input.ensure(&mut conn.transport, n).map_err(|e| match e {
                Error::MemoryLimitExceeded { .. } => Error::MemoryLimitExceeded { needed, limit },
                other => other,
            })
        }
        other => other,
    }
}

fn do_get_stream<P: Payload>(
    conn: &mut ChannelConn,
    range: KeyRange,
    callback: &mut dyn FnMut(RecordsSet<P>),
    on_send: &mut Option<Box<dyn FnMut(i32)>>,
    on_recv: &mut Option<Box<dyn FnMut(i32)>>,
) -> Result<i64> {
    notify(on_send, codec::CMD_GET);
    write_get_request(conn, codec::CMD_GET, range)?;

    let header1 = read_response_header(conn)?;
    notify(on_recv, header1.result);
    if header1.result != 0 {
        let _ = conn.transport.skip_exactly(header1.size as usize);
        return Err(Error::Server(ServerCode::from_raw(header1.result)));
    }

    let mut acc: RecordsSet<P> = RecordsSet::new();
    let body_result: Result<()> = (|| {
        loop {
            let rec_size = {
                reserve_or_drain(conn, &mut acc, callback, 4)?;
                codec::read_i32(conn.input.take_reserved(4))
            };
            if rec_size == codec::RECORD_STREAM_END {
                break;
            }
            if (rec_size as usize) < codec::KEY_SIZE {
                return Err(Error::Unexpected(format!("rec_size {rec_size} smaller than a key")));
            }
            let (key, decoded) = {
                reserve_or_drain(conn, &mut acc, callback, rec_size as usize)?;
                let frame = conn.input.take_reserved(rec_size as usize);
                let header = codec::read_record_frame_header(frame)?;
                let decoded = P::decode(&frame[codec::KEY_SIZE..]);
                (header.key, decoded)
            };
            match decoded {
                Ok(payload) => acc.push(Record::new(key, payload)),
                Err(e) => return Err(Error::DeserializationError(e.to_string())),
            }
        }
        Ok(())
    })();

    if !acc.is_empty() {
        callback(std::mem::take(&mut acc));
    }
    conn.input.confirm();
    body_result?;

    let header2 = read_response_header(conn)?;
    if header2.result != 0 {
        let _ = conn.transport.skip_exactly(header2.size as usize);
        return Err(Error::Server(ServerCode::from_raw(header2.result)));
    }
    let data = conn.input.reserve(&mut conn.transport, 8)?;
    let acq = codec::read_i64(&data[..8]);
    conn.input.confirm();
    Ok(acq)
}
