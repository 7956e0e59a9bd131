use std::io;
use std::time::Duration;

use thiserror::Error;

/// A server-reported result code, in the `[INT8_MIN, INT8_MAX]` range
/// excluding zero. Named variants cover the codes restored from
/// `original_source/c/include/tstorage-client/client.h`'s
/// `TSCLIENT_RES_*` enumeration; anything else round-trips through
/// `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ServerCode {
    #[error("general error")]
    General,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("retry")]
    Retry,
    #[error("timeout")]
    Timeout,
    #[error("out of memory")]
    NoMemory,
    #[error("I/O error")]
    IoError,
    #[error("permission denied")]
    NoPermission,
    #[error("not implemented")]
    NotImplemented,
    #[error("aborted")]
    Aborted,
    #[error("unauthorized")]
    Unauthorized,
    #[error("inactive")]
    Inactive,
    #[error("continue")]
    Continue,
    #[error("interrupted")]
    Interrupted,
    #[error("connection reset")]
    ConnReset,
    #[error("address error")]
    AddrError,
    #[error("connection error")]
    ConnError,
    #[error("bind error")]
    BindError,
    #[error("socket error")]
    SockError,
    #[error("invalid path")]
    InvalidPath,
    #[error("already exists")]
    AlreadyExists,
    #[error("not found")]
    NotFound,
    #[error("not a directory")]
    NotADirectory,
    #[error("busy")]
    Busy,
    #[error("not empty")]
    NotEmpty,
    #[error("not opened")]
    NotOpened,
    #[error("is a directory")]
    IsADirectory,
    #[error("already opened")]
    AlreadyOpened,
    #[error("already closed")]
    AlreadyClosed,
    #[error("not started")]
    NotStarted,
    #[error("running")]
    Running,
    #[error("server aborted")]
    ServerAborted,
    #[error("redirect")]
    Redirect,
    #[error("server error code {0}")]
    Unknown(i32),
}

impl ServerCode {
    /// Maps a raw, non-zero `result` field to a named code.
    pub fn from_raw(code: i32) -> Self {
        match code {
            -1 => Self::General,
            -2 => Self::InvalidArgument,
            -3 => Self::Retry,
            -4 => Self::Timeout,
            -5 => Self::NoMemory,
            -6 => Self::IoError,
            -7 => Self::NoPermission,
            -8 => Self::NotImplemented,
            -9 => Self::Aborted,
            -11 => Self::Unauthorized,
            -12 => Self::Inactive,
            -16 => Self::Continue,
            -126 => Self::Interrupted,
            -127 => Self::ConnReset,
            -128 => Self::AddrError,
            -129 => Self::ConnError,
            -130 => Self::BindError,
            -131 => Self::SockError,
            -132 => Self::InvalidPath,
            -133 => Self::AlreadyExists,
            -134 => Self::NotFound,
            -135 => Self::NotADirectory,
            -136 => Self::Busy,
            -137 => Self::NotEmpty,
            -138 => Self::NotOpened,
            -139 => Self::IsADirectory,
            -140 => Self::AlreadyOpened,
            -141 => Self::AlreadyClosed,
            -256 => Self::NotStarted,
            -257 => Self::Running,
            -258 => Self::ServerAborted,
            -259 => Self::Redirect,
            other => Self::Unknown(other),
        }
    }

    /// The raw numeric code the server sent, reconstructed for display
    /// and for callers who want the wire value rather than the name.
    pub fn raw(&self) -> i32 {
        match self {
            Self::General => -1,
            Self::InvalidArgument => -2,
            Self::Retry => -3,
            Self::Timeout => -4,
            Self::NoMemory => -5,
            Self::IoError => -6,
            Self::NoPermission => -7,
            Self::NotImplemented => -8,
            Self::Aborted => -9,
            Self::Unauthorized => -11,
            Self::Inactive => -12,
            Self::Continue => -16,
            Self::Interrupted => -126,
            Self::ConnReset => -127,
            Self::AddrError => -128,
            Self::ConnError => -129,
            Self::BindError => -130,
            Self::SockError => -131,
            Self::InvalidPath => -132,
            Self::AlreadyExists => -133,
            Self::NotFound => -134,
            Self::NotADirectory => -135,
            Self::Busy => -136,
            Self::NotEmpty => -137,
            Self::NotOpened => -138,
            Self::IsADirectory => -139,
            Self::AlreadyOpened => -140,
            Self::AlreadyClosed => -141,
            Self::NotStarted => -256,
            Self::Running => -257,
            Self::ServerAborted => -258,
            Self::Redirect => -259,
            Self::Unknown(code) => *code,
        }
    }
}

/// Every way a `Channel` operation can fail.
///
/// Server-reported errors (`Server`) retain the numeric code the peer
/// sent. Every other variant is client-side: validation failures that
/// leave the channel untouched ([`Error::InvalidInput`],
/// [`Error::EmptyKeyRange`], [`Error::InvalidKey`]), and transport or
/// protocol faults that close the channel.
#[derive(Debug, Error)]
pub enum Error {
    #[error("server rejected the request: {0}")]
    Server(ServerCode),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("key range [min, max) is empty")]
    EmptyKeyRange,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("memory limit exceeded: need {needed} bytes, limit is {limit}")]
    MemoryLimitExceeded { needed: usize, limit: usize },

    #[error("out of memory")]
    OutOfMemory,

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),

    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    #[error("could not resolve or connect to {host}:{port}")]
    BadAddress { host: String, port: u16 },

    #[error("connection refused")]
    ConnRefused,

    #[error("operation timed out after {0:?}")]
    ConnTimeout(Duration),

    #[error("connection closed by peer")]
    ConnClosed,

    #[error("connection reset by peer")]
    ConnReset,

    #[error("connection error: {0}")]
    ConnError(#[source] io::Error),

    #[error("socket error: {0}")]
    SocketError(#[source] io::Error),

    #[error("failed to set socket option: {0}")]
    SetOptError(#[source] io::Error),

    #[error("interrupted by signal")]
    Signal,

    #[error("protocol violation: {0}")]
    Unexpected(String),

    #[error("payload too large: {size} bytes exceeds the {max}-byte ceiling")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("payload deserialization failed: {0}")]
    DeserializationError(String),
}

impl Error {
    /// `true` for the pure-validation errors that spec.md §7's
    /// propagation policy carves out: detected before any I/O, they
    /// leave the channel's connection status untouched.
    pub fn leaves_channel_open(&self) -> bool {
        matches!(self, Error::InvalidInput(_) | Error::EmptyKeyRange | Error::InvalidKey(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
