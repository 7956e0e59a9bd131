//! Client library for the TStorage time-series database's binary
//! protocol: a synchronous state machine over one blocking TCP
//! connection, mediating PUT/PUTA/GET/GETACQ conversations.
//!
//! [`Channel`] is the entry point — connect, issue conversations, close:
//!
//! ```no_run
//! use tstorage_client::{Channel, Key, KeyRange, Record, RecordsSet};
//!
//! # fn main() -> tstorage_client::Result<()> {
//! let mut channel: Channel<Vec<u8>> = Channel::new("127.0.0.1", 1234);
//! channel.connect()?;
//!
//! let mut records = RecordsSet::new();
//! records.push(Record::new(Key::new(1, 0, 0, 0, 0), b"hello".to_vec()));
//! channel.put(&records)?;
//!
//! let (found, result) = channel.get(KeyRange::everything());
//! result?;
//! println!("read {} records", found.len());
//!
//! channel.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! Payloads are opaque to the core: implement [`Payload`] for your own
//! type, or use the built-in `Vec<u8>` impl for raw bytes.

mod buffer;
pub mod channel;
pub mod codec;
pub mod error;
pub mod key;
pub mod payload;
pub mod record;
mod streams;
pub mod timestamp;
mod transport;

pub use channel::{Channel, DEFAULT_MEMORY_LIMIT, DEFAULT_TIMEOUT};
pub use error::{Error, Result, ServerCode};
pub use key::{Key, KeyRange};
pub use payload::{DecodeError, Payload};
pub use record::{Record, RecordsSet};
