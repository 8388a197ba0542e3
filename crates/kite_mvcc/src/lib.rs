//! MVCC layer: key/value codec, time-ordered reader, and the batched
//! timestamp provider.

pub mod codec;
pub mod reader;
pub mod ts_provider;

pub use codec::{ValueFlag, NS_DOCUMENT, NS_RAW, NS_TXN, NS_VECTOR};
pub use reader::MvccReader;
pub use ts_provider::{LocalTsoClient, TsProvider, TsoClient, TsoTimestamp};
