//! Wire types: byte-exact transaction and block records.
//!
//! Both records are immutable once constructed; every accessor reads
//! straight from the validated byte buffer, so `bytes()` is always the
//! canonical encoding.

use thiserror::Error;

pub mod block;
pub mod transaction;

pub use block::{Block, BlockData};
pub use transaction::{Transaction, TxData};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("buffer too short")]
    ShortBuffer,
    #[error("invalid valid-till")]
    InvalidValidTill,
    #[error("payload too large ({0} bytes)")]
    PayloadTooLarge(usize),
    #[error("invalid public key: {0}")]
    InvalidPublicKey(#[from] crate::crypto::CryptoError),
    #[error("invalid transaction framing")]
    InvalidTxFraming,
    #[error("invalid block framing")]
    InvalidBlockFraming,
    #[error("invalid stream")]
    InvalidStream,
    #[error("block {this} does not follow block {prev}")]
    NotPrevious { prev: u64, this: u64 },
}

/// Walk a stream of `u32`-length-prefixed records, returning the byte range
/// of each. The walk must consume the buffer exactly.
pub(crate) fn split_records(data: &[u8]) -> Result<Vec<&[u8]>, WireError> {
    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        if data.len() - offset < 4 {
            return Err(WireError::InvalidStream);
        }
        let len = crate::crypto::u32_from_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let end = offset
            .checked_add(4)
            .and_then(|o| o.checked_add(len))
            .ok_or(WireError::InvalidStream)?;
        if end > data.len() {
            return Err(WireError::InvalidStream);
        }
        records.push(&data[offset..end]);
        offset = end;
    }
    Ok(records)
}
