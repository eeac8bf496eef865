//! Block wire record.
//!
//! Layout (little-endian offsets):
//!   0..4    total_length
//!   4..5    version (= 1)
//!   5..13   block_id (53-bit safe, genesis = 0)
//!   13..45  previous_block_hash
//!   45..53  processed_ts (ms since epoch, 53-bit safe)
//!   53..M   transactions (concatenated full transaction records)
//!   M..M+64 signature
//!
//! Blocks carry no public key; the producer's key is known to every
//! verifier out of band.

use super::{split_records, Transaction, WireError};
use crate::crypto::{self, keys::PrivateKey, keys::PublicKey};

/// Fixed bytes counted by `total_length` besides the transactions.
const NON_TX_LENGTH: usize = 1 + 8 + 32 + 8 + 64;
const TX_OFFSET: usize = 53;

/// The caller-supplied fields of a block about to be signed.
/// `transactions` is a merged stream as produced by [`Transaction::merge`].
#[derive(Clone, Debug)]
pub struct BlockData<'a> {
    pub version: u8,
    pub block_id: u64,
    pub previous_block_hash: [u8; 32],
    pub processed_ts: u64,
    pub transactions: &'a [u8],
}

#[derive(Clone, Debug)]
pub struct Block {
    data: Vec<u8>,
    transactions_amount: u32,
}

impl PartialEq for Block {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}
impl Eq for Block {}

impl Block {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, WireError> {
        if data.len() < 4 {
            return Err(WireError::ShortBuffer);
        }
        let total_length =
            crypto::u32_from_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() != total_length + 4 {
            return Err(WireError::InvalidBlockFraming);
        }
        if total_length < NON_TX_LENGTH {
            return Err(WireError::ShortBuffer);
        }
        if data[4] != 1 {
            return Err(WireError::UnsupportedVersion(data[4]));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&data[5..13]);
        crypto::ulong_from_bytes(id).map_err(|_| WireError::InvalidBlockFraming)?;
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[45..53]);
        crypto::ulong_from_bytes(ts).map_err(|_| WireError::InvalidBlockFraming)?;

        // The transaction walk must end exactly where the signature starts.
        let tx_region = &data[TX_OFFSET..data.len() - 64];
        let transactions_amount = split_records(tx_region)
            .map_err(|_| WireError::InvalidBlockFraming)?
            .len() as u32;

        Ok(Self { data, transactions_amount })
    }

    /// Encode and sign a block in one step.
    pub fn sign(
        fields: &BlockData,
        sign_prefix: &[u8],
        key: &PrivateKey,
    ) -> Result<Self, WireError> {
        if fields.version != 1 {
            return Err(WireError::UnsupportedVersion(fields.version));
        }
        let block_id = crypto::ulong_to_bytes(fields.block_id)
            .map_err(|_| WireError::InvalidBlockFraming)?;
        let processed_ts = crypto::ulong_to_bytes(fields.processed_ts)
            .map_err(|_| WireError::InvalidBlockFraming)?;
        let transactions_amount = split_records(fields.transactions)
            .map_err(|_| WireError::InvalidBlockFraming)?
            .len() as u32;

        let total_length = NON_TX_LENGTH + fields.transactions.len();
        let mut data = Vec::with_capacity(4 + total_length);
        data.extend_from_slice(&crypto::u32_to_bytes(total_length as u32));
        data.push(fields.version);
        data.extend_from_slice(&block_id);
        data.extend_from_slice(&fields.previous_block_hash);
        data.extend_from_slice(&processed_ts);
        data.extend_from_slice(fields.transactions);

        let mut preimage = Vec::with_capacity(sign_prefix.len() + data.len() - 4);
        preimage.extend_from_slice(sign_prefix);
        preimage.extend_from_slice(&data[4..]);
        data.extend_from_slice(&key.sign(&preimage));

        Ok(Self { data, transactions_amount })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn total_length(&self) -> u32 {
        crypto::u32_from_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    pub fn version(&self) -> u8 {
        self.data[4]
    }

    pub fn id(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[5..13]);
        u64::from_le_bytes(bytes)
    }

    pub fn previous_block_hash(&self) -> [u8; 32] {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&self.data[13..45]);
        hash
    }

    pub fn processed_ts(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[45..53]);
        u64::from_le_bytes(bytes)
    }

    pub fn transactions_amount(&self) -> u32 {
        self.transactions_amount
    }

    /// Raw merged transaction stream.
    pub fn transactions_raw(&self) -> &[u8] {
        &self.data[TX_OFFSET..self.data.len() - 64]
    }

    /// Fully parse the embedded transactions.
    pub fn transactions(&self) -> Result<Vec<Transaction>, WireError> {
        Transaction::split(self.transactions_raw())
    }

    pub fn signature(&self) -> &[u8] {
        &self.data[self.data.len() - 64..]
    }

    fn signed_part(&self) -> &[u8] {
        &self.data[4..self.data.len() - 64]
    }

    /// HASH256 over the network prefix and everything covered by the
    /// signature.
    pub fn hash(&self, sign_prefix: &[u8]) -> [u8; 32] {
        let mut preimage = Vec::with_capacity(sign_prefix.len() + self.signed_part().len());
        preimage.extend_from_slice(sign_prefix);
        preimage.extend_from_slice(self.signed_part());
        crypto::hash256(&preimage)
    }

    pub fn verify_signature(&self, sign_prefix: &[u8], producer: &PublicKey) -> bool {
        let mut preimage = Vec::with_capacity(sign_prefix.len() + self.signed_part().len());
        preimage.extend_from_slice(sign_prefix);
        preimage.extend_from_slice(self.signed_part());
        producer.verify(&preimage, self.signature())
    }

    /// Check that this block extends `previous`.
    ///
    /// With no previous block this must be the genesis block (id 0, all-zero
    /// previous hash). Otherwise the ids must be consecutive (an id gap is
    /// a caller error, reported as [`WireError::NotPrevious`]) and the
    /// result reports whether hash and timestamp line up.
    pub fn verify_with_previous_block(
        &self,
        sign_prefix: &[u8],
        previous: Option<&Block>,
    ) -> Result<bool, WireError> {
        match previous {
            None => Ok(self.id() == 0 && self.previous_block_hash() == [0u8; 32]),
            Some(prev) => {
                if prev.id() + 1 != self.id() {
                    return Err(WireError::NotPrevious { prev: prev.id(), this: self.id() });
                }
                Ok(self.previous_block_hash() == prev.hash(sign_prefix)
                    && self.processed_ts() > prev.processed_ts())
            }
        }
    }

    /// Concatenate full records into one stream.
    pub fn merge(blocks: &[Block]) -> Vec<u8> {
        let total = blocks.iter().map(|b| b.data.len()).sum();
        let mut out = Vec::with_capacity(total);
        for block in blocks {
            out.extend_from_slice(&block.data);
        }
        out
    }

    /// Inverse of `merge`.
    pub fn split(data: &[u8]) -> Result<Vec<Block>, WireError> {
        split_records(data)?
            .into_iter()
            .map(|record| Block::from_bytes(record.to_vec()))
            .collect()
    }
}
