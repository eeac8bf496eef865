//! Transaction wire record.
//!
//! Layout (little-endian offsets):
//!   0..4    total_length (length of everything after this field)
//!   4..5    version (= 1)
//!   5..21   transaction_id
//!   21..53  contract_hash
//!   53..61  valid_till (ms since epoch, 0 = no expiry, 53-bit safe)
//!   61..N   payload (UTF-8, at most 100 000 bytes)
//!   N..N+64 signature (r || s)
//!   N+64..  public_key (33-byte compressed secp256k1)

use super::{split_records, WireError};
use crate::crypto::{self, keys::PrivateKey, keys::PublicKey};
use rand::RngCore;

/// Fixed bytes counted by `total_length` besides the payload.
const NON_PAYLOAD_LENGTH: usize = 1 + 16 + 32 + 8 + 64 + 33;
/// Signature plus public key.
const TAIL_LENGTH: usize = 64 + 33;
const PAYLOAD_OFFSET: usize = 61;

pub const MAX_PAYLOAD_LENGTH: usize = 100_000;

/// The caller-supplied fields of a transaction about to be signed.
#[derive(Clone, Debug)]
pub struct TxData<'a> {
    pub version: u8,
    pub transaction_id: [u8; 16],
    pub contract_hash: [u8; 32],
    pub valid_till: u64,
    pub payload: &'a str,
}

#[derive(Clone, Debug)]
pub struct Transaction {
    data: Vec<u8>,
    public_key: PublicKey,
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}
impl Eq for Transaction {}

impl Transaction {
    /// Validate a raw record. The buffer is kept as-is; all invariants of
    /// the layout above are checked here and nowhere else.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, WireError> {
        if data.len() < 4 {
            return Err(WireError::ShortBuffer);
        }
        let total_length =
            crypto::u32_from_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if data.len() != total_length + 4 {
            return Err(WireError::InvalidTxFraming);
        }
        if total_length < NON_PAYLOAD_LENGTH {
            return Err(WireError::ShortBuffer);
        }
        if data[4] != 1 {
            return Err(WireError::UnsupportedVersion(data[4]));
        }
        let mut valid_till = [0u8; 8];
        valid_till.copy_from_slice(&data[53..61]);
        crypto::ulong_from_bytes(valid_till).map_err(|_| WireError::InvalidValidTill)?;
        let payload_length = total_length - NON_PAYLOAD_LENGTH;
        if payload_length > MAX_PAYLOAD_LENGTH {
            return Err(WireError::PayloadTooLarge(payload_length));
        }
        let public_key = PublicKey::from_bytes(&data[data.len() - 33..])?;
        Ok(Self { data, public_key })
    }

    /// Encode and sign a record in one step.
    pub fn sign(
        fields: &TxData,
        sign_prefix: &[u8],
        key: &PrivateKey,
    ) -> Result<Self, WireError> {
        if fields.version != 1 {
            return Err(WireError::UnsupportedVersion(fields.version));
        }
        let payload = fields.payload.as_bytes();
        if payload.len() > MAX_PAYLOAD_LENGTH {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }
        let valid_till = crypto::ulong_to_bytes(fields.valid_till)
            .map_err(|_| WireError::InvalidValidTill)?;

        let total_length = NON_PAYLOAD_LENGTH + payload.len();
        let mut data = Vec::with_capacity(4 + total_length);
        data.extend_from_slice(&crypto::u32_to_bytes(total_length as u32));
        data.push(fields.version);
        data.extend_from_slice(&fields.transaction_id);
        data.extend_from_slice(&fields.contract_hash);
        data.extend_from_slice(&valid_till);
        data.extend_from_slice(payload);

        let mut preimage = Vec::with_capacity(sign_prefix.len() + data.len() - 4);
        preimage.extend_from_slice(sign_prefix);
        preimage.extend_from_slice(&data[4..]);
        data.extend_from_slice(&key.sign(&preimage));
        data.extend_from_slice(key.public_key().as_bytes());

        Ok(Self { data, public_key: key.public_key() })
    }

    /// Random 16-byte transaction id. Host-side helper; never available to
    /// guest code.
    pub fn generate_id() -> [u8; 16] {
        let mut id = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut id);
        id
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

    pub fn id(&self) -> [u8; 16] {
        let mut id = [0u8; 16];
        id.copy_from_slice(&self.data[5..21]);
        id
    }

    pub fn id_hex(&self) -> String {
        hex::encode(&self.data[5..21])
    }

    pub fn contract_hash(&self) -> [u8; 32] {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&self.data[21..53]);
        hash
    }

    pub fn valid_till(&self) -> u64 {
        // Range-checked at construction.
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[53..61]);
        u64::from_le_bytes(bytes)
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[PAYLOAD_OFFSET..self.data.len() - TAIL_LENGTH]
    }

    /// Decoded payload, if it is valid UTF-8 JSON.
    pub fn payload_json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(self.payload()).ok()
    }

    pub fn signature(&self) -> &[u8] {
        let n = self.data.len();
        &self.data[n - TAIL_LENGTH..n - 33]
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    fn signed_part(&self) -> &[u8] {
        &self.data[4..self.data.len() - TAIL_LENGTH]
    }

    /// HASH256 over the network prefix and everything covered by the
    /// signature.
    pub fn hash(&self, sign_prefix: &[u8]) -> [u8; 32] {
        let mut preimage = Vec::with_capacity(sign_prefix.len() + self.signed_part().len());
        preimage.extend_from_slice(sign_prefix);
        preimage.extend_from_slice(self.signed_part());
        crypto::hash256(&preimage)
    }

    pub fn verify_signature(&self, sign_prefix: &[u8]) -> bool {
        let mut preimage = Vec::with_capacity(sign_prefix.len() + self.signed_part().len());
        preimage.extend_from_slice(sign_prefix);
        preimage.extend_from_slice(self.signed_part());
        self.public_key.verify(&preimage, self.signature())
    }

    /// Concatenate full records into one stream.
    pub fn merge(transactions: &[Transaction]) -> Vec<u8> {
        let total = transactions.iter().map(|t| t.data.len()).sum();
        let mut out = Vec::with_capacity(total);
        for tx in transactions {
            out.extend_from_slice(&tx.data);
        }
        out
    }

    /// Inverse of `merge`. The stream must consist of whole records and
    /// nothing else.
    pub fn split(data: &[u8]) -> Result<Vec<Transaction>, WireError> {
        split_records(data)?
            .into_iter()
            .map(|record| Transaction::from_bytes(record.to_vec()))
            .collect()
    }
}
