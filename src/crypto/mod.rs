//! Hash and encoding primitives shared by the wire codec, key handling and
//! the guest builtins.
//!
//! Everything here is a pure function over bytes. Hashes come from the
//! RustCrypto digest family; base58 uses the Bitcoin alphabet with the
//! 4-byte double-SHA256 checksum for the `check` variants.

use md5::Md5;
use ripemd::Ripemd160;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

pub mod keys;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid base58: {0}")]
    InvalidBase58(String),
    #[error("integer out of safe range")]
    UnsafeInteger,
}

/// Largest integer that survives an f64 round-trip (2^53 - 1). Wire fields
/// holding 64-bit counters are bounded by this so payload JSON and guest
/// arithmetic stay exact.
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

// ── Digests ──────────────────────────────────────────────────────────────

pub fn sha1(data: &[u8]) -> [u8; 20] {
    Sha1::digest(data).into()
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha512(data: &[u8]) -> [u8; 64] {
    Sha512::digest(data).into()
}

pub fn md5(data: &[u8]) -> [u8; 16] {
    Md5::digest(data).into()
}

pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(data).into()
}

/// RIPEMD160(SHA256(data)) — the address digest.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    ripemd160(&sha256(data))
}

/// SHA256(SHA256(data)) — the record/checksum digest.
pub fn hash256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

// ── Base58 ───────────────────────────────────────────────────────────────

pub fn base58_encode(data: &[u8]) -> String {
    bs58::encode(data).into_string()
}

pub fn base58_decode(text: &str) -> Result<Vec<u8>, CryptoError> {
    bs58::decode(text)
        .into_vec()
        .map_err(|e| CryptoError::InvalidBase58(e.to_string()))
}

/// Base58 with the first 4 bytes of HASH256 appended as checksum.
pub fn base58check_encode(payload: &[u8]) -> String {
    let checksum = hash256(payload);
    let mut full = Vec::with_capacity(payload.len() + 4);
    full.extend_from_slice(payload);
    full.extend_from_slice(&checksum[..4]);
    base58_encode(&full)
}

/// Decode and verify the checksum, returning the payload without it.
pub fn base58check_decode(text: &str) -> Result<Vec<u8>, CryptoError> {
    let full = base58_decode(text)?;
    if full.len() < 4 {
        return Err(CryptoError::InvalidBase58("too short for checksum".into()));
    }
    let (payload, checksum) = full.split_at(full.len() - 4);
    if hash256(payload)[..4] != *checksum {
        return Err(CryptoError::InvalidBase58("bad checksum".into()));
    }
    Ok(payload.to_vec())
}

// ── Bounded little-endian integer codecs ─────────────────────────────────

pub fn u32_to_bytes(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

pub fn u32_from_bytes(bytes: [u8; 4]) -> u32 {
    u32::from_le_bytes(bytes)
}

/// Encode a safe 53-bit integer across 8 little-endian bytes (high 11 bits
/// zero). Fails on values that would not round-trip through an f64.
pub fn ulong_to_bytes(value: u64) -> Result<[u8; 8], CryptoError> {
    if value > MAX_SAFE_INTEGER {
        return Err(CryptoError::UnsafeInteger);
    }
    Ok(value.to_le_bytes())
}

/// Decode 8 little-endian bytes, rejecting values above 2^53 - 1.
pub fn ulong_from_bytes(bytes: [u8; 8]) -> Result<u64, CryptoError> {
    let value = u64::from_le_bytes(bytes);
    if value > MAX_SAFE_INTEGER {
        return Err(CryptoError::UnsafeInteger);
    }
    Ok(value)
}
