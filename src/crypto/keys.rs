//! secp256k1 keys, WIF encoding and base58check addresses.
//!
//! Signatures are ECDSA with RFC 6979 deterministic nonces over the double
//! SHA-256 of the message: the caller-visible `sign(msg)` hashes once and
//! the ECDSA layer hashes again, so the signed digest is SHA256(SHA256(m)).
//! Signatures travel as fixed 64 bytes: 32-byte big-endian `r` then `s`.

use super::{base58check_decode, base58check_encode, hash160, CryptoError};
use k256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use rand::rngs::OsRng;
use std::fmt;
use zeroize::Zeroize;

const ADDRESS_VERSION: u8 = 0x00;
const WIF_VERSION: u8 = 0x80;
const WIF_COMPRESSED_FLAG: u8 = 0x01;

/// Longest textual form of a 25-byte base58check address.
pub const MAX_ADDRESS_LENGTH: usize = 35;

// ── Address ──────────────────────────────────────────────────────────────

/// A 20-byte HASH160 of a compressed public key. The textual form is
/// base58check of `0x00 || hash` (25 bytes before encoding).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Address([u8; 20]);

impl Address {
    /// Parse the base58check text form, verifying length, version byte and
    /// checksum.
    pub fn from_text(text: &str) -> Result<Self, CryptoError> {
        if text.is_empty() || text.len() > MAX_ADDRESS_LENGTH {
            return Err(CryptoError::InvalidAddress("bad length".into()));
        }
        let payload = base58check_decode(text)
            .map_err(|e| CryptoError::InvalidAddress(e.to_string()))?;
        if payload.len() != 21 || payload[0] != ADDRESS_VERSION {
            return Err(CryptoError::InvalidAddress("bad payload".into()));
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&payload[1..]);
        Ok(Self(hash))
    }

    /// Accept either the raw 20-byte hash or the full 25-byte
    /// version+hash+checksum form (checksum verified).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        match bytes.len() {
            20 => {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(bytes);
                Ok(Self(hash))
            }
            25 => {
                let text = super::base58_encode(bytes);
                Self::from_text(&text)
            }
            n => Err(CryptoError::InvalidAddress(format!("bad length {n}"))),
        }
    }

    pub fn from_public_key(key: &PublicKey) -> Self {
        Self(hash160(key.as_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_text(&self) -> String {
        let mut payload = [0u8; 21];
        payload[0] = ADDRESS_VERSION;
        payload[1..].copy_from_slice(&self.0);
        base58check_encode(&payload)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_text())
    }
}

pub fn is_valid_address(text: &str) -> bool {
    Address::from_text(text).is_ok()
}

// ── Public key ───────────────────────────────────────────────────────────

/// Compressed secp256k1 public key (33 bytes, leading 0x02 or 0x03).
/// Curve membership is validated at construction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PublicKey([u8; 33]);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 33 {
            return Err(CryptoError::InvalidKey(format!("bad length {}", bytes.len())));
        }
        if bytes[0] != 0x02 && bytes[0] != 0x03 {
            return Err(CryptoError::InvalidKey("not a compressed point".into()));
        }
        VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|_| CryptoError::InvalidKey("not on curve".into()))?;
        let mut out = [0u8; 33];
        out.copy_from_slice(bytes);
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 33] {
        &self.0
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(self)
    }

    /// Verify a fixed 64-byte `r||s` signature over SHA256(SHA256(msg)).
    /// Malformed signatures verify as false, never as an error.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(&self.0) else {
            return false;
        };
        let Ok(mut sig) = Signature::from_slice(signature) else {
            return false;
        };
        // Accept high-S encodings from foreign signers.
        if let Some(normalized) = sig.normalize_s() {
            sig = normalized;
        }
        verifying_key.verify(&super::sha256(msg), &sig).is_ok()
    }
}

// ── Private key ──────────────────────────────────────────────────────────

/// secp256k1 private key. Only the compressed-key WIF form
/// (`0x80 || key || 0x01`) is accepted or produced. Never persisted by the
/// engine; the hosting program owns key storage.
pub struct PrivateKey {
    signing_key: SigningKey,
}

impl PrivateKey {
    pub fn generate() -> Self {
        Self { signing_key: SigningKey::random(&mut OsRng) }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_bytes((&bytes).into())
            .map_err(|_| CryptoError::InvalidKey("not a valid scalar".into()))?;
        Ok(Self { signing_key })
    }

    /// Decode a WIF string; the network byte and compression flag must
    /// match exactly.
    pub fn from_wif(wif: &str) -> Result<Self, CryptoError> {
        let payload =
            base58check_decode(wif).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        if payload.len() != 34
            || payload[0] != WIF_VERSION
            || payload[33] != WIF_COMPRESSED_FLAG
        {
            return Err(CryptoError::InvalidKey("bad wif layout".into()));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&payload[1..33]);
        let key = Self::from_bytes(bytes);
        bytes.zeroize();
        key
    }

    pub fn to_wif(&self) -> String {
        let mut payload = [0u8; 34];
        payload[0] = WIF_VERSION;
        payload[1..33].copy_from_slice(&self.signing_key.to_bytes());
        payload[33] = WIF_COMPRESSED_FLAG;
        let wif = base58check_encode(&payload);
        payload.zeroize();
        wif
    }

    pub fn public_key(&self) -> PublicKey {
        let sec1 = self.signing_key.verifying_key().to_sec1_bytes();
        let mut bytes = [0u8; 33];
        bytes.copy_from_slice(&sec1);
        PublicKey(bytes)
    }

    pub fn address(&self) -> Address {
        self.public_key().address()
    }

    /// Deterministic ECDSA over SHA256(SHA256(msg)), packed as 64 bytes.
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        let sig: Signature = self.signing_key.sign(&super::sha256(msg));
        sig.to_bytes().into()
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        let mut bytes: [u8; 32] = self.signing_key.to_bytes().into();
        bytes.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The reference compressed-WIF pair from the address-format docs.
    const KNOWN_PRIV_HEX: &str =
        "0c28fca386c7a227600b2fe50b7cae11ec86d3bf1fbe471be89827e19d72aa1d";
    const KNOWN_WIF: &str = "KwdMAjGmerYanjeui5SHS7JkmpZvVipYvB2LJGU1ZxJwYvP98617";

    fn test_key() -> PrivateKey {
        PrivateKey::from_wif("KxLJSyM1111111111111111111111111111111111111119cskYz").unwrap()
    }

    #[test]
    fn test_wif_roundtrip() {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hex::decode(KNOWN_PRIV_HEX).unwrap());
        let key = PrivateKey::from_bytes(bytes).unwrap();
        assert_eq!(key.to_wif(), KNOWN_WIF);

        let restored = PrivateKey::from_wif(KNOWN_WIF).unwrap();
        assert_eq!(restored.public_key(), key.public_key());
    }

    #[test]
    fn test_wif_rejects_wrong_layout() {
        // Uncompressed-form WIF (no 0x01 flag) must not be accepted.
        assert!(
            PrivateKey::from_wif("5HueCGU8rMjxEXxiPuD5BDku4MkFqeZyd4dZ1jvhTVqvbTLvyTJ").is_err()
        );
        assert!(PrivateKey::from_wif("notbase58!").is_err());
    }

    #[test]
    fn test_address_derivation() {
        let key = test_key();
        assert_eq!(
            hex::encode(key.public_key().as_bytes()),
            "038c97eff5b4b4c719d3259cc7f9a9045af8ce0ed359a7343874fcd26527c4f817"
        );
        assert_eq!(key.address().to_text(), "1FKhYFQ5jaG2DabjDYLCoY1eviWWNkBN8M");
    }

    #[test]
    fn test_address_text_buffer_roundtrip() {
        let addr = test_key().address();
        let text = addr.to_text();
        assert_eq!(Address::from_text(&text).unwrap(), addr);
        assert_eq!(Address::from_bytes(addr.as_bytes()).unwrap(), addr);

        let full = crate::crypto::base58_decode(&text).unwrap();
        assert_eq!(full.len(), 25);
        assert_eq!(Address::from_bytes(&full).unwrap(), addr);
    }

    #[test]
    fn test_address_single_character_flip_detected() {
        let text = test_key().address().to_text();
        for i in 0..text.len() {
            let mut chars: Vec<char> = text.chars().collect();
            chars[i] = if chars[i] == '1' { '2' } else { '1' };
            let mutated: String = chars.into_iter().collect();
            if mutated != text {
                assert!(!is_valid_address(&mutated), "flip at {i} went undetected");
            }
        }
    }

    #[test]
    fn test_public_key_validation() {
        let valid = *test_key().public_key().as_bytes();
        assert!(PublicKey::from_bytes(&valid).is_ok());

        let mut bad_prefix = valid;
        bad_prefix[0] = 0x04;
        assert!(PublicKey::from_bytes(&bad_prefix).is_err());

        // x = p is not a field element, so this cannot be a curve point.
        let mut off_curve = [0xffu8; 33];
        off_curve[0] = 0x02;
        assert!(PublicKey::from_bytes(&off_curve).is_err());

        assert!(PublicKey::from_bytes(&valid[..32]).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let key = test_key();
        let msg = b"some message to bind";
        let sig = key.sign(msg);
        assert!(key.public_key().verify(msg, &sig));
        assert!(!key.public_key().verify(b"some other message", &sig));

        let other = PrivateKey::generate();
        assert!(!other.public_key().verify(msg, &sig));
    }

    #[test]
    fn test_signature_bit_flip_fails() {
        let key = test_key();
        let msg = b"flip test";
        let sig = key.sign(msg);
        for i in 0..64 {
            let mut mutated = sig;
            mutated[i] ^= 0x01;
            assert!(
                !key.public_key().verify(msg, &mutated),
                "flipped signature byte {i} still verified"
            );
        }
    }

    #[test]
    fn test_signing_is_deterministic() {
        let key = test_key();
        assert_eq!(key.sign(b"rfc6979"), key.sign(b"rfc6979"));
    }
}
