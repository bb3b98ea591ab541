//! Per-frame encryption header and its binary wire format.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! u8 version | u16 keyIdLen | keyId | u8 ivLen | iv | u8 algLen | algorithm | u8 aadLen | aad
//! ```
//!
//! `iv` and `aad` may be zero-length; their length byte is always present.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::error::CryptoError;

pub const HEADER_VERSION: u8 = 1;

/// Size of the header digest carried in `aad` when header authentication is on
pub const HEADER_DIGEST_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CipherAlgorithm {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "aes-256-cbc")]
    Aes256Cbc,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherAlgorithm::None => "none",
            CipherAlgorithm::Aes256Gcm => "aes-256-gcm",
            CipherAlgorithm::Aes256Cbc => "aes-256-cbc",
            CipherAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            _ => 32,
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            CipherAlgorithm::None => 0,
            CipherAlgorithm::Aes256Cbc => 16,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::ChaCha20Poly1305 => 12,
        }
    }

    /// AEAD ciphers append a 16-byte tag to the ciphertext
    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherAlgorithm::Aes256Gcm | CipherAlgorithm::ChaCha20Poly1305
        )
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(CipherAlgorithm::None),
            "aes-256-gcm" => Ok(CipherAlgorithm::Aes256Gcm),
            "aes-256-cbc" => Ok(CipherAlgorithm::Aes256Cbc),
            "chacha20-poly1305" => Ok(CipherAlgorithm::ChaCha20Poly1305),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionHeader {
    pub version: u8,
    pub key_id: String,
    pub iv: Option<Vec<u8>>,
    pub algorithm: CipherAlgorithm,
    pub aad: Option<Vec<u8>>,
}

impl EncryptionHeader {
    pub fn new(key_id: impl Into<String>, algorithm: CipherAlgorithm, iv: Option<Vec<u8>>) -> Self {
        Self {
            version: HEADER_VERSION,
            key_id: key_id.into(),
            iv,
            algorithm,
            aad: None,
        }
    }

    pub fn iv(&self) -> &[u8] {
        self.iv.as_deref().unwrap_or_default()
    }

    pub fn aad(&self) -> &[u8] {
        self.aad.as_deref().unwrap_or_default()
    }

    pub fn encoded_len(&self) -> usize {
        1 + 2 + self.key_id.len() + 1 + self.iv().len() + 1 + self.algorithm.as_str().len() + 1 + self.aad().len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, CryptoError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_fields(&mut buf, self.aad())?;
        Ok(buf)
    }

    /// SHA-256 over every field except `aad` itself.
    pub fn digest(&self) -> Result<[u8; HEADER_DIGEST_LEN], CryptoError> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_fields(&mut buf, &[])?;
        Ok(Sha256::digest(&buf).into())
    }

    fn encode_fields(&self, buf: &mut Vec<u8>, aad: &[u8]) -> Result<(), CryptoError> {
        let key_id_len = u16::try_from(self.key_id.len())
            .map_err(|_| CryptoError::MalformedHeader("key id longer than 65535 bytes".into()))?;

        buf.push(self.version);
        buf.extend_from_slice(&key_id_len.to_be_bytes());
        buf.extend_from_slice(self.key_id.as_bytes());
        put_short_field(buf, self.iv(), "iv")?;
        put_short_field(buf, self.algorithm.as_str().as_bytes(), "algorithm")?;
        put_short_field(buf, aad, "aad")?;
        Ok(())
    }

    /// Decode a header from the front of `buf`, returning it with the number
    /// of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), CryptoError> {
        let mut cursor = Cursor { buf, pos: 0 };

        let version = cursor.take(1, "version")?[0];
        let len_bytes = cursor.take(2, "key id length")?;
        let key_id_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]);
        let key_id = std::str::from_utf8(cursor.take(key_id_len as usize, "key id")?)
            .map_err(|_| CryptoError::MalformedHeader("key id is not valid UTF-8".into()))?
            .to_string();
        let iv = cursor.short_field("iv")?;
        let algorithm = cursor.short_field("algorithm")?;
        let algorithm = std::str::from_utf8(algorithm)
            .map_err(|_| CryptoError::MalformedHeader("algorithm is not valid UTF-8".into()))?
            .parse::<CipherAlgorithm>()?;
        let aad = cursor.short_field("aad")?;

        let header = Self {
            version,
            key_id,
            iv: (!iv.is_empty()).then(|| iv.to_vec()),
            algorithm,
            aad: (!aad.is_empty()).then(|| aad.to_vec()),
        };
        Ok((header, cursor.pos))
    }
}

fn put_short_field(buf: &mut Vec<u8>, value: &[u8], name: &str) -> Result<(), CryptoError> {
    let len = u8::try_from(value.len())
        .map_err(|_| CryptoError::MalformedHeader(format!("{} longer than 255 bytes", name)))?;
    buf.push(len);
    buf.extend_from_slice(value);
    Ok(())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize, field: &str) -> Result<&'a [u8], CryptoError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| CryptoError::MalformedHeader(format!("truncated at {}", field)))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn short_field(&mut self, field: &str) -> Result<&'a [u8], CryptoError> {
        let len = self.take(1, field)?[0] as usize;
        self.take(len, field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> EncryptionHeader {
        let mut header = EncryptionHeader::new("key-1", CipherAlgorithm::Aes256Gcm, Some(vec![7u8; 12]));
        header.aad = Some(vec![1, 2, 3]);
        header
    }

    #[test]
    fn test_header_wire_layout() {
        let header = sample_header();
        let bytes = header.encode().unwrap();

        assert_eq!(bytes[0], HEADER_VERSION);
        assert_eq!(&bytes[1..3], &[0, 5]);
        assert_eq!(&bytes[3..8], b"key-1");
        assert_eq!(bytes[8], 12);
        assert_eq!(bytes[21], "aes-256-gcm".len() as u8);
        assert_eq!(&bytes[22..33], b"aes-256-gcm");
        assert_eq!(bytes[33], 3);
        assert_eq!(&bytes[34..], &[1, 2, 3]);
        assert_eq!(bytes.len(), header.encoded_len());
    }

    #[test]
    fn test_header_decode_exact() {
        let header = sample_header();
        let mut bytes = header.encode().unwrap();
        let encoded_len = bytes.len();
        bytes.extend_from_slice(b"trailing ciphertext");

        let (decoded, consumed) = EncryptionHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(consumed, encoded_len);
    }

    #[test]
    fn test_header_optional_fields_are_zero_length() {
        let header = EncryptionHeader::new("k", CipherAlgorithm::None, None);
        let bytes = header.encode().unwrap();
        // version, keyIdLen(2), "k", ivLen, algLen, "none", aadLen
        assert_eq!(bytes, vec![1, 0, 1, b'k', 0, 4, b'n', b'o', b'n', b'e', 0]);

        let (decoded, _) = EncryptionHeader::decode(&bytes).unwrap();
        assert_eq!(decoded.iv, None);
        assert_eq!(decoded.aad, None);
    }

    #[test]
    fn test_header_decode_rejects_truncation() {
        let bytes = sample_header().encode().unwrap();
        for cut in [0, 2, 5, 9, bytes.len() - 1] {
            let err = EncryptionHeader::decode(&bytes[..cut]).unwrap_err();
            assert!(matches!(err, CryptoError::MalformedHeader(_)), "cut at {}", cut);
        }
    }

    #[test]
    fn test_header_decode_rejects_unknown_algorithm() {
        let mut bytes = vec![1, 0, 1, b'k', 0, 3];
        bytes.extend_from_slice(b"rc4");
        bytes.push(0);
        let err = EncryptionHeader::decode(&bytes).unwrap_err();
        assert_eq!(err, CryptoError::UnsupportedAlgorithm("rc4".into()));
    }

    #[test]
    fn test_digest_ignores_aad_but_covers_other_fields() {
        let header = sample_header();
        let mut without_aad = header.clone();
        without_aad.aad = None;
        assert_eq!(header.digest().unwrap(), without_aad.digest().unwrap());

        let mut other_key = header.clone();
        other_key.key_id = "key-2".into();
        assert_ne!(header.digest().unwrap(), other_key.digest().unwrap());
    }

    #[test]
    fn test_algorithm_parameters() {
        assert_eq!(CipherAlgorithm::Aes256Cbc.iv_len(), 16);
        assert_eq!(CipherAlgorithm::Aes256Gcm.iv_len(), 12);
        assert_eq!(CipherAlgorithm::ChaCha20Poly1305.key_len(), 32);
        assert!(!CipherAlgorithm::Aes256Cbc.is_aead());
        assert_eq!("chacha20-poly1305".parse::<CipherAlgorithm>().unwrap(), CipherAlgorithm::ChaCha20Poly1305);
    }
}
