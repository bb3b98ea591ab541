//! Sealed-frame framing for segment files: `header | u32 ciphertextLen | ciphertext`.

use crate::error::CryptoError;
use crate::header::EncryptionHeader;

pub fn seal(header: &EncryptionHeader, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let len = u32::try_from(ciphertext.len())
        .map_err(|_| CryptoError::MalformedFrame("ciphertext longer than 4 GiB".into()))?;
    let mut out = header.encode()?;
    out.reserve(4 + ciphertext.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(ciphertext);
    Ok(out)
}

/// Split one sealed frame off the front of `buf`. Returns the header, the
/// ciphertext, and the total number of bytes consumed.
pub fn open(buf: &[u8]) -> Result<(EncryptionHeader, &[u8], usize), CryptoError> {
    let (header, header_len) = EncryptionHeader::decode(buf)?;
    let rest = &buf[header_len..];
    if rest.len() < 4 {
        return Err(CryptoError::MalformedFrame("truncated ciphertext length".into()));
    }
    let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    let body = rest
        .get(4..4 + len)
        .ok_or_else(|| CryptoError::MalformedFrame(format!("truncated ciphertext, expected {} bytes", len)))?;
    Ok((header, body, header_len + 4 + len))
}

/// Iterate over every sealed frame in a buffer, e.g. a whole segment file.
pub fn frames(buf: &[u8]) -> FrameIter<'_> {
    FrameIter { buf, failed: false }
}

pub struct FrameIter<'a> {
    buf: &'a [u8],
    failed: bool,
}

impl<'a> Iterator for FrameIter<'a> {
    type Item = Result<(EncryptionHeader, &'a [u8]), CryptoError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() || self.failed {
            return None;
        }
        match open(self.buf) {
            Ok((header, body, consumed)) => {
                self.buf = &self.buf[consumed..];
                Some(Ok((header, body)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CipherAlgorithm;

    #[test]
    fn test_seal_then_iterate() {
        let header = EncryptionHeader::new("key-a", CipherAlgorithm::Aes256Gcm, Some(vec![9; 12]));
        let mut buf = seal(&header, b"first").unwrap();
        buf.extend(seal(&header, b"").unwrap());
        buf.extend(seal(&header, b"third frame").unwrap());

        let bodies: Vec<Vec<u8>> = frames(&buf).map(|f| f.unwrap().1.to_vec()).collect();
        assert_eq!(bodies, vec![b"first".to_vec(), Vec::new(), b"third frame".to_vec()]);
    }

    #[test]
    fn test_truncated_frame_stops_iteration() {
        let header = EncryptionHeader::new("key-a", CipherAlgorithm::None, None);
        let mut buf = seal(&header, b"payload").unwrap();
        buf.truncate(buf.len() - 2);

        let results: Vec<_> = frames(&buf).collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(CryptoError::MalformedFrame(_))));
    }
}
