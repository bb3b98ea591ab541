//! Raw cipher dispatch. Callers are responsible for key lookup and header
//! handling; this module only checks lengths and runs the primitive.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::error::CryptoError;
use crate::header::CipherAlgorithm;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AEAD tag size for AES-GCM and ChaCha20-Poly1305
pub const TAG_LEN: usize = 16;

fn check_lengths(algorithm: CipherAlgorithm, key: &[u8], iv: &[u8]) -> Result<(), CryptoError> {
    if key.len() != algorithm.key_len() {
        return Err(CryptoError::InvalidKeyLength {
            algorithm: algorithm.as_str(),
            expected: algorithm.key_len(),
            actual: key.len(),
        });
    }
    if iv.len() != algorithm.iv_len() {
        return Err(CryptoError::InvalidIv {
            algorithm: algorithm.as_str(),
            expected: algorithm.iv_len(),
            actual: iv.len(),
        });
    }
    Ok(())
}

pub(crate) fn encrypt(
    algorithm: CipherAlgorithm,
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    data: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if algorithm == CipherAlgorithm::None {
        return Ok(data.to_vec());
    }
    check_lengths(algorithm, key, iv)?;
    let name = algorithm.as_str();

    match algorithm {
        CipherAlgorithm::None => Ok(data.to_vec()),
        CipherAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::encrypt_failed(name))?;
            cipher
                .encrypt(Nonce::from_slice(iv), Payload { msg: data, aad })
                .map_err(|_| CryptoError::encrypt_failed(name))
        }
        CipherAlgorithm::Aes256Cbc => {
            let cipher = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| CryptoError::encrypt_failed(name))?;
            Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(data))
        }
        CipherAlgorithm::ChaCha20Poly1305 => chacha::encrypt(key, iv, aad, data),
    }
}

pub(crate) fn decrypt(
    algorithm: CipherAlgorithm,
    key: &[u8],
    iv: &[u8],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if algorithm == CipherAlgorithm::None {
        return Ok(ciphertext.to_vec());
    }
    check_lengths(algorithm, key, iv)?;
    let name = algorithm.as_str();

    if algorithm.is_aead() && ciphertext.len() < TAG_LEN {
        return Err(CryptoError::decrypt_failed(name));
    }

    match algorithm {
        CipherAlgorithm::None => Ok(ciphertext.to_vec()),
        CipherAlgorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::decrypt_failed(name))?;
            cipher
                .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad })
                .map_err(|_| CryptoError::decrypt_failed(name))
        }
        CipherAlgorithm::Aes256Cbc => {
            let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::decrypt_failed(name))?;
            cipher
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map_err(|_| CryptoError::decrypt_failed(name))
        }
        CipherAlgorithm::ChaCha20Poly1305 => chacha::decrypt(key, iv, aad, ciphertext),
    }
}

/// Whether this build can run `algorithm` natively
pub fn is_supported(algorithm: CipherAlgorithm) -> bool {
    match algorithm {
        CipherAlgorithm::ChaCha20Poly1305 => cfg!(feature = "chacha20"),
        _ => true,
    }
}

#[cfg(feature = "chacha20")]
mod chacha {
    use chacha20poly1305::aead::{Aead, KeyInit, Payload};
    use chacha20poly1305::{ChaCha20Poly1305, Nonce};

    use crate::error::CryptoError;

    const NAME: &str = "chacha20-poly1305";

    pub(super) fn encrypt(key: &[u8], iv: &[u8], aad: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::encrypt_failed(NAME))?;
        cipher
            .encrypt(Nonce::from_slice(iv), Payload { msg: data, aad })
            .map_err(|_| CryptoError::encrypt_failed(NAME))
    }

    pub(super) fn decrypt(key: &[u8], iv: &[u8], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::decrypt_failed(NAME))?;
        cipher
            .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::decrypt_failed(NAME))
    }
}

#[cfg(not(feature = "chacha20"))]
mod chacha {
    use crate::error::CryptoError;

    pub(super) fn encrypt(_key: &[u8], _iv: &[u8], _aad: &[u8], _data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Err(CryptoError::UnsupportedAlgorithm("chacha20-poly1305".into()))
    }

    pub(super) fn decrypt(_key: &[u8], _iv: &[u8], _aad: &[u8], _ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Err(CryptoError::UnsupportedAlgorithm("chacha20-poly1305".into()))
    }
}
