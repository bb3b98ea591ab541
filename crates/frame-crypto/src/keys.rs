use chrono::{DateTime, Duration, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::header::CipherAlgorithm;

/// Number of superseded keys kept for late frames
pub const RETAINED_KEY_CAPACITY: usize = 10;

/// Immutable key material. Rotation replaces the `Arc`, it never edits a key
/// in place.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKeyInfo {
    pub id: String,
    pub raw_key: Vec<u8>,
    pub iv: Vec<u8>,
    pub algorithm: CipherAlgorithm,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl EncryptionKeyInfo {
    /// Fresh random key and IV sized for `algorithm`
    pub fn generate(algorithm: CipherAlgorithm, ttl: Option<Duration>) -> Self {
        let mut raw_key = vec![0u8; algorithm.key_len()];
        let mut iv = vec![0u8; algorithm.iv_len()];
        OsRng.fill_bytes(&mut raw_key);
        OsRng.fill_bytes(&mut iv);

        let created_at = Utc::now();
        Self {
            id: format!("key_{}", uuid::Uuid::new_v4().simple()),
            raw_key,
            iv,
            algorithm,
            created_at,
            expires_at: ttl.map(|ttl| created_at + ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl fmt::Debug for EncryptionKeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKeyInfo")
            .field("id", &self.id)
            .field("raw_key", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// The current key plus a bounded, creation-ordered set of previous keys.
#[derive(Debug)]
pub struct KeyRing {
    current: Arc<EncryptionKeyInfo>,
    retained: VecDeque<Arc<EncryptionKeyInfo>>,
    capacity: usize,
}

impl KeyRing {
    pub fn new(current: EncryptionKeyInfo, capacity: usize) -> Self {
        Self {
            current: Arc::new(current),
            retained: VecDeque::new(),
            capacity,
        }
    }

    pub fn current(&self) -> Arc<EncryptionKeyInfo> {
        Arc::clone(&self.current)
    }

    pub fn find(&self, key_id: &str) -> Option<Arc<EncryptionKeyInfo>> {
        if self.current.id == key_id {
            return Some(self.current());
        }
        self.retained.iter().find(|k| k.id == key_id).cloned()
    }

    /// Install `next` as current and demote the previous key into the
    /// retention set, which is then pruned: expired keys first, then the
    /// oldest until within capacity.
    pub fn rotate(&mut self, next: EncryptionKeyInfo, now: DateTime<Utc>) -> Arc<EncryptionKeyInfo> {
        let previous = std::mem::replace(&mut self.current, Arc::new(next));
        self.retained.push_back(Arc::clone(&previous));

        self.retained.retain(|k| !k.is_expired(now));
        while self.retained.len() > self.capacity {
            self.retained.pop_front();
        }
        previous
    }

    /// Place a key received out of band into the retention set
    pub fn retain_key(&mut self, key: EncryptionKeyInfo) {
        if self.find(&key.id).is_some() {
            return;
        }
        let position = self
            .retained
            .iter()
            .position(|k| k.created_at > key.created_at)
            .unwrap_or(self.retained.len());
        self.retained.insert(position, Arc::new(key));
        while self.retained.len() > self.capacity {
            self.retained.pop_front();
        }
    }

    pub fn retained_ids(&self) -> Vec<String> {
        self.retained.iter().map(|k| k.id.clone()).collect()
    }

    pub fn retained_len(&self) -> usize {
        self.retained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_sizes_per_algorithm() {
        let gcm = EncryptionKeyInfo::generate(CipherAlgorithm::Aes256Gcm, None);
        assert_eq!(gcm.raw_key.len(), 32);
        assert_eq!(gcm.iv.len(), 12);

        let cbc = EncryptionKeyInfo::generate(CipherAlgorithm::Aes256Cbc, None);
        assert_eq!(cbc.raw_key.len(), 32);
        assert_eq!(cbc.iv.len(), 16);

        let chacha = EncryptionKeyInfo::generate(CipherAlgorithm::ChaCha20Poly1305, None);
        assert_eq!(chacha.iv.len(), 12);
        assert_ne!(gcm.id, cbc.id);
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let key = EncryptionKeyInfo::generate(CipherAlgorithm::Aes256Gcm, None);
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains(&key.id));
    }

    #[test]
    fn test_rotation_keeps_previous_keys_findable() {
        let first = EncryptionKeyInfo::generate(CipherAlgorithm::Aes256Gcm, None);
        let first_id = first.id.clone();
        let mut ring = KeyRing::new(first, RETAINED_KEY_CAPACITY);

        let demoted = ring.rotate(EncryptionKeyInfo::generate(CipherAlgorithm::Aes256Gcm, None), Utc::now());
        assert_eq!(demoted.id, first_id);
        assert!(ring.find(&first_id).is_some());
        assert_ne!(ring.current().id, first_id);
        assert!(ring.find("missing").is_none());
    }

    #[test]
    fn test_retention_is_bounded_oldest_first() {
        let first = EncryptionKeyInfo::generate(CipherAlgorithm::Aes256Gcm, None);
        let mut ring = KeyRing::new(first, 3);
        let mut ids = vec![ring.current().id.clone()];

        for _ in 0..5 {
            ring.rotate(EncryptionKeyInfo::generate(CipherAlgorithm::Aes256Gcm, None), Utc::now());
            ids.push(ring.current().id.clone());
        }

        // ids[5] is current, ids[2..5] are retained
        assert_eq!(ring.retained_len(), 3);
        assert_eq!(ring.retained_ids(), ids[2..5].to_vec());
        assert!(ring.find(&ids[0]).is_none());
        assert!(ring.find(&ids[1]).is_none());
    }

    #[test]
    fn test_expired_keys_pruned_before_capacity() {
        let mut short_lived = EncryptionKeyInfo::generate(CipherAlgorithm::Aes256Gcm, None);
        short_lived.expires_at = Some(Utc::now() - Duration::seconds(1));
        let expired_id = short_lived.id.clone();

        let mut ring = KeyRing::new(short_lived, RETAINED_KEY_CAPACITY);
        ring.rotate(EncryptionKeyInfo::generate(CipherAlgorithm::Aes256Gcm, None), Utc::now());

        assert_eq!(ring.retained_len(), 0);
        assert!(ring.find(&expired_id).is_none());
    }

    #[test]
    fn test_retain_key_out_of_band() {
        let mut ring = KeyRing::new(EncryptionKeyInfo::generate(CipherAlgorithm::Aes256Gcm, None), 2);
        let imported = EncryptionKeyInfo::generate(CipherAlgorithm::Aes256Gcm, None);
        let imported_id = imported.id.clone();

        ring.retain_key(imported.clone());
        ring.retain_key(imported);
        assert_eq!(ring.retained_len(), 1);
        assert!(ring.find(&imported_id).is_some());
    }
}
