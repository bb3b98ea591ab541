use chrono::Utc;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use telemetry::metrics::{CRYPTO_KEY_ROTATIONS, CRYPTO_LATENCY, CRYPTO_OPERATIONS};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cipher;
use crate::error::CryptoError;
use crate::frame;
use crate::header::{CipherAlgorithm, EncryptionHeader};
use crate::keys::{EncryptionKeyInfo, KeyRing, RETAINED_KEY_CAPACITY};
use crate::stats::EncryptionStats;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMode {
    /// Passthrough, frames are not encrypted
    #[default]
    Standard,
    AesGcm,
    AesCbc,
    Chacha20,
}

impl EncryptionMode {
    pub fn requested_algorithm(&self) -> CipherAlgorithm {
        match self {
            EncryptionMode::Standard => CipherAlgorithm::None,
            EncryptionMode::AesGcm => CipherAlgorithm::Aes256Gcm,
            EncryptionMode::AesCbc => CipherAlgorithm::Aes256Cbc,
            EncryptionMode::Chacha20 => CipherAlgorithm::ChaCha20Poly1305,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub mode: EncryptionMode,
    /// Automatic rotation period, 0 disables
    #[serde(default)]
    pub key_rotation_interval_secs: u64,
    /// Lifetime stamped on new keys as `expires_at`
    #[serde(default)]
    pub key_ttl_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub use_per_frame_iv: bool,
    #[serde(default = "default_true")]
    pub authenticate_headers: bool,
    #[serde(default = "default_retained_keys")]
    pub max_retained_keys: usize,
}

fn default_true() -> bool {
    true
}

fn default_retained_keys() -> usize {
    RETAINED_KEY_CAPACITY
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            mode: EncryptionMode::default(),
            key_rotation_interval_secs: 0,
            key_ttl_secs: None,
            use_per_frame_iv: true,
            authenticate_headers: true,
            max_retained_keys: RETAINED_KEY_CAPACITY,
        }
    }
}

impl EncryptionConfig {
    pub fn with_mode(mode: EncryptionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    fn rotation_interval(&self) -> Option<Duration> {
        (self.key_rotation_interval_secs > 0).then(|| Duration::from_secs(self.key_rotation_interval_secs))
    }

    fn key_ttl(&self) -> Option<chrono::Duration> {
        self.key_ttl_secs
            .and_then(|secs| chrono::Duration::try_seconds(i64::try_from(secs).ok()?))
    }
}

struct RotationTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Frame cipher with a rotating key ring.
///
/// `encrypt` and `decrypt` are synchronous and may be called concurrently
/// from every output of a pipeline. Each call clones the key `Arc` under a
/// short read lock, so a concurrent rotation is observed either fully or not
/// at all.
pub struct EncryptionEngine {
    config: EncryptionConfig,
    algorithm: CipherAlgorithm,
    keys: RwLock<KeyRing>,
    stats: Mutex<EncryptionStats>,
    rotation: Mutex<Option<RotationTask>>,
}

#[derive(Clone, Copy)]
enum Operation {
    Encrypt,
    Decrypt,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Encrypt => "encrypt",
            Operation::Decrypt => "decrypt",
        }
    }
}

impl EncryptionEngine {
    pub fn new(config: EncryptionConfig) -> Self {
        let algorithm = effective_algorithm(config.mode);
        let key = EncryptionKeyInfo::generate(algorithm, config.key_ttl());
        Self::build(config, algorithm, key)
    }

    /// Build an engine around existing key material, e.g. on the decrypting
    /// side of a recording.
    pub fn with_initial_key(config: EncryptionConfig, key: EncryptionKeyInfo) -> Self {
        let algorithm = effective_algorithm(config.mode);
        Self::build(config, algorithm, key)
    }

    fn build(mut config: EncryptionConfig, algorithm: CipherAlgorithm, key: EncryptionKeyInfo) -> Self {
        if config.max_retained_keys > RETAINED_KEY_CAPACITY {
            warn!(
                requested = config.max_retained_keys,
                limit = RETAINED_KEY_CAPACITY,
                "max_retained_keys above limit, clamping"
            );
            config.max_retained_keys = RETAINED_KEY_CAPACITY;
        }
        info!(
            mode = ?config.mode,
            algorithm = %algorithm,
            key_id = %key.id,
            rotation_interval_secs = config.key_rotation_interval_secs,
            "encryption engine initialized"
        );
        let capacity = config.max_retained_keys;
        Self {
            config,
            algorithm,
            keys: RwLock::new(KeyRing::new(key, capacity)),
            stats: Mutex::new(EncryptionStats::default()),
            rotation: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EncryptionConfig {
        &self.config
    }

    /// Cipher actually used for new frames, after any fallback
    pub fn algorithm(&self) -> CipherAlgorithm {
        self.algorithm
    }

    pub fn current_key(&self) -> Arc<EncryptionKeyInfo> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).current()
    }

    pub fn current_key_id(&self) -> String {
        self.current_key().id.clone()
    }

    pub fn retained_key_ids(&self) -> Vec<String> {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).retained_ids()
    }

    /// Accept a previously exported key so frames sealed under it can be opened
    pub fn import_key(&self, key: EncryptionKeyInfo) {
        self.keys.write().unwrap_or_else(PoisonError::into_inner).retain_key(key);
    }

    pub fn stats(&self) -> EncryptionStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Generate a new current key and demote the old one into the retention set.
    /// Returns the new key id.
    pub fn rotate_key(&self) -> String {
        let next = EncryptionKeyInfo::generate(self.algorithm, self.config.key_ttl());
        let next_id = next.id.clone();
        let previous = self
            .keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .rotate(next, Utc::now());

        self.stats.lock().unwrap_or_else(PoisonError::into_inner).key_rotations += 1;
        CRYPTO_KEY_ROTATIONS.inc();
        info!(previous_key = %previous.id, key_id = %next_id, "encryption key rotated");
        next_id
    }

    /// Spawn the periodic rotation task. Returns false when rotation is
    /// disabled or already running.
    pub fn start_rotation(self: &Arc<Self>) -> bool {
        let Some(interval) = self.config.rotation_interval() else {
            return false;
        };
        let mut slot = self.rotation.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return false;
        }

        let Some(first) = tokio::time::Instant::now().checked_add(interval) else {
            warn!(interval_secs = interval.as_secs(), "key rotation interval out of range, rotation disabled");
            return false;
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let engine: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(first, interval);
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(engine) = engine.upgrade() else { break };
                        engine.rotate_key();
                    }
                }
            }
            debug!("key rotation task stopped");
        });

        *slot = Some(RotationTask { token, handle });
        true
    }

    /// Cancel automatic rotation and wait for the task to finish.
    pub async fn shutdown(&self) {
        let task = self.rotation.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.token.cancel();
            if let Err(e) = task.handle.await {
                if e.is_panic() {
                    warn!(error = %e, "key rotation task panicked");
                }
            }
        }
    }

    pub fn encrypt(
        &self,
        data: &[u8],
        header: Option<EncryptionHeader>,
    ) -> Result<(Vec<u8>, EncryptionHeader), CryptoError> {
        let started = Instant::now();
        let result = self.encrypt_inner(data, header);
        let algorithm = result.as_ref().map_or(self.algorithm, |(_, h)| h.algorithm);
        self.finish(Operation::Encrypt, algorithm, started, result.is_ok());
        if let Err(e) = &result {
            warn!(error = %e, "frame encryption failed");
        }
        result
    }

    pub fn decrypt(&self, ciphertext: &[u8], header: &EncryptionHeader) -> Result<Vec<u8>, CryptoError> {
        let started = Instant::now();
        let result = self.decrypt_inner(ciphertext, header);
        self.finish(Operation::Decrypt, header.algorithm, started, result.is_ok());
        if let Err(e) = &result {
            warn!(key_id = %header.key_id, error = %e, "frame decryption failed");
        }
        result
    }

    /// Encrypt and frame `data` for a segment file
    pub fn seal_frame(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (ciphertext, header) = self.encrypt(data, None)?;
        frame::seal(&header, &ciphertext)
    }

    /// Decrypt every sealed frame in `buf`, in order
    pub fn open_frames(&self, buf: &[u8]) -> Result<Vec<Vec<u8>>, CryptoError> {
        frame::frames(buf)
            .map(|f| {
                let (header, body) = f?;
                self.decrypt(body, &header)
            })
            .collect()
    }

    fn find_key(&self, key_id: &str) -> Result<Arc<EncryptionKeyInfo>, CryptoError> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .find(key_id)
            .ok_or_else(|| CryptoError::KeyNotFound(key_id.to_string()))
    }

    fn frame_iv(&self, algorithm: CipherAlgorithm, key: &EncryptionKeyInfo) -> Option<Vec<u8>> {
        let len = algorithm.iv_len();
        if len == 0 {
            return None;
        }
        if self.config.use_per_frame_iv || key.iv.len() != len {
            let mut iv = vec![0u8; len];
            OsRng.fill_bytes(&mut iv);
            Some(iv)
        } else {
            Some(key.iv.clone())
        }
    }

    fn encrypt_inner(
        &self,
        data: &[u8],
        header: Option<EncryptionHeader>,
    ) -> Result<(Vec<u8>, EncryptionHeader), CryptoError> {
        let (key, mut header) = match header {
            Some(header) => (self.find_key(&header.key_id)?, header),
            None => {
                let key = self.current_key();
                let header = EncryptionHeader::new(key.id.clone(), self.algorithm, None);
                (key, header)
            }
        };

        if header.algorithm == CipherAlgorithm::None {
            return Ok((data.to_vec(), header));
        }
        if header.iv.is_none() {
            header.iv = self.frame_iv(header.algorithm, &key);
        }
        if self.config.authenticate_headers {
            header.aad = Some(header.digest()?.to_vec());
        }

        let ciphertext = cipher::encrypt(header.algorithm, &key.raw_key, header.iv(), header.aad(), data)?;
        Ok((ciphertext, header))
    }

    fn decrypt_inner(&self, ciphertext: &[u8], header: &EncryptionHeader) -> Result<Vec<u8>, CryptoError> {
        if header.algorithm == CipherAlgorithm::None {
            return Ok(ciphertext.to_vec());
        }
        let key = self.find_key(&header.key_id)?;

        if self.config.authenticate_headers && header.aad() != header.digest()?.as_slice() {
            return Err(CryptoError::HeaderAuthentication(header.key_id.clone()));
        }

        cipher::decrypt(header.algorithm, &key.raw_key, header.iv(), header.aad(), ciphertext)
    }

    fn finish(&self, operation: Operation, algorithm: CipherAlgorithm, started: Instant, ok: bool) {
        let elapsed = started.elapsed();
        {
            let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
            match (operation, ok) {
                (_, false) => stats.failures += 1,
                (Operation::Encrypt, true) => stats.frames_encrypted += 1,
                (Operation::Decrypt, true) => stats.frames_decrypted += 1,
            }
            stats.record_latency(elapsed.as_secs_f64() * 1_000_000.0);
        }

        let status = if ok { "ok" } else { "error" };
        CRYPTO_OPERATIONS
            .with_label_values(&[operation.as_str(), algorithm.as_str(), status])
            .inc();
        CRYPTO_LATENCY.observe(elapsed.as_secs_f64());
    }
}

impl Drop for EncryptionEngine {
    fn drop(&mut self) {
        let task = self.rotation.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            task.token.cancel();
        }
    }
}

fn effective_algorithm(mode: EncryptionMode) -> CipherAlgorithm {
    let requested = mode.requested_algorithm();
    if cipher::is_supported(requested) {
        return requested;
    }
    warn!(
        requested = %requested,
        fallback = %CipherAlgorithm::Aes256Gcm,
        "cipher not available in this build, falling back"
    );
    CipherAlgorithm::Aes256Gcm
}
