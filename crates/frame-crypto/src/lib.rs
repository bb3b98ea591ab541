//! Per-frame encryption for recorded media: a cipher engine with a rotating
//! key ring, a self-describing frame header, and the on-disk sealed-frame
//! layout used by encrypted segments.

pub mod cipher;
pub mod engine;
pub mod error;
pub mod frame;
pub mod header;
pub mod keys;
pub mod stats;

pub use engine::{EncryptionConfig, EncryptionEngine, EncryptionMode};
pub use error::CryptoError;
pub use header::{CipherAlgorithm, EncryptionHeader};
pub use keys::EncryptionKeyInfo;
pub use stats::EncryptionStats;
