use frame_crypto::{CipherAlgorithm, CryptoError, EncryptionConfig, EncryptionEngine, EncryptionMode};

#[test]
fn test_aes_gcm_detects_corruption() {
  let engine = EncryptionEngine::new(EncryptionConfig::with_mode(EncryptionMode::AesGcm));
  let payload = b"0123456789";

  let (ciphertext, header) = engine.encrypt(payload, None).unwrap();
  assert_eq!(header.algorithm, CipherAlgorithm::Aes256Gcm);
  assert_ne!(&ciphertext[..], &payload[..]);
  assert_eq!(engine.decrypt(&ciphertext, &header).unwrap(), payload);

  let mut corrupted = ciphertext.clone();
  corrupted[3] ^= 0x01;
  assert!(engine.decrypt(&corrupted, &header).is_err());

  let stats = engine.stats();
  assert_eq!(stats.frames_encrypted, 1);
  assert_eq!(stats.frames_decrypted, 1);
  assert_eq!(stats.failures, 1);
}

#[test]
fn test_retained_key_survives_rotation() {
  let engine = EncryptionEngine::new(EncryptionConfig::with_mode(EncryptionMode::AesCbc));
  let (ciphertext, header) = engine.encrypt(b"before rotation", None).unwrap();
  let old_key = engine.current_key_id();

  let new_key = engine.rotate_key();
  assert_ne!(old_key, new_key);
  assert_eq!(header.key_id, old_key);
  assert_eq!(engine.decrypt(&ciphertext, &header).unwrap(), b"before rotation");

  // frames sealed across the rotation open from one buffer
  let mut buf = engine.seal_frame(b"first").unwrap();
  engine.rotate_key();
  buf.extend(engine.seal_frame(b"second").unwrap());
  assert_eq!(engine.open_frames(&buf).unwrap(), vec![b"first".to_vec(), b"second".to_vec()]);
}

#[test]
fn test_unknown_key_is_rejected() {
  let producer = EncryptionEngine::new(EncryptionConfig::with_mode(EncryptionMode::AesGcm));
  let consumer = EncryptionEngine::new(EncryptionConfig::with_mode(EncryptionMode::AesGcm));
  let (ciphertext, header) = producer.encrypt(b"payload", None).unwrap();

  assert!(matches!(consumer.decrypt(&ciphertext, &header), Err(CryptoError::KeyNotFound(_))));

  consumer.import_key((*producer.current_key()).clone());
  assert_eq!(consumer.decrypt(&ciphertext, &header).unwrap(), b"payload");
}
