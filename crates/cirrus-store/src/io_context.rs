//! Encrypted slot I/O for the sync-config database
//!
//! Each drive keeps its configs in files named `<NAME_PREFIX><user>.<slot>`.
//! A write always targets the slot after the current one and fsyncs before
//! the caller unlinks older slots, so a crash mid-write leaves the previous
//! slot intact. Reads try slots newest-first and take the first one whose
//! keyed hash verifies and whose payload decrypts and parses.
//!
//! Payload layout: `ciphertext || nonce (24B) || mac (32B)`, XChaCha20-
//! Poly1305 under the user's configuration cipher key, HMAC-SHA256 with the
//! authentication key over `nonce || ciphertext`.

use std::io::Write;
use std::path::{Path, PathBuf};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use cirrus_core::domain::SyncConfig;

use crate::StoreError;

type HmacSha256 = Hmac<Sha256>;

/// Prefix applied to configuration database file names.
pub const NAME_PREFIX: &str = "cirrus_syncconfig_";

/// Number of rotating slots per drive.
pub const MAX_SLOTS: u32 = 4;

const NONCE_LEN: usize = 24;
const MAC_LEN: usize = 32;
const KEY_LEN: usize = 32;

/// On-disk document: a versioned ordered sequence of configs.
#[derive(Debug, Serialize, Deserialize)]
struct ConfigDocument {
    version: u32,
    configs: Vec<SyncConfig>,
}

const DOCUMENT_VERSION: u32 = 1;

/// Reads and writes encrypted config databases.
pub struct SyncConfigIoContext {
    cipher: XChaCha20Poly1305,
    auth_key: [u8; KEY_LEN],
    /// Name component identifying this user's databases.
    name: String,
}

impl SyncConfigIoContext {
    /// `cipher_key` and `auth_key` are derived from the user's keys by the
    /// login layer; `name` identifies the user's databases on a shared drive.
    pub fn new(cipher_key: [u8; KEY_LEN], auth_key: [u8; KEY_LEN], name: impl Into<String>) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new((&cipher_key).into()),
            auth_key,
            name: name.into(),
        }
    }

    /// Full path of one slot file.
    #[must_use]
    pub fn slot_path(&self, db_path: &Path, slot: u32) -> PathBuf {
        db_path.join(format!("{NAME_PREFIX}{}.{slot}", self.name))
    }

    /// Existing slots, newest mtime first.
    pub fn get_slots_in_order(&self, db_path: &Path) -> Vec<u32> {
        let mut slots: Vec<(u32, std::time::SystemTime)> = (0..MAX_SLOTS)
            .filter_map(|slot| {
                let meta = std::fs::metadata(self.slot_path(db_path, slot)).ok()?;
                let mtime = meta.modified().ok()?;
                Some((slot, mtime))
            })
            .collect();
        slots.sort_by(|a, b| b.1.cmp(&a.1));
        slots.into_iter().map(|(slot, _)| slot).collect()
    }

    /// Reads and verifies one slot.
    pub fn read(&self, db_path: &Path, slot: u32) -> Result<Vec<SyncConfig>, StoreError> {
        let path = self.slot_path(db_path, slot);
        let payload = std::fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
        let plaintext = self.decrypt(&payload)?;
        self.deserialize(&plaintext)
    }

    /// Encrypts and writes one slot, fsyncing before returning.
    pub fn write(
        &self,
        db_path: &Path,
        configs: &[SyncConfig],
        slot: u32,
    ) -> Result<(), StoreError> {
        std::fs::create_dir_all(db_path).map_err(|e| StoreError::io(db_path, e))?;

        let plaintext = self.serialize(configs)?;
        let payload = self.encrypt(&plaintext)?;

        let path = self.slot_path(db_path, slot);
        let mut file = std::fs::File::create(&path).map_err(|e| StoreError::io(&path, e))?;
        file.write_all(&payload)
            .map_err(|e| StoreError::io(&path, e))?;
        file.sync_all().map_err(|e| StoreError::io(&path, e))?;

        debug!(path = %path.display(), configs = configs.len(), "config slot written");
        Ok(())
    }

    /// Removes one slot from disk. Missing slots are fine.
    pub fn remove(&self, db_path: &Path, slot: u32) -> Result<(), StoreError> {
        let path = self.slot_path(db_path, slot);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// Removes every slot of this user's database on the drive.
    pub fn remove_all(&self, db_path: &Path) -> Result<(), StoreError> {
        for slot in 0..MAX_SLOTS {
            self.remove(db_path, slot)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    pub(crate) fn serialize(&self, configs: &[SyncConfig]) -> Result<Vec<u8>, StoreError> {
        let doc = ConfigDocument {
            version: DOCUMENT_VERSION,
            configs: configs.to_vec(),
        };
        Ok(serde_json::to_vec(&doc)?)
    }

    pub(crate) fn deserialize(&self, plaintext: &[u8]) -> Result<Vec<SyncConfig>, StoreError> {
        let doc: ConfigDocument = serde_json::from_slice(plaintext)?;
        if doc.version != DOCUMENT_VERSION {
            warn!(version = doc.version, "unsupported config document version");
            return Err(StoreError::Malformed);
        }
        Ok(doc.configs)
    }

    // ------------------------------------------------------------------
    // Crypto
    // ------------------------------------------------------------------

    pub(crate) fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| StoreError::Crypto)?;

        let mac = self.sign(&nonce, &ciphertext)?;

        let mut payload = ciphertext;
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&mac);
        Ok(payload)
    }

    pub(crate) fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, StoreError> {
        if payload.len() < NONCE_LEN + MAC_LEN {
            return Err(StoreError::Malformed);
        }
        let (rest, mac) = payload.split_at(payload.len() - MAC_LEN);
        let (ciphertext, nonce) = rest.split_at(rest.len() - NONCE_LEN);

        // Authenticate before touching the ciphertext.
        let mut verifier =
            <HmacSha256 as Mac>::new_from_slice(&self.auth_key).map_err(|_| StoreError::Crypto)?;
        verifier.update(nonce);
        verifier.update(ciphertext);
        verifier.verify_slice(mac).map_err(|_| StoreError::Crypto)?;

        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| StoreError::Crypto)
    }

    fn sign(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<[u8; MAC_LEN], StoreError> {
        let mut signer =
            <HmacSha256 as Mac>::new_from_slice(&self.auth_key).map_err(|_| StoreError::Crypto)?;
        signer.update(nonce);
        signer.update(ciphertext);
        let out = signer.finalize().into_bytes();
        Ok(out.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cirrus_core::domain::{BackupId, NodeHandle, SyncDirection};

    fn context() -> SyncConfigIoContext {
        SyncConfigIoContext::new([0x11; 32], [0x22; 32], "user1")
    }

    fn sample_configs() -> Vec<SyncConfig> {
        vec![
            SyncConfig::new(
                BackupId::new(1),
                "/home/u/Docs".into(),
                "Docs".into(),
                NodeHandle::new(10),
                "/Docs".into(),
                SyncDirection::TwoWay,
            ),
            SyncConfig::new(
                BackupId::new(2),
                "/home/u/Photos".into(),
                "Photos".into(),
                NodeHandle::new(11),
                "/Photos".into(),
                SyncDirection::Backup,
            ),
        ]
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let ctx = context();
        let plaintext = b"some config bytes".to_vec();
        let payload = ctx.encrypt(&plaintext).unwrap();
        assert_ne!(payload, plaintext);
        assert_eq!(ctx.decrypt(&payload).unwrap(), plaintext);
    }

    #[test]
    fn tampered_mac_is_rejected() {
        let ctx = context();
        let mut payload = ctx.encrypt(b"data").unwrap();
        let len = payload.len();
        payload[len - 1] ^= 0x01;
        assert!(matches!(ctx.decrypt(&payload), Err(StoreError::Crypto)));
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let ctx = context();
        let mut payload = ctx.encrypt(b"data").unwrap();
        payload[0] ^= 0x01;
        assert!(matches!(ctx.decrypt(&payload), Err(StoreError::Crypto)));
    }

    #[test]
    fn wrong_auth_key_is_rejected() {
        let ctx = context();
        let payload = ctx.encrypt(b"data").unwrap();
        let other = SyncConfigIoContext::new([0x11; 32], [0x33; 32], "user1");
        assert!(matches!(other.decrypt(&payload), Err(StoreError::Crypto)));
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let ctx = context();
        assert!(matches!(
            ctx.decrypt(&[0u8; 10]),
            Err(StoreError::Malformed)
        ));
    }

    #[test]
    fn write_then_read_slot() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context();
        let configs = sample_configs();

        ctx.write(dir.path(), &configs, 0).unwrap();
        let back = ctx.read(dir.path(), 0).unwrap();
        assert_eq!(back, configs);
    }

    #[test]
    fn slots_ordered_by_mtime_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context();
        let configs = sample_configs();

        ctx.write(dir.path(), &configs, 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(30));
        ctx.write(dir.path(), &configs, 1).unwrap();

        let slots = ctx.get_slots_in_order(dir.path());
        assert_eq!(slots, vec![1, 0]);
    }

    #[test]
    fn corrupt_slot_read_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context();
        ctx.write(dir.path(), &sample_configs(), 0).unwrap();

        // Truncate to simulate a crash mid-write.
        let path = ctx.slot_path(dir.path(), 0);
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() / 2]).unwrap();

        assert!(ctx.read(dir.path(), 0).is_err());
    }

    #[test]
    fn remove_slot_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context();
        ctx.write(dir.path(), &sample_configs(), 2).unwrap();
        ctx.remove(dir.path(), 2).unwrap();
        ctx.remove(dir.path(), 2).unwrap();
        assert!(ctx.get_slots_in_order(dir.path()).is_empty());
    }
}
