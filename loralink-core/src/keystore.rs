//! Persistent state: session key, paired flag, paired peer and device ID.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::crypto::SessionKey;
use crate::identity::DeviceId;

/// An established pairing as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPairing {
    pub session_key: SessionKey,
    pub paired: bool,
    pub peer_id: Option<DeviceId>,
}

impl StoredPairing {
    /// A stored record counts only when flagged paired and the key is not erased.
    pub fn is_usable(&self) -> bool {
        self.paired && !self.session_key.is_zero()
    }
}

/// Storage seam for pairing state and device identity.
pub trait KeyStore: Send {
    /// Stored pairing, or `None` when absent or invalid.
    fn load_pairing(&mut self) -> Option<StoredPairing>;

    fn save_pairing(&mut self, pairing: &StoredPairing) -> Result<(), KeyStoreError>;

    fn clear_pairing(&mut self) -> Result<(), KeyStoreError>;

    /// Stored device ID; a fresh one is generated and persisted when none exists.
    fn load_device_id(&mut self) -> Result<DeviceId, KeyStoreError>;

    fn save_device_id(&mut self, id: DeviceId) -> Result<(), KeyStoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Record {
    device_id: Option<DeviceId>,
    pairing: Option<StoredPairing>,
}

impl Record {
    fn usable_pairing(&self) -> Option<StoredPairing> {
        self.pairing.clone().filter(StoredPairing::is_usable)
    }
}

/// In-memory store. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryKeyStore {
    hardware_bits: Vec<u8>,
    inner: Arc<Mutex<Record>>,
}

impl MemoryKeyStore {
    pub fn new(hardware_bits: &[u8]) -> Self {
        Self {
            hardware_bits: hardware_bits.to_vec(),
            inner: Arc::default(),
        }
    }

    pub fn with_device_id(id: DeviceId) -> Self {
        let store = Self::default();
        store.record().device_id = Some(id);
        store
    }

    /// Raw stored pairing, including records `load_pairing` would reject.
    pub fn stored_pairing(&self) -> Option<StoredPairing> {
        self.record().pairing.clone()
    }

    fn record(&self) -> std::sync::MutexGuard<'_, Record> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyStore for MemoryKeyStore {
    fn load_pairing(&mut self) -> Option<StoredPairing> {
        self.record().usable_pairing()
    }

    fn save_pairing(&mut self, pairing: &StoredPairing) -> Result<(), KeyStoreError> {
        self.record().pairing = Some(pairing.clone());
        Ok(())
    }

    fn clear_pairing(&mut self) -> Result<(), KeyStoreError> {
        self.record().pairing = None;
        Ok(())
    }

    fn load_device_id(&mut self) -> Result<DeviceId, KeyStoreError> {
        let mut record = self.record();
        if let Some(id) = record.device_id {
            return Ok(id);
        }
        let id = DeviceId::generate(&self.hardware_bits);
        record.device_id = Some(id);
        Ok(id)
    }

    fn save_device_id(&mut self, id: DeviceId) -> Result<(), KeyStoreError> {
        self.record().device_id = Some(id);
        Ok(())
    }
}

/// Bincode record in a single file, replaced atomically (write temp, rename).
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    path: PathBuf,
    hardware_bits: Vec<u8>,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>, hardware_bits: &[u8]) -> Self {
        Self {
            path: path.into(),
            hardware_bits: hardware_bits.to_vec(),
        }
    }

    /// Missing or unreadable files yield an empty record.
    fn read(&self) -> Record {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %self.path.display(), "key store unreadable: {}", e);
                }
                return Record::default();
            }
        };
        match bincode::deserialize::<Record>(&bytes) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "key store corrupt, ignoring: {}", e);
                Record::default()
            }
        }
    }

    fn write(&self, record: &Record) -> Result<(), KeyStoreError> {
        let bytes = bincode::serialize(record)?;
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyStore for FileKeyStore {
    fn load_pairing(&mut self) -> Option<StoredPairing> {
        self.read().usable_pairing()
    }

    fn save_pairing(&mut self, pairing: &StoredPairing) -> Result<(), KeyStoreError> {
        let mut record = self.read();
        record.pairing = Some(pairing.clone());
        self.write(&record)
    }

    fn clear_pairing(&mut self) -> Result<(), KeyStoreError> {
        let mut record = self.read();
        record.pairing = None;
        self.write(&record)
    }

    fn load_device_id(&mut self) -> Result<DeviceId, KeyStoreError> {
        let mut record = self.read();
        if let Some(id) = record.device_id {
            return Ok(id);
        }
        let id = DeviceId::generate(&self.hardware_bits);
        record.device_id = Some(id);
        self.write(&record)?;
        tracing::info!(device_id = %id, "generated device id");
        Ok(id)
    }

    fn save_device_id(&mut self, id: DeviceId) -> Result<(), KeyStoreError> {
        let mut record = self.read();
        record.device_id = Some(id);
        self.write(&record)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("key store i/o: {0}")]
    Io(#[from] io::Error),
    #[error("key store encoding: {0}")]
    Encode(#[from] bincode::Error),
}
