//! Durable key-value slots for the in-progress draft.
//!
//! The draft store only needs one entry per session, so the interface is a
//! single slot: read it, overwrite it, remove it. Three backings exist:
//! process memory (tests, kiosk demos), the `local_settings` table in the
//! terminal database, and the OS credential store via the `keyring` crate
//! (DPAPI on Windows, Keychain on macOS, Secret Service on Linux).

use std::sync::{Arc, Mutex};

use keyring::Entry;
use tracing::{debug, warn};

use crate::db::{self, DbState};
use crate::error::StoreError;

const SERVICE_NAME: &str = "the-small-pos";

/// Settings category used for draft slots in `local_settings`.
pub const DRAFT_CATEGORY: &str = "draft";

/// A single durable string slot.
pub trait KeyValueSlot: Send + Sync {
    /// Current value, `None` when the slot was never written or was removed.
    fn read(&self) -> Result<Option<String>, StoreError>;

    /// Overwrite the slot.
    fn write(&self, value: &str) -> Result<(), StoreError>;

    /// Remove the slot. Succeeds when it is already empty.
    fn remove(&self) -> Result<(), StoreError>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// Memory
// ---------------------------------------------------------------------------

/// In-process slot. Lost on restart.
#[derive(Debug, Default)]
pub struct MemorySlot {
    value: Mutex<Option<String>>,
}

impl MemorySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot pre-filled with `value`, e.g. to simulate a previous session.
    pub fn with_value(value: impl Into<String>) -> Self {
        Self {
            value: Mutex::new(Some(value.into())),
        }
    }
}

impl KeyValueSlot for MemorySlot {
    fn read(&self) -> Result<Option<String>, StoreError> {
        let guard = self.value.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.clone())
    }

    fn write(&self, value: &str) -> Result<(), StoreError> {
        let mut guard = self.value.lock().map_err(|_| StoreError::Poisoned)?;
        *guard = Some(value.to_string());
        Ok(())
    }

    fn remove(&self) -> Result<(), StoreError> {
        let mut guard = self.value.lock().map_err(|_| StoreError::Poisoned)?;
        *guard = None;
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

// ---------------------------------------------------------------------------
// SQLite (local_settings)
// ---------------------------------------------------------------------------

/// Slot stored as one `local_settings` row.
pub struct SqliteSlot {
    db: Arc<DbState>,
    key: String,
}

impl SqliteSlot {
    pub fn new(db: Arc<DbState>, key: &str) -> Self {
        Self {
            db,
            key: key.to_string(),
        }
    }
}

impl KeyValueSlot for SqliteSlot {
    fn read(&self) -> Result<Option<String>, StoreError> {
        let conn = self.db.conn.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(db::get_setting(&conn, DRAFT_CATEGORY, &self.key)?)
    }

    fn write(&self, value: &str) -> Result<(), StoreError> {
        let conn = self.db.conn.lock().map_err(|_| StoreError::Poisoned)?;
        db::set_setting(&conn, DRAFT_CATEGORY, &self.key, value)?;
        Ok(())
    }

    fn remove(&self) -> Result<(), StoreError> {
        let conn = self.db.conn.lock().map_err(|_| StoreError::Poisoned)?;
        db::delete_setting(&conn, DRAFT_CATEGORY, &self.key)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "sqlite {}#{}/{}",
            self.db.db_path.display(),
            DRAFT_CATEGORY,
            self.key
        )
    }
}

// ---------------------------------------------------------------------------
// OS credential store
// ---------------------------------------------------------------------------

/// Slot kept in the OS keyring under the POS service name.
#[derive(Debug, Clone)]
pub struct KeyringSlot {
    key: String,
}

impl KeyringSlot {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
        }
    }

    fn entry(&self) -> Result<Entry, StoreError> {
        Entry::new(SERVICE_NAME, &self.key).map_err(|e| {
            warn!(key = %self.key, error = %e, "keyring: failed to create entry");
            StoreError::from(e)
        })
    }
}

impl KeyValueSlot for KeyringSlot {
    fn read(&self) -> Result<Option<String>, StoreError> {
        match self.entry()?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, value: &str) -> Result<(), StoreError> {
        self.entry()?.set_password(value)?;
        debug!(key = %self.key, bytes = value.len(), "keyring: slot written");
        Ok(())
    }

    fn remove(&self) -> Result<(), StoreError> {
        match self.entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("keyring {SERVICE_NAME}/{}", self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_memory_slot_lifecycle() {
        let slot = MemorySlot::new();
        assert_eq!(slot.read().unwrap(), None);
        slot.write("{\"a\":1}").unwrap();
        assert_eq!(slot.read().unwrap().as_deref(), Some("{\"a\":1}"));
        slot.remove().unwrap();
        assert_eq!(slot.read().unwrap(), None);
        // Removing twice is fine
        slot.remove().unwrap();
    }

    #[test]
    fn test_sqlite_slot_lifecycle() {
        let db = Arc::new(db::open_in_memory().expect("in-memory db"));
        let slot = SqliteSlot::new(db.clone(), "terminal-1");
        assert_eq!(slot.read().unwrap(), None);

        slot.write("first").unwrap();
        slot.write("second").unwrap();
        assert_eq!(slot.read().unwrap().as_deref(), Some("second"));

        // A slot with a different key is independent
        let other = SqliteSlot::new(db, "terminal-2");
        assert_eq!(other.read().unwrap(), None);

        slot.remove().unwrap();
        assert_eq!(slot.read().unwrap(), None);
    }

    #[test]
    #[serial]
    #[ignore = "needs an OS credential store"]
    fn test_keyring_slot_lifecycle() {
        let slot = KeyringSlot::new("draft-test-slot");
        slot.remove().unwrap();
        slot.write("payload").unwrap();
        assert_eq!(slot.read().unwrap().as_deref(), Some("payload"));
        slot.remove().unwrap();
        assert_eq!(slot.read().unwrap(), None);
    }
}
