//! Consolidated application state document: a single JSON file holding
//! every piece of cross-restart state, guarded by one mutex and rewritten
//! atomically on every save.

pub mod crypto;
pub mod migrate;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{error, warn};

use crate::model::AppState;

/// Supplies the bytes the state store's encryption protector is bound to.
/// Kept to exactly this one method: the key material is owned by an
/// external collaborator (env var, file, or secrets service), not by the
/// state store itself.
pub trait ApiKeySource: Send + Sync {
    fn get_or_create_api_key(&self) -> Vec<u8>;
}

#[derive(Debug)]
pub enum StateError {
    Io(io::Error),
    Serde(serde_json::Error),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::Io(e) => write!(f, "state I/O error: {e}"),
            StateError::Serde(e) => write!(f, "state serialization error: {e}"),
        }
    }
}

impl std::error::Error for StateError {}

impl From<io::Error> for StateError {
    fn from(e: io::Error) -> Self {
        StateError::Io(e)
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Serde(e)
    }
}

const MAX_CONSECUTIVE_SAVE_FAILURES: u32 = 5;

struct Inner {
    cached: AppState,
    loaded: bool,
    consecutive_save_failures: u32,
}

/// Owns `state.json` under a data directory. All reads go through an
/// in-memory cache populated on first access; all writes are
/// read-modify-write under a single mutex, enforcing a single-writer
/// contract on the document.
pub struct StateStore {
    path: PathBuf,
    data_dir: PathBuf,
    api_key: Box<dyn ApiKeySource>,
    inner: Mutex<Inner>,
}

impl StateStore {
    pub fn new(data_dir: impl Into<PathBuf>, api_key: Box<dyn ApiKeySource>) -> Self {
        let data_dir = data_dir.into();
        let path = data_dir.join("state.json");
        Self {
            path,
            data_dir,
            api_key,
            inner: Mutex::new(Inner {
                cached: AppState::default(),
                loaded: false,
                consecutive_save_failures: 0,
            }),
        }
    }

    /// Returns a clone of the current state, loading and migrating from
    /// disk on first call.
    pub fn get_state(&self) -> AppState {
        let mut inner = self.inner.lock().expect("state mutex poisoned");
        self.ensure_loaded(&mut inner);
        inner.cached.clone()
    }

    fn ensure_loaded(&self, inner: &mut Inner) {
        if inner.loaded {
            return;
        }
        inner.cached = self.load_from_disk().unwrap_or_else(|e| {
            warn!(error = %e, "failed to load state.json, starting from defaults");
            AppState::default()
        });
        migrate::migrate_legacy_files(&mut inner.cached, &self.data_dir);
        migrate::cleanup_stale_operations(&mut inner.cached);
        inner.loaded = true;
    }

    fn load_from_disk(&self) -> Result<AppState, StateError> {
        if !self.path.exists() {
            return Ok(AppState::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        let mut state: AppState = serde_json::from_str(&raw)?;
        self.decrypt_sensitive_fields(&mut state);
        Ok(state)
    }

    fn decrypt_sensitive_fields(&self, state: &mut AppState) {
        let key = self.api_key.get_or_create_api_key();
        if let Some(token) = state.steam_auth.refresh_token.take() {
            match crypto::decrypt_field(&token, &key) {
                Ok(plain) => state.steam_auth.refresh_token = Some(plain),
                Err(e) => error!(error = %e, "failed to decrypt steam_auth.refresh_token"),
            }
        }
        if let Some(guard) = state.steam_auth.guard_data.take() {
            match crypto::decrypt_field(&guard, &key) {
                Ok(plain) => state.steam_auth.guard_data = Some(plain),
                Err(e) => error!(error = %e, "failed to decrypt steam_auth.guard_data"),
            }
        }
    }

    fn encrypt_sensitive_fields(&self, state: &AppState) -> AppState {
        let key = self.api_key.get_or_create_api_key();
        let mut out = state.clone();
        if let Some(token) = &out.steam_auth.refresh_token {
            out.steam_auth.refresh_token = Some(crypto::encrypt_field(token, &key));
        }
        if let Some(guard) = &out.steam_auth.guard_data {
            out.steam_auth.guard_data = Some(crypto::encrypt_field(guard, &key));
        }
        out
    }

    /// Serializes `state`, writes to `state.json.tmp`, fsyncs, then
    /// atomically renames over `state.json`. After
    /// `MAX_CONSECUTIVE_SAVE_FAILURES` consecutive failures, becomes a
    /// silent no-op for the rest of the process lifetime.
    pub fn save_state(&self, mut state: AppState) {
        let mut inner = self.inner.lock().expect("state mutex poisoned");
        if inner.consecutive_save_failures > MAX_CONSECUTIVE_SAVE_FAILURES {
            return;
        }
        if inner.consecutive_save_failures == MAX_CONSECUTIVE_SAVE_FAILURES {
            // The attempt that tips over the limit is the one that gets an
            // escalated log; everything after it is a silent no-op.
            inner.consecutive_save_failures += 1;
            error!("state save failed repeatedly, giving up for this process lifetime");
            return;
        }

        state.last_updated = Utc::now();
        match self.write_atomic(&state) {
            Ok(()) => {
                inner.consecutive_save_failures = 0;
                inner.cached = state;
                inner.loaded = true;
            }
            Err(e) => {
                inner.consecutive_save_failures += 1;
                warn!(error = %e, attempt = inner.consecutive_save_failures, "state save failed");
            }
        }
    }

    fn write_atomic(&self, state: &AppState) -> Result<(), StateError> {
        let to_write = self.encrypt_sensitive_fields(state);
        let json = serde_json::to_string_pretty(&to_write)?;

        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json.as_bytes())?;
        {
            let f = fs::File::open(&tmp_path)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    /// Atomic read-modify-write guarded by the store's mutex.
    pub fn update_state<F>(&self, mutator: F)
    where
        F: FnOnce(&mut AppState),
    {
        let current = self.get_state();
        let mut updated = current;
        mutator(&mut updated);
        self.save_state(updated);
    }

    pub fn log_position(&self) -> u64 {
        self.get_state().log_processing.position
    }

    pub fn set_log_position(&self, position: u64) {
        self.update_state(|s| s.log_processing.position = position);
    }

    pub fn setup_completed(&self) -> bool {
        self.get_state().setup_completed
    }

    pub fn mark_setup_completed(&self) {
        self.update_state(|s| s.setup_completed = true);
    }

    pub fn crawl_interval_hours(&self) -> f64 {
        self.get_state().crawl_interval_hours
    }

    /// Changing the interval resets `last_pics_crawl` to now so the UI
    /// countdown stays consistent.
    pub fn set_crawl_interval_hours(&self, hours: f64) {
        self.update_state(|s| {
            s.crawl_interval_hours = hours;
            s.last_pics_crawl = Some(Utc::now());
        });
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedKey;
    impl ApiKeySource for FixedKey {
        fn get_or_create_api_key(&self) -> Vec<u8> {
            b"fixed-test-api-key".to_vec()
        }
    }

    #[test]
    fn save_then_get_state_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), Box::new(FixedKey));

        store.update_state(|s| s.log_processing.position = 12345);
        assert_eq!(store.log_position(), 12345);

        let store2 = StateStore::new(dir.path(), Box::new(FixedKey));
        assert_eq!(store2.log_position(), 12345);
    }

    #[test]
    fn sensitive_fields_are_encrypted_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), Box::new(FixedKey));

        store.update_state(|s| {
            s.steam_auth.refresh_token = Some("super-secret-token".to_string());
        });

        let raw = fs::read_to_string(dir.path().join("state.json")).unwrap();
        assert!(raw.contains("ENC2:"));
        assert!(!raw.contains("super-secret-token"));

        let state = store.get_state();
        assert_eq!(state.steam_auth.refresh_token.as_deref(), Some("super-secret-token"));
    }

    #[test]
    fn tmp_file_is_cleaned_up_after_rename() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), Box::new(FixedKey));
        store.update_state(|s| s.setup_completed = true);
        assert!(!dir.path().join("state.json.tmp").exists());
        assert!(dir.path().join("state.json").exists());
    }

    #[test]
    fn crawl_interval_change_resets_last_crawl() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), Box::new(FixedKey));
        store.set_crawl_interval_hours(2.0);
        let state = store.get_state();
        assert_eq!(state.crawl_interval_hours, 2.0);
        assert!(state.last_pics_crawl.is_some());
    }
}
