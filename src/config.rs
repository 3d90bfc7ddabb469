//! Terminal configuration from the environment.
//!
//! A `.env` file next to the binary is loaded first when present. Every
//! setting has a default except the admin dashboard credentials; without
//! them the terminal runs against its local database only.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use zeroize::Zeroizing;

use crate::api;
use crate::ledger::LedgerOptions;
use crate::logging::LogConfig;

pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(15);
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Where the in-progress draft is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftSlotKind {
    Memory,
    Sqlite,
    Keyring,
}

impl std::str::FromStr for DraftSlotKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "sqlite" | "db" => Ok(Self::Sqlite),
            "keyring" => Ok(Self::Keyring),
            other => bail!("unknown draft slot '{other}' (expected memory, sqlite or keyring)"),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    /// Normalized admin dashboard base URL.
    pub admin_url: Option<String>,
    /// Bare API key or onboarding connection string.
    pub api_key: Option<Zeroizing<String>>,
    pub terminal_id: Option<String>,
    pub db_path: PathBuf,
    pub commit_timeout: Duration,
    pub reconcile_timeout: Duration,
    pub page_size: u32,
    pub log_dir: PathBuf,
    pub draft_slot: DraftSlotKind,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("admin_url", &self.admin_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("terminal_id", &self.terminal_id)
            .field("db_path", &self.db_path)
            .field("commit_timeout", &self.commit_timeout)
            .field("reconcile_timeout", &self.reconcile_timeout)
            .field("page_size", &self.page_size)
            .field("log_dir", &self.log_dir)
            .field("draft_slot", &self.draft_slot)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_url: None,
            api_key: None,
            terminal_id: None,
            db_path: PathBuf::from("pos.db"),
            commit_timeout: DEFAULT_COMMIT_TIMEOUT,
            reconcile_timeout: DEFAULT_RECONCILE_TIMEOUT,
            page_size: DEFAULT_PAGE_SIZE,
            log_dir: PathBuf::from("logs"),
            draft_slot: DraftSlotKind::Sqlite,
        }
    }
}

fn millis(key: &str, raw: &str) -> anyhow::Result<Duration> {
    let ms: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a whole number of milliseconds, got '{raw}'"))?;
    Ok(Duration::from_millis(ms))
}

impl Config {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        // Missing .env is fine
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(raw) = get("POS_API_KEY") {
            config.admin_url = api::extract_admin_url_from_connection_string(&raw);
            config.terminal_id = api::extract_terminal_id_from_connection_string(&raw);
            config.api_key = Some(Zeroizing::new(raw.trim().to_string()));
        }
        if let Some(url) = get("POS_ADMIN_URL") {
            config.admin_url = Some(api::normalize_admin_url(&url));
        }
        if let Some(tid) = get("POS_TERMINAL_ID") {
            config.terminal_id = Some(tid.trim().to_string());
        }
        if let Some(path) = get("POS_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        if let Some(raw) = get("POS_COMMIT_TIMEOUT_MS") {
            config.commit_timeout = millis("POS_COMMIT_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = get("POS_RECONCILE_TIMEOUT_MS") {
            config.reconcile_timeout = millis("POS_RECONCILE_TIMEOUT_MS", &raw)?;
        }
        if let Some(raw) = get("POS_PAGE_SIZE") {
            let size: u32 = raw
                .trim()
                .parse()
                .with_context(|| format!("POS_PAGE_SIZE must be a positive number, got '{raw}'"))?;
            if size == 0 {
                bail!("POS_PAGE_SIZE must be at least 1");
            }
            config.page_size = size;
        }
        if let Some(dir) = get("POS_LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Some(raw) = get("POS_DRAFT_SLOT") {
            config.draft_slot = raw.parse()?;
        }

        Ok(config)
    }

    /// Admin URL and API key, when both are set.
    pub fn admin_credentials(&self) -> Option<(&str, &str)> {
        match (&self.admin_url, &self.api_key) {
            (Some(url), Some(key)) => Some((url.as_str(), key.as_str())),
            _ => None,
        }
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            log_dir: self.log_dir.clone(),
            ..LogConfig::default()
        }
    }

    pub fn ledger_options(&self) -> LedgerOptions {
        LedgerOptions {
            page_size: self.page_size,
            reconcile_timeout: self.reconcile_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.commit_timeout, Duration::from_secs(15));
        assert_eq!(config.reconcile_timeout, Duration::from_secs(30));
        assert_eq!(config.page_size, 50);
        assert_eq!(config.draft_slot, DraftSlotKind::Sqlite);
        assert!(config.admin_credentials().is_none());
    }

    #[test]
    fn test_overrides_and_url_normalization() {
        let config = Config::from_lookup(lookup(&[
            ("POS_ADMIN_URL", "admin.thesmall.app/api/"),
            ("POS_API_KEY", "secret-key"),
            ("POS_COMMIT_TIMEOUT_MS", "2500"),
            ("POS_PAGE_SIZE", "20"),
            ("POS_DRAFT_SLOT", "Keyring"),
        ]))
        .unwrap();

        assert_eq!(config.admin_url.as_deref(), Some("https://admin.thesmall.app"));
        assert_eq!(config.api_key.as_deref().map(String::as_str), Some("secret-key"));
        assert_eq!(config.commit_timeout, Duration::from_millis(2500));
        assert_eq!(config.page_size, 20);
        assert_eq!(config.draft_slot, DraftSlotKind::Keyring);
        assert_eq!(
            config.admin_credentials(),
            Some(("https://admin.thesmall.app", "secret-key"))
        );
        assert_eq!(config.ledger_options().page_size, 20);
        assert!(!format!("{config:?}").contains("secret-key"));
    }

    #[test]
    fn test_connection_string_supplies_url_and_terminal() {
        let conn = r#"{"key":"k-1","url":"localhost:3000","tid":"term-9"}"#;
        let config = Config::from_lookup(lookup(&[("POS_API_KEY", conn)])).unwrap();
        assert_eq!(config.admin_url.as_deref(), Some("http://localhost:3000"));
        assert_eq!(config.terminal_id.as_deref(), Some("term-9"));
    }

    #[test]
    fn test_invalid_values_are_errors() {
        assert!(Config::from_lookup(lookup(&[("POS_COMMIT_TIMEOUT_MS", "soon")])).is_err());
        assert!(Config::from_lookup(lookup(&[("POS_PAGE_SIZE", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("POS_DRAFT_SLOT", "cloud")])).is_err());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_process_environment() {
        std::env::set_var("POS_RECONCILE_TIMEOUT_MS", "1200");
        std::env::set_var("POS_LOG_DIR", "/tmp/pos-logs");
        let config = Config::from_env();
        std::env::remove_var("POS_RECONCILE_TIMEOUT_MS");
        std::env::remove_var("POS_LOG_DIR");

        let config = config.unwrap();
        assert_eq!(config.reconcile_timeout, Duration::from_millis(1200));
        assert_eq!(config.log_config().log_dir, PathBuf::from("/tmp/pos-logs"));
    }
}
