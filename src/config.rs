//! Sync configuration and the explicit session handle.
//!
//! Values come from the process environment first and fall back to the
//! `local_settings` table (category `sync`), so a device that was configured
//! once keeps working without the variables exported.

use std::path::PathBuf;
use tracing::{info, warn};

use crate::db::{self, DbState};
use crate::error::{Error, Result};

const SETTINGS_CATEGORY: &str = "sync";

const ENV_API_URL: &str = "VAN_SALES_API_URL";
const ENV_COMPANY_ID: &str = "VAN_SALES_COMPANY_ID";
const ENV_SITE_ID: &str = "VAN_SALES_SITE_ID";
const ENV_DATA_DIR: &str = "VAN_SALES_DATA_DIR";
const ENV_SYNC_INTERVAL: &str = "VAN_SALES_SYNC_INTERVAL_SECS";

const KEY_API_URL: &str = "api_url";
const KEY_COMPANY_ID: &str = "company_id";
const KEY_SITE_ID: &str = "site_id";

pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_MAX_RETRIES: i64 = 5;

/// Remote endpoint and tenant identity used by the master-data sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub base_url: String,
    pub company_id: String,
    pub site_id: String,
    pub data_dir: PathBuf,
    pub sync_interval_secs: u64,
    pub max_retries: i64,
}

impl SyncConfig {
    pub fn new(base_url: &str, company_id: &str, site_id: &str) -> Result<Self> {
        let base_url = crate::api::normalize_base_url(base_url);
        let company_id = company_id.trim().to_string();
        let site_id = site_id.trim().to_string();
        if base_url.is_empty() {
            return Err(Error::Config("remote base URL is not set".into()));
        }
        if company_id.is_empty() {
            return Err(Error::Config("company identifier is not set".into()));
        }
        if site_id.is_empty() {
            return Err(Error::Config("site identifier is not set".into()));
        }
        Ok(Self {
            base_url,
            company_id,
            site_id,
            data_dir: default_data_dir(),
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    /// Build the config from environment variables only.
    pub fn from_env() -> Result<Self> {
        let base_url = env_value(ENV_API_URL)
            .ok_or_else(|| Error::Config(format!("{ENV_API_URL} is not set")))?;
        let company_id = env_value(ENV_COMPANY_ID)
            .ok_or_else(|| Error::Config(format!("{ENV_COMPANY_ID} is not set")))?;
        let site_id = env_value(ENV_SITE_ID)
            .ok_or_else(|| Error::Config(format!("{ENV_SITE_ID} is not set")))?;
        Ok(Self::new(&base_url, &company_id, &site_id)?.with_env_overrides())
    }

    /// Environment first, then values persisted in `local_settings`.
    pub fn resolve(db: &DbState) -> Result<Self> {
        let conn = db.conn.lock()?;
        let lookup = |env_key: &str, setting_key: &str| {
            env_value(env_key).or_else(|| db::get_setting(&conn, SETTINGS_CATEGORY, setting_key))
        };
        let base_url = lookup(ENV_API_URL, KEY_API_URL)
            .ok_or_else(|| Error::Config(format!("{ENV_API_URL} is not set")))?;
        let company_id = lookup(ENV_COMPANY_ID, KEY_COMPANY_ID)
            .ok_or_else(|| Error::Config(format!("{ENV_COMPANY_ID} is not set")))?;
        let site_id = lookup(ENV_SITE_ID, KEY_SITE_ID)
            .ok_or_else(|| Error::Config(format!("{ENV_SITE_ID} is not set")))?;
        drop(conn);
        Ok(Self::new(&base_url, &company_id, &site_id)?.with_env_overrides())
    }

    /// Store the remote identity so later runs can resolve it without env.
    pub fn persist(&self, db: &DbState) -> Result<()> {
        let conn = db.conn.lock()?;
        db::with_transaction(&conn, |tx| {
            db::set_setting(tx, SETTINGS_CATEGORY, KEY_API_URL, &self.base_url)?;
            db::set_setting(tx, SETTINGS_CATEGORY, KEY_COMPANY_ID, &self.company_id)?;
            db::set_setting(tx, SETTINGS_CATEGORY, KEY_SITE_ID, &self.site_id)
        })?;
        info!(company_id = %self.company_id, site_id = %self.site_id, "sync config persisted");
        Ok(())
    }

    fn with_env_overrides(mut self) -> Self {
        self.data_dir = data_dir_from_env();
        if let Some(raw) = env_value(ENV_SYNC_INTERVAL) {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => self.sync_interval_secs = secs,
                _ => warn!(value = %raw, "ignoring invalid {ENV_SYNC_INTERVAL}"),
            }
        }
        self
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

/// Data directory from `VAN_SALES_DATA_DIR`, or `./data`.
///
/// Needed before the database (and therefore [`SyncConfig::resolve`]) exists.
pub fn data_dir_from_env() -> PathBuf {
    env_value(ENV_DATA_DIR)
        .map(PathBuf::from)
        .unwrap_or_else(default_data_dir)
}

/// Who is acting and which van is selected.
///
/// Passed explicitly into every operation that needs it instead of living in
/// a process-wide singleton.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: String,
    pub van_id: Option<String>,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            van_id: None,
        }
    }

    pub fn with_van(mut self, van_id: impl Into<String>) -> Self {
        self.van_id = Some(van_id.into());
        self
    }

    /// The selected van, or a validation error when none is selected.
    pub fn require_van(&self) -> Result<&str> {
        self.van_id
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::validation("Please select a van"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            ENV_API_URL,
            ENV_COMPANY_ID,
            ENV_SITE_ID,
            ENV_DATA_DIR,
            ENV_SYNC_INTERVAL,
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_requires_all_identity_values() {
        clear_env();
        std::env::set_var(ENV_API_URL, "api.example.com/");
        std::env::set_var(ENV_COMPANY_ID, "C1");
        let err = SyncConfig::from_env().unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        std::env::set_var(ENV_SITE_ID, "S1");
        std::env::set_var(ENV_SYNC_INTERVAL, "12");
        let cfg = SyncConfig::from_env().expect("config");
        assert_eq!(cfg.base_url, "https://api.example.com");
        assert_eq!(cfg.company_id, "C1");
        assert_eq!(cfg.sync_interval_secs, 12);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_resolve_falls_back_to_local_settings() {
        clear_env();
        let db = DbState::open_in_memory().unwrap();
        assert!(matches!(SyncConfig::resolve(&db), Err(Error::Config(_))));

        let cfg = SyncConfig::new("http://localhost:8080/api/", "C9", "S9").unwrap();
        cfg.persist(&db).unwrap();

        let resolved = SyncConfig::resolve(&db).expect("resolved");
        assert_eq!(resolved.base_url, "http://localhost:8080/api");
        assert_eq!(resolved.company_id, "C9");

        std::env::set_var(ENV_COMPANY_ID, "C-ENV");
        let resolved = SyncConfig::resolve(&db).expect("resolved");
        assert_eq!(resolved.company_id, "C-ENV");
        clear_env();
    }

    #[test]
    fn test_session_requires_selected_van() {
        let session = Session::new("salesman-1");
        assert!(matches!(session.require_van(), Err(Error::Validation(_))));
        let session = session.with_van("VAN-07");
        assert_eq!(session.require_van().unwrap(), "VAN-07");
        assert!(Session::new("u").with_van("  ").require_van().is_err());
    }
}
