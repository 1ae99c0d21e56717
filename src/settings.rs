//! Configuration collaborator
//!
//! Providers and the ledger call `SettingsStore::current()` on every request,
//! so a credential or limit change takes effect on the next call.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};

use crate::db::Database;
use crate::logging;
use crate::orchestrator::ModePolicy;

pub const DEFAULT_BASE_URL: &str = "https://api.deepseek.com";
pub const DEFAULT_MODEL: &str = "deepseek-chat";

const SETTINGS_KEY: &str = "analysis";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub monthly_unit_limit: u64,
    pub single_request_limit: u32,
    pub mode: ModePolicy,
    pub enable_auto_fallback: bool,
    pub enable_usage_alert: bool,
    pub usage_alert_threshold: u32, // percent of the monthly limit
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            monthly_unit_limit: 10_000,
            single_request_limit: 2_000,
            mode: ModePolicy::Automatic,
            enable_auto_fallback: true,
            enable_usage_alert: true,
            usage_alert_threshold: 80,
            request_timeout_secs: 60,
        }
    }
}

impl Settings {
    /// Credential present and not blank
    pub fn is_remote_configured(&self) -> bool {
        self.api_key
            .as_deref()
            .map(|k| !k.trim().is_empty())
            .unwrap_or(false)
    }

    /// Endpoint URL under the configured base, tolerating a trailing slash
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

pub struct SettingsStore {
    db: Option<Arc<Database>>,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// Load settings from storage, falling back to defaults on a missing or unreadable row
    pub fn load(db: Arc<Database>) -> Self {
        let settings = match db.load_setting(SETTINGS_KEY) {
            Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
                logging::log_error(None, &format!("Stored settings unreadable, using defaults: {}", e));
                Settings::default()
            }),
            Ok(None) => Settings::default(),
            Err(e) => {
                logging::log_error(None, &format!("Failed to load settings: {}", e));
                Settings::default()
            }
        };

        Self {
            db: Some(db),
            current: RwLock::new(settings),
        }
    }

    /// Settings held only in memory
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            db: None,
            current: RwLock::new(settings),
        }
    }

    /// Snapshot of the current settings
    pub fn current(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply a change and persist it. A failed write is logged; the in-memory
    /// value still changes.
    pub fn update<F>(&self, f: F) -> Settings
    where
        F: FnOnce(&mut Settings),
    {
        let snapshot = {
            let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut *guard);
            guard.clone()
        };

        if let Some(db) = &self.db {
            let persisted = serde_json::to_string(&snapshot)
                .map_err(|e| e.to_string())
                .and_then(|json| db.save_setting(SETTINGS_KEY, &json).map_err(|e| e.to_string()));
            if let Err(e) = persisted {
                logging::log_error(None, &format!("Failed to persist settings: {}", e));
            }
        }

        snapshot
    }

    pub fn set_api_key(&self, api_key: Option<&str>) -> Settings {
        self.update(|s| s.api_key = api_key.map(str::to_string))
    }
}
