//! Sync settings shared by every client embedding the core.
//!
//! Settings come from an optional JSON file, then `SHOPSYNC_*` environment
//! variables override individual fields. Every field has a default so an empty
//! file (or no file at all) yields a working offline-only configuration.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::{EntityType, ResolutionStrategy};
use crate::queue::{QueueConfig, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, DEFAULT_MAX_RETRIES};
use crate::resolver::{ConflictResolver, ResolverConfig};
use crate::sync::{
    HttpRemote, OrchestratorConfig, StaticToken, DEFAULT_BATCH_SIZE, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_SYNC_INTERVAL,
};
use crate::util::{is_http_url, normalize_text_option};
use crate::{Error, Result};

pub const ENV_REMOTE_URL: &str = "SHOPSYNC_REMOTE_URL";
pub const ENV_AUTH_TOKEN: &str = "SHOPSYNC_AUTH_TOKEN";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "SHOPSYNC_REQUEST_TIMEOUT_SECS";
pub const ENV_SYNC_INTERVAL_SECS: &str = "SHOPSYNC_SYNC_INTERVAL_SECS";
pub const ENV_BATCH_SIZE: &str = "SHOPSYNC_BATCH_SIZE";
pub const ENV_MAX_RETRIES: &str = "SHOPSYNC_MAX_RETRIES";

#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncSettings {
    /// Base URL of the remote sync service; `None` keeps the client offline
    pub remote_base_url: Option<String>,
    /// Bearer token for the remote; prefer the environment over the file
    pub auth_token: Option<String>,
    pub request_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub batch_size: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_cap_secs: u64,
    /// Entity types pulled every pass
    pub tracked_types: Vec<EntityType>,
    /// Conflict strategy overrides per type
    pub strategies: BTreeMap<EntityType, ResolutionStrategy>,
    /// Drain tier overrides per type
    pub priorities: BTreeMap<EntityType, u8>,
    /// Field-name regexes that keep the local value under `merge`
    pub always_local_fields: BTreeMap<EntityType, Vec<String>>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            remote_base_url: None,
            auth_token: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT.as_secs(),
            sync_interval_secs: DEFAULT_SYNC_INTERVAL.as_secs(),
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_ms: u64::try_from(DEFAULT_BACKOFF_BASE.as_millis()).unwrap_or(500),
            backoff_cap_secs: DEFAULT_BACKOFF_CAP.as_secs(),
            tracked_types: EntityType::ALL.to_vec(),
            strategies: BTreeMap::new(),
            priorities: BTreeMap::new(),
            always_local_fields: BTreeMap::new(),
        }
    }
}

impl fmt::Debug for SyncSettings {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("SyncSettings")
            .field("remote_base_url", &self.remote_base_url)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("sync_interval_secs", &self.sync_interval_secs)
            .field("batch_size", &self.batch_size)
            .field("max_retries", &self.max_retries)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("backoff_cap_secs", &self.backoff_cap_secs)
            .field("tracked_types", &self.tracked_types)
            .field("strategies", &self.strategies)
            .field("priorities", &self.priorities)
            .field("always_local_fields", &self.always_local_fields)
            .finish()
    }
}

impl SyncSettings {
    /// Parse settings from JSON text
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|error| Error::Config(format!("invalid settings JSON: {error}")))
    }

    /// Read settings from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                tracing::debug!("Loaded sync settings from {}", path.display());
                Self::from_json(&raw)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(error.into()),
        }
    }

    /// Apply `SHOPSYNC_*` overrides from the process environment
    pub fn with_env(self) -> Result<Self> {
        let values: HashMap<String, String> = std::env::vars().collect();
        self.with_lookup(|name| values.get(name).cloned())
    }

    /// Apply overrides from an arbitrary variable lookup, then validate
    pub fn with_lookup(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = optional_trimmed(&lookup, ENV_REMOTE_URL) {
            self.remote_base_url = Some(url);
        }
        if let Some(token) = optional_trimmed(&lookup, ENV_AUTH_TOKEN) {
            self.auth_token = Some(token);
        }
        if let Some(value) = parse_optional(&lookup, ENV_REQUEST_TIMEOUT_SECS)? {
            self.request_timeout_secs = value;
        }
        if let Some(value) = parse_optional(&lookup, ENV_SYNC_INTERVAL_SECS)? {
            self.sync_interval_secs = value;
        }
        if let Some(value) = parse_optional(&lookup, ENV_BATCH_SIZE)? {
            self.batch_size = value;
        }
        if let Some(value) = parse_optional(&lookup, ENV_MAX_RETRIES)? {
            self.max_retries = value;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(url) = normalize_text_option(self.remote_base_url.clone()) {
            if !is_http_url(&url) {
                return Err(Error::Config(
                    "remote_base_url must start with http:// or https://".to_string(),
                ));
            }
        }
        for (name, value) in [
            ("request_timeout_secs", self.request_timeout_secs),
            ("sync_interval_secs", self.sync_interval_secs),
            ("backoff_cap_secs", self.backoff_cap_secs),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than zero".to_string()));
        }
        if self.max_retries == 0 {
            return Err(Error::Config("max_retries must be greater than zero".to_string()));
        }
        if self.tracked_types.is_empty() {
            return Err(Error::Config("tracked_types must not be empty".to_string()));
        }
        ConflictResolver::new(&self.resolver_config())?;
        Ok(())
    }

    /// Remote URL, when one is configured
    pub fn remote_base_url(&self) -> Option<String> {
        normalize_text_option(self.remote_base_url.clone())
    }

    pub fn credentials(&self) -> Option<StaticToken> {
        normalize_text_option(self.auth_token.clone()).map(StaticToken::new)
    }

    /// HTTP client for the configured remote.
    ///
    /// Without a token every call fails as unauthorized, which sync passes
    /// treat as transient.
    pub fn http_remote(&self) -> Result<HttpRemote> {
        let base_url = self.remote_base_url().ok_or_else(|| {
            Error::Config(format!(
                "no remote configured; set remote_base_url or {ENV_REMOTE_URL}"
            ))
        })?;
        let credentials = self
            .credentials()
            .unwrap_or_else(|| StaticToken::new(String::new()));
        Ok(HttpRemote::new(
            base_url,
            self.request_timeout(),
            Arc::new(credentials),
        )?)
    }

    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_retries: self.max_retries,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_cap: Duration::from_secs(self.backoff_cap_secs),
            priorities: self.priorities.iter().map(|(k, v)| (*k, *v)).collect(),
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            strategies: self.strategies.iter().map(|(k, v)| (*k, *v)).collect(),
            always_local: self
                .always_local_fields
                .iter()
                .map(|(k, v)| (*k, v.clone()))
                .collect(),
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut tracked_types = Vec::with_capacity(self.tracked_types.len());
        for entity_type in &self.tracked_types {
            if !tracked_types.contains(entity_type) {
                tracked_types.push(*entity_type);
            }
        }
        OrchestratorConfig {
            sync_interval: Duration::from_secs(self.sync_interval_secs),
            request_timeout: self.request_timeout(),
            batch_size: self.batch_size,
            tracked_types,
        }
    }
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    normalize_text_option(lookup(name))
}

fn parse_optional<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>> {
    optional_trimmed(lookup, name)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|_| Error::Config(format!("{name} must be a non-negative integer")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let values: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| values.get(name).cloned()
    }

    #[test]
    fn empty_json_uses_defaults() {
        let settings = SyncSettings::from_json("{}").unwrap();
        assert_eq!(settings, SyncSettings::default());
        assert_eq!(settings.orchestrator_config().tracked_types.len(), 8);
        assert_eq!(settings.queue_config(), QueueConfig::default());
    }

    #[test]
    fn parses_per_type_maps() {
        let settings = SyncSettings::from_json(
            r#"{
                "remote_base_url": "https://erp.example.com/api",
                "strategies": {"invoice": "manual", "bay": "local-wins"},
                "priorities": {"customer": 1},
                "always_local_fields": {"service_order": ["^notes$", "^draft_"]}
            }"#,
        )
        .unwrap();
        settings.validate().unwrap();

        let resolver = ConflictResolver::new(&settings.resolver_config()).unwrap();
        assert_eq!(
            resolver.strategy_for(EntityType::Invoice),
            ResolutionStrategy::Manual
        );
        assert_eq!(
            settings
                .queue_config()
                .priority_for(crate::models::OperationKind::Update, EntityType::Customer),
            1
        );
        assert_eq!(
            settings.remote_base_url().as_deref(),
            Some("https://erp.example.com/api")
        );
    }

    #[test]
    fn rejects_unknown_fields_and_types() {
        assert!(SyncSettings::from_json(r#"{"remote_url": "x"}"#).is_err());
        assert!(SyncSettings::from_json(r#"{"strategies": {"spaceship": "merge"}}"#).is_err());
    }

    #[test]
    fn env_overrides_file_values() {
        let settings = SyncSettings {
            remote_base_url: Some("https://file.example.com".to_string()),
            ..SyncSettings::default()
        }
        .with_lookup(lookup(&[
            (ENV_REMOTE_URL, " https://env.example.com "),
            (ENV_AUTH_TOKEN, "secret"),
            (ENV_BATCH_SIZE, "10"),
            (ENV_MAX_RETRIES, "5"),
        ]))
        .unwrap();

        assert_eq!(
            settings.remote_base_url.as_deref(),
            Some("https://env.example.com")
        );
        assert_eq!(settings.batch_size, 10);
        assert_eq!(settings.queue_config().max_retries, 5);
        assert!(settings.credentials().is_some());
    }

    #[test]
    fn invalid_env_values_are_config_errors() {
        let result = SyncSettings::default().with_lookup(lookup(&[(ENV_BATCH_SIZE, "lots")]));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = SyncSettings::default().with_lookup(lookup(&[(ENV_BATCH_SIZE, "0")]));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = SyncSettings::default().with_lookup(lookup(&[(ENV_REMOTE_URL, "erp.local")]));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn invalid_merge_pattern_fails_validation() {
        let settings = SyncSettings::from_json(r#"{"always_local_fields": {"customer": ["("]}}"#)
            .unwrap();
        assert!(matches!(settings.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn debug_redacts_auth_token() {
        let settings = SyncSettings {
            auth_token: Some("super-secret".to_string()),
            ..SyncSettings::default()
        };
        let debug = format!("{settings:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = SyncSettings::load(&tmp.path().join("missing.json")).unwrap();
        assert_eq!(settings, SyncSettings::default());

        let path = tmp.path().join("settings.json");
        std::fs::write(&path, r#"{"sync_interval_secs": 15}"#).unwrap();
        assert_eq!(SyncSettings::load(&path).unwrap().sync_interval_secs, 15);
    }

    #[test]
    fn http_remote_requires_base_url() {
        assert!(matches!(
            SyncSettings::default().http_remote(),
            Err(Error::Config(_))
        ));

        let settings = SyncSettings {
            remote_base_url: Some("https://erp.example.com/".to_string()),
            ..SyncSettings::default()
        };
        assert_eq!(
            settings.http_remote().unwrap().base_url(),
            "https://erp.example.com"
        );
    }

    #[test]
    fn orchestrator_config_dedupes_tracked_types() {
        let settings = SyncSettings {
            tracked_types: vec![EntityType::Bay, EntityType::Bay, EntityType::Customer],
            ..SyncSettings::default()
        };
        assert_eq!(
            settings.orchestrator_config().tracked_types,
            vec![EntityType::Bay, EntityType::Customer]
        );
    }
}
