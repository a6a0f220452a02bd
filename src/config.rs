use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use std::{env, fs, path::PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const SAVE_DEBOUNCE_MS: &str = "FLOW_SAVE_DEBOUNCE_MS";
pub const SAVE_MAX_ATTEMPTS: &str = "FLOW_SAVE_MAX_ATTEMPTS";
pub const SAVE_BACKOFF_MS: &str = "FLOW_SAVE_BACKOFF_MS";
pub const SAVE_MAX_BACKOFF_MS: &str = "FLOW_SAVE_MAX_BACKOFF_MS";
pub const STUDIO_ROOT: &str = "FLOW_STUDIO_ROOT";

/// Key/value configuration source.
#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }

    /// Reads `key` and parses it. Missing keys and unparsable values give `default`.
    pub async fn get_parsed<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr + Display,
        T::Err: Display,
    {
        match self.0.get(key).await {
            None => default,
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(value) => value,
                Err(err) => {
                    warn!(%key, value = %raw, %err, fallback = %default, "ignoring unparsable config value");
                    default
                }
            },
        }
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded from a `.env` file when one exists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(err) => warn!("could not parse {}: {err}", env_file.display()),
            }
        } else {
            debug!("no .env at {}, using the process environment", env_file.display());
        }

        Box::new(Self { env_file })
    }

    /// Rewrites the `.env` file, replacing or dropping the line for `key`.
    fn rewrite_env_file(&self, key: &str, value: Option<&str>) -> std::io::Result<()> {
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        let mut found = false;
        let mut lines: Vec<String> = Vec::new();

        for line in content.lines() {
            let is_key = line.split_once('=').is_some_and(|(k, _)| k.trim() == key);
            if !is_key {
                lines.push(line.to_string());
                continue;
            }
            found = true;
            if let Some(value) = value {
                lines.push(format!("{key}={value}"));
            }
        }
        if let (false, Some(value)) = (found, value) {
            lines.push(format!("{key}={value}"));
        }

        fs::write(&self.env_file, lines.join("\n"))
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        unsafe {
            env::set_var(key, value);
        };
        self.rewrite_env_file(key, Some(value))
            .map_err(|e| e.to_string())
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if self.env_file.exists() {
            if let Err(err) = self.rewrite_env_file(key, None) {
                warn!("could not update {}: {err}", self.env_file.display());
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory configuration, mostly for tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// How failed saves are retried. Conflicts are never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero behaves like one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(8000),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Wait before attempt `failed + 1`, doubling from `initial_backoff` up to `max_backoff`.
    pub fn backoff(&self, failed: u32) -> Duration {
        let exp = failed.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

/// Timing knobs of a [`FlowEditingSession`](crate::flow::session::FlowEditingSession).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Quiet period after the last edit before the flow is saved.
    pub debounce: Duration,
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            retry: RetryPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub async fn from_config(config: &ConfigManager) -> Self {
        let defaults = Self::default();
        let millis = |d: Duration| d.as_millis() as u64;

        let debounce = config
            .get_parsed(SAVE_DEBOUNCE_MS, millis(defaults.debounce))
            .await;
        let max_attempts = config
            .get_parsed(SAVE_MAX_ATTEMPTS, defaults.retry.max_attempts)
            .await;
        let initial_backoff = config
            .get_parsed(SAVE_BACKOFF_MS, millis(defaults.retry.initial_backoff))
            .await;
        let max_backoff = config
            .get_parsed(SAVE_MAX_BACKOFF_MS, millis(defaults.retry.max_backoff))
            .await;

        Self {
            debounce: Duration::from_millis(debounce),
            retry: RetryPolicy {
                max_attempts: max_attempts.max(1),
                initial_backoff: Duration::from_millis(initial_backoff),
                max_backoff: Duration::from_millis(max_backoff.max(initial_backoff)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::{TempDir, tempdir};

    #[tokio::test]
    async fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::new();

        mgr.set("foo", "bar").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("bar".to_string()));

        mgr.set("foo", "baz").await.unwrap();
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));
        assert_eq!(mgr.keys().await, vec!["foo".to_string()]);

        mgr.del("foo").await;
        assert_eq!(mgr.get("foo").await, None);
    }

    #[tokio::test]
    async fn test_session_config_defaults() {
        let config = ConfigManager(MapConfigManager::new());
        assert_eq!(SessionConfig::from_config(&config).await, SessionConfig::default());
    }

    #[tokio::test]
    async fn test_session_config_overrides() {
        let config = ConfigManager(
            MapConfigManager::new()
                .with(SAVE_DEBOUNCE_MS, "250")
                .with(SAVE_MAX_ATTEMPTS, "5")
                .with(SAVE_BACKOFF_MS, " 100 ")
                .with(SAVE_MAX_BACKOFF_MS, "not-a-number"),
        );
        let session = SessionConfig::from_config(&config).await;

        assert_eq!(session.debounce, Duration::from_millis(250));
        assert_eq!(session.retry.max_attempts, 5);
        assert_eq!(session.retry.initial_backoff, Duration::from_millis(100));
        assert_eq!(session.retry.max_backoff, Duration::from_millis(8000));
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(3000),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff(4), Duration::from_millis(3000));
        assert_eq!(policy.backoff(40), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_env_config_manager_set_and_delete() {
        let key = "FLOW_STUDIO_TEST_SET_DELETE";
        let tmp = TempDir::new().unwrap();
        let env = tmp.path().join(".env");
        write(&env, "OTHER=1\n").unwrap();

        let mgr = EnvConfigManager::new(env.clone());
        mgr.set(key, "secret").await.unwrap();
        assert_eq!(mgr.get(key).await, Some("secret".to_string()));
        let content = std::fs::read_to_string(&env).unwrap();
        assert!(content.contains("OTHER=1"));
        assert!(content.contains(&format!("{key}=secret")));

        mgr.del(key).await;
        assert_eq!(std::env::var(key).ok(), None);
        assert!(!std::fs::read_to_string(&env).unwrap().contains(key));
    }

    #[tokio::test]
    async fn test_env_config_manager_with_temp_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "FLOW_STUDIO_TEST_DEBOUNCE=42\n").unwrap();

        let config = ConfigManager(EnvConfigManager::new(env_path));
        let value: u64 = config.get_parsed("FLOW_STUDIO_TEST_DEBOUNCE", 0).await;
        assert_eq!(value, 42);
    }
}
