use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tunables read by the scheduler at the start of every tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub tick_interval_secs: u64,
    pub worker_pool_size: usize,
    /// FAILED jobs older than this are reset to IDLE
    pub recovery_threshold_secs: u64,
    /// Unreleased leases older than this are reaped
    pub stale_lease_secs: u64,
    pub run_timeout_secs: u64,
    /// Warn once a job's consecutive empty runs reach this count
    pub empty_run_warn_threshold: i32,
    /// Window start for jobs without a usable watermark
    pub default_lookback_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            worker_pool_size: 4,
            recovery_threshold_secs: 20 * 60,
            stale_lease_secs: 2 * 60 * 60,
            run_timeout_secs: 30 * 60,
            empty_run_warn_threshold: 5,
            default_lookback_secs: 24 * 60 * 60,
        }
    }
}

impl SchedulerSettings {
    /// Clamp values that would stall or spin the loop.
    pub fn clamped(mut self) -> Self {
        self.tick_interval_secs = self.tick_interval_secs.max(1);
        self.worker_pool_size = self.worker_pool_size.max(1);
        self.run_timeout_secs = self.run_timeout_secs.max(1);
        self.empty_run_warn_threshold = self.empty_run_warn_threshold.max(1);
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn recovery_threshold(&self) -> chrono::Duration {
        secs_to_chrono(self.recovery_threshold_secs)
    }

    pub fn stale_lease_threshold(&self) -> chrono::Duration {
        secs_to_chrono(self.stale_lease_secs)
    }

    pub fn default_lookback(&self) -> chrono::Duration {
        secs_to_chrono(self.default_lookback_secs)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            tick_interval_secs: parse_or(&lookup, "LOADER_TICK_INTERVAL_SECS", defaults.tick_interval_secs)?,
            worker_pool_size: parse_or(&lookup, "LOADER_WORKER_POOL_SIZE", defaults.worker_pool_size)?,
            recovery_threshold_secs: parse_or(
                &lookup,
                "LOADER_RECOVERY_THRESHOLD_SECS",
                defaults.recovery_threshold_secs,
            )?,
            stale_lease_secs: parse_or(&lookup, "LOADER_STALE_LEASE_SECS", defaults.stale_lease_secs)?,
            run_timeout_secs: parse_or(&lookup, "LOADER_RUN_TIMEOUT_SECS", defaults.run_timeout_secs)?,
            empty_run_warn_threshold: parse_or(
                &lookup,
                "LOADER_EMPTY_RUN_WARN_THRESHOLD",
                defaults.empty_run_warn_threshold,
            )?,
            default_lookback_secs: parse_or(
                &lookup,
                "LOADER_DEFAULT_LOOKBACK_SECS",
                defaults.default_lookback_secs,
            )?,
        }
        .clamped())
    }
}

/// Caps at roughly a century so date arithmetic cannot overflow.
fn secs_to_chrono(secs: u64) -> chrono::Duration {
    const MAX_SECS: u64 = 100 * 365 * 24 * 60 * 60;
    chrono::Duration::seconds(secs.min(MAX_SECS) as i64)
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid number")),
        _ => Ok(default),
    }
}

/// Configuration-plan provider.
///
/// Read once per tick, so a swapped plan takes effect on the next tick.
pub trait SettingsProvider: Send + Sync {
    fn current(&self) -> SchedulerSettings;
}

/// Hot-swappable settings shared between the scheduler and an admin surface.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<SchedulerSettings>>,
}

impl SharedSettings {
    pub fn new(settings: SchedulerSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings.clamped())),
        }
    }

    pub fn replace(&self, settings: SchedulerSettings) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = settings.clamped();
    }
}

impl SettingsProvider for SharedSettings {
    fn current(&self) -> SchedulerSettings {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SettingsProvider for SchedulerSettings {
    fn current(&self) -> SchedulerSettings {
        self.clone()
    }
}

/// Identity stamped on every lease this process acquires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HolderIdentity(String);

impl HolderIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Resolve in order: explicit value, `LOADER_HOLDER_ID`, `HOSTNAME`
    /// suffixed with the process id, then a random `worker-<uuid>`.
    pub fn resolve(configured: Option<&str>, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |value: String| {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        };

        if let Some(id) = configured.map(str::to_string).and_then(non_empty) {
            return Self(id);
        }
        if let Some(id) = lookup("LOADER_HOLDER_ID").and_then(non_empty) {
            return Self(id);
        }
        if let Some(host) = lookup("HOSTNAME").and_then(non_empty) {
            return Self(format!("{host}-{}", std::process::id()));
        }
        Self(format!("worker-{}", Uuid::new_v4()))
    }

    pub fn from_env(configured: Option<&str>) -> Self {
        Self::resolve(configured, |key| env::var(key).ok())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Worker process configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub holder_id: Option<String>,
    /// `source_ref -> connection URL`
    pub sources: HashMap<String, String>,
    pub settings: SchedulerSettings,
}

impl WorkerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let sources = match lookup("LOADER_SOURCES") {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .context("LOADER_SOURCES must be a JSON object of source_ref -> URL")?,
            _ => HashMap::new(),
        };

        Ok(Self {
            database_url: lookup("DATABASE_URL").context("DATABASE_URL must be set")?,
            db_max_connections: parse_or(&lookup, "LOADER_DB_MAX_CONNECTIONS", 10)?,
            holder_id: lookup("LOADER_HOLDER_ID"),
            sources,
            settings: SchedulerSettings::from_lookup(&lookup)?,
        })
    }
}
