use serde::{Deserialize, Serialize};
use std::fs;

use crate::ledger::entities::RailKind;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub log_dir: String,
    pub log_file: String,
    pub use_json: bool,
    pub rotation: String,
    pub postgres_url: String,
    #[serde(default)]
    pub cores: Vec<CoreConfig>,
}

/// One rail instance to reconcile against.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CoreConfig {
    pub name: String,
    pub core_type: String,
    pub rail_kind: RailKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_min_confirms")]
    pub min_confirms: i32,
    /// Seconds before the first pass iteration; defaults per rail kind
    #[serde(default)]
    pub startup_delay_secs: Option<u64>,
    #[serde(default = "default_process_interval")]
    pub process_interval_secs: u64,
    #[serde(default = "default_hour")]
    pub recovery_delay_secs: u64,
    #[serde(default = "default_hour")]
    pub retry_balance_delay_secs: u64,
    #[serde(default = "default_hour")]
    pub retry_unconfirmed_delay_secs: u64,
    #[serde(default = "default_max_internal_attempts")]
    pub max_internal_attempts: i32,
    #[serde(default = "default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: u64,
}

fn default_enabled() -> bool {
    true
}
fn default_min_confirms() -> i32 {
    3
}
fn default_process_interval() -> u64 {
    10
}
fn default_hour() -> u64 {
    3600
}
fn default_max_internal_attempts() -> i32 {
    10
}
fn default_batch_size() -> i64 {
    1000
}
fn default_snapshot_every() -> u64 {
    60
}

impl AppConfig {
    pub fn load(env: &str) -> Self {
        let config_path = format!("config/{}.yaml", env);
        let content = fs::read_to_string(&config_path)
            .unwrap_or_else(|_| panic!("Failed to read config file: {}", config_path));
        serde_yaml::from_str(&content).expect("Failed to parse config yaml")
    }
}

impl CoreConfig {
    /// Timings for this core, with per-rail-kind defaults where the
    /// file stays silent.
    pub fn timings(&self) -> crate::reconciler::CoreTimings {
        use std::time::Duration;
        let mut t = crate::reconciler::CoreTimings::for_kind(self.rail_kind);
        if let Some(secs) = self.startup_delay_secs {
            t.startup_delay = Duration::from_secs(secs);
        }
        t.process_interval = Duration::from_secs(self.process_interval_secs);
        t.recovery_delay = Duration::from_secs(self.recovery_delay_secs);
        t.retry_balance_delay = Duration::from_secs(self.retry_balance_delay_secs);
        t.retry_unconfirmed_delay = Duration::from_secs(self.retry_unconfirmed_delay_secs);
        t.max_internal_attempts = self.max_internal_attempts;
        t.batch_size = self.batch_size;
        t.snapshot_every = self.snapshot_every;
        t
    }
}
