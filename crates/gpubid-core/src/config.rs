//! Configuration types for gpubid

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Schedule parameters, persisted inside the state document so that a data
/// directory is self-describing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Number of schedulable GPUs
    #[serde(default = "default_num_gpus")]
    pub num_gpus: u32,
    /// Local hour (0-23) at which a logical day begins
    #[serde(default)]
    pub transition_hour: u8,
    /// Fraction of unspent balance carried into the next refill
    #[serde(default = "default_rollover")]
    pub rollover: Decimal,
    /// Fixed credit refund for a voluntary slot release
    #[serde(default = "default_refund")]
    pub refund: Decimal,
    /// Number of open days kept ahead of the executing day
    #[serde(default = "default_planning_horizon")]
    pub planning_horizon_days: u32,
    /// Session lifetime
    #[serde(default = "default_session_ttl")]
    pub session_ttl_seconds: u64,
    /// IANA timezone name for all displayed times and day boundaries
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_num_gpus() -> u32 {
    8
}

fn default_rollover() -> Decimal {
    dec!(0.5)
}

fn default_refund() -> Decimal {
    dec!(0.34)
}

fn default_planning_horizon() -> u32 {
    6
}

fn default_session_ttl() -> u64 {
    12 * 60 * 60
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            num_gpus: default_num_gpus(),
            transition_hour: 0,
            rollover: default_rollover(),
            refund: default_refund(),
            planning_horizon_days: default_planning_horizon(),
            session_ttl_seconds: default_session_ttl(),
            timezone: default_timezone(),
        }
    }
}

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// API server configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DaemonConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::SchedError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::SchedError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::SchedError::Config(format!("Failed to parse config: {}", e)))
    }
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the REST API server
    pub address: String,
    /// Port for the REST API server
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the state document
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log format (json or text)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}
