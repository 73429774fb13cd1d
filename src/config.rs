//! Configuration management for graphvault
//!
//! All configurable parameters in one place with environment variable
//! overrides. Sensible defaults, configurable in production.

use std::env;
use std::path::PathBuf;
use tracing::info;

use crate::errors::{BackupError, Result};

/// Backup core configuration loaded from environment with defaults
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Root directory for the filesystem blob store (default: ./graphvault_data)
    pub data_dir: PathBuf,

    /// Key prefix under which all backup objects live (default: graphvault)
    pub prefix: String,

    /// Incremental sync interval in seconds (default: 60)
    pub sync_interval_secs: u64,

    /// Whether the periodic full-backup task runs (default: true)
    pub full_backup_enabled: bool,

    /// Full backup interval in seconds (default: 3600 = 1 hour)
    pub full_backup_interval_secs: u64,

    /// Manual backup retention in days (default: 30)
    pub manual_retention_days: i64,

    /// Scheduled backup retention in days (default: 90)
    pub scheduled_retention_days: i64,

    /// Whether running in production mode
    pub is_production: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./graphvault_data"),
            prefix: "graphvault".to_string(),
            sync_interval_secs: 60,
            full_backup_enabled: true,
            full_backup_interval_secs: 3600,
            manual_retention_days: 30,
            scheduled_retention_days: 90,
            is_production: false,
        }
    }
}

impl BackupConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.is_production = env::var("GRAPHVAULT_ENV")
            .map(|v| {
                let v = v.to_lowercase();
                v == "production" || v == "prod"
            })
            .unwrap_or(false);

        if let Ok(val) = env::var("GRAPHVAULT_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("GRAPHVAULT_PREFIX") {
            config.prefix = val;
        }

        if let Ok(val) = env::var("GRAPHVAULT_SYNC_INTERVAL") {
            if let Ok(n) = val.parse() {
                config.sync_interval_secs = n;
            }
        }

        if let Ok(val) = env::var("GRAPHVAULT_FULL_BACKUP_ENABLED") {
            config.full_backup_enabled = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = env::var("GRAPHVAULT_FULL_BACKUP_INTERVAL") {
            if let Ok(n) = val.parse() {
                config.full_backup_interval_secs = n;
            }
        }

        if let Ok(val) = env::var("GRAPHVAULT_MANUAL_RETENTION_DAYS") {
            if let Ok(n) = val.parse::<i64>() {
                config.manual_retention_days = n.max(1);
            }
        }

        if let Ok(val) = env::var("GRAPHVAULT_SCHEDULED_RETENTION_DAYS") {
            if let Ok(n) = val.parse::<i64>() {
                config.scheduled_retention_days = n.max(1);
            }
        }

        config
    }

    /// Validate the configuration. Fatal at worker construction time only.
    pub fn validate(&self) -> Result<()> {
        if self.prefix.trim().is_empty() {
            return Err(BackupError::Configuration(
                "backup key prefix must not be empty".to_string(),
            ));
        }
        if self.prefix.starts_with('/') || self.prefix.ends_with('/') {
            return Err(BackupError::Configuration(format!(
                "backup key prefix must not start or end with '/': {}",
                self.prefix
            )));
        }
        if self.sync_interval_secs == 0 {
            return Err(BackupError::Configuration(
                "sync interval must be at least 1 second".to_string(),
            ));
        }
        if self.full_backup_enabled && self.full_backup_interval_secs == 0 {
            return Err(BackupError::Configuration(
                "full backup interval must be at least 1 second".to_string(),
            ));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(BackupError::Configuration(
                "data directory must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Log the current configuration
    pub fn log(&self) {
        info!("Configuration:");
        info!(
            "   Mode: {}",
            if self.is_production {
                "PRODUCTION"
            } else {
                "Development"
            }
        );
        info!("   Data dir: {:?}", self.data_dir);
        info!("   Key prefix: {}", self.prefix);
        info!("   Sync interval: {}s", self.sync_interval_secs);
        if self.full_backup_enabled {
            info!(
                "   Full backup: enabled (every {}s)",
                self.full_backup_interval_secs
            );
        } else {
            info!("   Full backup: disabled");
        }
        info!(
            "   Retention: manual {}d, scheduled {}d, deletions never",
            self.manual_retention_days, self.scheduled_retention_days
        );
    }
}

/// Environment variable documentation
pub fn print_env_help() {
    println!("graphvault Configuration Environment Variables:");
    println!();
    println!("  GRAPHVAULT_ENV                      - Set to 'production' or 'prod' for production mode");
    println!("  GRAPHVAULT_DATA_DIR                 - Blob store root directory (default: ./graphvault_data)");
    println!("  GRAPHVAULT_PREFIX                   - Backup key prefix (default: graphvault)");
    println!("  GRAPHVAULT_SYNC_INTERVAL            - Incremental sync interval seconds (default: 60)");
    println!("  GRAPHVAULT_FULL_BACKUP_ENABLED      - Enable periodic full backups true/false (default: true)");
    println!("  GRAPHVAULT_FULL_BACKUP_INTERVAL     - Full backup interval seconds (default: 3600)");
    println!("  GRAPHVAULT_MANUAL_RETENTION_DAYS    - Manual backup retention days (default: 30)");
    println!("  GRAPHVAULT_SCHEDULED_RETENTION_DAYS - Scheduled backup retention days (default: 90)");
    println!();
    println!("  RUST_LOG                            - Log level (e.g., info, debug, trace)");
    println!();
}
