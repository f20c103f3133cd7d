use std::env;
use std::path::PathBuf;
use std::time::Duration;

use linkmark_core::snapshot::SnapshotConfig;

/// Server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 4040)
    pub port: u16,
    /// Database file path (default: ./linkmark_sync.db)
    pub database_path: PathBuf,
    /// Accepted operations between snapshots (default: 2000)
    pub snapshot_threshold: u64,
    /// Snapshots kept per account (default: 3)
    pub snapshot_retention: usize,
    /// Tombstone retention window in days (default: 30)
    pub tombstone_retention_days: i64,
    /// Per-device outbound broadcast queue bound (default: 256)
    pub broadcast_capacity: usize,
    /// Static connection token; None trusts the fronting gateway
    pub shared_token: Option<String>,
    /// CORS allowed origins (comma-separated)
    pub cors_origins: Vec<String>,
    /// Snapshot maintenance period (default: 1 hour)
    pub maintenance_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "4040".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_path = PathBuf::from(
            env::var("DATABASE_PATH").unwrap_or_else(|_| "./linkmark_sync.db".to_string()),
        );

        let snapshot_threshold = env::var("SNAPSHOT_THRESHOLD")
            .unwrap_or_else(|_| "2000".to_string())
            .parse()
            .unwrap_or(2000);

        let snapshot_retention = env::var("SNAPSHOT_RETENTION")
            .unwrap_or_else(|_| "3".to_string())
            .parse()
            .unwrap_or(3);

        let tombstone_retention_days = env::var("TOMBSTONE_RETENTION_DAYS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .unwrap_or(30);

        let broadcast_capacity = env::var("BROADCAST_CAPACITY")
            .unwrap_or_else(|_| "256".to_string())
            .parse()
            .unwrap_or(256);

        let shared_token = env::var("SHARED_TOKEN").ok().filter(|t| !t.is_empty());

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let maintenance_interval = Duration::from_secs(
            env::var("MAINTENANCE_INTERVAL_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .unwrap_or(3600),
        );

        Ok(Config {
            host,
            port,
            database_path,
            snapshot_threshold,
            snapshot_retention,
            tombstone_retention_days,
            broadcast_capacity,
            shared_token,
            cors_origins,
            maintenance_interval,
        })
    }

    /// Get the server address
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Snapshot tuning for the core snapshot manager
    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig {
            threshold: self.snapshot_threshold,
            retention: self.snapshot_retention,
            tombstone_retention_ms: self.tombstone_retention_days * 24 * 60 * 60 * 1000,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "Invalid PORT environment variable"),
        }
    }
}

impl std::error::Error for ConfigError {}
