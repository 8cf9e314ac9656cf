//! TOML configuration for trafficlens.
//!
//! Every section has compiled-in defaults; a config file only needs the keys
//! it wants to change.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::{DetectOptions, DEFAULT_MARGIN, DEFAULT_MAX_COUNT, MIN_GAP, MIN_POINTS};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "TRAFFICLENS_CONFIG";
const SYSTEM_CONFIG_PATH: &str = "/etc/trafficlens/trafficlens.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub investigation: InvestigationConfig,
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration, in order:
    /// 1. `explicit` (a `--config` argument); an unreadable file here is an error.
    /// 2. The path in `TRAFFICLENS_CONFIG`.
    /// 3. `/etc/trafficlens/trafficlens.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(&env_path);
            match Self::load(&path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "TRAFFICLENS_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Series shorter than this are not analysed.
    pub min_points: usize,
    pub start_margin: usize,
    pub end_margin: usize,
    pub min_gap: usize,
    /// Default number of anomalies to report.
    pub max_count: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_points: MIN_POINTS,
            start_margin: DEFAULT_MARGIN,
            end_margin: DEFAULT_MARGIN,
            min_gap: MIN_GAP,
            max_count: DEFAULT_MAX_COUNT,
        }
    }
}

impl DetectionConfig {
    pub fn options(&self) -> DetectOptions {
        DetectOptions {
            min_points: self.min_points,
            start_margin: self.start_margin,
            end_margin: self.end_margin,
            min_gap: self.min_gap,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// SQLite file holding cached investigations.
    pub db_path: PathBuf,
    pub ttl_secs: u64,
    /// Entries retained after pruning, most recent first.
    pub max_entries: usize,
    /// Values larger than this are rejected by the store.
    pub max_value_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data/trafficlens.db"),
            ttl_secs: 3600,
            max_entries: 10,
            max_value_bytes: 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Investigation
// ---------------------------------------------------------------------------

/// A dimension to break traffic down by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetConfig {
    pub name: String,
    /// SQL expression producing the dimension value.
    pub expression: String,
}

impl FacetConfig {
    pub fn new(name: &str, expression: &str) -> Self {
        Self {
            name: name.to_string(),
            expression: expression.to_string(),
        }
    }
}

fn default_facets() -> Vec<FacetConfig> {
    vec![
        FacetConfig::new("host", "`request.host`"),
        FacetConfig::new("url", "`request.url`"),
        FacetConfig::new("status", "toString(`response.status`)"),
        FacetConfig::new("client_ip", "`client.ip`"),
        FacetConfig::new("country", "`client.country_name`"),
        FacetConfig::new("asn", "concat(toString(`client.asn`), ' ', `client.asname`)"),
        FacetConfig::new("cache_status", "upper(`cdn.cache_status`)"),
        FacetConfig::new("user_agent", "`request.headers.user_agent`"),
        FacetConfig::new("content_type", "`response.headers.content_type`"),
        FacetConfig::new("method", "`request.method`"),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvestigationConfig {
    /// Table holding request logs.
    pub table: String,
    pub timestamp_column: String,
    pub status_column: String,
    /// A dimension value needs at least this rate in one bucket.
    pub min_rate_per_minute: f64,
    /// Minimum change, in percentage points, to be reported.
    pub min_change_pct: f64,
    /// Findings kept per facet and overall; values above 5 are treated as 5.
    pub max_results: usize,
    /// Dimension values fetched per facet query.
    pub row_limit: usize,
    pub facets: Vec<FacetConfig>,
}

impl Default for InvestigationConfig {
    fn default() -> Self {
        Self {
            table: "cdn_requests".to_string(),
            timestamp_column: "timestamp".to_string(),
            status_column: "`response.status`".to_string(),
            min_rate_per_minute: 0.5,
            min_change_pct: 5.0,
            max_results: 5,
            row_limit: 50,
            facets: default_facets(),
        }
    }
}

// ---------------------------------------------------------------------------
// ClickHouse
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickHouseConfig {
    /// HTTP interface, e.g. `http://localhost:8123`.
    pub endpoint: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8123".to_string(),
            user: None,
            password: None,
            timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Server / logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
