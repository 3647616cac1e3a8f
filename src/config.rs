use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Core Lightning REST endpoint, including scheme
    pub base_url: String,
    /// Rune authorising the RPC methods the engine calls
    pub rune: String,
    /// CA certificate the REST endpoint's certificate chains to
    pub tls_cert_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    /// Path to the attempt history database
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    /// Seconds between full gossip refreshes
    #[serde(rename = "circular-graph-refresh", default = "default_graph_refresh")]
    pub graph_refresh_secs: u64,
    /// Seconds between own-channel liquidity refreshes
    #[serde(rename = "circular-peer-refresh", default = "default_peer_refresh")]
    pub peer_refresh_secs: u64,
    /// Age after which a learned third-party liquidity estimate falls back to 50/50
    #[serde(default = "default_liquidity_reset")]
    pub liquidity_reset_secs: u64,
    #[serde(default = "default_stats_log_interval")]
    pub stats_log_interval_secs: u64,
    /// `waitsendpay` timeout per chunk
    #[serde(default = "default_payment_timeout")]
    pub payment_timeout_secs: u64,
    /// Capacity of the in-memory attempt ring and of the persisted history
    #[serde(default = "default_max_stored_attempts")]
    pub max_stored_attempts: usize,
    #[serde(default = "default_stats_retention_days")]
    pub stats_retention_days: u64,
}

/// Values used for any parameter a rebalance command leaves out.
/// Amounts are in satoshis.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default = "default_amount")]
    pub amount: u64,
    #[serde(default = "default_splitamount")]
    pub splitamount: u64,
    #[serde(default = "default_maxppm")]
    pub maxppm: u64,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_maxhops")]
    pub maxhops: usize,
    #[serde(default = "default_outppm")]
    pub maxoutppm: u64,
    #[serde(default = "default_outppm")]
    pub minoutppm: u64,
    #[serde(default = "default_depleteuptopercent")]
    pub depleteuptopercent: u64,
    #[serde(default = "default_depleteuptoamount")]
    pub depleteuptoamount: u64,
    #[serde(default = "default_filluptopercent")]
    pub filluptopercent: u64,
    #[serde(default = "default_filluptoamount")]
    pub filluptoamount: u64,
}

// Default value functions
fn default_database_path() -> PathBuf {
    PathBuf::from("circular.db")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_graph_refresh() -> u64 {
    600
}
fn default_peer_refresh() -> u64 {
    30
}
fn default_liquidity_reset() -> u64 {
    300 * 60
}
fn default_stats_log_interval() -> u64 {
    600
}
fn default_payment_timeout() -> u64 {
    120
}
fn default_max_stored_attempts() -> usize {
    1000
}
fn default_stats_retention_days() -> u64 {
    14
}
fn default_amount() -> u64 {
    400_000
}
fn default_splitamount() -> u64 {
    100_000
}
fn default_maxppm() -> u64 {
    10
}
fn default_attempts() -> u32 {
    1
}
fn default_maxhops() -> usize {
    8
}
fn default_outppm() -> u64 {
    50
}
fn default_depleteuptopercent() -> u64 {
    20
}
fn default_depleteuptoamount() -> u64 {
    1_000_000
}
fn default_filluptopercent() -> u64 {
    80
}
fn default_filluptoamount() -> u64 {
    10_000_000
}

// Default implementations
impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            log_level: default_log_level(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            graph_refresh_secs: default_graph_refresh(),
            peer_refresh_secs: default_peer_refresh(),
            liquidity_reset_secs: default_liquidity_reset(),
            stats_log_interval_secs: default_stats_log_interval(),
            payment_timeout_secs: default_payment_timeout(),
            max_stored_attempts: default_max_stored_attempts(),
            stats_retention_days: default_stats_retention_days(),
        }
    }
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            amount: default_amount(),
            splitamount: default_splitamount(),
            maxppm: default_maxppm(),
            attempts: default_attempts(),
            maxhops: default_maxhops(),
            maxoutppm: default_outppm(),
            minoutppm: default_outppm(),
            depleteuptopercent: default_depleteuptopercent(),
            depleteuptoamount: default_depleteuptoamount(),
            filluptopercent: default_filluptopercent(),
            filluptoamount: default_filluptoamount(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        const MIN_HOPS: usize = 2;

        if self.engine.graph_refresh_secs < 1 {
            anyhow::bail!("circular-graph-refresh must be at least 1 second");
        }
        if self.engine.peer_refresh_secs < 1 {
            anyhow::bail!("circular-peer-refresh must be at least 1 second");
        }
        if self.engine.stats_log_interval_secs < 1 {
            anyhow::bail!("stats_log_interval_secs must be at least 1 second");
        }
        if self.engine.payment_timeout_secs < 1 {
            anyhow::bail!("payment_timeout_secs must be at least 1 second");
        }
        if self.engine.max_stored_attempts < 1 {
            anyhow::bail!("max_stored_attempts must be at least 1");
        }
        if self.defaults.splitamount < 1 {
            anyhow::bail!("splitamount must be at least 1 sat");
        }
        if self.defaults.maxhops < MIN_HOPS {
            anyhow::bail!(
                "maxhops ({}) below minimum ({})",
                self.defaults.maxhops,
                MIN_HOPS
            );
        }
        if self.defaults.depleteuptopercent > 100 {
            anyhow::bail!("depleteuptopercent must be between 0 and 100");
        }
        if self.defaults.filluptopercent > 100 {
            anyhow::bail!("filluptopercent must be between 0 and 100");
        }
        if !self.server.tls_cert_path.exists() {
            anyhow::bail!(
                "TLS cert not found at: {}",
                self.server.tls_cert_path.display()
            );
        }
        Ok(())
    }

    /// Create a config with all defaults for testing purposes.
    /// The TLS cert path is set to the provided path (must exist for validation).
    #[cfg(test)]
    pub fn test_default(tls_cert_path: std::path::PathBuf) -> Self {
        Self {
            server: ServerConfig {
                base_url: "https://127.0.0.1:3010".to_string(),
                rune: "test-rune".to_string(),
                tls_cert_path,
            },
            general: GeneralConfig::default(),
            engine: EngineConfig::default(),
            defaults: DefaultsConfig::default(),
        }
    }
}
