//! TOML configuration for the processor core.
//!
//! Loaded from a path chosen by the hosting program; missing file means
//! defaults. Every section tolerates missing keys.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProcessorConfig {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub processor: ProcessorSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Per-statement timeout applied to the session (ms).
    pub statement_timeout_ms: u64,
    /// Seconds between reconnect attempts.
    pub retry_interval_s: u64,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5432,
            user: "processor".into(),
            password: "".into(),
            database: "blockchain".into(),
            statement_timeout_ms: 5_000,
            retry_interval_s: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorSection {
    /// Textual address of the block producer; only this identity may
    /// create contracts.
    pub address: String,
    /// Network prefix mixed into every transaction and block hash.
    pub sign_prefix: String,
    pub log_level: String,
}

impl Default for ProcessorSection {
    fn default() -> Self {
        Self {
            address: "".into(),
            sign_prefix: "".into(),
            log_level: "info".into(),
        }
    }
}

impl ProcessorConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        if !Path::new(path).exists() {
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)?;
        let cfg: ProcessorConfig = toml::from_str(&s)?;
        Ok(cfg)
    }

    pub fn example_toml() -> &'static str {
        r#"# Processor core configuration.
# All values shown are defaults.

[database]
host = "127.0.0.1"
port = 5432
user = "processor"
password = ""
database = "blockchain"
statement_timeout_ms = 5000  # per-statement timeout for contract queries
retry_interval_s = 5         # seconds between reconnect attempts

[processor]
address = ""        # block producer address (create-contract privilege)
sign_prefix = ""    # network prefix; makes records non-portable across networks
log_level = "info"  # trace | debug | info | warn | error
"#
    }

    pub fn write_example(path: &str) -> std::io::Result<()> {
        std::fs::write(path, Self::example_toml())
    }
}
