//! Configuration management for the transaction tracker
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::Address;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub tracker: TrackerConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Confirmations after which an action is considered final
    #[serde(default = "default_target_confirmations")]
    pub target_confirmations: u64,
    /// Percentage added to fees on speed-up
    #[serde(default = "default_fee_bump_percent")]
    pub fee_bump_percent: u64,
    /// Smallest absolute increment (wei) applied on speed-up
    #[serde(default = "default_min_fee_bump_wei")]
    pub min_fee_bump_wei: u64,
    /// Block polling interval when no WebSocket endpoint is configured
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_target_confirmations() -> u64 {
    2
}

fn default_fee_bump_percent() -> u64 {
    20
}

fn default_min_fee_bump_wei() -> u64 {
    1
}

fn default_poll_interval_ms() -> u64 {
    4000
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            target_confirmations: default_target_confirmations(),
            fee_bump_percent: default_fee_bump_percent(),
            min_fee_bump_wei: default_min_fee_bump_wei(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub ws_url: Option<String>,
    /// DataStorage contract; records fall back to plain transfers without it
    pub contract_address: Option<String>,
}

impl ChainConfig {
    /// Parsed DataStorage address, if one is configured
    pub fn contract(&self) -> Result<Option<Address>> {
        match self.contract_address.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => raw
                .parse::<Address>()
                .map(Some)
                .with_context(|| format!("Invalid contract address: {}", raw)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
}

fn default_private_key_env() -> String {
    "TRACKER_PRIVATE_KEY".to_string()
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: default_private_key_env(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub port: u16,
}

impl Settings {
    /// Load settings from the file named by `TX_TRACKER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("TX_TRACKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.tracker.target_confirmations == 0 {
            anyhow::bail!("tracker.target_confirmations must be at least 1");
        }
        if self.tracker.poll_interval_ms == 0 {
            anyhow::bail!("tracker.poll_interval_ms must be positive");
        }
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.name);
        }
        if self.chain.contract()?.is_none() {
            tracing::warn!(
                "Chain {} has no DataStorage contract - records will be sent as transfers",
                self.chain.name
            );
        }
        if self.metrics.enabled && self.metrics.port == 0 {
            anyhow::bail!("metrics.port is required when metrics are enabled");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static pattern");

    re.replace_all(input, |cap: &regex::Captures| {
        env::var(&cap[1]).unwrap_or_default()
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [tracker]
        target_confirmations = 3

        [chain]
        chain_id = 11155111
        name = "sepolia"
        rpc_urls = ["https://rpc.sepolia.org"]
        contract_address = "0x00000000000000000000000000000000000000aa"

        [api]
        host = "127.0.0.1"
        port = 8080
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TX_TRACKER_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TX_TRACKER_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_defaults_fill_missing_fields() {
        let settings = Settings::parse(SAMPLE).unwrap();
        assert_eq!(settings.tracker.target_confirmations, 3);
        assert_eq!(settings.tracker.fee_bump_percent, 20);
        assert_eq!(settings.tracker.min_fee_bump_wei, 1);
        assert_eq!(settings.wallet.private_key_env, "TRACKER_PRIVATE_KEY");
        assert!(!settings.metrics.enabled);
        assert!(settings.chain.contract().unwrap().is_some());
    }

    #[test]
    fn test_rejects_zero_target() {
        let raw = SAMPLE.replace("target_confirmations = 3", "target_confirmations = 0");
        assert!(Settings::parse(&raw).is_err());
    }

    #[test]
    fn test_rejects_bad_contract_address() {
        let raw = SAMPLE.replace("0x00000000000000000000000000000000000000aa", "not-an-address");
        assert!(Settings::parse(&raw).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.chain.chain_id, 11155111);
        assert_eq!(settings.api.port, 8080);
    }
}
