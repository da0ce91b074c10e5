//! Configuration loading for the treasury core.
//!
//! CLI argument parsing is out of scope (spec §1); this module only owns
//! the semantics of the three files rooted at `BLOCKHOST_CONFIG_DIR`
//! (default `/etc/blockhost`): `blockhost.yaml` (fund-manager cadence and
//! thresholds), `web3-defaults.yaml` (chain RPC and contract addresses),
//! and `revenue-share.json` (the basis-point distribution table).

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::address::InternalAddress;

const DEFAULT_CONFIG_DIR: &str = "/etc/blockhost";

/// Errors loading or validating on-disk configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to parse YAML in {path}: {source}")]
    Yaml { path: PathBuf, source: serde_yaml::Error },
    #[error("failed to parse JSON in {path}: {source}")]
    Json { path: PathBuf, source: serde_json::Error },
    #[error("invalid address in {field}: {value}")]
    InvalidAddress { field: String, value: String },
    #[error("invalid rpc_url {value}: {source}")]
    InvalidRpcUrl { value: String, source: url::ParseError },
}

/// The root directory for all persisted/config files, from
/// `BLOCKHOST_CONFIG_DIR` or the documented default.
pub fn config_dir() -> PathBuf {
    std::env::var("BLOCKHOST_CONFIG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR))
}

/// Fund-manager cadence and thresholds, from `blockhost.yaml`. All fields
/// carry the defaults documented in spec §6; floating-point YAML values are
/// truncated (not rounded) to integers before conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FundManagerConfig {
    pub fund_cycle_interval_ms: u64,
    pub gas_check_interval_ms: u64,
    pub min_withdrawal_sats: u64,
    pub gas_low_threshold_sats: u64,
    pub gas_swap_amount_sats: u64,
    pub server_stablecoin_buffer_sats: u64,
    pub hot_wallet_gas_sats: u64,
}

impl Default for FundManagerConfig {
    fn default() -> Self {
        Self {
            fund_cycle_interval_ms: 24 * 3_600_000,
            gas_check_interval_ms: 30 * 60_000,
            min_withdrawal_sats: 50_000,
            gas_low_threshold_sats: 10_000,
            gas_swap_amount_sats: 50_000,
            server_stablecoin_buffer_sats: 5_000_000,
            hot_wallet_gas_sats: 100_000,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawFundManagerConfig {
    fund_cycle_interval_hours: Option<f64>,
    gas_check_interval_minutes: Option<f64>,
    min_withdrawal_sats: Option<f64>,
    gas_low_threshold_sats: Option<f64>,
    gas_swap_amount_sats: Option<f64>,
    server_stablecoin_buffer_sats: Option<f64>,
    hot_wallet_gas_sats: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct RawBlockhostYaml {
    #[serde(default)]
    fund_manager: RawFundManagerConfig,
}

/// Truncates a float to a non-negative integer; negative values clamp to 0.
fn truncate_to_u64(value: f64) -> u64 {
    if value <= 0.0 { 0 } else { value.trunc() as u64 }
}

impl FundManagerConfig {
    pub async fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join("blockhost.yaml");
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        let parsed: RawBlockhostYaml =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml { path, source })?;
        let f = parsed.fund_manager;
        let defaults = Self::default();
        Ok(Self {
            fund_cycle_interval_ms: f
                .fund_cycle_interval_hours
                .map(|h| truncate_to_u64(h * 3_600_000.0))
                .unwrap_or(defaults.fund_cycle_interval_ms),
            gas_check_interval_ms: f
                .gas_check_interval_minutes
                .map(|m| truncate_to_u64(m * 60_000.0))
                .unwrap_or(defaults.gas_check_interval_ms),
            min_withdrawal_sats: f.min_withdrawal_sats.map(truncate_to_u64).unwrap_or(defaults.min_withdrawal_sats),
            gas_low_threshold_sats: f
                .gas_low_threshold_sats
                .map(truncate_to_u64)
                .unwrap_or(defaults.gas_low_threshold_sats),
            gas_swap_amount_sats: f
                .gas_swap_amount_sats
                .map(truncate_to_u64)
                .unwrap_or(defaults.gas_swap_amount_sats),
            server_stablecoin_buffer_sats: f
                .server_stablecoin_buffer_sats
                .map(truncate_to_u64)
                .unwrap_or(defaults.server_stablecoin_buffer_sats),
            hot_wallet_gas_sats: f
                .hot_wallet_gas_sats
                .map(truncate_to_u64)
                .unwrap_or(defaults.hot_wallet_gas_sats),
        })
    }
}

/// AMM router/factory addresses, present only if the deployment has a
/// configured AMM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmmConfig {
    pub router: InternalAddress,
    pub factory: InternalAddress,
}

/// Chain RPC endpoint and contract addresses, from `web3-defaults.yaml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Web3Config {
    pub rpc_url: String,
    pub chain_id: String,
    pub subscription_contract: InternalAddress,
    pub native_swap_contract: InternalAddress,
    pub amm: Option<AmmConfig>,
}

#[derive(Debug, Deserialize)]
struct RawAmmConfig {
    router: String,
    factory: String,
}

#[derive(Debug, Deserialize)]
struct RawWeb3Config {
    rpc_url: String,
    chain_id: String,
    subscription_contract: String,
    native_swap_contract: String,
    #[serde(default)]
    amm: Option<RawAmmConfig>,
}

impl Web3Config {
    pub async fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join("web3-defaults.yaml");
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read { path: path.clone(), source })?;
        let parsed: RawWeb3Config =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml { path, source })?;

        url::Url::parse(&parsed.rpc_url).map_err(|source| ConfigError::InvalidRpcUrl {
            value: parsed.rpc_url.clone(),
            source,
        })?;

        let subscription_contract = parsed.subscription_contract.parse().map_err(|_| ConfigError::InvalidAddress {
            field: "subscription_contract".to_string(),
            value: parsed.subscription_contract.clone(),
        })?;
        let native_swap_contract = parsed.native_swap_contract.parse().map_err(|_| ConfigError::InvalidAddress {
            field: "native_swap_contract".to_string(),
            value: parsed.native_swap_contract.clone(),
        })?;
        let amm = match parsed.amm {
            Some(raw) => Some(AmmConfig {
                router: raw.router.parse().map_err(|_| ConfigError::InvalidAddress {
                    field: "amm.router".to_string(),
                    value: raw.router.clone(),
                })?,
                factory: raw.factory.parse().map_err(|_| ConfigError::InvalidAddress {
                    field: "amm.factory".to_string(),
                    value: raw.factory.clone(),
                })?,
            }),
            None => None,
        };

        Ok(Self {
            rpc_url: parsed.rpc_url,
            chain_id: parsed.chain_id,
            subscription_contract,
            native_swap_contract,
            amm,
        })
    }
}

/// One revenue-share recipient, as configured.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RevenueRecipient {
    pub role: String,
    pub bps: u32,
}

/// The revenue-distribution table, from `revenue-share.json`. Disabled or
/// absent entirely disables fund-cycle step 4.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevenueShareConfig {
    pub enabled: bool,
    pub total_bps: u32,
    pub recipients: Vec<RevenueRecipient>,
}

impl Default for RevenueShareConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            total_bps: 0,
            recipients: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawRevenueShareConfig {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    total_bps: Option<u32>,
    #[serde(default)]
    total_percent: Option<f64>,
    #[serde(default)]
    recipients: Vec<RevenueRecipient>,
}

impl RevenueShareConfig {
    pub async fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join("revenue-share.json");
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        let parsed: RawRevenueShareConfig =
            serde_json::from_str(&raw).map_err(|source| ConfigError::Json { path, source })?;

        // total_percent is accepted only as a fallback: x100, half-away-from-zero.
        let total_bps = parsed.total_bps.unwrap_or_else(|| {
            parsed
                .total_percent
                .map(|p| (p * 100.0).round() as u32)
                .unwrap_or(0)
        });

        Ok(Self {
            enabled: parsed.enabled,
            total_bps,
            recipients: parsed.recipients,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fund_manager_config_defaults_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = FundManagerConfig::load(dir.path()).await.unwrap();
        assert_eq!(config, FundManagerConfig::default());
    }

    #[tokio::test]
    async fn fund_manager_config_truncates_fractional_hours() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("blockhost.yaml"),
            "fund_manager:\n  fund_cycle_interval_hours: 1.9\n",
        )
        .await
        .unwrap();
        let config = FundManagerConfig::load(dir.path()).await.unwrap();
        // 1.9h -> truncated to 1h -> 3_600_000 ms, not rounded to 2h.
        assert_eq!(config.fund_cycle_interval_ms, 3_600_000);
    }

    #[tokio::test]
    async fn revenue_share_converts_total_percent_half_away_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("revenue-share.json"),
            r#"{"enabled": true, "total_percent": 12.345, "recipients": []}"#,
        )
        .await
        .unwrap();
        let config = RevenueShareConfig::load(dir.path()).await.unwrap();
        assert_eq!(config.total_bps, 1235); // 1234.5 rounds away from zero.
    }

    #[tokio::test]
    async fn revenue_share_defaults_when_file_absent() {
        let dir = tempfile::tempdir().unwrap();
        let config = RevenueShareConfig::load(dir.path()).await.unwrap();
        assert!(!config.enabled);
    }

    #[tokio::test]
    async fn web3_config_missing_file_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Web3Config::load(dir.path()).await,
            Err(ConfigError::Read { .. })
        ));
    }

    #[tokio::test]
    async fn web3_config_rejects_malformed_rpc_url() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(
            dir.path().join("web3-defaults.yaml"),
            "rpc_url: \"not a url\"\nchain_id: \"1\"\nsubscription_contract: \"0x1111111111111111111111111111111111111111111111111111111111111a\"\nnative_swap_contract: \"0x1111111111111111111111111111111111111111111111111111111111111a\"\n",
        )
        .await
        .unwrap();
        assert!(matches!(
            Web3Config::load(dir.path()).await,
            Err(ConfigError::InvalidRpcUrl { .. })
        ));
    }
}
