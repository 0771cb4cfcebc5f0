use crate::{
    curve::BondingCurve,
    error::{LedgerError, LedgerResult},
    models::TokenSpec,
};
use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    pub environment: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub rpc_url: String,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    /// `eth_getLogs` range requests in flight at once.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub initial_backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
    #[serde(default = "default_backfill_attempts")]
    pub backfill_attempts: u32,
    #[serde(default = "default_avg_block_time_secs")]
    pub avg_block_time_secs: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NamesConfig {
    pub graphql_url: String,
    #[serde(default = "default_name_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_name_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenConfig {
    pub label: String,
    pub address: String,
    #[serde(default)]
    pub creation_block: u64,
    #[serde(default = "default_mint_event")]
    pub mint_event: String,
    #[serde(default = "default_burn_event")]
    pub burn_event: String,
    #[serde(default = "default_price_multiplier")]
    pub price_multiplier: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LedgerConfig {
    pub runtime: RuntimeConfig,
    pub api: ApiConfig,
    pub chain: ChainConfig,
    pub names: NamesConfig,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

fn default_max_block_range() -> u64 {
    2_000
}

fn default_batch_size() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_backfill_attempts() -> u32 {
    5
}

fn default_avg_block_time_secs() -> f64 {
    2.0
}

fn default_name_timeout_ms() -> u64 {
    3_000
}

fn default_name_batch_size() -> usize {
    50
}

fn default_mint_event() -> String {
    "Mint(address,uint256,uint256)".to_string()
}

fn default_burn_event() -> String {
    "Burn(address,uint256,uint256)".to_string()
}

fn default_price_multiplier() -> u64 {
    1
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self> {
        // Load base config from `config/default.(toml|yaml|json)` relative to the
        // current working directory, then override with `LEDGER__...` environment
        // variables.
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("LEDGER").separator("__"))
            .build()?;

        settings.try_deserialize().map_err(Into::into)
    }
}

impl TokenConfig {
    pub fn to_spec(&self) -> LedgerResult<TokenSpec> {
        let address = self.address.trim().to_lowercase();
        let valid = address
            .strip_prefix("0x")
            .is_some_and(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(LedgerError::InvalidToken(format!(
                "{}: bad contract address {:?}",
                self.label, self.address
            )));
        }

        Ok(TokenSpec {
            label: self.label.clone(),
            address,
            creation_block: self.creation_block,
            mint_event: self.mint_event.clone(),
            burn_event: self.burn_event.clone(),
            curve: BondingCurve::new(self.price_multiplier),
        })
    }
}

/// Runtime knobs shared by every ledger.
#[derive(Debug, Clone)]
pub struct LedgerSettings {
    pub avg_block_time: Duration,
    pub name_timeout: Duration,
    pub name_batch_size: usize,
    pub backfill_attempts: u32,
    pub poll_interval: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            avg_block_time: Duration::from_secs(2),
            name_timeout: Duration::from_millis(default_name_timeout_ms()),
            name_batch_size: default_name_batch_size(),
            backfill_attempts: default_backfill_attempts(),
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            initial_backoff: Duration::from_millis(1_000),
            max_backoff: Duration::from_millis(30_000),
        }
    }
}

impl LedgerSettings {
    pub fn from_config(config: &LedgerConfig) -> LedgerResult<Self> {
        let secs = config.chain.avg_block_time_secs;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(LedgerError::InvalidConfig(format!(
                "chain.avg_block_time_secs must be a positive number of seconds, got {secs}"
            )));
        }
        let avg_block_time = Duration::try_from_secs_f64(secs)
            .map_err(|e| LedgerError::InvalidConfig(format!("chain.avg_block_time_secs: {e}")))?;

        Ok(Self {
            avg_block_time,
            name_timeout: Duration::from_millis(config.names.timeout_ms),
            name_batch_size: config.names.batch_size,
            backfill_attempts: config.chain.backfill_attempts.max(1),
            poll_interval: Duration::from_millis(config.chain.poll_interval_ms),
            initial_backoff: Duration::from_millis(config.chain.initial_backoff_ms.unwrap_or(1_000)),
            max_backoff: Duration::from_millis(config.chain.max_backoff_ms.unwrap_or(30_000)),
        })
    }
}
