use crate::curve::{BondingCurve, Price, U256};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Mint,
    Burn,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Mint => "Mint",
            EventKind::Burn => "Burn",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "Mint" => Some(EventKind::Mint),
            "Burn" => Some(EventKind::Burn),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bonding-curve token contract: where its logs live, which events carry
/// its trades, and how it prices them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenSpec {
    pub label: String,
    /// Lowercase `0x` contract address.
    pub address: String,
    pub creation_block: u64,
    pub mint_event: String,
    pub burn_event: String,
    #[serde(skip)]
    pub curve: BondingCurve,
}

impl TokenSpec {
    pub fn event_signature(&self, kind: EventKind) -> &str {
        match kind {
            EventKind::Mint => &self.mint_event,
            EventKind::Burn => &self.burn_event,
        }
    }

    pub fn log_query(&self, kind: EventKind, from_block: u64, to_block: u64) -> LogQuery {
        LogQuery {
            address: self.address.clone(),
            event: kind,
            signature: self.event_signature(kind).to_string(),
            from_block,
            to_block,
        }
    }
}

/// Historical log range query for one event of one contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    pub address: String,
    pub event: EventKind,
    /// Solidity event signature, e.g. `Mint(address,uint256,uint256)`.
    pub signature: String,
    pub from_block: u64,
    pub to_block: u64,
}

/// Decoded arguments of a Mint/Burn log. Any of them may be missing when the
/// log does not match the expected ABI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawLogArgs {
    pub account: Option<String>,
    pub amount: Option<U256>,
    pub total_supply: Option<U256>,
}

/// A chain log as delivered by either the historical query or the live
/// listener: `{eventName, args: {account, amount, totalSupply}, blockNumber}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub event_name: String,
    pub args: RawLogArgs,
    pub block_number: Option<u64>,
    pub log_index: Option<u64>,
    pub transaction_hash: Option<String>,
}

impl RawLog {
    /// Ordering key used when pre-sorting raw logs. Logs without a block sort
    /// first and are rejected later by the event parser.
    pub fn sort_key(&self) -> (u64, u64) {
        (self.block_number.unwrap_or(0), self.log_index.unwrap_or(0))
    }
}

/// One reconciled bonding-curve mint or burn.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenTransaction {
    pub event_kind: EventKind,
    pub trader: String,
    pub trader_display_name: String,
    #[serde(serialize_with = "as_decimal")]
    pub amount: U256,
    #[serde(serialize_with = "as_decimal")]
    pub total_supply_after: U256,
    #[serde(serialize_with = "as_decimal")]
    pub price: Price,
    pub price_change_percent: f64,
    pub block_number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
}

impl TokenTransaction {
    /// Identity of the underlying chain log, when the source provided one.
    pub fn log_id(&self) -> Option<(String, u64)> {
        match (&self.transaction_hash, self.log_index) {
            (Some(hash), Some(index)) => Some((hash.to_lowercase(), index)),
            _ => None,
        }
    }
}

/// Serialize big integers as decimal strings so JSON consumers never lose
/// precision.
pub fn as_decimal<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    T: fmt::Display,
    S: Serializer,
{
    serializer.collect_str(value)
}
