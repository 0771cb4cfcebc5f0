//! In-memory chain and profile services for exercising ledgers without a
//! node or a GraphQL endpoint.

use crate::{
    chain::ChainLogSource,
    curve::{BondingCurve, U256},
    error::{ChainError, ResolveError},
    models::{LogQuery, RawLog, RawLogArgs, TokenSpec},
    names::NameResolver,
};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

pub const TEST_TOKEN_ADDRESS: &str = "0x00000000000000000000000000000000000000aa";

pub fn token_spec() -> TokenSpec {
    TokenSpec {
        label: "vibes".to_string(),
        address: TEST_TOKEN_ADDRESS.to_string(),
        creation_block: 50,
        mint_event: "Mint(address,uint256,uint256)".to_string(),
        burn_event: "Burn(address,uint256,uint256)".to_string(),
        curve: BondingCurve::default(),
    }
}

fn log(event: &str, account: &str, amount: u64, supply: u64, block: u64, index: u64) -> RawLog {
    RawLog {
        event_name: event.to_string(),
        args: RawLogArgs {
            account: Some(account.to_string()),
            amount: Some(U256::from(amount)),
            total_supply: Some(U256::from(supply)),
        },
        block_number: Some(block),
        log_index: Some(index),
        transaction_hash: Some(format!("0x{block:x}{index:02x}")),
    }
}

pub fn mint_log(account: &str, amount: u64, supply: u64, block: u64, index: u64) -> RawLog {
    log("Mint", account, amount, supply, block, index)
}

pub fn burn_log(account: &str, amount: u64, supply: u64, block: u64, index: u64) -> RawLog {
    log("Burn", account, amount, supply, block, index)
}

/// Serves logs from memory, filtered by event name and block range.
pub struct MockChainSource {
    head: AtomicU64,
    logs: Mutex<Vec<RawLog>>,
    failures: AtomicU32,
    queries: Mutex<Vec<LogQuery>>,
}

impl MockChainSource {
    pub fn new(head: u64) -> Self {
        Self {
            head: AtomicU64::new(head),
            logs: Mutex::new(Vec::new()),
            failures: AtomicU32::new(0),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn push_log(&self, log: RawLog) {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner).push(log);
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    /// Fail the next `n` calls of either method.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn queries(&self) -> Vec<LogQuery> {
        self.queries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn take_failure(&self) -> Result<(), ChainError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(ChainError::Rpc {
                code: -32000,
                message: "mock failure".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChainLogSource for MockChainSource {
    async fn head_block(&self) -> Result<u64, ChainError> {
        self.take_failure()?;
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn fetch_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, ChainError> {
        self.take_failure()?;
        self.queries.lock().unwrap_or_else(PoisonError::into_inner).push(query.clone());
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(logs
            .iter()
            .filter(|l| l.event_name == query.event.as_str())
            .filter(|l| {
                l.block_number
                    .map_or(true, |b| b >= query.from_block && b <= query.to_block)
            })
            .cloned()
            .collect())
    }
}

/// Profile service with per-address names, latencies and failures. Counts
/// single lookups per address and the size of every batched lookup.
#[derive(Default)]
pub struct MockNameResolver {
    names: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    failing: HashSet<String>,
    lookups: Mutex<HashMap<String, usize>>,
    batches: Mutex<Vec<usize>>,
}

impl MockNameResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, address: &str, name: &str) -> Self {
        self.names.insert(address.to_string(), name.to_string());
        self
    }

    pub fn with_delay(mut self, address: &str, delay: Duration) -> Self {
        self.delays.insert(address.to_string(), delay);
        self
    }

    pub fn failing(mut self, address: &str) -> Self {
        self.failing.insert(address.to_string());
        self
    }

    pub fn lookups(&self, address: &str) -> usize {
        self.lookups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .copied()
            .unwrap_or(0)
    }

    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl NameResolver for MockNameResolver {
    async fn resolve(&self, address: &str) -> Result<Option<String>, ResolveError> {
        *self
            .lookups
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(address.to_string())
            .or_insert(0) += 1;

        if let Some(delay) = self.delays.get(address) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(address) {
            return Err(ResolveError::Graphql("profile service unavailable".to_string()));
        }
        Ok(self.names.get(address).cloned())
    }

    async fn resolve_many(
        &self,
        addresses: &[String],
    ) -> Result<HashMap<String, Option<String>>, ResolveError> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).push(addresses.len());

        let delay = addresses
            .iter()
            .filter_map(|a| self.delays.get(a))
            .max()
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        Ok(addresses
            .iter()
            .map(|a| {
                let name = if self.failing.contains(a) {
                    None
                } else {
                    self.names.get(a).cloned()
                };
                (a.clone(), name)
            })
            .collect())
    }
}
