// Chain log access: historical range queries over EVM JSON-RPC, and the
// polling watcher that feeds newly produced logs into a ledger's live queue.

use crate::{
    config::{ChainConfig, LedgerSettings},
    curve::U256,
    error::ChainError,
    models::{EventKind, LogQuery, RawLog, RawLogArgs, TokenSpec},
    queue::LiveQueue,
};
use alloy::primitives::{hex, Address, B256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::transports::TransportResult;
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;
use std::future::IntoFuture;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tiny_keccak::{Hasher, Keccak};
use tracing::{debug, error, info, warn};

/// Source of Mint/Burn logs.
#[async_trait]
pub trait ChainLogSource: Send + Sync {
    /// Current chain head.
    async fn head_block(&self) -> Result<u64, ChainError>;

    /// Every log matching `query`, inclusive of both block bounds.
    async fn fetch_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, ChainError>;
}

/// `topic0` of an event: Keccak-256 of its canonical signature.
pub fn event_topic(signature: &str) -> B256 {
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(signature.as_bytes());
    hasher.finalize(&mut output);
    B256::from(output)
}

/// Account held in a 32-byte ABI word. The 12 padding bytes must be zero.
fn address_from_word(word: &[u8]) -> Option<String> {
    if word.len() != 32 || word[..12].iter().any(|b| *b != 0) {
        return None;
    }
    Some(hex::encode_prefixed(Address::from_slice(&word[12..])))
}

/// Decode one log for `event`.
///
/// With an indexed account the data holds `[amount, totalSupply]`, otherwise
/// `[account, amount, totalSupply]`. Missing or malformed words leave the
/// argument empty, which the event parser rejects.
pub fn decode_log(log: &Log, event: EventKind) -> RawLog {
    let data = &log.data().data;
    let words: Vec<&[u8]> = data.chunks_exact(32).collect();

    let (account, values) = match log.topics().get(1) {
        Some(indexed) => (address_from_word(indexed.as_slice()), &words[..]),
        None => (
            words.first().and_then(|w| address_from_word(w)),
            words.get(1..).unwrap_or(&[]),
        ),
    };

    RawLog {
        event_name: event.as_str().to_string(),
        args: RawLogArgs {
            account,
            amount: values.first().map(|w| U256::from_big_endian(w)),
            total_supply: values.get(1).map(|w| U256::from_big_endian(w)),
        },
        block_number: log.block_number,
        log_index: log.log_index,
        transaction_hash: log.transaction_hash.map(hex::encode_prefixed),
    }
}

/// Decode one raw `eth_getLogs` entry. Reorged-out entries and entries that
/// are not valid logs yield `None`.
fn decode_entry(entry: Value, event: EventKind) -> Option<RawLog> {
    match serde_json::from_value::<Log>(entry) {
        Ok(log) if log.removed => {
            debug!(event = %event, block = ?log.block_number, "dropping removed log");
            None
        }
        Ok(log) => Some(decode_log(&log, event)),
        Err(e) => {
            warn!(event = %event, error = %e, "skipping undecodable log");
            None
        }
    }
}

/// Split `[from, to]` into inclusive ranges of at most `max_range` blocks.
pub fn block_ranges(from: u64, to: u64, max_range: u64) -> Vec<(u64, u64)> {
    let step = max_range.max(1);
    let mut ranges = Vec::new();
    let mut start = from;
    while start <= to {
        let end = start.saturating_add(step - 1).min(to);
        ranges.push((start, end));
        if end == u64::MAX {
            break;
        }
        start = end + 1;
    }
    ranges
}

/// `ChainLogSource` over an HTTP JSON-RPC provider.
pub struct JsonRpcLogSource {
    provider: RootProvider,
    max_block_range: u64,
    /// `eth_getLogs` range requests in flight at once.
    concurrency: usize,
    request_timeout: Duration,
}

impl JsonRpcLogSource {
    pub fn new(config: &ChainConfig) -> Result<Self, ChainError> {
        let url: reqwest::Url = config
            .rpc_url
            .parse()
            .map_err(|e| ChainError::Decode(format!("bad rpc url {:?}: {e}", config.rpc_url)))?;
        Ok(Self {
            provider: RootProvider::new_http(url),
            max_block_range: config.max_block_range,
            concurrency: config.batch_size.max(1),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
        })
    }

    async fn timed<T, F>(&self, call: F) -> Result<T, ChainError>
    where
        F: IntoFuture<Output = TransportResult<T>>,
    {
        tokio::time::timeout(self.request_timeout, call)
            .await
            .map_err(|_| ChainError::Timeout(self.request_timeout))?
            .map_err(ChainError::from)
    }

    // Entries are decoded one by one so a single bad log cannot fail the range.
    async fn logs_in_range(&self, filter: Filter, event: EventKind) -> Result<Vec<RawLog>, ChainError> {
        let entries: Vec<Value> = self
            .timed(self.provider.raw_request("eth_getLogs".into(), (filter,)))
            .await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| decode_entry(entry, event))
            .collect())
    }
}

#[async_trait]
impl ChainLogSource for JsonRpcLogSource {
    async fn head_block(&self) -> Result<u64, ChainError> {
        self.timed(self.provider.get_block_number()).await
    }

    async fn fetch_logs(&self, query: &LogQuery) -> Result<Vec<RawLog>, ChainError> {
        if query.from_block > query.to_block {
            return Ok(Vec::new());
        }

        let address = Address::from_str(&query.address)
            .map_err(|e| ChainError::Decode(format!("bad token address {}: {e}", query.address)))?;
        let base = Filter::new()
            .address(address)
            .event_signature(event_topic(&query.signature));

        let ranges = block_ranges(query.from_block, query.to_block, self.max_block_range);
        let chunks: Vec<Vec<RawLog>> = stream::iter(ranges)
            .map(|(from, to)| {
                self.logs_in_range(base.clone().from_block(from).to_block(to), query.event)
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;
        let out: Vec<RawLog> = chunks.into_iter().flatten().collect();

        debug!(
            event = %query.event,
            address = %query.address,
            from = query.from_block,
            to = query.to_block,
            logs = out.len(),
            "fetched logs"
        );
        Ok(out)
    }
}

/// Polls a `ChainLogSource` for logs past the last delivered block and pushes
/// each poll's logs into a live queue as one batch.
pub struct LogWatcher {
    source: Arc<dyn ChainLogSource>,
    token: TokenSpec,
    last_seen: u64,
    poll_interval: Duration,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl LogWatcher {
    pub fn new(
        source: Arc<dyn ChainLogSource>,
        token: TokenSpec,
        last_seen: u64,
        settings: &LedgerSettings,
    ) -> Self {
        Self {
            source,
            token,
            last_seen,
            poll_interval: settings.poll_interval,
            initial_backoff: settings.initial_backoff,
            max_backoff: settings.max_backoff,
        }
    }

    /// Poll until the queue is closed.
    pub async fn run(mut self, queue: LiveQueue) {
        info!(token = %self.token.label, from = self.last_seen + 1, "watching for live logs");
        let mut backoff = self.initial_backoff;

        loop {
            match self.poll_once(&queue).await {
                Ok(true) => {
                    backoff = self.initial_backoff;
                    tokio::time::sleep(self.poll_interval).await;
                }
                Ok(false) => break,
                Err(e) => {
                    error!(token = %self.token.label, error = %e, "live log poll failed");
                    if queue.report_error(e.to_string()).is_err() {
                        break;
                    }
                    warn!(
                        token = %self.token.label,
                        "retrying in {}ms from block {}",
                        backoff.as_millis(),
                        self.last_seen + 1
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.max_backoff);
                }
            }
        }

        info!(token = %self.token.label, "live log watcher stopped");
    }

    /// One poll. Returns `Ok(false)` once the queue no longer accepts items.
    pub async fn poll_once(&mut self, queue: &LiveQueue) -> Result<bool, ChainError> {
        let head = self.source.head_block().await?;
        if head <= self.last_seen {
            return Ok(queue.set_head(head).is_ok());
        }

        let from = self.last_seen + 1;
        let mint_query = self.token.log_query(EventKind::Mint, from, head);
        let burn_query = self.token.log_query(EventKind::Burn, from, head);
        let (mut batch, burns) = tokio::try_join!(
            self.source.fetch_logs(&mint_query),
            self.source.fetch_logs(&burn_query)
        )?;
        batch.extend(burns);

        if !batch.is_empty() {
            debug!(token = %self.token.label, from, to = head, logs = batch.len(), "live batch");
            if queue.push_batch(batch).is_err() {
                return Ok(false);
            }
        }
        self.last_seen = head;
        Ok(queue.set_head(head).is_ok())
    }
}
