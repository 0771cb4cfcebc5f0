// Per-token reconciled ledger.
//
// Lifecycle: `open` runs the backfill to completion, then arms the live queue.
// From then on the queue worker is the only writer; readers take snapshots.
// `close` stops the watcher and the worker.

use crate::{
    backfill::run_backfill,
    chain::{ChainLogSource, LogWatcher},
    config::LedgerSettings,
    curve::{Price, U256},
    error::{LedgerError, LedgerResult},
    models::{RawLog, TokenSpec, TokenTransaction},
    names::{NameCache, NameResolver},
    queue::{LiveQueue, QueueState},
    windows::{LookbackWindow, WindowCache, WindowIndex},
};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Mutable ledger state. Written only by the backfill (before the queue is
/// armed) and by the live queue worker.
#[derive(Debug, Default)]
pub struct LedgerState {
    pub transactions: Vec<TokenTransaction>,
    pub head_block: u64,
    pub last_error: Option<String>,
    pub(crate) seen: HashSet<(String, u64)>,
}

/// Pushed to subscribers after every settled live insertion.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LedgerEvent {
    Inserted {
        token: String,
        index: usize,
        transaction: TokenTransaction,
    },
    /// The record after an out-of-order insert, with its price change
    /// recomputed against the new predecessor.
    Updated {
        token: String,
        index: usize,
        transaction: TokenTransaction,
    },
}

/// Read-only view handed to renderers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerSnapshot {
    pub token: TokenSpec,
    pub head_block: u64,
    pub transactions: Vec<TokenTransaction>,
    pub windows: BTreeMap<LookbackWindow, WindowIndex>,
    pub last_error: Option<String>,
}

#[derive(Clone)]
pub struct TokenLedger {
    inner: Arc<Inner>,
}

struct Inner {
    token: TokenSpec,
    state: Arc<RwLock<LedgerState>>,
    queue: LiveQueue,
    events: broadcast::Sender<LedgerEvent>,
    windows: Mutex<WindowCache>,
    avg_block_time: Duration,
    /// Head reached by the backfill; live watchers resume after it.
    backfill_head: u64,
    settings: LedgerSettings,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TokenLedger {
    /// Backfill `token` from `source`, then arm its live queue.
    ///
    /// The backfill is retried with exponential backoff; after
    /// `settings.backfill_attempts` failures the ledger is not opened.
    pub async fn open(
        token: TokenSpec,
        source: Arc<dyn ChainLogSource>,
        resolver: Arc<dyn NameResolver>,
        settings: LedgerSettings,
    ) -> LedgerResult<Self> {
        let names = Arc::new(NameCache::new(
            resolver,
            settings.name_timeout,
            settings.name_batch_size,
        ));

        let attempts = settings.backfill_attempts.max(1);
        let mut backoff = settings.initial_backoff;
        let mut attempt = 0;
        let backfill = loop {
            attempt += 1;
            match run_backfill(source.as_ref(), &token, &names).await {
                Ok(backfill) => break backfill,
                Err(e) if attempt < attempts => {
                    error!(token = %token.label, attempt, error = %e, "backfill failed");
                    warn!(token = %token.label, "retrying backfill in {}ms", backoff.as_millis());
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(settings.max_backoff);
                }
                Err(e) => {
                    return Err(LedgerError::Backfill {
                        attempts: attempt,
                        source: e,
                    })
                }
            }
        };

        let seen = backfill
            .transactions
            .iter()
            .filter_map(TokenTransaction::log_id)
            .collect();
        let backfill_head = backfill.head_block;
        let state = Arc::new(RwLock::new(LedgerState {
            transactions: backfill.transactions,
            head_block: backfill.head_block,
            last_error: None,
            seen,
        }));

        let (events, _) = broadcast::channel(1_024);
        let (queue, worker) = LiveQueue::spawn(
            token.label.clone(),
            state.clone(),
            names,
            token.curve,
            events.clone(),
        );
        info!(token = %token.label, address = %token.address, "ledger open, live queue armed");

        Ok(Self {
            inner: Arc::new(Inner {
                avg_block_time: settings.avg_block_time,
                backfill_head,
                token,
                state,
                queue,
                events,
                windows: Mutex::new(WindowCache::default()),
                settings,
                tasks: Mutex::new(vec![worker]),
            }),
        })
    }

    pub fn token(&self) -> &TokenSpec {
        &self.inner.token
    }

    /// Push one live listener delivery.
    pub fn ingest(&self, batch: Vec<RawLog>) -> LedgerResult<()> {
        self.inner.queue.push_batch(batch)
    }

    /// Start polling `source` for logs after the backfilled head. Blocks
    /// already delivered through `ingest` are fetched again and deduplicated.
    pub async fn watch(&self, source: Arc<dyn ChainLogSource>) {
        let watcher = LogWatcher::new(
            source,
            self.inner.token.clone(),
            self.inner.backfill_head,
            &self.inner.settings,
        );
        let handle = tokio::spawn(watcher.run(self.inner.queue.clone()));
        self.lock_tasks().push(handle);
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until every item enqueued so far has settled.
    pub async fn flush(&self) -> LedgerResult<()> {
        self.inner.queue.flush().await
    }

    pub fn queue_state(&self) -> QueueState {
        self.inner.queue.state()
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        let state = self.inner.state.read().await;
        let windows = self.windows_for(&state);
        LedgerSnapshot {
            token: self.inner.token.clone(),
            head_block: state.head_block,
            transactions: state.transactions.clone(),
            windows,
            last_error: state.last_error.clone(),
        }
    }

    pub async fn windows(&self) -> BTreeMap<LookbackWindow, WindowIndex> {
        let state = self.inner.state.read().await;
        self.windows_for(&state)
    }

    fn windows_for(&self, state: &LedgerState) -> BTreeMap<LookbackWindow, WindowIndex> {
        let mut cache = self
            .inner
            .windows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        cache
            .get(&state.transactions, state.head_block, self.inner.avg_block_time)
            .iter()
            .copied()
            .collect()
    }

    /// Newest-last page of transactions strictly before `before_block`,
    /// at most `limit` long.
    pub async fn transactions(&self, limit: usize, before_block: Option<u64>) -> Vec<TokenTransaction> {
        let state = self.inner.state.read().await;
        let end = match before_block {
            Some(block) => state.transactions.partition_point(|t| t.block_number < block),
            None => state.transactions.len(),
        };
        let start = end.saturating_sub(limit);
        state.transactions[start..end].to_vec()
    }

    pub async fn len(&self) -> usize {
        self.inner.state.read().await.transactions.len()
    }

    pub async fn head_block(&self) -> u64 {
        self.inner.state.read().await.head_block
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.state.read().await.last_error.clone()
    }

    /// Supply after the latest reconciled event.
    pub async fn current_supply(&self) -> U256 {
        self.inner
            .state
            .read()
            .await
            .transactions
            .last()
            .map(|t| t.total_supply_after)
            .unwrap_or_else(U256::zero)
    }

    pub async fn quote_mint(&self, amount: U256) -> Price {
        let supply = self.current_supply().await;
        self.inner.token.curve.mint_cost(supply, amount)
    }

    pub async fn quote_burn(&self, amount: U256) -> Price {
        let supply = self.current_supply().await;
        self.inner.token.curve.burn_proceeds(supply, amount)
    }

    /// Stop the watcher, let queued items settle, then stop the worker.
    pub async fn close(&self) {
        let mut tasks = std::mem::take(&mut *self.lock_tasks());
        // The worker is spawned first; everything after it is a watcher.
        let watchers = tasks.split_off(1.min(tasks.len()));
        for watcher in watchers {
            watcher.abort();
        }
        if let Err(e) = self.flush().await {
            warn!(token = %self.inner.token.label, error = %e, "flush on close failed");
        }
        for worker in tasks {
            worker.abort();
        }
        info!(token = %self.inner.token.label, "ledger closed");
    }
}
