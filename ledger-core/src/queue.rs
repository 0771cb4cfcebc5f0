// Live event queue.
//
// Every live mutation of a ledger goes through one unbounded channel drained
// by a single worker task. An item is fully settled (parsed, name resolved,
// inserted) before the next one is taken, so records land in enqueue order no
// matter how long each name lookup takes.

use crate::{
    curve::BondingCurve,
    error::{LedgerError, LedgerResult},
    event_parser::parse_event,
    ledger::{LedgerEvent, LedgerState},
    models::RawLog,
    names::NameCache,
    ordered::{insert_ordered, sort_raw_logs},
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum QueueItem {
    Log(RawLog),
    Head(u64),
    Failure(String),
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Draining,
}

/// Producer side of a ledger's live queue.
#[derive(Clone)]
pub struct LiveQueue {
    label: String,
    tx: mpsc::UnboundedSender<QueueItem>,
    pending: Arc<AtomicUsize>,
}

impl LiveQueue {
    /// Start the single consumer. All state mutation after backfill happens
    /// inside the returned task.
    pub(crate) fn spawn(
        label: String,
        state: Arc<RwLock<LedgerState>>,
        names: Arc<NameCache>,
        curve: BondingCurve,
        events: broadcast::Sender<LedgerEvent>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = Worker {
            label: label.clone(),
            state,
            names,
            curve,
            events,
            pending: pending.clone(),
        };
        let handle = tokio::spawn(worker.drain(rx));

        (Self { label, tx, pending }, handle)
    }

    fn send(&self, item: QueueItem) -> LedgerResult<()> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.tx.send(item).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            LedgerError::QueueClosed(self.label.clone())
        })
    }

    /// Enqueue one listener delivery. The batch is sorted by block (then log
    /// index) and its logs are queued individually.
    pub fn push_batch(&self, mut batch: Vec<RawLog>) -> LedgerResult<()> {
        sort_raw_logs(&mut batch);
        for log in batch {
            self.send(QueueItem::Log(log))?;
        }
        Ok(())
    }

    /// Record a newly observed chain head. Also clears a previously reported
    /// fetch failure, since the source answered again.
    pub fn set_head(&self, head: u64) -> LedgerResult<()> {
        self.send(QueueItem::Head(head))
    }

    /// Record a live fetch failure so readers can see the ledger is stale.
    pub fn report_error(&self, message: String) -> LedgerResult<()> {
        self.send(QueueItem::Failure(message))
    }

    /// Resolves once everything enqueued before this call has settled.
    pub async fn flush(&self) -> LedgerResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(QueueItem::Flush(done_tx))?;
        done_rx
            .await
            .map_err(|_| LedgerError::QueueClosed(self.label.clone()))
    }

    pub fn state(&self) -> QueueState {
        if self.pending.load(Ordering::SeqCst) == 0 {
            QueueState::Idle
        } else {
            QueueState::Draining
        }
    }
}

struct Worker {
    label: String,
    state: Arc<RwLock<LedgerState>>,
    names: Arc<NameCache>,
    curve: BondingCurve,
    events: broadcast::Sender<LedgerEvent>,
    pending: Arc<AtomicUsize>,
}

impl Worker {
    async fn drain(self, mut rx: mpsc::UnboundedReceiver<QueueItem>) {
        while let Some(item) = rx.recv().await {
            match item {
                QueueItem::Log(log) => self.process(log).await,
                QueueItem::Head(head) => {
                    let mut state = self.state.write().await;
                    state.head_block = state.head_block.max(head);
                    state.last_error = None;
                }
                QueueItem::Failure(message) => {
                    self.state.write().await.last_error = Some(message);
                }
                QueueItem::Flush(done) => {
                    // Settle the counter first so a flushed queue reads as idle.
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    let _ = done.send(());
                    continue;
                }
            }
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug!(token = %self.label, "live queue drained and closed");
    }

    async fn process(&self, log: RawLog) {
        let mut tx = match parse_event(&log, &self.curve) {
            Ok(tx) => tx,
            Err(e) => {
                warn!(token = %self.label, error = %e, "skipping malformed live log");
                return;
            }
        };

        let log_id = tx.log_id();
        if let Some(id) = &log_id {
            if self.state.read().await.seen.contains(id) {
                debug!(token = %self.label, block = tx.block_number, "duplicate live log ignored");
                return;
            }
        }

        tx.trader_display_name = self.names.display_name(&tx.trader).await;

        let mut state = self.state.write().await;
        if let Some(id) = log_id {
            if !state.seen.insert(id) {
                return;
            }
        }
        state.head_block = state.head_block.max(tx.block_number);
        let index = insert_ordered(&mut state.transactions, tx);
        let transaction = state.transactions[index].clone();
        // An insert before the tail changes the successor's price change too.
        let successor = state.transactions.get(index + 1).cloned();
        drop(state);

        debug!(
            token = %self.label,
            index,
            block = transaction.block_number,
            kind = %transaction.event_kind,
            "live transaction inserted"
        );
        // No subscribers is fine.
        let _ = self.events.send(LedgerEvent::Inserted {
            token: self.label.clone(),
            index,
            transaction,
        });
        if let Some(transaction) = successor {
            let _ = self.events.send(LedgerEvent::Updated {
                token: self.label.clone(),
                index: index + 1,
                transaction,
            });
        }
    }
}
