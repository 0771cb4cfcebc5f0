use crate::{
    chain::ChainLogSource,
    curve::{price_change_percent, BondingCurve},
    error::ChainError,
    event_parser::parse_event,
    models::{EventKind, RawLog, TokenSpec, TokenTransaction},
    names::NameCache,
    ordered::sort_raw_logs,
};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Result of the one-shot historical reconstruction.
#[derive(Debug, Clone)]
pub struct Backfill {
    pub transactions: Vec<TokenTransaction>,
    /// Chain head the backfill ran up to; live watching resumes after it.
    pub head_block: u64,
    /// Malformed logs that were dropped.
    pub skipped: usize,
}

/// Fetch every Mint and Burn log since the token's creation, fold them into
/// transactions and resolve all trader names in one batched pass.
pub async fn run_backfill(
    source: &dyn ChainLogSource,
    token: &TokenSpec,
    names: &NameCache,
) -> Result<Backfill, ChainError> {
    let head_block = source.head_block().await?;
    if head_block < token.creation_block {
        info!(token = %token.label, head_block, "chain head before token creation, nothing to backfill");
        return Ok(Backfill {
            transactions: Vec::new(),
            head_block,
            skipped: 0,
        });
    }

    let mint_query = token.log_query(EventKind::Mint, token.creation_block, head_block);
    let burn_query = token.log_query(EventKind::Burn, token.creation_block, head_block);
    let (mut logs, burns) = tokio::try_join!(
        source.fetch_logs(&mint_query),
        source.fetch_logs(&burn_query)
    )?;
    logs.extend(burns);
    sort_raw_logs(&mut logs);

    let (mut transactions, skipped) = fold_logs(&logs, &token.curve);

    let traders: Vec<String> = transactions
        .iter()
        .map(|t| t.trader.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    names.prime(&traders).await;
    for tx in &mut transactions {
        if let Some(name) = names.cached(&tx.trader) {
            tx.trader_display_name = name;
        }
    }

    info!(
        token = %token.label,
        from = token.creation_block,
        to = head_block,
        transactions = transactions.len(),
        traders = traders.len(),
        skipped,
        "backfill complete"
    );

    Ok(Backfill {
        transactions,
        head_block,
        skipped,
    })
}

/// Fold already sorted logs into transactions, pricing each against the
/// running predecessor. Malformed logs are skipped.
pub fn fold_logs(logs: &[RawLog], curve: &BondingCurve) -> (Vec<TokenTransaction>, usize) {
    let mut out: Vec<TokenTransaction> = Vec::with_capacity(logs.len());
    let mut skipped = 0;

    for log in logs {
        match parse_event(log, curve) {
            Ok(mut tx) => {
                tx.price_change_percent =
                    price_change_percent(out.last().map(|prev| &prev.price), &tx.price);
                out.push(tx);
            }
            Err(e) => {
                warn!(error = %e, "skipping malformed log");
                skipped += 1;
            }
        }
    }

    (out, skipped)
}
