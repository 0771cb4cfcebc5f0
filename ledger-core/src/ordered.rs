use crate::{
    curve::price_change_percent,
    models::{RawLog, TokenTransaction},
};

/// Position at which a transaction for `block_number` belongs.
///
/// Scans from the tail since live events almost always land at the end.
/// Transactions sharing a block keep their insertion order: the new one goes
/// after every existing record of the same block.
pub fn insertion_index(list: &[TokenTransaction], block_number: u64) -> usize {
    let mut idx = list.len();
    while idx > 0 && list[idx - 1].block_number > block_number {
        idx -= 1;
    }
    idx
}

/// Insert `tx` keeping `list` sorted by block number. Returns the index the
/// record landed at.
///
/// The price change of the inserted record and of its successor are
/// recomputed, since both now have a different predecessor.
pub fn insert_ordered(list: &mut Vec<TokenTransaction>, tx: TokenTransaction) -> usize {
    let idx = insertion_index(list, tx.block_number);
    list.insert(idx, tx);
    refresh_price_change(list, idx);
    if idx + 1 < list.len() {
        refresh_price_change(list, idx + 1);
    }
    idx
}

fn refresh_price_change(list: &mut [TokenTransaction], idx: usize) {
    let previous = idx.checked_sub(1).map(|i| list[i].price);
    list[idx].price_change_percent = price_change_percent(previous.as_ref(), &list[idx].price);
}

/// One-shot bulk sort of raw logs by `(blockNumber, logIndex)`. The sort is
/// stable, so logs without a log index keep their delivery order.
pub fn sort_raw_logs(logs: &mut [RawLog]) {
    logs.sort_by_key(RawLog::sort_key);
}

pub fn is_sorted(list: &[TokenTransaction]) -> bool {
    list.windows(2).all(|w| w[0].block_number <= w[1].block_number)
}
