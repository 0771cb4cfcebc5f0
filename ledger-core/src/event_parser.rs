use crate::{
    curve::BondingCurve,
    error::{LedgerError, LedgerResult},
    models::{EventKind, RawLog, TokenTransaction},
};

/// Turn a raw Mint/Burn log into a transaction record.
///
/// The price is always rebuilt from the supply delta on the curve. The
/// display name starts out as the raw address and is replaced once the name
/// cache settles; `price_change_percent` is filled in when the record is
/// placed next to its predecessor.
pub fn parse_event(log: &RawLog, curve: &BondingCurve) -> LedgerResult<TokenTransaction> {
    let malformed = |reason: &str| LedgerError::MalformedLog {
        event: log.event_name.clone(),
        block: log.block_number,
        reason: reason.to_string(),
    };

    let event_kind =
        EventKind::from_event_name(&log.event_name).ok_or_else(|| malformed("unknown event"))?;
    let block_number = log.block_number.ok_or_else(|| malformed("missing blockNumber"))?;
    let trader = log
        .args
        .account
        .as_deref()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| malformed("missing account"))?
        .to_lowercase();
    let amount = log.args.amount.ok_or_else(|| malformed("missing amount"))?;
    let total_supply_after = log
        .args
        .total_supply
        .ok_or_else(|| malformed("missing totalSupply"))?;

    let price = curve.trade_value(event_kind, total_supply_after, amount);

    Ok(TokenTransaction {
        event_kind,
        trader_display_name: trader.clone(),
        trader,
        amount,
        total_supply_after,
        price,
        price_change_percent: 0.0,
        block_number,
        log_index: log.log_index,
        transaction_hash: log.transaction_hash.clone(),
    })
}
