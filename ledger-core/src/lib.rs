//! Bonding-curve token ledger reconciliation.
//!
//! Rebuilds a token's Mint/Burn history from historical chain logs, then keeps
//! it current from live logs, producing one block-ordered transaction list
//! with curve-derived prices and resolved trader names.

pub mod backfill;
pub mod chain;
pub mod config;
pub mod curve;
pub mod error;
pub mod event_parser;
pub mod ledger;
pub mod models;
pub mod names;
pub mod ordered;
pub mod queue;
pub mod testing;
pub mod windows;

pub use error::{ChainError, LedgerError, LedgerResult, ResolveError};
pub use ledger::{LedgerEvent, LedgerSnapshot, TokenLedger};
pub use models::{EventKind, RawLog, TokenSpec, TokenTransaction};
