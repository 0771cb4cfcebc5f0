use alloy::transports::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while reconciling a token's transaction history.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("malformed {event} log at block {block:?}: {reason}")]
    MalformedLog {
        event: String,
        block: Option<u64>,
        reason: String,
    },

    #[error("backfill failed after {attempts} attempts: {source}")]
    Backfill {
        attempts: u32,
        #[source]
        source: ChainError,
    },

    #[error("live queue for {0} is closed")]
    QueueClosed(String),

    #[error("invalid token spec: {0}")]
    InvalidToken(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Failures talking to the chain log source.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("rpc transport error: {0}")]
    Transport(#[source] TransportError),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl From<TransportError> for ChainError {
    fn from(err: TransportError) -> Self {
        if let Some(payload) = err.as_error_resp() {
            return ChainError::Rpc {
                code: payload.code,
                message: payload.message.to_string(),
            };
        }
        ChainError::Transport(err)
    }
}

/// Failures resolving a trader's display name.
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("graphql error: {0}")]
    Graphql(String),
}

pub type LedgerResult<T> = Result<T, LedgerError>;
