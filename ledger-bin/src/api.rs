use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use ledger_core::{
    curve::U256,
    windows::{LookbackWindow, WindowIndex},
    TokenLedger, TokenTransaction,
};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Clone)]
pub struct AppState {
    /// Keyed by lowercase token address.
    pub ledgers: Arc<HashMap<String, TokenLedger>>,
    pub events_tx: broadcast::Sender<String>,
}

impl AppState {
    fn ledger(&self, address: &str) -> Result<&TokenLedger, StatusCode> {
        self.ledgers
            .get(&address.to_ascii_lowercase())
            .ok_or(StatusCode::NOT_FOUND)
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route(
            "/token/:address/transactions",
            get(token_transactions_handler),
        )
        .route("/token/:address/windows", get(token_windows_handler))
        .route("/token/:address/quote", get(token_quote_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics_handler(State(state): State<AppState>) -> Json<JsonValue> {
    let mut tokens = Vec::with_capacity(state.ledgers.len());
    for (address, ledger) in state.ledgers.iter() {
        tokens.push(serde_json::json!({
            "label": ledger.token().label,
            "address": address,
            "transactions_count": ledger.len().await,
            "head_block": ledger.head_block().await,
            "last_error": ledger.last_error().await,
        }));
    }
    Json(serde_json::json!({ "tokens": tokens }))
}

#[derive(Debug, Deserialize)]
struct TransactionsQuery {
    limit: Option<usize>,
    before_block: Option<u64>,
}

async fn token_transactions_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(q): Query<TransactionsQuery>,
) -> Result<Json<Vec<TokenTransaction>>, StatusCode> {
    let ledger = state.ledger(&address)?;
    let limit = q.limit.unwrap_or(200).clamp(1, 5_000);
    Ok(Json(ledger.transactions(limit, q.before_block).await))
}

async fn token_windows_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<BTreeMap<LookbackWindow, WindowIndex>>, StatusCode> {
    let ledger = state.ledger(&address)?;
    Ok(Json(ledger.windows().await))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum QuoteSide {
    Mint,
    Burn,
}

#[derive(Debug, Deserialize)]
struct QuoteQuery {
    side: QuoteSide,
    amount: String,
}

async fn token_quote_handler(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Query(q): Query<QuoteQuery>,
) -> Result<Json<JsonValue>, StatusCode> {
    let ledger = state.ledger(&address)?;
    let amount = U256::from_dec_str(&q.amount).map_err(|_| StatusCode::BAD_REQUEST)?;

    let supply = ledger.current_supply().await;
    let (side, value) = match q.side {
        QuoteSide::Mint => ("mint", ledger.quote_mint(amount).await),
        QuoteSide::Burn => ("burn", ledger.quote_burn(amount).await),
    };

    Ok(Json(serde_json::json!({
        "side": side,
        "amount": amount.to_string(),
        "supply": supply.to_string(),
        "value": value.to_string(),
    })))
}

async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

async fn handle_ws(mut socket: WebSocket, state: AppState) {
    // Protocol:
    // - Client may send: {"type":"subscribe","token":"0x..."}
    // - Server pushes: {"topic":"transactions","token":"0x...","payload":{...}}
    let mut rx = state.events_tx.subscribe();

    // Default: every token.
    let mut allowed_token: Option<String> = None;

    loop {
        tokio::select! {
            recv = socket.recv() => {
                let Some(Ok(msg)) = recv else { break; };
                if let Message::Text(txt) = msg {
                    if let Ok(v) = serde_json::from_str::<JsonValue>(&txt) {
                        if v.get("type").and_then(|x| x.as_str()) == Some("subscribe") {
                            allowed_token = v
                                .get("token")
                                .and_then(|t| t.as_str())
                                .map(|s| s.to_ascii_lowercase());
                            let _ = socket.send(Message::Text(r#"{"type":"subscribed"}"#.to_string())).await;
                        }
                    }
                }
            }
            evt = rx.recv() => {
                let payload = match evt {
                    Ok(p) => p,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Some(ref token) = allowed_token {
                    let matches = serde_json::from_str::<JsonValue>(&payload)
                        .ok()
                        .and_then(|v| v.get("token").and_then(|t| t.as_str()).map(|t| t == token))
                        .unwrap_or(false);
                    if !matches {
                        continue;
                    }
                }

                if socket.send(Message::Text(payload)).await.is_err() {
                    break;
                }
            }
        }
    }
}
