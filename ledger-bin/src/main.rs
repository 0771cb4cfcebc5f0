use anyhow::Result;
use ledger_core::{
    chain::{ChainLogSource, JsonRpcLogSource},
    config::{LedgerConfig, LedgerSettings},
    names::{GraphqlNameResolver, NameResolver},
    TokenLedger,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

mod api;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = LedgerConfig::from_env()?;

    tracing::info!("Starting curve ledger with config: {:?}", config.runtime);

    if config.tokens.is_empty() {
        anyhow::bail!("no tokens configured");
    }

    let source: Arc<dyn ChainLogSource> = Arc::new(JsonRpcLogSource::new(&config.chain)?);
    let resolver: Arc<dyn NameResolver> =
        Arc::new(GraphqlNameResolver::new(config.names.graphql_url.clone()));
    let settings = LedgerSettings::from_config(&config)?;

    let ledgers = open_ledgers(&config, source, resolver, settings).await?;
    let result = serve(&config, ledgers.clone()).await;

    for ledger in ledgers.values() {
        ledger.close().await;
    }
    result
}

/// Backfill every configured token, then start its live watcher. Backfills
/// run concurrently; one token failing aborts startup.
async fn open_ledgers(
    config: &LedgerConfig,
    source: Arc<dyn ChainLogSource>,
    resolver: Arc<dyn NameResolver>,
    settings: LedgerSettings,
) -> Result<HashMap<String, TokenLedger>> {
    let specs = config
        .tokens
        .iter()
        .map(|t| t.to_spec())
        .collect::<Result<Vec<_>, _>>()?;

    let opened = futures::future::try_join_all(specs.into_iter().map(|spec| {
        TokenLedger::open(spec, source.clone(), resolver.clone(), settings.clone())
    }))
    .await?;

    let mut ledgers = HashMap::new();
    for ledger in opened {
        ledger.watch(source.clone()).await;
        tracing::info!(
            "Ledger {} ({}) ready with {} transactions",
            ledger.token().label,
            ledger.token().address,
            ledger.len().await
        );
        ledgers.insert(ledger.token().address.clone(), ledger);
    }
    Ok(ledgers)
}

async fn serve(config: &LedgerConfig, ledgers: HashMap<String, TokenLedger>) -> Result<()> {
    let (events_tx, _events_rx) = broadcast::channel::<String>(10_000);

    // Background: ledger insertions -> broadcast for websocket clients.
    for ledger in ledgers.values() {
        let mut rx = ledger.subscribe();
        let events_tx = events_tx.clone();
        let label = ledger.token().label.clone();
        let address = ledger.token().address.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let envelope = serde_json::json!({
                            "topic": "transactions",
                            "token": address,
                            "payload": event,
                        });
                        let _ = events_tx.send(envelope.to_string());
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("{label} event fanout lagged by {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    let app = api::router(api::AppState {
        ledgers: Arc::new(ledgers),
        events_tx,
    });

    let addr: SocketAddr = config.api.bind_addr.parse()?;
    tracing::info!("Starting API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
