use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use ledger_core::{
    chain::{event_topic, ChainLogSource, JsonRpcLogSource},
    config::ChainConfig,
    curve::U256,
    names::{GraphqlNameResolver, NameResolver},
    testing::{token_spec, TEST_TOKEN_ADDRESS},
    ChainError, EventKind, ResolveError,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

async fn serve(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn quantity(value: &Value) -> u64 {
    let s = value.as_str().unwrap();
    u64::from_str_radix(s.trim_start_matches("0x"), 16).unwrap()
}

// --- JSON-RPC node ---------------------------------------------------------

#[derive(Default)]
struct Node {
    head: u64,
    logs: Vec<Value>,
    /// Ranges starting here answer late, after later ranges.
    slow_from: Option<u64>,
    ranges: Mutex<Vec<(u64, u64)>>,
    fail_get_logs: bool,
}

async fn rpc(State(node): State<Arc<Node>>, Json(req): Json<Value>) -> Json<Value> {
    let id = req["id"].clone();
    let result = match req["method"].as_str() {
        Some("eth_blockNumber") => json!(format!("0x{:x}", node.head)),
        Some("eth_getLogs") if node.fail_get_logs => {
            return Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32005, "message": "query returned more than 10000 results" }
            }));
        }
        Some("eth_getLogs") => {
            let filter = &req["params"][0];
            let (from, to) = (quantity(&filter["fromBlock"]), quantity(&filter["toBlock"]));
            node.ranges.lock().unwrap().push((from, to));
            if node.slow_from == Some(from) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            let logs: Vec<Value> = node
                .logs
                .iter()
                .filter(|l| {
                    let block = quantity(&l["blockNumber"]);
                    block >= from && block <= to
                })
                .cloned()
                .collect();
            Value::Array(logs)
        }
        _ => {
            return Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": "method not found" }
            }));
        }
    };
    Json(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

fn word(n: u64) -> String {
    format!("{n:064x}")
}

fn mint_entry(account: &str, amount: u64, supply: u64, block: u64, index: u64) -> Value {
    json!({
        "address": TEST_TOKEN_ADDRESS,
        "topics": [
            alloy::primitives::hex::encode_prefixed(event_topic("Mint(address,uint256,uint256)")),
            format!("0x{:0>64}", account),
        ],
        "data": format!("0x{}{}", word(amount), word(supply)),
        "blockHash": format!("0x{:064x}", block),
        "blockNumber": format!("0x{block:x}"),
        "transactionHash": format!("0x{:064x}", block * 1_000 + index),
        "transactionIndex": "0x0",
        "logIndex": format!("0x{index:x}"),
        "removed": false,
    })
}

fn chain_config(addr: SocketAddr, max_block_range: u64) -> ChainConfig {
    ChainConfig {
        rpc_url: format!("http://{addr}"),
        max_block_range,
        batch_size: 4,
        poll_interval_ms: 10,
        request_timeout_ms: 2_000,
        initial_backoff_ms: None,
        max_backoff_ms: None,
        backfill_attempts: 1,
        avg_block_time_secs: 2.0,
    }
}

async fn node_source(node: Node, max_block_range: u64) -> (Arc<Node>, JsonRpcLogSource) {
    let node = Arc::new(node);
    let app = Router::new().route("/", post(rpc)).with_state(node.clone());
    let addr = serve(app).await;
    let source = JsonRpcLogSource::new(&chain_config(addr, max_block_range)).unwrap();
    (node, source)
}

#[tokio::test]
async fn test_head_block_from_node() {
    let (_, source) = node_source(
        Node {
            head: 0x1234,
            ..Default::default()
        },
        100,
    )
    .await;
    assert_eq!(source.head_block().await.unwrap(), 0x1234);
}

#[tokio::test]
async fn test_fetch_logs_chunks_range_and_keeps_order_when_answers_arrive_late() {
    let (node, source) = node_source(
        Node {
            head: 400,
            logs: vec![
                mint_entry("11", 1, 1, 120, 0),
                mint_entry("22", 1, 2, 260, 3),
                mint_entry("33", 1, 3, 399, 1),
            ],
            slow_from: Some(100),
            ..Default::default()
        },
        100,
    )
    .await;

    let query = token_spec().log_query(EventKind::Mint, 100, 399);
    let logs = source.fetch_logs(&query).await.unwrap();

    let blocks: Vec<u64> = logs.iter().filter_map(|l| l.block_number).collect();
    assert_eq!(blocks, vec![120, 260, 399]);
    assert_eq!(logs[0].args.account.as_deref(), Some("0x0000000000000000000000000000000000000011"));
    assert_eq!(logs[1].args.total_supply, Some(U256::from(2u64)));
    assert_eq!(logs[1].log_index, Some(3));

    let mut ranges = node.ranges.lock().unwrap().clone();
    ranges.sort();
    assert_eq!(ranges, vec![(100, 199), (200, 299), (300, 399)]);
}

#[tokio::test]
async fn test_fetch_logs_drops_removed_and_undecodable_entries() {
    let mut removed = mint_entry("22", 1, 2, 20, 0);
    removed["removed"] = json!(true);
    let mut bad_topic = mint_entry("33", 1, 3, 30, 0);
    bad_topic["topics"] = json!([
        "0xabc",
        format!("0x{:0>64}", "44"),
        format!("0x{:0>64}", "55"),
    ]);

    let (_, source) = node_source(
        Node {
            head: 100,
            logs: vec![mint_entry("11", 1, 1, 10, 0), removed, bad_topic],
            ..Default::default()
        },
        1_000,
    )
    .await;

    let logs = source
        .fetch_logs(&token_spec().log_query(EventKind::Mint, 0, 100))
        .await
        .unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].block_number, Some(10));
    assert_eq!(logs[0].args.account.as_deref(), Some("0x0000000000000000000000000000000000000011"));
}

#[tokio::test]
async fn test_fetch_logs_surfaces_rpc_errors() {
    let (_, source) = node_source(
        Node {
            head: 100,
            fail_get_logs: true,
            ..Default::default()
        },
        1_000,
    )
    .await;

    match source
        .fetch_logs(&token_spec().log_query(EventKind::Mint, 0, 100))
        .await
    {
        Err(ChainError::Rpc { code, .. }) => assert_eq!(code, -32005),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_range_issues_no_request() {
    let (node, source) = node_source(Node::default(), 100).await;
    let logs = source
        .fetch_logs(&token_spec().log_query(EventKind::Burn, 50, 49))
        .await
        .unwrap();
    assert!(logs.is_empty());
    assert!(node.ranges.lock().unwrap().is_empty());
}

// --- GraphQL profile service -----------------------------------------------

struct Profiles {
    status: StatusCode,
    response: Value,
    requests: Mutex<Vec<Value>>,
}

async fn graphql(State(svc): State<Arc<Profiles>>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    svc.requests.lock().unwrap().push(body);
    (svc.status, Json(svc.response.clone()))
}

async fn profiles(status: StatusCode, response: Value) -> (Arc<Profiles>, GraphqlNameResolver) {
    let svc = Arc::new(Profiles {
        status,
        response,
        requests: Mutex::new(Vec::new()),
    });
    let app = Router::new().route("/graphql", post(graphql)).with_state(svc.clone());
    let addr = serve(app).await;
    (svc, GraphqlNameResolver::new(format!("http://{addr}/graphql")))
}

#[tokio::test]
async fn test_single_lookup_sends_address_variable() {
    let (svc, resolver) = profiles(
        StatusCode::OK,
        json!({ "data": { "getUser": { "username": "bob" } } }),
    )
    .await;

    assert_eq!(resolver.resolve("0xbb").await.unwrap().as_deref(), Some("bob"));
    let requests = svc.requests.lock().unwrap();
    assert_eq!(requests[0]["variables"]["address"], "0xbb");
}

#[tokio::test]
async fn test_batched_lookup_maps_aliases_back_past_skipped_entries() {
    let (svc, resolver) = profiles(
        StatusCode::OK,
        json!({ "data": {
            "a0": { "username": "alice" },
            "a2": { "username": "carol" },
        } }),
    )
    .await;

    let addresses = vec!["0xaa".to_string(), "not-an-address".to_string(), "0xcc".to_string()];
    let names: HashMap<String, Option<String>> = resolver.resolve_many(&addresses).await.unwrap();
    assert_eq!(names["0xaa"].as_deref(), Some("alice"));
    assert_eq!(names["not-an-address"], None);
    assert_eq!(names["0xcc"].as_deref(), Some("carol"));

    let query = svc.requests.lock().unwrap()[0]["query"].as_str().unwrap().to_string();
    assert!(query.contains("a0: getUser"));
    assert!(!query.contains("a1: getUser"));
    assert!(query.contains("a2: getUser"));
}

#[tokio::test]
async fn test_batched_lookup_without_hex_addresses_skips_the_request() {
    let (svc, resolver) = profiles(StatusCode::OK, json!({ "data": {} })).await;
    let names = resolver.resolve_many(&["nobody".to_string()]).await.unwrap();
    assert_eq!(names["nobody"], None);
    assert!(svc.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_graphql_errors_without_data_fail_the_lookup() {
    let (_, resolver) = profiles(
        StatusCode::OK,
        json!({ "data": null, "errors": [{ "message": "user service down" }] }),
    )
    .await;

    match resolver.resolve("0xaa").await {
        Err(ResolveError::Graphql(message)) => assert!(message.contains("user service down")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn test_graphql_partial_errors_keep_the_data() {
    let (_, resolver) = profiles(
        StatusCode::OK,
        json!({
            "data": { "getUser": null },
            "errors": [{ "message": "user not found" }]
        }),
    )
    .await;

    assert_eq!(resolver.resolve("0xaa").await.unwrap(), None);
}

#[tokio::test]
async fn test_http_failure_is_a_resolve_error() {
    let (_, resolver) = profiles(StatusCode::INTERNAL_SERVER_ERROR, json!({})).await;
    assert!(matches!(resolver.resolve("0xaa").await, Err(ResolveError::Http(_))));
}
