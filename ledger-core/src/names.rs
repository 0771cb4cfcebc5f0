// Trader display-name resolution.
//
// Names come from the profile service, are looked up at most once per address
// and cached for the lifetime of the ledger. Any failure (error, timeout, no
// profile) caches the raw address instead; failed lookups are not retried.

use crate::error::ResolveError;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Profile lookup service.
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Display name registered for `address`, if any.
    async fn resolve(&self, address: &str) -> Result<Option<String>, ResolveError>;

    /// Resolve several addresses at once. The default issues the single
    /// lookups concurrently; a failed lookup yields `None` for that address.
    async fn resolve_many(
        &self,
        addresses: &[String],
    ) -> Result<HashMap<String, Option<String>>, ResolveError> {
        let lookups = addresses.iter().map(|address| async move {
            let name = match self.resolve(address).await {
                Ok(name) => name,
                Err(e) => {
                    warn!(address = %address, error = %e, "name lookup failed");
                    None
                }
            };
            (address.clone(), name)
        });
        Ok(futures::future::join_all(lookups).await.into_iter().collect())
    }
}

/// Memoising front of a `NameResolver`.
///
/// Each address owns a `OnceCell`, so concurrent callers for the same address
/// share one in-flight lookup.
pub struct NameCache {
    resolver: Arc<dyn NameResolver>,
    entries: Mutex<HashMap<String, Arc<OnceCell<String>>>>,
    timeout: Duration,
    batch_size: usize,
}

impl NameCache {
    pub fn new(resolver: Arc<dyn NameResolver>, timeout: Duration, batch_size: usize) -> Self {
        Self {
            resolver,
            entries: Mutex::new(HashMap::new()),
            timeout,
            batch_size: batch_size.max(1),
        }
    }

    fn cell(&self, key: &str) -> Arc<OnceCell<String>> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone()
    }

    /// Settled name for `address`, without triggering a lookup.
    pub fn cached(&self, address: &str) -> Option<String> {
        let key = address.to_lowercase();
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(&key).and_then(|cell| cell.get().cloned())
    }

    /// Display name for `address`, looking it up on first use.
    pub async fn display_name(&self, address: &str) -> String {
        let key = address.to_lowercase();
        let cell = self.cell(&key);
        cell.get_or_init(|| self.lookup(&key)).await.clone()
    }

    async fn lookup(&self, address: &str) -> String {
        match tokio::time::timeout(self.timeout, self.resolver.resolve(address)).await {
            Ok(Ok(Some(name))) if !name.is_empty() => name,
            Ok(Ok(_)) => {
                debug!(address = %address, "no profile name, using address");
                address.to_string()
            }
            Ok(Err(e)) => {
                warn!(address = %address, error = %e, "name lookup failed, using address");
                address.to_string()
            }
            Err(_) => {
                warn!(address = %address, timeout = ?self.timeout, "name lookup timed out, using address");
                address.to_string()
            }
        }
    }

    /// Resolve every address not cached yet in batched lookups.
    pub async fn prime(&self, addresses: &[String]) {
        let mut seen = HashSet::new();
        let pending: Vec<String> = addresses
            .iter()
            .map(|a| a.to_lowercase())
            .filter(|a| seen.insert(a.clone()))
            .filter(|a| !self.cell(a).initialized())
            .collect();

        if pending.is_empty() {
            return;
        }
        debug!(addresses = pending.len(), "priming name cache");

        for chunk in pending.chunks(self.batch_size) {
            let names =
                match tokio::time::timeout(self.timeout, self.resolver.resolve_many(chunk)).await {
                    Ok(Ok(names)) => names,
                    Ok(Err(e)) => {
                        warn!(error = %e, addresses = chunk.len(), "batched name lookup failed");
                        HashMap::new()
                    }
                    Err(_) => {
                        warn!(timeout = ?self.timeout, addresses = chunk.len(), "batched name lookup timed out");
                        HashMap::new()
                    }
                };

            for address in chunk {
                let name = names
                    .get(address)
                    .cloned()
                    .flatten()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| address.clone());
                // A concurrent single lookup may have won; either value is final.
                let _ = self.cell(address).set(name);
            }
        }
    }
}

const USER_NAME_QUERY: &str =
    "query GetUserName($address: String!) { getUser(data: { address: $address }) { username } }";

/// Profile lookups against the platform's GraphQL API.
pub struct GraphqlNameResolver {
    http: reqwest::Client,
    endpoint: String,
}

impl GraphqlNameResolver {
    pub fn new(endpoint: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
        }
    }

    async fn post(&self, body: Value) -> Result<Value, ResolveError> {
        let resp: Value = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if let Some(errors) = resp.get("errors").and_then(|e| e.as_array()) {
            if !errors.is_empty() && resp.get("data").map_or(true, Value::is_null) {
                return Err(ResolveError::Graphql(Value::Array(errors.clone()).to_string()));
            }
        }
        Ok(resp.get("data").cloned().unwrap_or(Value::Null))
    }
}

fn username(user: Option<&Value>) -> Option<String> {
    user.and_then(|u| u.get("username"))
        .and_then(|n| n.as_str())
        .filter(|n| !n.is_empty())
        .map(|n| n.to_string())
}

/// Only plain hex addresses are inlined into batched queries.
fn is_hex_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .is_some_and(|hex| !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

/// One aliased `getUser` field per address.
fn batched_user_query(addresses: &[String]) -> String {
    let fields: Vec<String> = addresses
        .iter()
        .enumerate()
        .filter(|(_, a)| is_hex_address(a))
        .map(|(i, a)| format!("a{i}: getUser(data: {{ address: \"{a}\" }}) {{ username }}"))
        .collect();
    format!("query GetUserNames {{ {} }}", fields.join(" "))
}

#[async_trait]
impl NameResolver for GraphqlNameResolver {
    async fn resolve(&self, address: &str) -> Result<Option<String>, ResolveError> {
        let data = self
            .post(json!({ "query": USER_NAME_QUERY, "variables": { "address": address } }))
            .await?;
        Ok(username(data.get("getUser")))
    }

    async fn resolve_many(
        &self,
        addresses: &[String],
    ) -> Result<HashMap<String, Option<String>>, ResolveError> {
        let mut out: HashMap<String, Option<String>> =
            addresses.iter().map(|a| (a.clone(), None)).collect();
        if !addresses.iter().any(|a| is_hex_address(a)) {
            return Ok(out);
        }

        let data = self
            .post(json!({ "query": batched_user_query(addresses) }))
            .await?;
        for (i, address) in addresses.iter().enumerate() {
            out.insert(address.clone(), username(data.get(format!("a{i}"))));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockNameResolver;

    fn cache(resolver: Arc<MockNameResolver>) -> NameCache {
        NameCache::new(resolver, Duration::from_millis(200), 2)
    }

    #[tokio::test]
    async fn test_resolves_once_and_memoises() {
        let resolver = Arc::new(MockNameResolver::new().with_name("0xaa", "alice"));
        let names = cache(resolver.clone());

        assert_eq!(names.cached("0xaa"), None);
        assert_eq!(names.display_name("0xAA").await, "alice");
        assert_eq!(names.display_name("0xaa").await, "alice");
        assert_eq!(names.cached("0xaa").as_deref(), Some("alice"));
        assert_eq!(resolver.lookups("0xaa"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_lookup() {
        let resolver = Arc::new(
            MockNameResolver::new()
                .with_name("0xaa", "alice")
                .with_delay("0xaa", Duration::from_millis(50)),
        );
        let names = Arc::new(cache(resolver.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let names = names.clone();
                tokio::spawn(async move { names.display_name("0xaa").await })
            })
            .collect();
        for task in tasks {
            assert_eq!(task.await.unwrap(), "alice");
        }
        assert_eq!(resolver.lookups("0xaa"), 1);
    }

    #[tokio::test]
    async fn test_failures_fall_back_to_address_permanently() {
        let resolver = Arc::new(MockNameResolver::new().failing("0xbad"));
        let names = cache(resolver.clone());

        assert_eq!(names.display_name("0xbad").await, "0xbad");
        assert_eq!(names.display_name("0xbad").await, "0xbad");
        assert_eq!(resolver.lookups("0xbad"), 1);

        // no profile at all
        assert_eq!(names.display_name("0xnobody").await, "0xnobody");
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_address() {
        let resolver = Arc::new(
            MockNameResolver::new()
                .with_name("0xslow", "sloth")
                .with_delay("0xslow", Duration::from_secs(5)),
        );
        let names = NameCache::new(resolver, Duration::from_millis(20), 10);
        assert_eq!(names.display_name("0xslow").await, "0xslow");
    }

    #[tokio::test]
    async fn test_prime_batches_and_skips_cached() {
        let resolver = Arc::new(
            MockNameResolver::new()
                .with_name("0x01", "one")
                .with_name("0x02", "two")
                .with_name("0x03", "three"),
        );
        let names = cache(resolver.clone());
        names.display_name("0x01").await;

        let addrs: Vec<String> = ["0x01", "0x02", "0x02", "0x03", "0x04"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        names.prime(&addrs).await;

        assert_eq!(names.cached("0x02").as_deref(), Some("two"));
        assert_eq!(names.cached("0x03").as_deref(), Some("three"));
        assert_eq!(names.cached("0x04").as_deref(), Some("0x04"));
        // 0x01 was cached already; the rest went out in chunks of two
        assert_eq!(resolver.lookups("0x01"), 1);
        assert_eq!(resolver.batches(), vec![2, 1]);

        // priming again is a no-op
        names.prime(&addrs).await;
        assert_eq!(resolver.batches().len(), 2);
    }

    #[test]
    fn test_batched_query_skips_non_hex_addresses() {
        let addrs = vec![
            "0xabc".to_string(),
            "0x\"}) { secret }".to_string(),
            "0xdef".to_string(),
        ];
        let query = batched_user_query(&addrs);
        assert!(query.contains("a0: getUser(data: { address: \"0xabc\" }) { username }"));
        assert!(query.contains("a2: getUser(data: { address: \"0xdef\" })"));
        assert!(!query.contains("secret"));
    }

    #[test]
    fn test_username_extraction() {
        let data = json!({ "a0": { "username": "bob" }, "a1": null, "a2": { "username": "" } });
        assert_eq!(username(data.get("a0")), Some("bob".to_string()));
        assert_eq!(username(data.get("a1")), None);
        assert_eq!(username(data.get("a2")), None);
        assert_eq!(username(data.get("a3")), None);
    }
}
