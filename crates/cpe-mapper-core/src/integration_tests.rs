//! End-to-end pipeline tests driven by scripted search and oracle clients.

use crate::config::MappingConfig;
use crate::llm::CpeSuggest;
use crate::mapping::{MappingStore, MatchMethod};
use crate::nvd::{CpeSearch, SearchHit};
use crate::rate::RateGate;
use crate::resolver::{CpeResolver, LookupRequest};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Search backend answering from a fixed query -> hit table, recording
/// every query it receives.
#[derive(Default)]
struct ScriptedSearch {
    hits: HashMap<String, SearchHit>,
    queries: Mutex<Vec<String>>,
}

impl ScriptedSearch {
    fn with_hit(query: &str, cpe: &str) -> Self {
        let mut hits = HashMap::new();
        hits.insert(query.to_string(), SearchHit::from_cpe(cpe.to_string()));
        Self {
            hits,
            queries: Mutex::new(Vec::new()),
        }
    }

    fn empty() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CpeSearch for Arc<ScriptedSearch> {
    async fn search(&self, query: &str) -> Result<Option<SearchHit>> {
        self.queries.lock().unwrap().push(query.to_string());
        Ok(self.hits.get(query).cloned())
    }
}

/// Search backend whose transport always fails.
struct FailingSearch;

#[async_trait]
impl CpeSearch for FailingSearch {
    async fn search(&self, _query: &str) -> Result<Option<SearchHit>> {
        Err(anyhow::anyhow!("connection refused"))
    }
}

struct ScriptedOracle {
    hit: Option<SearchHit>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    fn with_hit(cpe: &str) -> Self {
        Self {
            hit: Some(SearchHit::from_cpe(cpe.to_string())),
            calls: AtomicUsize::new(0),
        }
    }

    fn empty() -> Self {
        Self {
            hit: None,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CpeSuggest for Arc<ScriptedOracle> {
    async fn suggest(
        &self,
        _name: &str,
        _publisher: Option<&str>,
        _version: Option<&str>,
    ) -> Result<Option<SearchHit>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.hit.clone())
    }
}

fn test_store() -> (MappingStore, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let config = MappingConfig {
        database_path: temp_dir.path().join("pipeline_test.db"),
    };
    (MappingStore::new(config).unwrap(), temp_dir)
}

fn resolver_with(
    search: Arc<ScriptedSearch>,
    oracle: Option<Arc<ScriptedOracle>>,
) -> (CpeResolver, TempDir) {
    let (store, temp_dir) = test_store();
    let resolver = CpeResolver::new(
        store,
        Box::new(search),
        oracle.map(|o| Box::new(o) as Box<dyn CpeSuggest>),
        Arc::new(RateGate::new(Duration::ZERO)),
    )
    .unwrap();
    (resolver, temp_dir)
}

const SEVEN_ZIP_CPE: &str = "cpe:2.3:a:7-zip:7-zip:24.09:*:*:*:*:*:*:*";

#[tokio::test]
async fn test_exact_hit_then_cache_hit() -> Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .try_init();

    let search = Arc::new(ScriptedSearch::with_hit("7-Zip", SEVEN_ZIP_CPE));
    let (resolver, _dir) = resolver_with(search.clone(), None);

    let request = LookupRequest::named("7-Zip 24.09 (x64)");

    let first = resolver.lookup(&request).await?;
    assert_eq!(first.match_method, MatchMethod::Exact);
    assert!(!first.cached);
    assert_eq!(first.cpe.as_deref(), Some(SEVEN_ZIP_CPE));
    assert_eq!(first.vendor.as_deref(), Some("7-zip"));
    assert_eq!(first.matched_name.as_deref(), Some("7-Zip"));
    assert_eq!(search.queries.lock().unwrap().len(), 1);

    let second = resolver.lookup(&request).await?;
    assert!(second.cached);
    assert_eq!(second.cpe, first.cpe);
    assert_eq!(second.match_method, MatchMethod::Exact);
    // No further external queries for a cached name.
    assert_eq!(search.queries.lock().unwrap().len(), 1);

    Ok(())
}

#[tokio::test]
async fn test_not_found_is_terminal() -> Result<()> {
    let search = Arc::new(ScriptedSearch::empty());
    let oracle = Arc::new(ScriptedOracle::empty());
    let (resolver, _dir) = resolver_with(search.clone(), Some(oracle.clone()));

    let request = LookupRequest::named("Some Unknown App");

    let first = resolver.lookup(&request).await?;
    assert_eq!(first.match_method, MatchMethod::NotFound);
    assert!(first.cpe.is_none());
    assert!(first.vendor.is_none());
    assert!(!first.cached);

    let queries_after_first = search.queries.lock().unwrap().len();
    let oracle_calls_after_first = oracle.calls.load(Ordering::SeqCst);

    let second = resolver.lookup(&request).await?;
    assert_eq!(second.match_method, MatchMethod::NotFound);
    assert!(second.cached);

    // The confirmed miss short-circuits every stage.
    assert_eq!(search.queries.lock().unwrap().len(), queries_after_first);
    assert_eq!(oracle.calls.load(Ordering::SeqCst), oracle_calls_after_first);

    Ok(())
}

#[tokio::test]
async fn test_backoff_finds_shorter_query() -> Result<()> {
    let node_cpe = "cpe:2.3:a:nodejs:node.js:-:*:*:*:*:*:*:*";
    let search = Arc::new(ScriptedSearch::with_hit("Node.js", node_cpe));
    let (resolver, _dir) = resolver_with(search.clone(), None);

    let result = resolver
        .lookup(&LookupRequest::named("Node.js LTS Installer"))
        .await?;

    assert_eq!(result.match_method, MatchMethod::Backoff);
    assert_eq!(result.cpe.as_deref(), Some(node_cpe));
    assert_eq!(result.matched_name.as_deref(), Some("Node.js"));

    let queries = search.queries.lock().unwrap().clone();
    assert_eq!(
        queries,
        vec![
            "Node.js LTS Installer".to_string(),
            "Node.js LTS".to_string(),
            "Node.js".to_string(),
        ]
    );

    Ok(())
}

#[tokio::test]
async fn test_backoff_is_bounded_and_never_empty() -> Result<()> {
    let search = Arc::new(ScriptedSearch::empty());
    let (resolver, _dir) = resolver_with(search.clone(), None);

    resolver
        .lookup(&LookupRequest::named("Alpha Beta Gamma Delta"))
        .await?;

    let queries = search.queries.lock().unwrap().clone();
    // One exact query plus at most words - 1 backoff queries.
    assert_eq!(queries.len(), 4);
    assert_eq!(queries.last().map(String::as_str), Some("Alpha"));
    assert!(queries.iter().all(|q| !q.is_empty()));

    Ok(())
}

#[tokio::test]
async fn test_single_word_name_skips_backoff() -> Result<()> {
    let search = Arc::new(ScriptedSearch::empty());
    let (resolver, _dir) = resolver_with(search.clone(), None);

    resolver.lookup(&LookupRequest::named("Blender")).await?;

    // Exact query only; a one-word name leaves nothing to back off.
    assert_eq!(
        search.queries.lock().unwrap().clone(),
        vec!["Blender".to_string()]
    );

    Ok(())
}

#[tokio::test]
async fn test_oracle_fallback_after_search_misses() -> Result<()> {
    let oracle_cpe = "cpe:2.3:a:acme:widget:1.0:*:*:*:*:*:*:*";
    let search = Arc::new(ScriptedSearch::empty());
    let oracle = Arc::new(ScriptedOracle::with_hit(oracle_cpe));
    let (resolver, _dir) = resolver_with(search.clone(), Some(oracle.clone()));

    let result = resolver
        .lookup(&LookupRequest::named("Acme Widget"))
        .await?;

    assert_eq!(result.match_method, MatchMethod::Llm);
    assert_eq!(result.cpe.as_deref(), Some(oracle_cpe));
    assert!(result.matched_name.is_none());

    // Exact plus one backoff query ran before the oracle.
    assert_eq!(search.queries.lock().unwrap().len(), 2);
    assert_eq!(oracle.calls.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn test_missing_oracle_means_not_found() -> Result<()> {
    let search = Arc::new(ScriptedSearch::empty());
    let (resolver, _dir) = resolver_with(search, None);

    let result = resolver
        .lookup(&LookupRequest::named("Acme Widget"))
        .await?;

    assert_eq!(result.match_method, MatchMethod::NotFound);
    Ok(())
}

#[tokio::test]
async fn test_search_transport_failure_is_not_fatal() -> Result<()> {
    let (store, _dir) = test_store();
    let resolver = CpeResolver::new(
        store,
        Box::new(FailingSearch),
        None,
        Arc::new(RateGate::new(Duration::ZERO)),
    )?;

    let result = resolver
        .lookup(&LookupRequest::named("Unreachable App"))
        .await?;

    assert_eq!(result.match_method, MatchMethod::NotFound);
    assert!(result.cpe.is_none());

    Ok(())
}

#[tokio::test]
async fn test_version_is_injected_into_hit() -> Result<()> {
    let search = Arc::new(ScriptedSearch::with_hit(
        "7-Zip",
        "cpe:2.3:a:7-zip:7-zip:23.01:*:*:*:*:*:*:*",
    ));
    let (resolver, _dir) = resolver_with(search, None);

    let request = LookupRequest {
        name: "7-Zip 24.09 (x64)".to_string(),
        publisher: Some("Igor Pavlov".to_string()),
        version: Some("24.09".to_string()),
        source: None,
    };

    let result = resolver.lookup(&request).await?;
    assert_eq!(result.cpe.as_deref(), Some(SEVEN_ZIP_CPE));

    Ok(())
}

#[tokio::test]
async fn test_manual_entry_overrides_and_sticks() -> Result<()> {
    let search = Arc::new(ScriptedSearch::with_hit("7-Zip", SEVEN_ZIP_CPE));
    let (resolver, _dir) = resolver_with(search.clone(), None);

    let request = LookupRequest::named("7-Zip 24.09 (x64)");
    resolver.lookup(&request).await?;

    let corrected = "cpe:2.3:a:7-zip:7-zip:24.09:*:*:*:*:*:x64:*";
    let outcome = resolver
        .manual_entry(&request, corrected, Some("corrected target hw".to_string()))
        .await?;
    assert_eq!(outcome.action, crate::mapping::ManualAction::Updated);

    let queries_before = search.queries.lock().unwrap().len();

    let result = resolver.lookup(&request).await?;
    assert_eq!(result.match_method, MatchMethod::Manual);
    assert_eq!(result.cpe.as_deref(), Some(corrected));
    assert!(result.cached);
    // Manual mappings are never re-queried.
    assert_eq!(search.queries.lock().unwrap().len(), queries_before);

    Ok(())
}

#[tokio::test]
async fn test_manual_entry_rejects_malformed_cpe() {
    let search = Arc::new(ScriptedSearch::empty());
    let (resolver, _dir) = resolver_with(search, None);

    let result = resolver
        .manual_entry(&LookupRequest::named("App"), "not-a-cpe", None)
        .await;

    assert!(result.is_err());
}

#[tokio::test]
async fn test_batch_preserves_order_and_cached_flags() -> Result<()> {
    let search = Arc::new(ScriptedSearch::with_hit("7-Zip", SEVEN_ZIP_CPE));
    let (resolver, _dir) = resolver_with(search.clone(), None);

    // Warm the cache for the first item only.
    resolver.lookup(&LookupRequest::named("7-Zip")).await?;

    let batch = vec![
        LookupRequest::named("7-Zip"),
        LookupRequest::named("Some Unknown App"),
    ];
    let items = resolver.lookup_batch(&batch).await?;

    assert_eq!(items.len(), 2);
    assert_eq!(items[0].name, "7-Zip");
    assert!(items[0].result.cached);
    assert_eq!(items[0].result.match_method, MatchMethod::Exact);

    assert_eq!(items[1].name, "Some Unknown App");
    assert!(!items[1].result.cached);
    assert_eq!(items[1].result.match_method, MatchMethod::NotFound);

    Ok(())
}

#[tokio::test]
async fn test_empty_name_is_rejected() {
    let search = Arc::new(ScriptedSearch::empty());
    let (resolver, _dir) = resolver_with(search.clone(), None);

    assert!(resolver.lookup(&LookupRequest::named("")).await.is_err());
    assert!(resolver.lookup(&LookupRequest::named("   ")).await.is_err());

    // Rejected before any stage runs.
    assert!(search.queries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_distinct_originals_get_distinct_records() -> Result<()> {
    let search = Arc::new(ScriptedSearch::with_hit("7-Zip", SEVEN_ZIP_CPE));
    let (resolver, _dir) = resolver_with(search.clone(), None);

    // Both normalize to "7-Zip" but are memoized per exact input string.
    resolver.lookup(&LookupRequest::named("7-Zip 24.09 (x64)")).await?;
    let second = resolver.lookup(&LookupRequest::named("7-Zip 23.01 (x64)")).await?;

    assert!(!second.cached);
    assert_eq!(search.queries.lock().unwrap().len(), 2);

    let mappings = resolver.search_mappings("7-Zip").await?;
    assert_eq!(mappings.len(), 2);

    Ok(())
}

#[tokio::test]
async fn test_statistics_reflect_outcomes() -> Result<()> {
    let search = Arc::new(ScriptedSearch::with_hit("7-Zip", SEVEN_ZIP_CPE));
    let (resolver, _dir) = resolver_with(search, None);

    resolver.lookup(&LookupRequest::named("7-Zip")).await?;
    resolver.lookup(&LookupRequest::named("Some Unknown App")).await?;

    let stats = resolver.statistics().await?;
    assert_eq!(stats.total_mappings, 2);
    assert_eq!(stats.found, 1);
    assert_eq!(stats.not_found, 1);
    assert_eq!(stats.by_method.get("exact"), Some(&1));
    assert_eq!(stats.by_method.get("not_found"), Some(&1));

    Ok(())
}
