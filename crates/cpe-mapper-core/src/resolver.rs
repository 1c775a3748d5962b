//! End-to-end CPE resolution pipeline
//!
//! Composes the cache store, name normalizer, rate gate, NVD search and LLM
//! oracle into one ordered pipeline: cache check, normalize, exact search,
//! word-elimination backoff search, oracle fallback, persist. Every path
//! persists its outcome — a confirmed miss is remembered just like a hit —
//! and terminates.

use crate::config::Config;
use crate::cpe;
use crate::llm::{CpeSuggest, LlmClient};
use crate::mapping::{ManualAction, ManualEntry, MappingStatistics, MappingStore, MatchMethod, NewMapping};
use crate::normalize::NameNormalizer;
use crate::nvd::{CpeSearch, NvdClient, SearchHit};
use crate::rate::RateGate;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const EXACT_CONFIDENCE: f64 = 1.0;
const BACKOFF_CONFIDENCE_STEP: f64 = 0.1;
const BACKOFF_CONFIDENCE_MAX: f64 = 0.9;
const BACKOFF_CONFIDENCE_FLOOR: f64 = 0.5;
/// Below the backoff floor: an unverified completion is trusted less than
/// the broadest structured search hit.
const LLM_CONFIDENCE: f64 = 0.4;

/// One software identification to resolve. Field aliases accept the
/// capitalized keys produced by Windows inventory exports unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupRequest {
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Publisher")]
    pub publisher: Option<String>,
    #[serde(default, alias = "Version")]
    pub version: Option<String>,
    #[serde(default, alias = "Source")]
    pub source: Option<String>,
}

impl LookupRequest {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            publisher: None,
            version: None,
            source: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LookupResult {
    pub cpe: Option<String>,
    pub vendor: Option<String>,
    pub product: Option<String>,
    pub match_method: MatchMethod,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_name: Option<String>,
    pub cached: bool,
}

/// Batch output item: the input echo plus its result, in input order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publisher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub result: LookupResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualOutcome {
    pub action: ManualAction,
    pub name: String,
    pub cpe: String,
}

struct StageOutcome {
    hit: SearchHit,
    matched_name: Option<String>,
    method: MatchMethod,
    confidence: f64,
}

pub struct CpeResolver {
    store: Mutex<MappingStore>,
    search: Box<dyn CpeSearch>,
    oracle: Option<Box<dyn CpeSuggest>>,
    gate: Arc<RateGate>,
    normalizer: NameNormalizer,
}

impl CpeResolver {
    pub fn new(
        store: MappingStore,
        search: Box<dyn CpeSearch>,
        oracle: Option<Box<dyn CpeSuggest>>,
        gate: Arc<RateGate>,
    ) -> Result<Self> {
        Ok(Self {
            store: Mutex::new(store),
            search,
            oracle,
            gate,
            normalizer: NameNormalizer::new()?,
        })
    }

    /// Wire up the full production pipeline: NVD search paced by a gate
    /// whose mode is fixed at startup from credential presence, and the LLM
    /// oracle only when a key is configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let store = MappingStore::new(config.mapping.clone())?;

        let nvd = NvdClient::new(config.nvd.clone())?;
        let gate = Arc::new(RateGate::for_credential(nvd.authenticated()));
        info!(
            "NVD query pacing: {:?} ({})",
            gate.min_delay(),
            if nvd.authenticated() { "authenticated" } else { "unauthenticated" }
        );

        let oracle: Option<Box<dyn CpeSuggest>> = match &config.llm {
            Some(llm_config) => {
                let client = LlmClient::new(llm_config.clone())?;
                if client.enabled() {
                    Some(Box::new(client))
                } else {
                    info!("LLM fallback disabled (no API key or disabled in config)");
                    None
                }
            }
            None => None,
        };

        Self::new(store, Box::new(nvd), oracle, gate)
    }

    /// Resolve one request through the pipeline. Returns `Err` only when the
    /// input is invalid or the store cannot be read or written; exhausting
    /// every search stage is a successful `not_found` outcome.
    pub async fn lookup(&self, request: &LookupRequest) -> Result<LookupResult> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(anyhow::anyhow!("lookup name must not be empty"));
        }

        // Cache check: any existing record, including a confirmed miss or a
        // manual entry, short-circuits the pipeline entirely.
        if let Some(existing) = self.store.lock().await.touch(&request.name)? {
            return Ok(LookupResult {
                cpe: existing.cpe,
                vendor: existing.vendor,
                product: existing.product,
                match_method: existing.match_method,
                matched_name: existing.matched_name,
                cached: true,
            });
        }

        info!("Looking up '{}'", request.name);
        let normalized = self.normalizer.normalize(&request.name);
        debug!("Normalized '{}' -> '{}'", request.name, normalized);

        let outcome = match self.exact_search(&normalized).await {
            Some(outcome) => Some(outcome),
            None => match self.backoff_search(&normalized).await {
                Some(outcome) => Some(outcome),
                None => self.oracle_fallback(request).await,
            },
        };

        let result = self
            .persist_outcome(request, &normalized, outcome)
            .await?;
        Ok(result)
    }

    /// Resolve many requests strictly one after another. The shared rate
    /// budget gives interleaving no benefit, and sequential processing keeps
    /// external traffic ordered and bounded.
    pub async fn lookup_batch(&self, requests: &[LookupRequest]) -> Result<Vec<BatchItem>> {
        let mut items = Vec::with_capacity(requests.len());

        for request in requests {
            let result = self.lookup(request).await?;
            items.push(BatchItem {
                name: request.name.clone(),
                publisher: request.publisher.clone(),
                version: request.version.clone(),
                result,
            });
        }

        Ok(items)
    }

    /// Record an operator-verified mapping. Takes effect for the very next
    /// lookup of the same original name.
    pub async fn manual_entry(
        &self,
        request: &LookupRequest,
        cpe_name: &str,
        notes: Option<String>,
    ) -> Result<ManualOutcome> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(anyhow::anyhow!("mapping name must not be empty"));
        }
        if !cpe::looks_like_cpe(cpe_name) {
            return Err(anyhow::anyhow!(
                "'{}' is not a CPE 2.3 identifier",
                cpe_name
            ));
        }

        let (vendor, product) = cpe::vendor_product(cpe_name);
        let entry = ManualEntry {
            original_name: request.name.clone(),
            normalized_name: self.normalizer.normalize(&request.name),
            publisher: request.publisher.clone(),
            version: request.version.clone(),
            cpe: cpe_name.to_string(),
            vendor,
            product,
            notes,
        };

        let action = self.store.lock().await.upsert_manual(&entry)?;
        Ok(ManualOutcome {
            action,
            name: request.name.clone(),
            cpe: cpe_name.to_string(),
        })
    }

    pub async fn search_mappings(&self, query: &str) -> Result<Vec<crate::mapping::CpeMapping>> {
        self.store.lock().await.search(query)
    }

    pub async fn statistics(&self) -> Result<MappingStatistics> {
        self.store.lock().await.statistics()
    }

    /// Single query on the fully normalized name.
    async fn exact_search(&self, normalized: &str) -> Option<StageOutcome> {
        let hit = self.gated_search(normalized).await?;

        Some(StageOutcome {
            hit,
            matched_name: Some(normalized.to_string()),
            method: MatchMethod::Exact,
            confidence: EXACT_CONFIDENCE,
        })
    }

    /// Word-elimination backoff: drop trailing words one at a time, leftmost
    /// words being the most significant, and stop on the first hit or once
    /// the single-word query has missed. At most `words - 1` queries; never
    /// an empty query.
    async fn backoff_search(&self, normalized: &str) -> Option<StageOutcome> {
        let words: Vec<&str> = normalized.split_whitespace().collect();
        let total = words.len();

        for keep in (1..total).rev() {
            let query = words[..keep].join(" ");
            debug!("Backoff search trying '{}'", query);

            if let Some(hit) = self.gated_search(&query).await {
                let removed = total - keep;
                let confidence = (BACKOFF_CONFIDENCE_MAX
                    - BACKOFF_CONFIDENCE_STEP * removed as f64)
                    .max(BACKOFF_CONFIDENCE_FLOOR);

                return Some(StageOutcome {
                    hit,
                    matched_name: Some(query),
                    method: MatchMethod::Backoff,
                    confidence,
                });
            }
        }

        None
    }

    async fn oracle_fallback(&self, request: &LookupRequest) -> Option<StageOutcome> {
        let oracle = self.oracle.as_ref()?;
        debug!("Trying LLM fallback for '{}'", request.name);

        let suggestion = oracle
            .suggest(
                &request.name,
                request.publisher.as_deref(),
                request.version.as_deref(),
            )
            .await;

        let hit = match suggestion {
            Ok(hit) => hit?,
            Err(e) => {
                // Best-effort single attempt: a failed oracle is a miss.
                warn!("LLM fallback failed for '{}': {}", request.name, e);
                return None;
            }
        };

        Some(StageOutcome {
            hit,
            matched_name: None,
            method: MatchMethod::Llm,
            confidence: LLM_CONFIDENCE,
        })
    }

    /// One paced external query. Transport failures and zero-result answers
    /// both advance the pipeline, but only the former is worth a warning.
    async fn gated_search(&self, query: &str) -> Option<SearchHit> {
        self.gate.acquire().await;

        match self.search.search(query).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!("Search query '{}' failed: {}", query, e);
                None
            }
        }
    }

    async fn persist_outcome(
        &self,
        request: &LookupRequest,
        normalized: &str,
        outcome: Option<StageOutcome>,
    ) -> Result<LookupResult> {
        let notes = request.source.as_ref().map(|s| format!("source: {}", s));

        let mapping = match outcome {
            Some(outcome) => {
                // The keyword search matches some indexed version; reflect the
                // version actually reported by the caller in the stored CPE.
                let cpe_name = match (&request.version, outcome.method) {
                    (Some(version), MatchMethod::Exact | MatchMethod::Backoff) => {
                        cpe::with_version(&outcome.hit.cpe, version)
                    }
                    _ => outcome.hit.cpe.clone(),
                };

                info!(
                    "Resolved '{}' -> {} ({})",
                    request.name,
                    cpe_name,
                    outcome.method.as_str()
                );

                NewMapping {
                    original_name: request.name.clone(),
                    normalized_name: normalized.to_string(),
                    matched_name: outcome.matched_name,
                    publisher: request.publisher.clone(),
                    version: request.version.clone(),
                    cpe: Some(cpe_name),
                    vendor: outcome.hit.vendor,
                    product: outcome.hit.product,
                    match_method: outcome.method,
                    confidence_score: outcome.confidence,
                    notes,
                }
            }
            None => {
                info!("No match found for '{}'", request.name);

                NewMapping {
                    original_name: request.name.clone(),
                    normalized_name: normalized.to_string(),
                    matched_name: None,
                    publisher: request.publisher.clone(),
                    version: request.version.clone(),
                    cpe: None,
                    vendor: None,
                    product: None,
                    match_method: MatchMethod::NotFound,
                    confidence_score: 0.0,
                    notes,
                }
            }
        };

        self.store.lock().await.record_resolution(&mapping)?;

        Ok(LookupResult {
            cpe: mapping.cpe,
            vendor: mapping.vendor,
            product: mapping.product,
            match_method: mapping.match_method,
            matched_name: mapping.matched_name,
            cached: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_confidence_decreases_with_removals() {
        let conf = |removed: usize| {
            (BACKOFF_CONFIDENCE_MAX - BACKOFF_CONFIDENCE_STEP * removed as f64)
                .max(BACKOFF_CONFIDENCE_FLOOR)
        };

        assert!((conf(1) - 0.8).abs() < 1e-9);
        assert!(conf(2) < conf(1));
        // Floored, and always above the LLM stage.
        assert_eq!(conf(10), BACKOFF_CONFIDENCE_FLOOR);
        assert!(LLM_CONFIDENCE < BACKOFF_CONFIDENCE_FLOOR);
    }

    #[test]
    fn test_lookup_request_accepts_inventory_keys() {
        let request: LookupRequest = serde_json::from_str(
            r#"{"Name": "7-Zip 24.09 (x64)", "Publisher": "Igor Pavlov", "Version": "24.09"}"#,
        )
        .unwrap();

        assert_eq!(request.name, "7-Zip 24.09 (x64)");
        assert_eq!(request.publisher.as_deref(), Some("Igor Pavlov"));
        assert_eq!(request.version.as_deref(), Some("24.09"));
        assert!(request.source.is_none());
    }

    #[test]
    fn test_lookup_request_accepts_lowercase_keys() {
        let request: LookupRequest =
            serde_json::from_str(r#"{"name": "Chrome", "source": "Registry"}"#).unwrap();

        assert_eq!(request.name, "Chrome");
        assert_eq!(request.source.as_deref(), Some("Registry"));
    }
}
