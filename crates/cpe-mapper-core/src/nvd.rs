//! NVD CPE search integration
//!
//! Thin client for the NVD CPE 2.0 keyword-search API. The pipeline only
//! needs the first candidate of a query, exposed through the [`CpeSearch`]
//! trait so the orchestrator can be driven by scripted clients in tests.

use crate::config::NvdConfig;
use crate::cpe;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// One candidate match from the search service.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub cpe: String,
    pub vendor: Option<String>,
    pub product: Option<String>,
}

impl SearchHit {
    pub fn from_cpe(cpe_name: String) -> Self {
        let (vendor, product) = cpe::vendor_product(&cpe_name);
        Self {
            cpe: cpe_name,
            vendor,
            product,
        }
    }
}

/// Query contract consumed by the resolution pipeline. `Ok(None)` means the
/// service answered with zero matches; `Err` means it could not be asked.
/// The pipeline advances to the next fallback stage in both cases but logs
/// them differently.
#[async_trait]
pub trait CpeSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Option<SearchHit>>;
}

#[derive(Debug, Deserialize)]
struct NvdResponse {
    #[serde(default)]
    products: Vec<NvdProduct>,
}

#[derive(Debug, Deserialize)]
struct NvdProduct {
    cpe: NvdCpe,
}

#[derive(Debug, Deserialize)]
struct NvdCpe {
    #[serde(rename = "cpeName")]
    cpe_name: String,
}

#[derive(Clone)]
pub struct NvdClient {
    client: Client,
    config: NvdConfig,
}

impl NvdClient {
    pub fn new(config: NvdConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn authenticated(&self) -> bool {
        self.config.api_key.is_some()
    }

    fn first_hit(response: NvdResponse) -> Option<SearchHit> {
        response
            .products
            .into_iter()
            .next()
            .map(|product| SearchHit::from_cpe(product.cpe.cpe_name))
    }
}

#[async_trait]
impl CpeSearch for NvdClient {
    async fn search(&self, query: &str) -> Result<Option<SearchHit>> {
        debug!("Querying NVD for '{}'", query);

        let mut request = self.client.get(&self.config.endpoint).query(&[
            ("keywordSearch", query),
            ("resultsPerPage", &self.config.results_per_page.to_string()),
        ]);

        if let Some(key) = &self.config.api_key {
            request = request.header("apiKey", key);
        }

        let response = request.send().await?;
        let status = response.status();

        if status.as_u16() == 429 {
            // No adaptive retry here; the shared gate is the only throttle.
            warn!("NVD rejected query '{}' with 429", query);
            return Err(anyhow::anyhow!("NVD rate limit rejection for '{}'", query));
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "NVD request failed: {} - {}",
                status,
                body
            ));
        }

        let parsed: NvdResponse = response.json().await?;
        let hit = Self::first_hit(parsed);

        match &hit {
            Some(h) => debug!("NVD matched '{}' -> {}", query, h.cpe),
            None => debug!("NVD returned zero matches for '{}'", query),
        }

        Ok(hit)
    }
}
