//! LLM oracle fallback for CPE identification
//!
//! Last-resort lookup against a messages-style completion API when both the
//! exact and backoff searches come up empty. One best-effort call, no retry;
//! anything that is not a well-formed CPE string is treated as no answer.

use crate::config::LlmConfig;
use crate::cpe;
use crate::nvd::SearchHit;
use crate::prompt_loader::PromptLoader;
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 100;

/// Oracle contract consumed by the resolution pipeline, after exact and
/// backoff search have both missed.
#[async_trait]
pub trait CpeSuggest: Send + Sync {
    async fn suggest(
        &self,
        name: &str,
        publisher: Option<&str>,
        version: Option<&str>,
    ) -> Result<Option<SearchHit>>;
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    config: LlmConfig,
    prompt_loader: PromptLoader,
    prompt_template: String,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;

        let prompt_loader = PromptLoader::new()?;
        let template = prompt_loader.load_prompt(config.prompt_template.as_ref())?;

        Ok(Self {
            client,
            config,
            prompt_loader,
            prompt_template: template,
        })
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled && self.config.api_key.is_some()
    }

    async fn call_api(&self, prompt: &str) -> Result<String> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("LLM API key not configured"))?;

        let request = MessagesRequest {
            model: self.config.model.clone(),
            max_tokens: MAX_TOKENS,
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
        };

        debug!("Making request to LLM: {}/v1/messages", self.config.endpoint);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.config.endpoint))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("LLM request failed: {} - {}", status, body));
        }

        let parsed: MessagesResponse = response.json().await?;
        let text = parsed
            .content
            .into_iter()
            .next()
            .map(|block| block.text)
            .unwrap_or_default();

        debug!("Received LLM response: {} characters", text.len());
        Ok(text)
    }

    /// Accept the completion only if it is CPE-2.3-shaped. The prompt asks
    /// for the sentinel `UNKNOWN` on low confidence; that and any free-form
    /// prose fall through to `None`.
    fn parse_suggestion(response: &str) -> Option<SearchHit> {
        let candidate = response.trim();

        if cpe::looks_like_cpe(candidate) {
            Some(SearchHit::from_cpe(candidate.to_string()))
        } else {
            debug!("LLM response is not a usable CPE: '{}'", candidate);
            None
        }
    }
}

#[async_trait]
impl CpeSuggest for LlmClient {
    async fn suggest(
        &self,
        name: &str,
        publisher: Option<&str>,
        version: Option<&str>,
    ) -> Result<Option<SearchHit>> {
        if !self.enabled() {
            debug!("LLM client is disabled, skipping oracle stage");
            return Ok(None);
        }

        let prompt = self
            .prompt_loader
            .format_prompt(&self.prompt_template, name, publisher, version);

        let response = self.call_api(&prompt).await?;
        let hit = Self::parse_suggestion(&response);

        match &hit {
            Some(h) => debug!("LLM suggested {} for '{}'", h.cpe, name),
            None => warn!("LLM gave no usable suggestion for '{}'", name),
        }

        Ok(hit)
    }
}
