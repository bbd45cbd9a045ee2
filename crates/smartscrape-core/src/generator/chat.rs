//! Chat-completions generator (Azure OpenAI deployment API).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::extract::extract_source;
use super::{GeneratorError, PageSpec, RepairRequest, ScriptGenerator};

const GENERATE_SYSTEM_PROMPT: &str = "You are an expert in Python web scraping. \
Given information about a web page, write an executable scraper.

Rules:
1. Use requests and BeautifulSoup (bs4).
2. The code must be complete and runnable as-is.
3. Define a function scrape(url) that returns list[dict].
4. Handle request and parsing errors.
5. Do not use dangerous functions (exec, eval, os.system, subprocess, open).
6. Do not access attributes whose names start with an underscore.
7. Reply with a JSON object: {\"code\": \"<full python source>\", \"imports\": [\"<import lines>\"], \"explanation\": \"<short explanation>\"}";

const REPAIR_SYSTEM_PROMPT: &str = "You repair Python web scrapers that failed in a sandbox. \
The sandbox only allows requests, bs4 and pure standard-library helpers (json, re, datetime, time, \
typing, collections, urllib.parse, math, random); never use os, sys, subprocess, open, eval or exec, \
and never access attributes whose names start with an underscore. \
Keep the scrape(url) entry point returning list[dict]. \
Reply with the complete corrected script in a single ```python fenced block.";

/// Connection settings for the chat-completions endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatConfig {
    pub endpoint: String,
    pub api_key: String,
    pub deployment: String,
    pub api_version: String,
    pub temperature: f32,
    pub request_timeout_secs: u64,
}

impl ChatConfig {
    pub const DEFAULT_API_VERSION: &'static str = "2025-04-01-preview";
    pub const DEFAULT_DEPLOYMENT: &'static str = "gpt-5.1-codex-max";

    /// Read `AZURE_OPENAI_ENDPOINT`, `AZURE_OPENAI_API_KEY`,
    /// `AZURE_OPENAI_CODEX_DEPLOYMENT` and `AZURE_OPENAI_API_VERSION`.
    pub fn from_env() -> Result<Self, GeneratorError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, GeneratorError> {
        let endpoint = lookup("AZURE_OPENAI_ENDPOINT")
            .filter(|v| !v.is_empty())
            .ok_or(GeneratorError::MissingConfig("AZURE_OPENAI_ENDPOINT"))?;
        let api_key = lookup("AZURE_OPENAI_API_KEY")
            .filter(|v| !v.is_empty())
            .ok_or(GeneratorError::MissingConfig("AZURE_OPENAI_API_KEY"))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            deployment: lookup("AZURE_OPENAI_CODEX_DEPLOYMENT")
                .unwrap_or_else(|| Self::DEFAULT_DEPLOYMENT.to_string()),
            api_version: lookup("AZURE_OPENAI_API_VERSION")
                .unwrap_or_else(|| Self::DEFAULT_API_VERSION.to_string()),
            temperature: 0.2,
            request_timeout_secs: 120,
        })
    }

    pub fn completions_url(&self) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            self.endpoint, self.deployment, self.api_version
        )
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

fn first_reply(body: &str) -> Result<String, GeneratorError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| GeneratorError::InvalidResponse(format!("malformed completion: {e}")))?;
    parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| GeneratorError::InvalidResponse("completion has no content".to_string()))
}

fn generate_prompt(goal: &str, page: &PageSpec) -> String {
    format!(
        "Target URL: {}\nExtraction goal: {}\nWhat to extract: {}\nSuggested CSS selectors: {:?}\nRecord structure: {}\nPage type: {}\n\nWrite the Python scraper.",
        page.url,
        goal,
        page.target_description,
        page.suggested_selectors,
        page.data_structure,
        page.page_type,
    )
}

fn repair_prompt(request: &RepairRequest) -> String {
    format!(
        "Target URL: {}\nExtraction goal: {}\n\nFailing script:\n```python\n{}\n```\n\nDiagnostic:\n{}",
        request.url,
        request.goal,
        request.failing_source,
        request.diagnostic.render(),
    )
}

/// [`ScriptGenerator`] backed by a chat-completions deployment.
pub struct ChatGenerator {
    config: ChatConfig,
    http: reqwest::Client,
}

impl ChatGenerator {
    pub fn new(config: ChatConfig) -> Result<Self, GeneratorError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("smartscrape/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> Result<Self, GeneratorError> {
        Self::new(ChatConfig::from_env()?)
    }

    async fn complete(
        &self,
        system: &str,
        user: &str,
        json_mode: bool,
    ) -> Result<String, GeneratorError> {
        let request = ChatRequest {
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.config.temperature,
            response_format: json_mode.then_some(ResponseFormat {
                kind: "json_object",
            }),
        };

        let response = self
            .http
            .post(self.config.completions_url())
            .header("api-key", &self.config.api_key)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(GeneratorError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(bytes = body.len(), "completion received");
        first_reply(&body)
    }
}

#[async_trait]
impl ScriptGenerator for ChatGenerator {
    #[instrument(skip_all, fields(deployment = %self.config.deployment))]
    async fn generate(&self, goal: &str, page: &PageSpec) -> Result<String, GeneratorError> {
        let reply = self
            .complete(GENERATE_SYSTEM_PROMPT, &generate_prompt(goal, page), true)
            .await?;
        extract_source(&reply)
            .ok_or_else(|| GeneratorError::InvalidResponse("reply contains no script".to_string()))
    }

    #[instrument(skip_all, fields(deployment = %self.config.deployment, error_kind = %request.diagnostic.error_kind))]
    async fn repair(&self, request: &RepairRequest) -> Result<String, GeneratorError> {
        let reply = self
            .complete(REPAIR_SYSTEM_PROMPT, &repair_prompt(request), false)
            .await?;
        extract_source(&reply)
            .ok_or_else(|| GeneratorError::InvalidResponse("reply contains no script".to_string()))
    }
}
