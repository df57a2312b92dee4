// src/infer.rs
// Inference boundary: turns one Item into a structured `RawInsight`.
// Provider abstraction mirrors the content-source trait; the OpenAI
// implementation asks for JSON-only output and strips markdown fences
// before parsing. Enum normalization happens later, in the generator.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::model::RawInsight;
use crate::throttle::ThrottleSignal;

#[derive(Debug, thiserror::Error)]
pub enum InferError {
    #[error("inference provider rate limited the request")]
    RateLimited,
    #[error("inference provider returned status {0}")]
    Status(u16),
    #[error("inference transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("inference provider not configured: missing api key")]
    MissingApiKey,
    #[error("inference response malformed: {0}")]
    Malformed(String),
}

impl ThrottleSignal for InferError {
    fn is_throttle_signal(&self) -> bool {
        match self {
            InferError::RateLimited => true,
            InferError::Status(code) => *code >= 500,
            _ => false,
        }
    }
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn infer(
        &self,
        title: &str,
        body: &str,
        partition: &str,
    ) -> Result<RawInsight, InferError>;
    fn provider_name(&self) -> &'static str;
}

pub type DynInferenceClient = Arc<dyn InferenceClient>;

/// Build a client from config and environment.
///
/// * `INSIGHT_TEST_MODE=mock` returns a deterministic mock client.
/// * A missing api key yields a client that fails every call with
///   `MissingApiKey`; the pipeline degrades instead of refusing to boot.
pub fn build_inference_client(model_override: Option<&str>) -> DynInferenceClient {
    if std::env::var("INSIGHT_TEST_MODE")
        .map(|v| v == "mock")
        .unwrap_or(false)
    {
        return Arc::new(MockInference::with_fixed(RawInsight {
            category: "general-sentiment".into(),
            priority: "medium".into(),
            sentiment: "neutral".into(),
            topics: vec!["mock".into(), "fixture".into()],
            summary: "Deterministic mock insight.".into(),
            narrative: "Produced by the mock provider for local runs.".into(),
        }));
    }
    Arc::new(OpenAiInference::new(model_override))
}

// ------------------------------------------------------------
// OpenAI provider
// ------------------------------------------------------------

pub struct OpenAiInference {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiInference {
    /// `model_override`: pass Some("gpt-4o-mini") to override; defaults to gpt-4o-mini.
    pub fn new(model_override: Option<&str>) -> Self {
        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        let http = reqwest::Client::builder()
            .user_agent("insight-miner/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_default();
        let model = model_override.unwrap_or("gpt-4o-mini").to_string();
        Self {
            http,
            api_key,
            model,
        }
    }
}

const SYSTEM_PROMPT: &str = "You analyze one community feedback post. Respond with ONE JSON object \
and nothing else, using exactly these keys: category (one of: pain-point, competitor-mention, \
feature-request, general-sentiment), priority (high|medium|low), sentiment \
(positive|negative|neutral), topics (array of 2-5 short tags), summary (one sentence), \
narrative (2-3 sentences).";

#[async_trait]
impl InferenceClient for OpenAiInference {
    async fn infer(
        &self,
        title: &str,
        body: &str,
        partition: &str,
    ) -> Result<RawInsight, InferError> {
        if self.api_key.is_empty() {
            return Err(InferError::MissingApiKey);
        }

        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
            max_tokens: u32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: String,
        }

        let user = format!(
            "channel: {}\ntitle: {}\npost: {}",
            partition,
            collapse_ws(title),
            collapse_ws(body)
        );
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                Msg {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.2,
            max_tokens: 400,
        };

        let resp = self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(InferError::RateLimited);
        }
        if !status.is_success() {
            return Err(InferError::Status(status.as_u16()));
        }

        let parsed: Resp = resp.json().await?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");
        parse_raw_insight(content)
    }

    fn provider_name(&self) -> &'static str {
        "openai"
    }
}

/// Parse the provider's message content into a `RawInsight`. Tolerates
/// markdown code fences around the JSON object; anything else unparsable is
/// a `Malformed` error and the item is dropped for this run.
pub fn parse_raw_insight(content: &str) -> Result<RawInsight, InferError> {
    let stripped = strip_code_fences(content);
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        return Err(InferError::Malformed("empty response body".into()));
    }
    serde_json::from_str(trimmed).map_err(|e| InferError::Malformed(e.to_string()))
}

fn strip_code_fences(s: &str) -> String {
    static RE_FENCE: OnceCell<regex::Regex> = OnceCell::new();
    let re = RE_FENCE
        .get_or_init(|| regex::Regex::new(r"(?s)^\s*```(?:json)?\s*(.*?)\s*```\s*$").unwrap());
    match re.captures(s) {
        Some(caps) => caps[1].to_string(),
        None => s.to_string(),
    }
}

fn collapse_ws(s: &str) -> String {
    static RE_WS: OnceCell<regex::Regex> = OnceCell::new();
    let re = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    re.replace_all(s.trim(), " ").to_string()
}

// ------------------------------------------------------------
// Mock provider for tests/local runs
// ------------------------------------------------------------

pub struct MockInference {
    pub fixed: RawInsight,
    calls: AtomicUsize,
    failing: AtomicBool,
}

impl MockInference {
    pub fn with_fixed(fixed: RawInsight) -> Self {
        Self {
            fixed,
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// When set, every call fails with a rate-limit signal.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InferenceClient for MockInference {
    async fn infer(
        &self,
        _title: &str,
        _body: &str,
        _partition: &str,
    ) -> Result<RawInsight, InferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(InferError::RateLimited);
        }
        Ok(self.fixed.clone())
    }

    fn provider_name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let raw = parse_raw_insight(
            r#"{"category":"pain-point","priority":"high","sentiment":"negative",
               "topics":["latency","checkout"],"summary":"s","narrative":"n"}"#,
        )
        .unwrap();
        assert_eq!(raw.category, "pain-point");
        assert_eq!(raw.topics.len(), 2);
    }

    #[test]
    fn strips_markdown_fences() {
        let content = "```json\n{\"category\":\"feature-request\"}\n```";
        let raw = parse_raw_insight(content).unwrap();
        assert_eq!(raw.category, "feature-request");
        assert!(raw.summary.is_empty());
    }

    #[test]
    fn garbage_is_malformed_not_panic() {
        assert!(matches!(
            parse_raw_insight("no json here"),
            Err(InferError::Malformed(_))
        ));
        assert!(matches!(
            parse_raw_insight("   "),
            Err(InferError::Malformed(_))
        ));
    }

    #[test]
    fn rate_limit_and_5xx_feed_the_breaker() {
        assert!(InferError::RateLimited.is_throttle_signal());
        assert!(InferError::Status(502).is_throttle_signal());
        assert!(!InferError::MissingApiKey.is_throttle_signal());
        assert!(!InferError::Malformed("x".into()).is_throttle_signal());
    }
}
