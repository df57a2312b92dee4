// src/source.rs
// Content-source boundary: one fetch per tracked partition per poll cycle.
// The HTTP implementation talks to a JSON feed API; a "too many requests"
// response must stay distinguishable from other failures so the throttle
// gate can apply the breaker path specifically.

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use crate::model::Item;
use crate::throttle::ThrottleSignal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortMode {
    New,
    Top,
}

impl SortMode {
    fn as_query(&self) -> &'static str {
        match self {
            SortMode::New => "new",
            SortMode::Top => "top",
        }
    }
}

/// One page of results from the content source.
#[derive(Debug, Clone, Default)]
pub struct FetchPage {
    pub items: Vec<Item>,
    /// Opaque continuation token; unused by the poller today but carried so
    /// the interface matches the upstream API.
    pub cursor: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("content source rate limited the request")]
    RateLimited,
    #[error("content source returned status {0}")]
    Status(u16),
    #[error("content source transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("content source payload malformed: {0}")]
    Payload(#[from] serde_json::Error),
}

impl ThrottleSignal for SourceError {
    fn is_throttle_signal(&self) -> bool {
        match self {
            SourceError::RateLimited => true,
            SourceError::Status(code) => *code >= 500,
            _ => false,
        }
    }
}

#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn fetch(
        &self,
        partition: &str,
        sort: SortMode,
        limit: u32,
    ) -> Result<FetchPage, SourceError>;
    fn name(&self) -> &'static str;
}

// ------------------------------------------------------------
// HTTP implementation
// ------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WirePage {
    #[serde(default)]
    items: Vec<WireItem>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireItem {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    score: i64,
    #[serde(default)]
    reply_count: u32,
    #[serde(default)]
    url: String,
}

pub struct HttpContentSource {
    http: reqwest::Client,
    base_url: String,
}

impl HttpContentSource {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("insight-miner/0.1")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ContentSource for HttpContentSource {
    async fn fetch(
        &self,
        partition: &str,
        sort: SortMode,
        limit: u32,
    ) -> Result<FetchPage, SourceError> {
        let url = format!(
            "{}/feeds/{}/items?sort={}&limit={}",
            self.base_url,
            partition,
            sort.as_query(),
            limit
        );
        let resp = self.http.get(&url).send().await?;
        let status = resp.status();
        if status.as_u16() == 429 {
            counter!("source_rate_limited_total").increment(1);
            return Err(SourceError::RateLimited);
        }
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }

        let body = resp.text().await?;
        let wire: WirePage = serde_json::from_str(&body)?;
        counter!("source_items_fetched_total").increment(wire.items.len() as u64);

        let fetched_at = Utc::now();
        let items = wire
            .items
            .into_iter()
            .map(|w| Item {
                id: w.id,
                title: w.title,
                body: w.body,
                partition: partition.to_string(),
                score: w.score,
                reply_count: w.reply_count,
                source_url: w.url,
                fetched_at,
            })
            .collect();

        Ok(FetchPage {
            items,
            cursor: wire.cursor,
        })
    }

    fn name(&self) -> &'static str {
        "http-feed"
    }
}

// ------------------------------------------------------------
// Scripted source for tests and local runs
// ------------------------------------------------------------

/// Returns pre-loaded pages in order, then empty pages forever. Fetch calls
/// are counted so tests can assert scheduling behavior.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<Vec<Item>, SourceError>>>,
    fetches: Mutex<Vec<String>>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&self, items: Vec<Item>) {
        self.script
            .lock()
            .expect("script mutex poisoned")
            .push_back(Ok(items));
    }

    pub fn push_error(&self, err: SourceError) {
        self.script
            .lock()
            .expect("script mutex poisoned")
            .push_back(Err(err));
    }

    /// Partitions fetched so far, in call order.
    pub fn fetch_log(&self) -> Vec<String> {
        self.fetches.lock().expect("fetch log poisoned").clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().expect("fetch log poisoned").len()
    }
}

#[async_trait]
impl ContentSource for ScriptedSource {
    async fn fetch(
        &self,
        partition: &str,
        _sort: SortMode,
        _limit: u32,
    ) -> Result<FetchPage, SourceError> {
        self.fetches
            .lock()
            .expect("fetch log poisoned")
            .push(partition.to_string());
        let next = self
            .script
            .lock()
            .expect("script mutex poisoned")
            .pop_front();
        match next {
            Some(Ok(items)) => Ok(FetchPage {
                items,
                cursor: None,
            }),
            Some(Err(e)) => Err(e),
            None => Ok(FetchPage::default()),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
