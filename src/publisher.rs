// src/publisher.rs
// Publishes items and insights twice: synchronously into a capped in-process
// snapshot that local readers observe push-style, then asynchronously into
// the persistent store. A failed store write is logged and never rolls back
// the snapshot, so the local view may run ahead of the durable view.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;
use tokio::sync::watch;

use crate::model::{Insight, Item};

pub const ITEMS_COLLECTION: &str = "items";
pub const INSIGHTS_COLLECTION: &str = "insights";

/// Write API of the external persistent store. Fire-and-forget from the
/// publisher's perspective; failures are caught and logged, never propagated.
#[async_trait]
pub trait StoreWriter: Send + Sync {
    async fn insert(&self, collection: &str, record: Value) -> anyhow::Result<String>;
}

pub type DynStoreWriter = Arc<dyn StoreWriter>;

// ------------------------------------------------------------
// In-process observable snapshot
// ------------------------------------------------------------

/// Capped in-memory view of published items and insights. The watch channel
/// carries a revision counter so subscribers can re-read on every publish.
pub struct Snapshot {
    items: Mutex<Vec<Item>>,
    insights: Mutex<Vec<Insight>>,
    cap: usize,
    revision: watch::Sender<u64>,
}

impl Snapshot {
    /// `cap` is taken as-is; config sanitization clamps it before it gets
    /// here.
    pub fn with_capacity(cap: usize) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            items: Mutex::new(Vec::new()),
            insights: Mutex::new(Vec::new()),
            cap,
            revision,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn items_last_n(&self, n: usize) -> Vec<Item> {
        let v = self.items.lock().expect("snapshot mutex poisoned");
        let start = v.len().saturating_sub(n);
        v[start..].to_vec()
    }

    pub fn insights_last_n(&self, n: usize) -> Vec<Insight> {
        let v = self.insights.lock().expect("snapshot mutex poisoned");
        let start = v.len().saturating_sub(n);
        v[start..].to_vec()
    }

    pub fn counts(&self) -> (usize, usize) {
        let items = self.items.lock().expect("snapshot mutex poisoned").len();
        let insights = self.insights.lock().expect("snapshot mutex poisoned").len();
        (items, insights)
    }

    fn push_item(&self, item: Item) {
        let mut v = self.items.lock().expect("snapshot mutex poisoned");
        v.push(item);
        if v.len() > self.cap {
            let excess = v.len() - self.cap;
            v.drain(0..excess);
        }
        drop(v);
        self.bump();
    }

    fn push_insight(&self, insight: Insight) {
        let mut v = self.insights.lock().expect("snapshot mutex poisoned");
        v.push(insight);
        if v.len() > self.cap {
            let excess = v.len() - self.cap;
            v.drain(0..excess);
        }
        drop(v);
        self.bump();
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

// ------------------------------------------------------------
// Publisher
// ------------------------------------------------------------

pub struct Publisher {
    snapshot: Arc<Snapshot>,
    store: DynStoreWriter,
}

impl Publisher {
    pub fn new(snapshot: Arc<Snapshot>, store: DynStoreWriter) -> Self {
        Self { snapshot, store }
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snapshot
    }

    /// Update the local snapshot now, then write to the store in the
    /// background. Must run inside a tokio runtime.
    pub fn publish_item(&self, item: Item) {
        let record = match serde_json::to_value(&item) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(target: "publish", error = %e, id = %item.id, "item serialization failed");
                return;
            }
        };
        self.snapshot.push_item(item);
        counter!("published_total", "collection" => ITEMS_COLLECTION).increment(1);
        self.write_async(ITEMS_COLLECTION, record);
    }

    pub fn publish_insight(&self, insight: Insight) {
        let record = match serde_json::to_value(&insight) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(target: "publish", error = %e, id = %insight.id, "insight serialization failed");
                return;
            }
        };
        self.snapshot.push_insight(insight);
        counter!("published_total", "collection" => INSIGHTS_COLLECTION).increment(1);
        self.write_async(INSIGHTS_COLLECTION, record);
    }

    fn write_async(&self, collection: &'static str, record: Value) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            match store.insert(collection, record).await {
                Ok(id) => {
                    tracing::debug!(target: "publish", collection, store_id = %id, "store write ok");
                }
                Err(e) => {
                    counter!("store_write_errors_total", "collection" => collection).increment(1);
                    tracing::warn!(target: "publish", collection, error = %e, "store write failed");
                }
            }
        });
    }
}

// ------------------------------------------------------------
// Store implementations
// ------------------------------------------------------------

/// REST store: POST /collections/{name}/records, response `{"id": "..."}`.
pub struct HttpStoreWriter {
    http: reqwest::Client,
    base_url: String,
}

impl HttpStoreWriter {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("insight-miner/0.1")
            .connect_timeout(std::time::Duration::from_secs(4))
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl StoreWriter for HttpStoreWriter {
    async fn insert(&self, collection: &str, record: Value) -> anyhow::Result<String> {
        #[derive(serde::Deserialize)]
        struct InsertResp {
            id: String,
        }

        let url = format!("{}/collections/{}/records", self.base_url, collection);
        let resp = self.http.post(&url).json(&record).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("store returned status {status}");
        }
        let body: InsertResp = resp.json().await?;
        Ok(body.id)
    }
}

/// In-memory store for tests and store-less local runs.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<(String, Value)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records_in(&self, collection: &str) -> Vec<Value> {
        self.records
            .lock()
            .expect("memory store poisoned")
            .iter()
            .filter(|(c, _)| c == collection)
            .map(|(_, v)| v.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().expect("memory store poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StoreWriter for MemoryStore {
    async fn insert(&self, collection: &str, record: Value) -> anyhow::Result<String> {
        let mut v = self.records.lock().expect("memory store poisoned");
        v.push((collection.to_string(), record));
        Ok(format!("mem-{}", v.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RawInsight;

    fn item(id: &str) -> Item {
        Item {
            id: id.into(),
            title: "t".into(),
            body: "b".into(),
            partition: "alpha".into(),
            score: 0,
            reply_count: 0,
            source_url: String::new(),
            fetched_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn snapshot_updates_before_store_write_resolves() {
        let snapshot = Arc::new(Snapshot::with_capacity(100));
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::new(Arc::clone(&snapshot), store.clone());

        publisher.publish_item(item("a"));
        // Synchronous snapshot update: visible immediately, no await needed.
        assert_eq!(snapshot.counts(), (1, 0));
    }

    #[tokio::test]
    async fn snapshot_cap_drops_oldest() {
        let snapshot = Arc::new(Snapshot::with_capacity(2));
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::new(Arc::clone(&snapshot), store);

        for id in ["a", "b", "c"] {
            publisher.publish_item(item(id));
        }
        let kept = snapshot.items_last_n(10);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].id, "b");
        assert_eq!(kept[1].id, "c");
    }

    #[tokio::test]
    async fn revision_bumps_on_every_publish() {
        let snapshot = Arc::new(Snapshot::with_capacity(10));
        let store = Arc::new(MemoryStore::new());
        let publisher = Publisher::new(Arc::clone(&snapshot), store);
        let rx = snapshot.subscribe();

        publisher.publish_item(item("a"));
        let insight = Insight::from_raw("a", "alpha", RawInsight::default());
        publisher.publish_insight(insight);
        assert_eq!(*rx.borrow(), 2);
    }
}
