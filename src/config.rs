// src/config.rs
// Pipeline configuration. Loaded from a TOML file resolved via env var with
// a repo-local fallback; every section has serde defaults so a missing file
// boots a usable (store-less, mock-friendly) pipeline.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::throttle::ThrottleCfg;

const ENV_PATH: &str = "INSIGHT_CONFIG_PATH";
const DEFAULT_PATH: &str = "config/insight.toml";

const MIN_POLL_INTERVAL_MS: u64 = 250;
const MAX_FETCH_LIMIT: u32 = 100;
const MAX_SNAPSHOT_CAP: usize = 10_000;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub poll: PollCfg,
    #[serde(default)]
    pub content: ContentCfg,
    #[serde(default)]
    pub inference: InferenceCfg,
    #[serde(default)]
    pub store: StoreCfg,
    #[serde(default)]
    pub snapshot: SnapshotCfg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollCfg {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Tracked partitions at boot; the control surface can replace them.
    #[serde(default)]
    pub partitions: Vec<String>,
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u32,
    /// Start polling immediately on boot instead of waiting for
    /// POST /control/start.
    #[serde(default)]
    pub autostart: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentCfg {
    #[serde(default = "default_content_url")]
    pub base_url: String,
    #[serde(default = "ThrottleCfg::content_default")]
    pub throttle: ThrottleCfg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceCfg {
    /// Provider model name; None keeps the provider default.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "ThrottleCfg::inference_default")]
    pub throttle: ThrottleCfg,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreCfg {
    /// When false, writes go to the in-memory store (local runs, tests).
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotCfg {
    #[serde(default = "default_snapshot_cap")]
    pub cap: usize,
}

fn default_interval_ms() -> u64 {
    30_000
}
fn default_fetch_limit() -> u32 {
    25
}
fn default_content_url() -> String {
    "https://feed.example.com/api".to_string()
}
fn default_snapshot_cap() -> usize {
    2_000
}

impl Default for PollCfg {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            partitions: Vec::new(),
            fetch_limit: default_fetch_limit(),
            autostart: false,
        }
    }
}

impl Default for ContentCfg {
    fn default() -> Self {
        Self {
            base_url: default_content_url(),
            throttle: ThrottleCfg::content_default(),
        }
    }
}

impl Default for InferenceCfg {
    fn default() -> Self {
        Self {
            model: None,
            throttle: ThrottleCfg::inference_default(),
        }
    }
}

impl Default for StoreCfg {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
        }
    }
}

impl Default for SnapshotCfg {
    fn default() -> Self {
        Self {
            cap: default_snapshot_cap(),
        }
    }
}

impl PipelineConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading pipeline config from {}", path.display()))?;
        Self::parse(&content)
    }

    /// Resolve config using env var + fallback:
    /// 1) $INSIGHT_CONFIG_PATH
    /// 2) config/insight.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        if let Ok(p) = std::env::var(ENV_PATH) {
            let pb = PathBuf::from(p);
            if pb.exists() {
                return Self::load_from(&pb);
            }
            anyhow::bail!("{ENV_PATH} points to non-existent path");
        }
        let fallback = PathBuf::from(DEFAULT_PATH);
        if fallback.exists() {
            return Self::load_from(&fallback);
        }
        Ok(Self::default())
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut cfg: PipelineConfig = toml::from_str(s).context("parsing pipeline config toml")?;
        cfg.sanitize();
        Ok(cfg)
    }

    /// Clamp values the scheduler cannot safely honor.
    fn sanitize(&mut self) {
        if self.poll.interval_ms < MIN_POLL_INTERVAL_MS {
            self.poll.interval_ms = MIN_POLL_INTERVAL_MS;
        }
        self.poll.fetch_limit = self.poll.fetch_limit.clamp(1, MAX_FETCH_LIMIT);
        // cap = 0 would make the snapshot drop everything it is handed.
        self.snapshot.cap = self.snapshot.cap.clamp(1, MAX_SNAPSHOT_CAP);
        self.poll.partitions = {
            use std::collections::BTreeSet;
            let mut set = BTreeSet::new();
            for p in self.poll.partitions.drain(..) {
                let t = p.trim().to_string();
                if !t.is_empty() {
                    set.insert(t);
                }
            }
            set.into_iter().collect()
        };
    }
}
