// src/model.rs
// Core value types shared across the pipeline. Items and Insights are
// immutable once constructed; downstream consumers republish new values
// instead of mutating in place.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One unit fetched from the content source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Item {
    /// Stable identifier from the source, unique within a partition.
    pub id: String,
    pub title: String,
    pub body: String,
    /// Which tracked channel produced this item.
    pub partition: String,
    /// Engagement score reported by the source. Advisory only.
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub reply_count: u32,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InsightCategory {
    PainPoint,
    CompetitorMention,
    FeatureRequest,
    GeneralSentiment,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    Neutral,
}

impl InsightCategory {
    /// Parse a producer label. Out-of-enum values map to the documented
    /// default instead of failing the whole item.
    pub fn from_label(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "pain-point" | "pain_point" | "painpoint" => Self::PainPoint,
            "competitor-mention" | "competitor_mention" | "competitor" => Self::CompetitorMention,
            "feature-request" | "feature_request" | "feature" => Self::FeatureRequest,
            "general-sentiment" | "general_sentiment" | "general" => Self::GeneralSentiment,
            _ => Self::GeneralSentiment,
        }
    }
}

impl Priority {
    pub fn from_label(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Self::High,
            "medium" => Self::Medium,
            "low" => Self::Low,
            _ => Self::Medium,
        }
    }
}

impl Sentiment {
    pub fn from_label(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "positive" => Self::Positive,
            "negative" => Self::Negative,
            "neutral" => Self::Neutral,
            _ => Self::Neutral,
        }
    }
}

/// Structured output of analyzing one Item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Insight {
    /// Generated id, distinct from the source item id.
    pub id: String,
    /// Back-reference to the originating Item. Lookup only, no ownership.
    pub source_item_id: String,
    pub category: InsightCategory,
    pub priority: Priority,
    pub sentiment: Sentiment,
    /// Short tags, clamped to 2..=5 entries.
    pub topics: Vec<String>,
    pub summary: String,
    pub narrative: String,
    pub created_at: DateTime<Utc>,
}

/// Untrusted shape as returned by the inference provider. Every enum-like
/// field arrives as a plain string and is normalized in `Insight::from_raw`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawInsight {
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub priority: String,
    #[serde(default)]
    pub sentiment: String,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub narrative: String,
}

impl Insight {
    /// Normalize a raw provider response into a well-formed Insight.
    /// Enum fields outside their enumeration fall back to conservative
    /// defaults; topics are trimmed and clamped to 2..=5 entries.
    pub fn from_raw(source_item_id: &str, partition: &str, raw: RawInsight) -> Self {
        let created_at = Utc::now();
        let mut topics: Vec<String> = raw
            .topics
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .take(5)
            .collect();
        if topics.len() < 2 {
            let pad = partition.trim();
            if !pad.is_empty() && !topics.iter().any(|t| t.eq_ignore_ascii_case(pad)) {
                topics.push(pad.to_string());
            }
        }
        while topics.len() < 2 {
            topics.push("community-feedback".to_string());
        }

        Self {
            id: insight_id(source_item_id, created_at),
            source_item_id: source_item_id.to_string(),
            category: InsightCategory::from_label(&raw.category),
            priority: Priority::from_label(&raw.priority),
            sentiment: Sentiment::from_label(&raw.sentiment),
            topics,
            summary: raw.summary.trim().to_string(),
            narrative: raw.narrative.trim().to_string(),
            created_at,
        }
    }
}

fn insight_id(source_item_id: &str, created_at: DateTime<Utc>) -> String {
    // DefaultHasher is sufficient here; ids only need to be unique per insight.
    let mut hasher = DefaultHasher::new();
    source_item_id.hash(&mut hasher);
    created_at
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .hash(&mut hasher);
    format!("ins-{:016x}", hasher.finish())
}
