// src/generator.rs
// Consumes unseen items one at a time and derives an Insight through the
// inference gate. A failed item is dropped for this run; the deduplicator
// already recorded its id, so later cycles will not resurrect it.

use metrics::counter;

use crate::infer::{DynInferenceClient, InferError};
use crate::model::{Insight, Item};
use crate::throttle::{ThrottleError, ThrottleGate};

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// Inference gate refused the call; retried implicitly only if the same
    /// item id ever reappears unseen, which the dedup set prevents.
    #[error("inference throttled, retry in {retry_after_ms} ms")]
    Throttled { retry_after_ms: u64 },
    #[error(transparent)]
    Inference(#[from] InferError),
}

pub struct InsightGenerator {
    gate: ThrottleGate,
    client: DynInferenceClient,
}

impl InsightGenerator {
    pub fn new(gate: ThrottleGate, client: DynInferenceClient) -> Self {
        Self { gate, client }
    }

    pub fn gate(&self) -> &ThrottleGate {
        &self.gate
    }

    /// Generate one Insight for one Item. Sequenced through the inference
    /// gate; concurrent callers for distinct items are paced there.
    pub async fn generate(&self, item: &Item) -> Result<Insight, GenerationError> {
        let raw = self
            .gate
            .call(|| self.client.infer(&item.title, &item.body, &item.partition))
            .await
            .map_err(|e| match e {
                ThrottleError::Rejected { retry_after_ms } => {
                    counter!("generation_throttled_total").increment(1);
                    GenerationError::Throttled { retry_after_ms }
                }
                ThrottleError::Upstream(err) => {
                    counter!("generation_failures_total").increment(1);
                    GenerationError::Inference(err)
                }
            })?;

        let insight = Insight::from_raw(&item.id, &item.partition, raw);
        counter!("insights_generated_total").increment(1);
        Ok(insight)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::infer::MockInference;
    use crate::model::{InsightCategory, Priority, RawInsight, Sentiment};
    use crate::throttle::ThrottleCfg;

    fn test_item() -> Item {
        Item {
            id: "it-1".into(),
            title: "Checkout keeps timing out".into(),
            body: "Third day in a row the checkout page 504s.".into(),
            partition: "alpha".into(),
            score: 41,
            reply_count: 7,
            source_url: "https://feed.example/it-1".into(),
            fetched_at: chrono::Utc::now(),
        }
    }

    fn fast_gate() -> ThrottleGate {
        ThrottleGate::new(
            "inference-test",
            ThrottleCfg {
                base_interval_ms: 0,
                increment_ms: 10,
                decrement_ms: 10,
                max_backoff_ms: 100,
                break_threshold_ms: 50,
                breaker_reset_ms: 100,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn generates_normalized_insight_from_raw_fields() {
        let mock = Arc::new(MockInference::with_fixed(RawInsight {
            category: "brand-new-category".into(),
            priority: "low".into(),
            sentiment: "negative".into(),
            topics: vec!["checkout".into(), "timeouts".into()],
            summary: "Checkout is failing for users.".into(),
            narrative: "Multiple reports of 504s at checkout.".into(),
        }));
        let gen = InsightGenerator::new(fast_gate(), mock.clone());

        let insight = gen.generate(&test_item()).await.unwrap();
        assert_eq!(insight.source_item_id, "it-1");
        assert_eq!(insight.category, InsightCategory::GeneralSentiment);
        assert_eq!(insight.priority, Priority::Low);
        assert_eq!(insight.sentiment, Sentiment::Negative);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_inference_surfaces_as_generation_error() {
        let mock = Arc::new(MockInference::with_fixed(RawInsight::default()));
        mock.set_failing(true);
        let gen = InsightGenerator::new(fast_gate(), mock.clone());

        let err = gen.generate(&test_item()).await.unwrap_err();
        assert!(matches!(
            err,
            GenerationError::Inference(InferError::RateLimited)
        ));
    }
}
