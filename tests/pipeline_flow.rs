// tests/pipeline_flow.rs
//
// End-to-end flow over scripted dependencies: deduplication across cycles,
// fan-out to the generator, publication to snapshot and store, and the
// no-resurrection rule for items whose generation failed.

use std::sync::Arc;
use std::time::Duration;

use insight_miner::config::PipelineConfig;
use insight_miner::infer::MockInference;
use insight_miner::model::{Item, RawInsight};
use insight_miner::pipeline::Pipeline;
use insight_miner::publisher::{MemoryStore, INSIGHTS_COLLECTION, ITEMS_COLLECTION};
use insight_miner::source::ScriptedSource;

fn item(id: &str) -> Item {
    Item {
        id: id.into(),
        title: format!("title {id}"),
        body: "body".into(),
        partition: "alpha".into(),
        score: 10,
        reply_count: 2,
        source_url: format!("https://feed.example/{id}"),
        fetched_at: chrono::Utc::now(),
    }
}

fn fast_config(partitions: &str) -> PipelineConfig {
    PipelineConfig::parse(&format!(
        r#"
        [poll]
        interval_ms = 1000
        partitions = {partitions}

        [content.throttle]
        base_interval_ms = 10
        increment_ms = 100
        decrement_ms = 50
        max_backoff_ms = 1000
        break_threshold_ms = 300
        breaker_reset_ms = 2000

        [inference.throttle]
        base_interval_ms = 10
        increment_ms = 100
        decrement_ms = 50
        max_backoff_ms = 1000
        break_threshold_ms = 300
        breaker_reset_ms = 2000
        "#
    ))
    .expect("test config parses")
}

fn fixed_raw() -> RawInsight {
    RawInsight {
        category: "pain-point".into(),
        priority: "high".into(),
        sentiment: "negative".into(),
        topics: vec!["checkout".into(), "latency".into()],
        summary: "Users report slow checkout.".into(),
        narrative: "Several posts describe checkout timeouts.".into(),
    }
}

#[tokio::test(start_paused = true)]
async fn repeated_item_ids_generate_exactly_one_insight_each() {
    let source = Arc::new(ScriptedSource::new());
    source.push_page(vec![item("a"), item("b")]);
    source.push_page(vec![item("b"), item("c")]);

    let inference = Arc::new(MockInference::with_fixed(fixed_raw()));
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(
        &fast_config(r#"["alpha"]"#),
        source.clone(),
        inference.clone(),
        store.clone(),
    );

    pipeline.run_cycle_once().await;
    pipeline.run_cycle_once().await;
    // Drain the detached generation and store-write tasks on paused time.
    tokio::time::sleep(Duration::from_millis(10_000)).await;

    // Cycle 1 forwards a and b; cycle 2 forwards only c.
    assert_eq!(inference.calls(), 3);
    assert_eq!(source.fetch_log(), vec!["alpha", "alpha"]);

    let (items, insights) = pipeline.snapshot().counts();
    assert_eq!(items, 3);
    assert_eq!(insights, 3);

    assert_eq!(store.records_in(ITEMS_COLLECTION).len(), 3);
    assert_eq!(store.records_in(INSIGHTS_COLLECTION).len(), 3);

    // Spot-check normalization made it through to the published insight.
    let published = pipeline.snapshot().insights_last_n(10);
    assert!(published.iter().all(|i| i.topics.len() >= 2));
    assert!(published
        .iter()
        .any(|i| i.source_item_id == "c" && i.summary == "Users report slow checkout."));
}

#[tokio::test(start_paused = true)]
async fn empty_partition_set_makes_a_cycle_a_no_op() {
    let source = Arc::new(ScriptedSource::new());
    let inference = Arc::new(MockInference::with_fixed(fixed_raw()));
    let pipeline = Pipeline::new(
        &fast_config("[]"),
        source.clone(),
        inference,
        Arc::new(MemoryStore::new()),
    );

    pipeline.run_cycle_once().await;
    assert_eq!(source.fetch_count(), 0, "no partitions, no network calls");
}

#[tokio::test(start_paused = true)]
async fn failed_generation_drops_the_item_without_resurrection() {
    let source = Arc::new(ScriptedSource::new());
    source.push_page(vec![item("a")]);
    // Same id returned again by the source in the next cycle.
    source.push_page(vec![item("a")]);

    let inference = Arc::new(MockInference::with_fixed(fixed_raw()));
    inference.set_failing(true);
    let store = Arc::new(MemoryStore::new());
    let pipeline = Pipeline::new(
        &fast_config(r#"["alpha"]"#),
        source,
        inference.clone(),
        store.clone(),
    );

    pipeline.run_cycle_once().await;
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    pipeline.run_cycle_once().await;
    tokio::time::sleep(Duration::from_millis(5_000)).await;

    // The dedup set already recorded the id, so the failed item is dropped
    // for the whole run, not retried on the next cycle.
    assert_eq!(inference.calls(), 1);
    let (items, insights) = pipeline.snapshot().counts();
    assert_eq!(items, 1, "raw item is still published once");
    assert_eq!(insights, 0, "failed generation yields no insight");
}

#[tokio::test(start_paused = true)]
async fn throttle_rejected_partition_is_skipped_not_fatal() {
    let source = Arc::new(ScriptedSource::new());
    // Three rate-limit failures open the content breaker (threshold 300).
    for _ in 0..3 {
        source.push_error(insight_miner::source::SourceError::RateLimited);
    }
    source.push_page(vec![item("late")]);

    let inference = Arc::new(MockInference::with_fixed(fixed_raw()));
    let pipeline = Pipeline::new(
        &fast_config(r#"["alpha"]"#),
        source.clone(),
        inference.clone(),
        Arc::new(MemoryStore::new()),
    );

    for _ in 0..4 {
        pipeline.run_cycle_once().await;
    }
    // Breaker open: the fourth cycle was rejected before reaching the source.
    assert_eq!(source.fetch_count(), 3);

    // After the cooldown, polling resumes and the late page flows through.
    tokio::time::advance(Duration::from_millis(2_500)).await;
    pipeline.run_cycle_once().await;
    tokio::time::sleep(Duration::from_millis(5_000)).await;

    assert_eq!(source.fetch_count(), 4);
    assert_eq!(inference.calls(), 1);
}
