// src/pipeline.rs
// The poller: a two-state (stopped/running) loop that fetches every tracked
// partition once per cycle through the content gate, filters items through
// the deduplicator, and fans unseen items out to the insight generator.
// No per-item or per-partition failure is allowed to stop the timer.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::PipelineConfig;
use crate::dedup::Deduplicator;
use crate::generator::{GenerationError, InsightGenerator};
use crate::infer::DynInferenceClient;
use crate::metrics::ensure_metrics_described;
use crate::publisher::{DynStoreWriter, Publisher, Snapshot};
use crate::source::{ContentSource, FetchPage, SortMode};
use crate::throttle::{ThrottleError, ThrottleGate, ThrottleSnapshot};

const MIN_POLL_INTERVAL_MS: u64 = 250;

#[derive(Debug)]
struct RunState {
    is_running: bool,
    /// Bumped on every start so a stale loop can never publish after a
    /// stop/start pair.
    epoch: u64,
    tracked_partitions: BTreeSet<String>,
    poll_interval_ms: u64,
}

/// Operator-facing view for `GET /status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub is_running: bool,
    pub tracked_partitions: Vec<String>,
    pub poll_interval_ms: u64,
    pub content_gate: ThrottleSnapshot,
    pub inference_gate: ThrottleSnapshot,
    pub items_published: usize,
    pub insights_published: usize,
}

struct Inner {
    run: Mutex<RunState>,
    content_gate: ThrottleGate,
    source: Arc<dyn ContentSource>,
    dedup: Deduplicator,
    generator: InsightGenerator,
    publisher: Publisher,
    fetch_limit: u32,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Wake signal for the loop; carries the running flag.
    running_tx: watch::Sender<bool>,
}

/// Cheap clonable handle; all clones share one poller.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(
        cfg: &PipelineConfig,
        source: Arc<dyn ContentSource>,
        inference: DynInferenceClient,
        store: DynStoreWriter,
    ) -> Self {
        ensure_metrics_described();

        let snapshot = Arc::new(Snapshot::with_capacity(cfg.snapshot.cap));
        let (running_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                run: Mutex::new(RunState {
                    is_running: false,
                    epoch: 0,
                    tracked_partitions: cfg.poll.partitions.iter().cloned().collect(),
                    poll_interval_ms: cfg.poll.interval_ms.max(MIN_POLL_INTERVAL_MS),
                }),
                content_gate: ThrottleGate::new("content", cfg.content.throttle),
                source,
                dedup: Deduplicator::default(),
                generator: InsightGenerator::new(
                    ThrottleGate::new("inference", cfg.inference.throttle),
                    inference,
                ),
                publisher: Publisher::new(snapshot, store),
                fetch_limit: cfg.poll.fetch_limit,
                task: Mutex::new(None),
                running_tx,
            }),
        }
    }

    pub fn snapshot(&self) -> &Arc<Snapshot> {
        self.inner.publisher.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.inner.run.lock().expect("run state poisoned").is_running
    }

    /// Start polling. Idempotent: a second call while running is a no-op and
    /// returns false. The first cycle runs immediately, later cycles at the
    /// configured interval.
    pub fn start(&self) -> bool {
        let epoch = {
            let mut run = self.inner.run.lock().expect("run state poisoned");
            if run.is_running {
                return false;
            }
            run.is_running = true;
            run.epoch += 1;
            run.epoch
        };
        let _ = self.inner.running_tx.send(true);

        let this = self.clone();
        let handle = tokio::spawn(async move { this.poll_loop(epoch).await });
        let mut task = self.inner.task.lock().expect("task slot poisoned");
        *task = Some(handle);

        tracing::info!(target: "pipeline", epoch, "poller started");
        true
    }

    /// Stop polling. Idempotent. The schedule is cancelled; in-flight
    /// dependency calls drain and their results are discarded.
    pub fn stop(&self) -> bool {
        {
            let mut run = self.inner.run.lock().expect("run state poisoned");
            if !run.is_running {
                return false;
            }
            run.is_running = false;
        }
        let _ = self.inner.running_tx.send(false);
        tracing::info!(target: "pipeline", "poller stopped");
        true
    }

    pub fn set_tracked_partitions(&self, partitions: BTreeSet<String>) {
        let mut run = self.inner.run.lock().expect("run state poisoned");
        tracing::info!(target: "pipeline", count = partitions.len(), "tracked partitions updated");
        run.tracked_partitions = partitions;
    }

    pub fn set_poll_interval_ms(&self, interval_ms: u64) {
        let clamped = interval_ms.max(MIN_POLL_INTERVAL_MS);
        let mut run = self.inner.run.lock().expect("run state poisoned");
        run.poll_interval_ms = clamped;
        tracing::info!(target: "pipeline", interval_ms = clamped, "poll interval updated");
    }

    pub async fn status(&self) -> StatusReport {
        let (is_running, tracked_partitions, poll_interval_ms) = {
            let run = self.inner.run.lock().expect("run state poisoned");
            (
                run.is_running,
                run.tracked_partitions.iter().cloned().collect(),
                run.poll_interval_ms,
            )
        };
        let (items_published, insights_published) = self.inner.publisher.snapshot().counts();
        StatusReport {
            is_running,
            tracked_partitions,
            poll_interval_ms,
            content_gate: self.inner.content_gate.snapshot().await,
            inference_gate: self.inner.generator.gate().snapshot().await,
            items_published,
            insights_published,
        }
    }

    /// Run exactly one fetch cycle outside the schedule. Used by tests and
    /// the one-shot probe; results are never discarded.
    pub async fn run_cycle_once(&self) {
        self.run_cycle(None).await;
    }

    fn run_matches(&self, epoch: Option<u64>) -> bool {
        match epoch {
            None => true,
            Some(e) => {
                let run = self.inner.run.lock().expect("run state poisoned");
                run.is_running && run.epoch == e
            }
        }
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.inner
                .run
                .lock()
                .expect("run state poisoned")
                .poll_interval_ms,
        )
    }

    async fn poll_loop(self, epoch: u64) {
        let mut wake_rx = self.inner.running_tx.subscribe();
        loop {
            if !self.run_matches(Some(epoch)) {
                break;
            }
            self.run_cycle(Some(epoch)).await;

            // Interval is re-read each lap so /control/interval applies live.
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval()) => {}
                changed = wake_rx.changed() => {
                    if changed.is_err() || !*wake_rx.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::debug!(target: "pipeline", epoch, "poll loop exited");
    }

    async fn run_cycle(&self, epoch: Option<u64>) {
        let partitions: Vec<String> = {
            let run = self.inner.run.lock().expect("run state poisoned");
            run.tracked_partitions.iter().cloned().collect()
        };
        if partitions.is_empty() {
            tracing::trace!(target: "pipeline", "no tracked partitions, cycle is a no-op");
            return;
        }
        counter!("poll_cycles_total").increment(1);

        for partition in partitions {
            let fetched = self
                .inner
                .content_gate
                .call(|| {
                    self.inner
                        .source
                        .fetch(&partition, SortMode::New, self.inner.fetch_limit)
                })
                .await;
            match fetched {
                Err(ThrottleError::Rejected { retry_after_ms }) => {
                    // Not retried within this cycle; the next scheduled cycle
                    // tries again.
                    counter!("partition_skips_total").increment(1);
                    tracing::info!(
                        target: "pipeline",
                        partition = %partition,
                        retry_after_ms,
                        "content gate rejected fetch, skipping partition this cycle"
                    );
                }
                Err(ThrottleError::Upstream(e)) => {
                    counter!("source_errors_total").increment(1);
                    tracing::warn!(target: "pipeline", partition = %partition, error = %e, "fetch failed");
                }
                Ok(page) => {
                    if !self.run_matches(epoch) {
                        tracing::debug!(
                            target: "pipeline",
                            partition = %partition,
                            "stopped mid-cycle, discarding fetch results"
                        );
                        return;
                    }
                    self.fan_out(epoch, page);
                }
            }
        }
    }

    /// Forward unseen items: publish the raw item, then generate its insight
    /// in a detached task so generation latency never blocks the poll cycle.
    fn fan_out(&self, epoch: Option<u64>, page: FetchPage) {
        for item in page.items {
            if !self.inner.dedup.check_and_record(&item.id) {
                counter!("dedup_dropped_total").increment(1);
                continue;
            }
            counter!("items_kept_total").increment(1);
            self.inner.publisher.publish_item(item.clone());

            let this = self.clone();
            tokio::spawn(async move {
                match this.inner.generator.generate(&item).await {
                    Ok(insight) => {
                        if this.run_matches(epoch) {
                            this.inner.publisher.publish_insight(insight);
                        } else {
                            tracing::debug!(
                                target: "pipeline",
                                item_id = %item.id,
                                "discarding insight generated after stop"
                            );
                        }
                    }
                    Err(GenerationError::Throttled { retry_after_ms }) => {
                        tracing::info!(
                            target: "pipeline",
                            item_id = %item.id,
                            retry_after_ms,
                            "insight generation throttled, item dropped for this run"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            target: "pipeline",
                            item_id = %item.id,
                            error = %e,
                            "insight generation failed, item dropped for this run"
                        );
                    }
                }
            });
        }
    }
}
