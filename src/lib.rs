// src/lib.rs
// Public library surface for integration tests (and potential reuse).

pub mod api;
pub mod config;
pub mod dedup;
pub mod generator;
pub mod infer;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod publisher;
pub mod source;
pub mod throttle;

// ---- Re-exports for stable public API ----
pub use crate::api::{create_router, AppState};
pub use crate::model::{Insight, InsightCategory, Item, Priority, RawInsight, Sentiment};
pub use crate::pipeline::{Pipeline, StatusReport};
pub use crate::throttle::{ThrottleCfg, ThrottleError, ThrottleGate};
