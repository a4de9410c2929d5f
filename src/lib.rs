// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod cache;
pub mod config;
pub mod decode;
pub mod dedup;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod parse;
pub mod persist;
pub mod pipeline;
pub mod publish;
pub mod reputation;
pub mod scheduler;
pub mod scoring;
pub mod types;

// ---- Re-exports for stable public API ----
pub use crate::cache::{CacheScope, DistributedBackend, InMemoryBackend, MultiTierCache};
pub use crate::config::{load_sources_default, load_sources_from, AggregatorSettings};
pub use crate::error::{ErrorKind, FetchError, ParseError, SourceSetError};
pub use crate::fetch::{HttpClient, MockHttpClient, MockReply};
pub use crate::parse::Parser;
pub use crate::pipeline::{AggregationResult, Aggregator, CycleStats};
pub use crate::reputation::{ReputationState, SourceReputation};
pub use crate::scoring::{RuleScorer, ScoreSignals, Scorer};
pub use crate::types::{CanonicalKey, Configuration, Protocol, Source, SourceSet, SourceTier};
