// src/config/mod.rs
//! Settings and source set loading.

pub mod settings;
pub mod sources;

pub use settings::{
    AggregatorSettings, BreakerSettings, CacheSettings, DedupSettings, FetchSettings,
    OutputSettings, RateLimitSettings, ReputationSettings, RetrySettings, ScoreWeights,
    ScreeningSettings,
};
pub use sources::{load_sources_default, load_sources_from, parse_sources_json, parse_sources_toml};
