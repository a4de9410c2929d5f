// src/scheduler.rs
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::pipeline::Aggregator;
use crate::publish::publish;
use crate::types::SourceSet;

#[derive(Clone, Debug)]
pub struct SchedulerCfg {
    pub interval: Duration,
    /// Publish every result here when set.
    pub output_dir: Option<PathBuf>,
}

/// Spawn the periodic cycle loop. The first cycle starts immediately; a cycle
/// that overruns the interval delays the next tick instead of bunching.
pub fn spawn_scheduler(agg: Arc<Aggregator>, sources: SourceSet, cfg: SchedulerCfg) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let result = agg.run_cycle(&sources).await;
            if let Some(dir) = &cfg.output_dir {
                if let Err(e) = publish(&result, dir) {
                    tracing::warn!(target: "scheduler", error = ?e, "publishing cycle output failed");
                }
            }
            tracing::info!(
                target: "scheduler",
                published = result.stats.published,
                next_in_secs = cfg.interval.as_secs(),
                "scheduled cycle done"
            );
        }
    })
}
