use crate::engine::GroupPurchaseEngine;
use crate::services::SweepReport;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{error, info};

/// Background task that finalizes groups whose 24h window has closed
pub struct Sweeper {
    engine: Arc<GroupPurchaseEngine>,
    sweep_interval: Duration,
}

impl Sweeper {
    pub fn new(engine: Arc<GroupPurchaseEngine>, sweep_interval: Duration) -> Self {
        Self { engine, sweep_interval }
    }

    /// Run until `shutdown` flips to true
    pub async fn start(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = time::interval(self.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Sweeper started, will sweep every {:?}", self.sweep_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        error!("Error sweeping expired groups: {:#}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Sweeper stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One pass; a full batch is followed immediately by another
    pub async fn sweep_once(&self) -> anyhow::Result<SweepReport> {
        let mut total = SweepReport::default();

        loop {
            let report = self
                .engine
                .sweep_expired()
                .await
                .context("listing expired groups")?;

            total.scanned += report.scanned;
            total.succeeded += report.succeeded;
            total.failed += report.failed;
            total.skipped += report.skipped;
            total.errors += report.errors;

            // Groups that errored stay due; stop instead of spinning on them
            let progressed = report.succeeded + report.failed;
            if progressed == 0 || report.errors > 0 || report.scanned < self.engine.sweep_batch_size() {
                break;
            }
        }

        if total.scanned > 0 {
            info!(
                scanned = total.scanned,
                succeeded = total.succeeded,
                failed = total.failed,
                errors = total.errors,
                "Expired groups swept"
            );
        }
        Ok(total)
    }
}
