//! Periodic aggregate snapshot for operators.

use crate::metrics::SnapshotMetrics;
use shopflow_core::store::{StatsSnapshot, StatsSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Logs a [`StatsSnapshot`] on a fixed interval.
#[derive(Clone)]
pub struct StatsReporter {
    source: Arc<dyn StatsSource>,
    interval: Duration,
}

impl StatsReporter {
    /// Default reporting interval.
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

    /// Report from `source` every `interval`.
    #[must_use]
    pub fn new(source: Arc<dyn StatsSource>, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// Take and log one snapshot.
    ///
    /// Returns `None` if the snapshot query failed; the failure is logged as a warning.
    pub async fn report_once(&self) -> Option<StatsSnapshot> {
        match self.source.snapshot().await {
            Ok(snapshot) => {
                tracing::info!(
                    total_events = snapshot.total_events,
                    total_sales = snapshot.total_sales,
                    total_revenue = snapshot.total_revenue,
                    "Pipeline stats"
                );
                SnapshotMetrics::record(&snapshot);
                Some(snapshot)
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to collect pipeline stats");
                None
            },
        }
    }

    /// Report until `shutdown` becomes `true` or its sender is dropped.
    ///
    /// The first report is taken one interval after start.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.report_once().await;
                },
            }
        }

        tracing::debug!("Stats reporter stopped");
    }
}

impl std::fmt::Debug for StatsReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsReporter")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}
