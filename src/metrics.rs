use chrono::{DateTime, Utc};
use kube::{
    runtime::events::{Recorder, Reporter},
    Client,
};
use prometheus::{histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, Registry};
use serde::Serialize;
use tokio::time::Instant;

use crate::controllers::upgrade::UpgradeOutcome;
use crate::Error;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub migrations: IntCounter,
    pub plan_writes: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "cattle_sync_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["controller"],
        )?;
        let failures = IntCounterVec::new(
            opts!("cattle_sync_reconciliation_errors_total", "reconciliation errors"),
            &["controller", "error"],
        )?;
        let reconciliations = IntCounter::new("cattle_sync_reconciliations_total", "reconciliations")?;
        let migrations = IntCounter::new(
            "cattle_sync_migrations_total",
            "node templates migrated to the global namespace",
        )?;
        let plan_writes = IntCounterVec::new(
            opts!("cattle_sync_plan_writes_total", "upgrade plan writes"),
            &["action"],
        )?;

        Ok(Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            migrations,
            plan_writes,
        })
    }

    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.migrations.clone()))?;
        registry.register(Box::new(self.plan_writes.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, controller: &str, e: &Error) {
        self.failures
            .with_label_values(&[controller, e.metric_label().as_ref()])
            .inc()
    }

    pub fn count_and_measure(&self, controller: &str) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            controller: controller.to_string(),
            metric: self.reconcile_duration.clone(),
        }
    }

    pub fn plans_written(&self, outcome: &UpgradeOutcome) {
        if let UpgradeOutcome::Converged {
            created,
            updated,
            deactivated,
            ..
        } = outcome
        {
            for (action, count) in [("created", created), ("updated", updated), ("deactivated", deactivated)] {
                self.plan_writes
                    .with_label_values(&[action])
                    .inc_by(*count as u64);
            }
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    controller: String,
    metric: HistogramVec,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metric
            .with_label_values(&[self.controller.as_str()])
            .observe(duration);
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "cattle-sync-controller".into(),
        }
    }
}

impl Diagnostics {
    pub(crate) fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_once() {
        let registry = Registry::new();
        let metrics = Metrics::new().unwrap().register(&registry).unwrap();

        metrics.plans_written(&UpgradeOutcome::Converged {
            created: 2,
            updated: 0,
            deactivated: 1,
            applying: false,
        });
        metrics.plans_written(&UpgradeOutcome::Unsupported);
        drop(metrics.count_and_measure("cluster"));

        assert_eq!(metrics.plan_writes.with_label_values(&["created"]).get(), 2);
        assert_eq!(metrics.plan_writes.with_label_values(&["deactivated"]).get(), 1);
        assert_eq!(metrics.reconciliations.get(), 1);
        assert!(Metrics::new().unwrap().register(&registry).is_err());
    }
}
