use chrono::{DateTime, Utc};
use kube::{
    client::Client,
    runtime::events::{Recorder, Reporter},
};
use prometheus::{histogram_opts, opts, HistogramTimer, HistogramVec, IntCounterVec, Registry};
use serde::Serialize;

use crate::Error;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "packet_provider_reconcile_duration_seconds",
                "The distribution of reconcile durations",
                vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]
            ),
            &["kind"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "packet_provider_reconciliation_errors_total",
                "reconciliation errors"
            ),
            &["kind", "error"],
        )
        .unwrap();
        let reconciliations = IntCounterVec::new(
            opts!("packet_provider_reconciliations_total", "reconciliations"),
            &["kind"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, kind: &str, error: &Error) {
        self.failures
            .with_label_values(&[kind, error.metric_label().as_ref()])
            .inc()
    }

    pub fn count_and_measure(&self, kind: &str) -> HistogramTimer {
        self.reconciliations.with_label_values(&[kind]).inc();
        self.reconcile_duration
            .with_label_values(&[kind])
            .start_timer()
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
            reporter: "packet-provider-controller".into(),
        }
    }
}

impl Diagnostics {
    pub(crate) fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}
