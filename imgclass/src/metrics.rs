//! Prometheus instruments for the classification pipeline.
//!
//! HTTP-level metrics (request counts and latencies per route) come from
//! `axum-prometheus`. This module adds what the HTTP layer cannot see: how each
//! classification ended and how long the backend took. Staging counters
//! (`imgclass_staged_files_total`, `imgclass_released_files_total`) are recorded inline
//! through the `metrics` facade in [`crate::staging`].

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::time::Duration;

/// Classification metrics registered in a dedicated Prometheus registry
#[derive(Clone)]
pub struct ClassifyMetrics {
    /// Finished classifications by outcome
    outcomes: IntCounterVec,
    /// Time spent waiting on the classification service
    backend_duration: HistogramVec,
    registry: Registry,
}

impl ClassifyMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let outcomes = IntCounterVec::new(
            Opts::new("imgclass_classifications_total", "Classification requests by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(outcomes.clone()))?;

        // Backend inference on CPU sits in the hundreds of milliseconds to seconds
        let buckets = vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];
        let backend_duration = HistogramVec::new(
            HistogramOpts::new(
                "imgclass_backend_request_duration_seconds",
                "Duration of calls to the classification service",
            )
            .buckets(buckets),
            &["status"],
        )?;
        registry.register(Box::new(backend_duration.clone()))?;

        Ok(Self {
            outcomes,
            backend_duration,
            registry: registry.clone(),
        })
    }

    pub fn record_outcome(&self, outcome: &str) {
        self.outcomes.with_label_values(&[outcome]).inc();
    }

    /// `status` is the backend HTTP status, or `"error"` when no reply arrived
    pub fn record_backend_call(&self, status: &str, elapsed: Duration) {
        self.backend_duration.with_label_values(&[status]).observe(elapsed.as_secs_f64());
    }

    /// Render this registry in the Prometheus text format
    pub fn render(&self) -> String {
        use prometheus::{Encoder, TextEncoder};

        let mut buffer = vec![];
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode classification metrics: {}", e);
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}
