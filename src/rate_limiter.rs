//! Rate limiter
//!
//! Every outbound AWS call goes through [`RateLimiter::run`], which records
//! call latency and failures tagged with the call's dimension labels. Errors
//! are passed back to the caller untouched.

use anyhow::{Context, Result};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Instant;

pub const SCRAPE_LATENCY_METRIC: &str = "aws_exporter_milliseconds";
pub const SCRAPE_ERROR_COUNT_METRIC: &str = "aws_exporter_error_count";

pub const SCRAPE_ACCOUNT_ID_LABEL: &str = "account_id";
pub const SCRAPE_REGION_LABEL: &str = "region";
pub const SCRAPE_OPERATION_LABEL: &str = "operation";
pub const SCRAPE_NAMESPACE_LABEL: &str = "namespace";

/// Label names carried by both telemetry metrics, in registration order
const TELEMETRY_LABELS: [&str; 4] = [
    SCRAPE_ACCOUNT_ID_LABEL,
    SCRAPE_REGION_LABEL,
    SCRAPE_OPERATION_LABEL,
    SCRAPE_NAMESPACE_LABEL,
];

/// Latency buckets in milliseconds
const LATENCY_BUCKETS: &[f64] = &[
    5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

/// Dimension labels attached to a single remote call
pub type DimensionLabels = BTreeMap<String, String>;

/// Build the standard dimension labels for a call
pub fn dimension_labels(
    account_id: &str,
    region: &str,
    operation: &str,
    namespace: &str,
) -> DimensionLabels {
    BTreeMap::from([
        (SCRAPE_ACCOUNT_ID_LABEL.to_string(), account_id.to_string()),
        (SCRAPE_REGION_LABEL.to_string(), region.to_string()),
        (SCRAPE_OPERATION_LABEL.to_string(), operation.to_string()),
        (SCRAPE_NAMESPACE_LABEL.to_string(), namespace.to_string()),
    ])
}

/// Latency histogram and error counter for outbound calls
#[derive(Clone)]
pub struct Telemetry {
    latency: HistogramVec,
    errors: IntCounterVec,
}

impl Telemetry {
    /// Create the metrics and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let telemetry = Self::unregistered()?;
        registry
            .register(Box::new(telemetry.latency.clone()))
            .context("Failed to register latency histogram")?;
        registry
            .register(Box::new(telemetry.errors.clone()))
            .context("Failed to register error counter")?;
        Ok(telemetry)
    }

    /// Create the metrics without exposing them anywhere
    pub fn unregistered() -> Result<Self> {
        let latency = HistogramVec::new(
            HistogramOpts::new(SCRAPE_LATENCY_METRIC, "Latency of AWS API calls in milliseconds")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &TELEMETRY_LABELS,
        )
        .context("Failed to create latency histogram")?;
        let errors = IntCounterVec::new(
            Opts::new(SCRAPE_ERROR_COUNT_METRIC, "Number of failed AWS API calls"),
            &TELEMETRY_LABELS,
        )
        .context("Failed to create error counter")?;
        Ok(Self { latency, errors })
    }

    pub fn record_latency(&self, labels: &DimensionLabels, millis: f64) {
        let values = label_values(labels);
        self.latency
            .with_label_values(&values)
            .observe(millis);
    }

    pub fn record_error(&self, labels: &DimensionLabels) {
        let values = label_values(labels);
        self.errors.with_label_values(&values).inc();
    }

    /// Number of latency observations recorded for `labels`
    pub fn latency_count(&self, labels: &DimensionLabels) -> u64 {
        let values = label_values(labels);
        self.latency.with_label_values(&values).get_sample_count()
    }

    /// Number of errors recorded for `labels`
    pub fn error_count(&self, labels: &DimensionLabels) -> u64 {
        let values = label_values(labels);
        self.errors.with_label_values(&values).get()
    }
}

/// Values in [`TELEMETRY_LABELS`] order; missing keys become ""
fn label_values(labels: &DimensionLabels) -> Vec<&str> {
    TELEMETRY_LABELS
        .iter()
        .map(|name| labels.get(*name).map(|v| v.as_str()).unwrap_or(""))
        .collect()
}

/// Single chokepoint for outbound calls
///
/// Currently only observes; it is also the place to add admission control
/// without touching call sites.
#[derive(Clone)]
pub struct RateLimiter {
    telemetry: Telemetry,
}

impl RateLimiter {
    pub fn new(telemetry: Telemetry) -> Self {
        Self { telemetry }
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Run `call`, recording its latency and any failure under `labels`
    ///
    /// The operation name fills the `operation` label unless `labels`
    /// already carries one.
    pub async fn run<T, F, Fut>(&self, operation: &str, labels: &DimensionLabels, call: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut labels = labels.clone();
        labels
            .entry(SCRAPE_OPERATION_LABEL.to_string())
            .or_insert_with(|| operation.to_string());

        let start = Instant::now();
        let result = call().await;
        let elapsed = start.elapsed().as_secs_f64() * 1000.0;

        self.telemetry.record_latency(&labels, elapsed);
        if let Err(ref e) = result {
            tracing::debug!("{} failed: {:#}", operation, e);
            self.telemetry.record_error(&labels);
        }

        result
    }
}
