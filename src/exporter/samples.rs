//! Metric sample assembly

use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};
use std::collections::BTreeMap;

/// A single gauge observation
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricSampleBuilder;

impl MetricSampleBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build_single_sample(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
        value: f64,
    ) -> Sample {
        Sample {
            name: name.to_string(),
            labels: labels
                .into_iter()
                .map(|(k, v)| (sanitize_label_name(&k), v))
                .collect(),
            value,
        }
    }

    /// Gauge family holding `samples`; `None` when there are none
    ///
    /// Samples whose name differs from the first one are dropped.
    pub fn build_family(&self, samples: &[Sample]) -> Option<MetricFamily> {
        let name = &samples.first()?.name;

        let metrics: Vec<Metric> = samples
            .iter()
            .filter(|sample| &sample.name == name)
            .map(|sample| {
                let pairs: Vec<LabelPair> = sample
                    .labels
                    .iter()
                    .map(|(k, v)| {
                        let mut pair = LabelPair::default();
                        pair.set_name(k.clone());
                        pair.set_value(v.clone());
                        pair
                    })
                    .collect();
                let mut gauge = Gauge::default();
                gauge.set_value(sample.value);

                let mut metric = Metric::default();
                metric.set_label(pairs.into());
                metric.set_gauge(gauge);
                metric
            })
            .collect();

        let mut family = MetricFamily::default();
        family.set_name(name.clone());
        family.set_help(format!("{} gauge", name));
        family.set_field_type(MetricType::GAUGE);
        family.set_metric(metrics.into());
        Some(family)
    }
}

/// Replace characters outside `[a-zA-Z0-9_]` and a leading digit with `_`
fn sanitize_label_name(name: &str) -> String {
    let mut sanitized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if sanitized.is_empty() || sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }
    sanitized
}
