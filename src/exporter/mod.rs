//! Discovery exporters
//!
//! # Module Structure
//!
//! - [`ecs_discovery`] - The account × region × cluster × service pipeline
//! - [`task_targets`] - Turns a running task into scrape targets
//! - [`routing`] - Infers load balancer → service edges
//! - [`samples`] - Builds Prometheus metric families from samples

pub mod ecs_discovery;
pub mod routing;
pub mod samples;
pub mod task_targets;

pub use ecs_discovery::{DiscoverySnapshot, EcsServiceDiscoveryExporter, InventoryCollector};
pub use routing::LbRoutingBuilder;
pub use samples::{MetricSampleBuilder, Sample};
pub use task_targets::TaskTargetBuilder;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const METRICS_PATH_LABEL: &str = "__metrics_path__";
pub const JOB_LABEL: &str = "job";
pub const CLUSTER_LABEL: &str = "cluster";
pub const TASK_DEF_NAME_LABEL: &str = "ecs_taskdef_name";
pub const TASK_DEF_VERSION_LABEL: &str = "ecs_taskdef_version";
pub const CONTAINER_LABEL: &str = "container";
pub const TASK_ID_LABEL: &str = "pod";
pub const AVAILABILITY_ZONE_LABEL: &str = "availability_zone";
pub const SUBNET_ID_LABEL: &str = "subnet_id";
pub const NAMESPACE_LABEL: &str = "namespace";
pub const REGION_LABEL: &str = "region";
pub const ACCOUNT_ID_LABEL: &str = "account_id";

pub const ECS_NAMESPACE: &str = "AWS/ECS";

/// A periodically refreshed metric source
#[async_trait]
pub trait MetricProvider: Send + Sync {
    /// Run one refresh cycle. Failures are logged, never returned.
    async fn update(&self);
}

/// One entry of a Prometheus `file_sd_configs` file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StaticTargetConfig {
    pub targets: BTreeSet<String>,
    pub labels: BTreeMap<String, String>,
}

impl StaticTargetConfig {
    pub fn new(target: String, labels: TargetLabels) -> Self {
        Self {
            targets: BTreeSet::from([target]),
            labels: labels.into_map(),
        }
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(|v| v.as_str())
    }
}

/// Labels attached to a discovered ECS scrape target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetLabels {
    pub metrics_path: String,
    pub job: String,
    pub cluster: String,
    pub task_def_name: String,
    pub task_def_version: Option<String>,
    pub container: String,
    pub task_id: String,
    pub availability_zone: Option<String>,
    pub subnet_id: Option<String>,
    pub region: String,
    pub account_id: String,
}

impl TargetLabels {
    pub fn into_map(self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::from([
            (METRICS_PATH_LABEL.to_string(), self.metrics_path),
            (JOB_LABEL.to_string(), self.job),
            (CLUSTER_LABEL.to_string(), self.cluster),
            (TASK_DEF_NAME_LABEL.to_string(), self.task_def_name),
            (CONTAINER_LABEL.to_string(), self.container),
            (TASK_ID_LABEL.to_string(), self.task_id),
            (NAMESPACE_LABEL.to_string(), ECS_NAMESPACE.to_string()),
            (REGION_LABEL.to_string(), self.region),
            (ACCOUNT_ID_LABEL.to_string(), self.account_id),
        ]);

        let optional = [
            (TASK_DEF_VERSION_LABEL, self.task_def_version),
            (AVAILABILITY_ZONE_LABEL, self.availability_zone),
            (SUBNET_ID_LABEL, self.subnet_id),
        ];
        for (name, value) in optional {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                labels.insert(name.to_string(), value);
            }
        }
        labels
    }
}
