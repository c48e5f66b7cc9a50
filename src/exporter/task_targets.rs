//! Scrape target construction for running ECS tasks

use super::{StaticTargetConfig, TargetLabels, ECS_NAMESPACE};
use crate::aws::{ContainerDefinition, EcsApi, EcsTask, TaskDefinition};
use crate::config::{EcsTaskDefScrapeConfig, ScrapeConfig, DEFAULT_METRIC_PATH};
use crate::rate_limiter::{dimension_labels, RateLimiter};
use crate::resource::{Resource, ResourceMapper};
use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

pub const ENI_ATTACHMENT_TYPE: &str = "ElasticNetworkInterface";
pub const PRIVATE_IPV4_ADDRESS: &str = "privateIPv4Address";
pub const SUBNET_ID: &str = "subnetId";
pub const RUNNING_STATUS: &str = "RUNNING";

/// Docker label carrying the metrics path of a container
pub const PROMETHEUS_METRIC_PATH_DOCKER_LABEL: &str = "PROMETHEUS_EXPORTER_PATH";
/// Docker label carrying the metrics port of a container
pub const PROMETHEUS_PORT_DOCKER_LABEL: &str = "PROMETHEUS_EXPORTER_PORT";

type ConfigLookup<'a> = BTreeMap<&'a str, BTreeMap<Option<u16>, &'a EcsTaskDefScrapeConfig>>;

/// Task definitions by revision ARN, with the ARNs used since the last sweep
#[derive(Default)]
struct TaskDefinitionCache {
    entries: HashMap<String, Arc<TaskDefinition>>,
    used: HashSet<String>,
}

/// Builds scrape targets for ECS tasks
///
/// Task definitions are cached by ARN. A revision ARN never changes content,
/// so entries never go stale; revisions no task used during a cycle are
/// dropped by [`TaskTargetBuilder::retain_used_task_definitions`].
#[derive(Clone)]
pub struct TaskTargetBuilder {
    resource_mapper: ResourceMapper,
    rate_limiter: RateLimiter,
    task_definitions: Arc<RwLock<TaskDefinitionCache>>,
}

impl TaskTargetBuilder {
    pub fn new(rate_limiter: RateLimiter) -> Self {
        Self {
            resource_mapper: ResourceMapper::new(),
            rate_limiter,
            task_definitions: Arc::new(RwLock::new(TaskDefinitionCache::default())),
        }
    }

    /// A running task with a reachable ENI address
    pub fn has_required_info(&self, task: &EcsTask) -> bool {
        task.last_status.as_deref() == Some(RUNNING_STATUS) && private_ip(task).is_some()
    }

    /// Scrape targets for one task, in container then port declaration order
    pub async fn build_scrape_targets(
        &self,
        config: &ScrapeConfig,
        ecs: &dyn EcsApi,
        cluster: &Resource,
        service: &Resource,
        task: &EcsTask,
    ) -> Result<Vec<StaticTargetConfig>> {
        let Some(ip) = private_ip(task) else {
            return Ok(Vec::new());
        };
        let Some(task_resource) = task.task_arn.as_deref().and_then(|arn| self.resource_mapper.map(arn))
        else {
            tracing::debug!("Skipping task with unmappable ARN {:?}", task.task_arn);
            return Ok(Vec::new());
        };
        let Some(task_def_arn) = task.task_definition_arn.as_deref() else {
            tracing::debug!("Skipping task {} without a task definition", task_resource.name);
            return Ok(Vec::new());
        };
        let Some(task_def_resource) = self.resource_mapper.map(task_def_arn) else {
            tracing::debug!("Skipping task with unmappable task definition {}", task_def_arn);
            return Ok(Vec::new());
        };

        let task_def = self.task_definition(ecs, cluster, task_def_arn).await?;
        let overrides = config.ecs_config_by_name_and_port();

        let base_labels = TargetLabels {
            job: service.name.clone(),
            cluster: cluster.name.clone(),
            task_def_name: task_def_resource.name.clone(),
            task_def_version: task_def_resource.version.clone(),
            task_id: task_resource.name.clone(),
            availability_zone: task.availability_zone.clone(),
            subnet_id: eni_detail(task, SUBNET_ID).map(|s| s.to_string()),
            region: cluster.region.clone(),
            account_id: cluster.account.clone(),
            ..Default::default()
        };

        let mut targets = Vec::new();
        for container in &task_def.containers {
            let Some(name) = container.name.as_deref() else {
                continue;
            };
            for (port, path) in scrape_endpoints(config, &overrides, name, container) {
                let labels = TargetLabels {
                    metrics_path: path.to_string(),
                    container: name.to_string(),
                    ..base_labels.clone()
                };
                targets.push(StaticTargetConfig::new(format!("{}:{}", ip, port), labels));
            }
        }
        Ok(targets)
    }

    async fn task_definition(
        &self,
        ecs: &dyn EcsApi,
        cluster: &Resource,
        arn: &str,
    ) -> Result<Arc<TaskDefinition>> {
        {
            let mut cache = self.task_definitions.write().await;
            if let Some(cached) = cache.entries.get(arn).cloned() {
                cache.used.insert(arn.to_string());
                return Ok(cached);
            }
        }

        let labels = dimension_labels(
            &cluster.account,
            &cluster.region,
            "describeTaskDefinition",
            ECS_NAMESPACE,
        );
        let definition = self
            .rate_limiter
            .run("EcsClient/describeTaskDefinition", &labels, || {
                ecs.describe_task_definition(arn)
            })
            .await
            .with_context(|| format!("Failed to describe task definition {}", arn))?;

        let definition = Arc::new(definition);
        let mut cache = self.task_definitions.write().await;
        cache.entries.insert(arn.to_string(), definition.clone());
        cache.used.insert(arn.to_string());
        Ok(definition)
    }

    /// Evict task definitions not used since the previous call
    pub async fn retain_used_task_definitions(&self) {
        let mut cache = self.task_definitions.write().await;
        let TaskDefinitionCache { entries, used } = &mut *cache;
        let before = entries.len();
        entries.retain(|arn, _| used.contains(arn));
        used.clear();
        if entries.len() < before {
            tracing::debug!("Evicted {} unused task definitions", before - entries.len());
        }
    }

    /// Number of cached task definitions
    pub async fn cached_task_definitions(&self) -> usize {
        self.task_definitions.read().await.entries.len()
    }
}

/// (port, path) pairs to scrape for a container
fn scrape_endpoints<'a>(
    config: &ScrapeConfig,
    overrides: &ConfigLookup<'a>,
    name: &str,
    container: &'a ContainerDefinition,
) -> Vec<(u16, &'a str)> {
    let labels = &container.docker_labels;
    if let Some(port) = labels
        .get(PROMETHEUS_PORT_DOCKER_LABEL)
        .and_then(|p| p.trim().parse::<u16>().ok())
    {
        let path = labels
            .get(PROMETHEUS_METRIC_PATH_DOCKER_LABEL)
            .map(|p| p.as_str())
            .unwrap_or(DEFAULT_METRIC_PATH);
        return vec![(port, path)];
    }

    let by_port = overrides.get(name);
    container
        .port_mappings
        .iter()
        .filter_map(|mapping| {
            let port = mapping.container_port?;
            let configured = by_port
                .and_then(|m| m.get(&Some(port)).or_else(|| m.get(&None)))
                .copied();
            match configured {
                Some(entry) => Some((port, entry.metric_path.as_str())),
                None if config.discover_all_ecs_tasks_by_default => Some((port, DEFAULT_METRIC_PATH)),
                None => None,
            }
        })
        .collect()
}

fn eni_detail<'a>(task: &'a EcsTask, name: &str) -> Option<&'a str> {
    task.attachments
        .iter()
        .filter(|a| a.attachment_type.as_deref() == Some(ENI_ATTACHMENT_TYPE))
        .find_map(|a| a.details.get(name))
        .map(|v| v.as_str())
        .filter(|v| !v.is_empty())
}

fn private_ip(task: &EcsTask) -> Option<&str> {
    eni_detail(task, PRIVATE_IPV4_ADDRESS)
}
