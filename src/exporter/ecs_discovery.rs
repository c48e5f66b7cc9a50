//! ECS service discovery
//!
//! Walks accounts × regions × clusters × services, builds Prometheus scrape
//! targets for the running tasks of every service, infers load balancer
//! routing, and emits one inventory sample per service.
//!
//! A cycle's results are published all at once when the cycle completes.
//! Readers see either the previous cycle or the new one, never a mix.

use super::{
    MetricProvider, MetricSampleBuilder, Sample, StaticTargetConfig, TaskTargetBuilder,
    LbRoutingBuilder, ECS_NAMESPACE,
};
use crate::aws::sdk::format_aws_error;
use crate::aws::{ClientProvider, EcsApi, RegionClients};
use crate::config::{AwsAccount, ConfigAccountProvider, ConfigProvider, ScrapeConfig};
use crate::rate_limiter::{dimension_labels, RateLimiter};
use crate::resource::{Resource, ResourceMapper, ResourceType, RoutingEdge};
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Largest batch describe-tasks accepts
pub const TASK_BATCH_SIZE: usize = 100;

/// Inventory gauge, one sample per discovered service
pub const RESOURCE_METRIC: &str = "aws_resource";

const INVENTORY_LABELS: [&str; 6] = ["account_id", "region", "cluster", "job", "name", "resource_type"];

/// Results of the most recently completed cycle
#[derive(Debug, Default)]
pub struct DiscoverySnapshot {
    pub targets: Vec<StaticTargetConfig>,
    pub routing: HashSet<RoutingEdge>,
    pub inventory: Vec<MetricFamily>,
    /// `None` until the first cycle completes
    pub completed_at: Option<DateTime<Utc>>,
}

/// State accumulated while a cycle runs; never visible to readers
#[derive(Default)]
struct Cycle {
    targets: Vec<StaticTargetConfig>,
    routing: HashSet<RoutingEdge>,
    samples: Vec<Sample>,
}

pub struct EcsServiceDiscoveryExporter {
    config_provider: Arc<dyn ConfigProvider>,
    account_provider: ConfigAccountProvider,
    client_provider: Arc<dyn ClientProvider>,
    resource_mapper: ResourceMapper,
    rate_limiter: RateLimiter,
    task_builder: TaskTargetBuilder,
    routing_builder: LbRoutingBuilder,
    sample_builder: MetricSampleBuilder,
    published: Arc<ArcSwap<DiscoverySnapshot>>,
    running: Mutex<()>,
}

impl EcsServiceDiscoveryExporter {
    pub fn new(
        config_provider: Arc<dyn ConfigProvider>,
        account_provider: ConfigAccountProvider,
        client_provider: Arc<dyn ClientProvider>,
        rate_limiter: RateLimiter,
    ) -> Self {
        Self {
            config_provider,
            account_provider,
            client_provider,
            resource_mapper: ResourceMapper::new(),
            task_builder: TaskTargetBuilder::new(rate_limiter.clone()),
            routing_builder: LbRoutingBuilder::new(rate_limiter.clone()),
            rate_limiter,
            sample_builder: MetricSampleBuilder::new(),
            published: Arc::new(ArcSwap::from_pointee(DiscoverySnapshot::default())),
            running: Mutex::new(()),
        }
    }

    /// The last completed cycle
    pub fn snapshot(&self) -> Arc<DiscoverySnapshot> {
        self.published.load_full()
    }

    /// A collector exposing the inventory of the last completed cycle
    pub fn inventory_collector(&self) -> Result<InventoryCollector> {
        let desc = Desc::new(
            RESOURCE_METRIC.to_string(),
            "Discovered AWS resources".to_string(),
            INVENTORY_LABELS.iter().map(|l| l.to_string()).collect(),
            HashMap::new(),
        )
        .context("Failed to describe inventory metric")?;
        Ok(InventoryCollector {
            desc,
            published: self.published.clone(),
        })
    }

    async fn discover_region(
        &self,
        config: &ScrapeConfig,
        account: &AwsAccount,
        region: &str,
        cycle: &mut Cycle,
    ) -> Result<()> {
        let clients = self
            .client_provider
            .region_clients(account, region)
            .await
            .context("Failed to create ECS client")?;

        let labels = dimension_labels(&account.account_id, region, "listClusters", ECS_NAMESPACE);
        let cluster_arns = self
            .rate_limiter
            .run("EcsClient/listClusters", &labels, || clients.ecs.list_clusters())
            .await?;

        let clusters = cluster_arns
            .iter()
            .filter_map(|arn| self.resource_mapper.map(arn))
            .filter(|r| r.resource_type == ResourceType::EcsCluster);
        for cluster in clusters {
            self.discover_cluster(config, &clients, &cluster, cycle).await;
        }
        Ok(())
    }

    async fn discover_cluster(
        &self,
        config: &ScrapeConfig,
        clients: &RegionClients,
        cluster: &Resource,
        cycle: &mut Cycle,
    ) {
        let labels = dimension_labels(&cluster.account, &cluster.region, "listServices", ECS_NAMESPACE);
        let service_arns = match self
            .rate_limiter
            .run("EcsClient/listServices", &labels, || {
                clients.ecs.list_services(&cluster.name)
            })
            .await
        {
            Ok(arns) => arns,
            Err(e) => {
                tracing::error!(
                    "Failed to list services of cluster {} in {}/{}: {}",
                    cluster.name,
                    cluster.account,
                    cluster.region,
                    format_aws_error(&e)
                );
                return;
            }
        };

        let mut services = Vec::new();
        let mapped = service_arns
            .iter()
            .filter_map(|arn| self.resource_mapper.map(arn))
            .filter(|r| r.resource_type == ResourceType::EcsService);
        for service in mapped {
            if config.discover_ecs_tasks {
                let targets = self
                    .build_targets_in_service(config, clients.ecs.as_ref(), cluster, &service)
                    .await;
                cycle.targets.extend(targets);
            }
            cycle.samples.push(self.inventory_sample(cluster, &service));
            services.push(service);
        }

        let edges = self
            .routing_builder
            .get_routings(clients, cluster, &services)
            .await;
        cycle.routing.extend(edges);
    }

    /// Targets of a service; on failure keeps what the earlier batches produced
    async fn build_targets_in_service(
        &self,
        config: &ScrapeConfig,
        ecs: &dyn EcsApi,
        cluster: &Resource,
        service: &Resource,
    ) -> Vec<StaticTargetConfig> {
        let mut targets = Vec::new();
        if let Err(e) = self
            .collect_service_targets(config, ecs, cluster, service, &mut targets)
            .await
        {
            tracing::error!(
                "Failed to discover tasks of service {} in cluster {} ({}/{}): {}",
                service.name,
                cluster.name,
                cluster.account,
                cluster.region,
                format_aws_error(&e)
            );
        }
        targets
    }

    async fn collect_service_targets(
        &self,
        config: &ScrapeConfig,
        ecs: &dyn EcsApi,
        cluster: &Resource,
        service: &Resource,
        targets: &mut Vec<StaticTargetConfig>,
    ) -> Result<()> {
        let labels = dimension_labels(&cluster.account, &cluster.region, "listTasks", ECS_NAMESPACE);
        let mut task_arns: IndexSet<String> = IndexSet::new();
        // ARNs already sent in an earlier batch of this service
        let mut flushed: HashSet<String> = HashSet::new();
        let mut next_token: Option<String> = None;

        loop {
            let page = self
                .rate_limiter
                .run("EcsClient/listTasks", &labels, || {
                    ecs.list_tasks(&cluster.name, &service.name, next_token.as_deref())
                })
                .await?;

            for arn in page.task_arns {
                if flushed.contains(&arn) {
                    continue;
                }
                task_arns.insert(arn);
                if task_arns.len() == TASK_BATCH_SIZE {
                    let batch: Vec<String> = task_arns.drain(..).collect();
                    self.build_batch_targets(config, ecs, cluster, service, &batch, targets)
                        .await?;
                    flushed.extend(batch);
                }
            }

            next_token = page.next_token;
            if next_token.is_none() {
                break;
            }
        }

        if !task_arns.is_empty() {
            let batch: Vec<String> = task_arns.drain(..).collect();
            self.build_batch_targets(config, ecs, cluster, service, &batch, targets)
                .await?;
        }
        Ok(())
    }

    async fn build_batch_targets(
        &self,
        config: &ScrapeConfig,
        ecs: &dyn EcsApi,
        cluster: &Resource,
        service: &Resource,
        batch: &[String],
        targets: &mut Vec<StaticTargetConfig>,
    ) -> Result<()> {
        let labels = dimension_labels(&cluster.account, &cluster.region, "describeTasks", ECS_NAMESPACE);
        let tasks = self
            .rate_limiter
            .run("EcsClient/describeTasks", &labels, || {
                ecs.describe_tasks(&cluster.name, batch)
            })
            .await?;

        for task in tasks.iter().filter(|t| self.task_builder.has_required_info(t)) {
            match self
                .task_builder
                .build_scrape_targets(config, ecs, cluster, service, task)
                .await
            {
                Ok(built) => targets.extend(built),
                Err(e) => tracing::error!(
                    "Failed to build scrape targets for task {:?} of service {}: {}",
                    task.task_arn,
                    service.name,
                    format_aws_error(&e)
                ),
            }
        }
        Ok(())
    }

    fn inventory_sample(&self, cluster: &Resource, service: &Resource) -> Sample {
        let labels = BTreeMap::from([
            ("account_id".to_string(), cluster.account.clone()),
            ("region".to_string(), cluster.region.clone()),
            ("cluster".to_string(), cluster.name.clone()),
            ("job".to_string(), service.name.clone()),
            ("name".to_string(), service.name.clone()),
            (
                "resource_type".to_string(),
                ResourceType::EcsService.aws_type_name().to_string(),
            ),
        ]);
        self.sample_builder.build_single_sample(RESOURCE_METRIC, labels, 1.0)
    }
}

#[async_trait]
impl MetricProvider for EcsServiceDiscoveryExporter {
    async fn update(&self) {
        let _running = self.running.lock().await;
        let config = self.config_provider.scrape_config();
        let mut cycle = Cycle::default();

        for account in self.account_provider.accounts(&config) {
            for region in &account.regions {
                if let Err(e) = self.discover_region(&config, &account, region, &mut cycle).await {
                    tracing::error!(
                        "Failed to get list of ECS clusters in {}/{}: {}",
                        account.account_id,
                        region,
                        format_aws_error(&e)
                    );
                }
            }
        }

        self.task_builder.retain_used_task_definitions().await;

        let snapshot = Arc::new(DiscoverySnapshot {
            inventory: self.sample_builder.build_family(&cycle.samples).into_iter().collect(),
            targets: cycle.targets,
            routing: cycle.routing,
            completed_at: Some(Utc::now()),
        });
        self.published.store(snapshot.clone());
        tracing::info!(
            "ECS discovery found {} targets and {} routes",
            snapshot.targets.len(),
            snapshot.routing.len()
        );

        if config.discover_ecs_tasks {
            let path = Path::new(&config.ecs_target_sd_file);
            match write_targets(path, &snapshot.targets) {
                Ok(()) => tracing::info!("Wrote ECS scrape target SD file {:?}", path),
                Err(e) => tracing::error!("Failed to write ECS SD file {:?}: {:#}", path, e),
            }
        }
    }
}

/// Replace the target file atomically; `.json` paths get JSON, others YAML
pub fn write_targets(path: &Path, targets: &[StaticTargetConfig]) -> Result<()> {
    let content = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::to_string_pretty(targets)?,
        _ => serde_yaml::to_string(targets)?,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {:?}", parent))?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    std::fs::write(&tmp, content).with_context(|| format!("Failed to write {:?}", tmp))?;
    std::fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}

/// Exposes the inventory family of the last completed cycle
pub struct InventoryCollector {
    desc: Desc,
    published: Arc<ArcSwap<DiscoverySnapshot>>,
}

impl Collector for InventoryCollector {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.desc]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.published.load().inventory.clone()
    }
}
