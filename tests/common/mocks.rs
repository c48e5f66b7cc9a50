//! In-memory implementations of the AWS capability traits
//!
//! Every call is recorded in a shared [`CallLog`] so tests can assert on the
//! exact sequence of remote operations.

use super::ACCOUNT;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use ecs_discovery::aws::{
    ClientProvider, ContainerDefinition, EcsApi, EcsTask, ElbApi, ListTasksPage, PortMapping,
    RegionClients, ServiceDescription, TargetGroupDescription, TaskAttachment, TaskDefinition,
};
use ecs_discovery::config::AwsAccount;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Remote calls observed by the fakes
#[derive(Debug, Default)]
pub struct CallLog {
    pub list_clusters: Vec<String>,
    pub list_tasks: usize,
    pub describe_tasks: Vec<Vec<String>>,
    pub describe_task_definition: usize,
    pub describe_services: Vec<usize>,
    pub describe_target_groups: Vec<usize>,
}

/// Upstream state of one region
#[derive(Debug, Clone, Default)]
pub struct MockRegion {
    pub region: String,
    pub cluster_arns: Vec<String>,
    /// Cluster name -> service ARNs
    pub services: HashMap<String, Vec<String>>,
    /// (cluster name, service name) -> pages of task ARNs
    pub task_pages: HashMap<(String, String), Vec<Vec<String>>>,
    pub tasks: HashMap<String, EcsTask>,
    pub task_definitions: HashMap<String, TaskDefinition>,
    /// Service ARN -> target group ARNs
    pub service_target_groups: HashMap<String, Vec<String>>,
    /// Target group ARN -> load balancer ARNs
    pub target_group_lbs: HashMap<String, Vec<String>>,
    pub fail_list_clusters: bool,
    pub fail_list_services: HashSet<String>,
    pub fail_describe_tasks: HashSet<String>,
    /// Delay before answering each list-tasks call
    pub list_tasks_delay: Option<Duration>,
}

pub fn cluster_arn(region: &str, cluster: &str) -> String {
    format!("arn:aws:ecs:{}:{}:cluster/{}", region, ACCOUNT, cluster)
}

pub fn service_arn(region: &str, cluster: &str, service: &str) -> String {
    format!("arn:aws:ecs:{}:{}:service/{}/{}", region, ACCOUNT, cluster, service)
}

pub fn task_arn(region: &str, cluster: &str, id: &str) -> String {
    format!("arn:aws:ecs:{}:{}:task/{}/{}", region, ACCOUNT, cluster, id)
}

pub fn task_definition_arn(region: &str, family: &str, revision: u32) -> String {
    format!("arn:aws:ecs:{}:{}:task-definition/{}:{}", region, ACCOUNT, family, revision)
}

pub fn load_balancer_arn(region: &str, name: &str) -> String {
    format!(
        "arn:aws:elasticloadbalancing:{}:{}:loadbalancer/app/{}/50dc6c495c0c9188",
        region, ACCOUNT, name
    )
}

pub fn target_group_arn(region: &str, name: &str) -> String {
    format!(
        "arn:aws:elasticloadbalancing:{}:{}:targetgroup/{}/73e2d6bc24d8a067",
        region, ACCOUNT, name
    )
}

impl MockRegion {
    pub fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
            ..Default::default()
        }
    }

    pub fn with_cluster(mut self, cluster: &str) -> Self {
        let arn = cluster_arn(&self.region, cluster);
        if !self.cluster_arns.contains(&arn) {
            self.cluster_arns.push(arn);
        }
        self.services.entry(cluster.to_string()).or_default();
        self
    }

    /// Add a service whose `task_count` running tasks each expose port 8080,
    /// listed `page_size` ARNs per page
    pub fn with_service(
        mut self,
        cluster: &str,
        service: &str,
        task_count: usize,
        page_size: usize,
    ) -> Self {
        self = self.with_cluster(cluster);
        let region = self.region.clone();
        self.services
            .entry(cluster.to_string())
            .or_default()
            .push(service_arn(&region, cluster, service));

        let definition_arn = task_definition_arn(&region, service, 1);
        self.task_definitions.insert(
            definition_arn.clone(),
            TaskDefinition {
                task_definition_arn: Some(definition_arn.clone()),
                containers: vec![ContainerDefinition {
                    name: Some("app".to_string()),
                    port_mappings: vec![PortMapping {
                        container_port: Some(8080),
                        host_port: Some(8080),
                    }],
                    docker_labels: BTreeMap::new(),
                }],
            },
        );

        let arns: Vec<String> = (0..task_count)
            .map(|i| task_arn(&region, cluster, &format!("{}-{:05}", service, i)))
            .collect();
        for (i, arn) in arns.iter().enumerate() {
            self.tasks
                .insert(arn.clone(), running_task(arn, &definition_arn, i));
        }
        let pages = arns
            .chunks(page_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        self.task_pages
            .insert((cluster.to_string(), service.to_string()), pages);
        self
    }

    /// Put `service` behind a load balancer
    pub fn with_load_balancer(mut self, cluster: &str, service: &str, lb: &str) -> Self {
        let tg = target_group_arn(&self.region, service);
        self.service_target_groups
            .entry(service_arn(&self.region, cluster, service))
            .or_default()
            .push(tg.clone());
        self.target_group_lbs
            .entry(tg)
            .or_default()
            .push(load_balancer_arn(&self.region, lb));
        self
    }
}

pub fn running_task(arn: &str, definition_arn: &str, index: usize) -> EcsTask {
    EcsTask {
        task_arn: Some(arn.to_string()),
        task_definition_arn: Some(definition_arn.to_string()),
        last_status: Some("RUNNING".to_string()),
        availability_zone: Some("us-west-2a".to_string()),
        attachments: vec![TaskAttachment {
            attachment_type: Some("ElasticNetworkInterface".to_string()),
            details: BTreeMap::from([
                (
                    "privateIPv4Address".to_string(),
                    format!("10.0.{}.{}", index / 250, index % 250 + 1),
                ),
                ("subnetId".to_string(), "subnet-0abc".to_string()),
            ]),
        }],
    }
}

pub struct MockEcs {
    region: Arc<MockRegion>,
    calls: Arc<Mutex<CallLog>>,
    dropped: Arc<AtomicUsize>,
}

impl Drop for MockEcs {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl EcsApi for MockEcs {
    async fn list_clusters(&self) -> Result<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .list_clusters
            .push(self.region.region.clone());
        if self.region.fail_list_clusters {
            bail!("AccessDeniedException: not authorized to perform ecs:ListClusters");
        }
        Ok(self.region.cluster_arns.clone())
    }

    async fn list_services(&self, cluster: &str) -> Result<Vec<String>> {
        if self.region.fail_list_services.contains(cluster) {
            bail!("ClusterNotFoundException: {}", cluster);
        }
        Ok(self.region.services.get(cluster).cloned().unwrap_or_default())
    }

    async fn list_tasks(
        &self,
        cluster: &str,
        service: &str,
        next_token: Option<&str>,
    ) -> Result<ListTasksPage> {
        self.calls.lock().unwrap().list_tasks += 1;
        if let Some(delay) = self.region.list_tasks_delay {
            tokio::time::sleep(delay).await;
        }
        let pages = self
            .region
            .task_pages
            .get(&(cluster.to_string(), service.to_string()));
        let Some(pages) = pages else {
            return Ok(ListTasksPage::default());
        };

        let index: usize = match next_token {
            Some(token) => token.parse()?,
            None => 0,
        };
        let task_arns = pages.get(index).cloned().unwrap_or_default();
        let next_token = (index + 1 < pages.len()).then(|| (index + 1).to_string());
        Ok(ListTasksPage {
            task_arns,
            next_token,
        })
    }

    async fn describe_tasks(&self, cluster: &str, task_arns: &[String]) -> Result<Vec<EcsTask>> {
        self.calls
            .lock()
            .unwrap()
            .describe_tasks
            .push(task_arns.to_vec());
        if task_arns.len() > 100 {
            bail!("InvalidParameterException: too many tasks");
        }
        if self.region.fail_describe_tasks.contains(cluster) {
            bail!("ThrottlingException: Rate exceeded");
        }
        Ok(task_arns
            .iter()
            .filter_map(|arn| self.region.tasks.get(arn).cloned())
            .collect())
    }

    async fn describe_task_definition(&self, task_definition_arn: &str) -> Result<TaskDefinition> {
        self.calls.lock().unwrap().describe_task_definition += 1;
        self.region
            .task_definitions
            .get(task_definition_arn)
            .cloned()
            .ok_or_else(|| anyhow!("ClientException: unknown task definition"))
    }

    async fn describe_services(
        &self,
        _cluster: &str,
        service_arns: &[String],
    ) -> Result<Vec<ServiceDescription>> {
        self.calls
            .lock()
            .unwrap()
            .describe_services
            .push(service_arns.len());
        Ok(service_arns
            .iter()
            .map(|arn| ServiceDescription {
                service_arn: Some(arn.clone()),
                target_group_arns: self
                    .region
                    .service_target_groups
                    .get(arn)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect())
    }
}

pub struct MockElb {
    region: Arc<MockRegion>,
    calls: Arc<Mutex<CallLog>>,
}

#[async_trait]
impl ElbApi for MockElb {
    async fn describe_target_groups(
        &self,
        target_group_arns: &[String],
    ) -> Result<Vec<TargetGroupDescription>> {
        self.calls
            .lock()
            .unwrap()
            .describe_target_groups
            .push(target_group_arns.len());
        Ok(target_group_arns
            .iter()
            .map(|arn| TargetGroupDescription {
                target_group_arn: Some(arn.clone()),
                load_balancer_arns: self
                    .region
                    .target_group_lbs
                    .get(arn)
                    .cloned()
                    .unwrap_or_default(),
            })
            .collect())
    }
}

/// Hands out mock clients; regions without state fail client construction
#[derive(Clone, Default)]
pub struct MockClientProvider {
    regions: HashMap<String, Arc<MockRegion>>,
    pub calls: Arc<Mutex<CallLog>>,
    pub opened: Arc<AtomicUsize>,
    pub dropped: Arc<AtomicUsize>,
}

impl MockClientProvider {
    pub fn new(regions: Vec<MockRegion>) -> Self {
        Self {
            regions: regions
                .into_iter()
                .map(|r| (r.region.clone(), Arc::new(r)))
                .collect(),
            ..Default::default()
        }
    }

    pub fn describe_task_batches(&self) -> Vec<usize> {
        self.calls
            .lock()
            .unwrap()
            .describe_tasks
            .iter()
            .map(|batch| batch.len())
            .collect()
    }
}

#[async_trait]
impl ClientProvider for MockClientProvider {
    async fn region_clients(&self, _account: &AwsAccount, region: &str) -> Result<RegionClients> {
        let state = self
            .regions
            .get(region)
            .cloned()
            .ok_or_else(|| anyhow!("dispatch failure: no endpoint for region {}", region))?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(RegionClients {
            ecs: Box::new(MockEcs {
                region: state.clone(),
                calls: self.calls.clone(),
                dropped: self.dropped.clone(),
            }),
            elb: Box::new(MockElb {
                region: state,
                calls: self.calls.clone(),
            }),
        })
    }
}
