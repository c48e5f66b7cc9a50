//! AWS API interaction module
//!
//! The discovery pipeline never talks to an SDK client directly. It goes
//! through small capability traits, one per resource family, so each stage
//! can be exercised against in-memory fakes.
//!
//! # Module Structure
//!
//! - [`sdk`] - Production implementations backed by the AWS SDK
//!
//! # Example
//!
//! ```ignore
//! use crate::aws::{ClientProvider, sdk::SdkClientProvider};
//!
//! async fn example(account: &AwsAccount) -> anyhow::Result<()> {
//!     let clients = SdkClientProvider::new().region_clients(account, "us-west-2").await?;
//!     let clusters = clients.ecs.list_clusters().await?;
//!     Ok(())
//! }
//! ```

pub mod sdk;

use crate::config::AwsAccount;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// One page of a list-tasks response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListTasksPage {
    pub task_arns: Vec<String>,
    pub next_token: Option<String>,
}

/// Network or volume attachment of a running task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskAttachment {
    pub attachment_type: Option<String>,
    pub details: BTreeMap<String, String>,
}

/// The fields of a described ECS task that discovery relies on
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EcsTask {
    pub task_arn: Option<String>,
    pub task_definition_arn: Option<String>,
    pub last_status: Option<String>,
    pub availability_zone: Option<String>,
    pub attachments: Vec<TaskAttachment>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortMapping {
    pub container_port: Option<u16>,
    pub host_port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerDefinition {
    pub name: Option<String>,
    /// In declared order
    pub port_mappings: Vec<PortMapping>,
    pub docker_labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskDefinition {
    pub task_definition_arn: Option<String>,
    /// In declared order
    pub containers: Vec<ContainerDefinition>,
}

/// Load balancer bindings of an ECS service
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceDescription {
    pub service_arn: Option<String>,
    pub target_group_arns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetGroupDescription {
    pub target_group_arn: Option<String>,
    pub load_balancer_arns: Vec<String>,
}

/// List/describe capability for the ECS resource family
#[async_trait]
pub trait EcsApi: Send + Sync {
    /// Cluster ARNs in the client's region
    async fn list_clusters(&self) -> Result<Vec<String>>;

    /// Service ARNs in a cluster
    async fn list_services(&self, cluster: &str) -> Result<Vec<String>>;

    /// One page of task ARNs for a service
    async fn list_tasks(
        &self,
        cluster: &str,
        service: &str,
        next_token: Option<&str>,
    ) -> Result<ListTasksPage>;

    /// Describe at most 100 tasks
    async fn describe_tasks(&self, cluster: &str, task_arns: &[String]) -> Result<Vec<EcsTask>>;

    async fn describe_task_definition(&self, task_definition_arn: &str) -> Result<TaskDefinition>;

    /// Describe at most 10 services
    async fn describe_services(
        &self,
        cluster: &str,
        service_arns: &[String],
    ) -> Result<Vec<ServiceDescription>>;
}

/// Describe capability for the ELBv2 resource family
#[async_trait]
pub trait ElbApi: Send + Sync {
    /// Describe at most 20 target groups
    async fn describe_target_groups(
        &self,
        target_group_arns: &[String],
    ) -> Result<Vec<TargetGroupDescription>>;
}

/// Clients scoped to one account and region
///
/// Dropping this value releases the underlying connections.
pub struct RegionClients {
    pub ecs: Box<dyn EcsApi>,
    pub elb: Box<dyn ElbApi>,
}

/// Opens region-scoped clients for an account
#[async_trait]
pub trait ClientProvider: Send + Sync {
    async fn region_clients(&self, account: &AwsAccount, region: &str) -> Result<RegionClients>;
}
