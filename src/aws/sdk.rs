//! AWS SDK backed clients
//!
//! Converts SDK responses into the plain records defined in [`super`]. Each
//! account may name a role to assume; otherwise the default credential chain
//! is used.

use super::{
    ClientProvider, ContainerDefinition, EcsApi, EcsTask, ElbApi, ListTasksPage, PortMapping,
    RegionClients, ServiceDescription, TargetGroupDescription, TaskAttachment, TaskDefinition,
};
use crate::config::AwsAccount;
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::sts::AssumeRoleProvider;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_ecs::error::DisplayErrorContext;
use std::collections::BTreeMap;

/// Session name used when assuming a per-account role
const SESSION_NAME: &str = "ecs-discovery";

/// Production [`ClientProvider`]
#[derive(Debug, Clone, Default)]
pub struct SdkClientProvider;

impl SdkClientProvider {
    pub fn new() -> Self {
        Self
    }

    async fn sdk_config(&self, account: &AwsAccount, region: &str) -> SdkConfig {
        let region = Region::new(region.to_string());
        let loader = aws_config::defaults(BehaviorVersion::latest()).region(region.clone());

        match account.role_arn.as_deref() {
            Some(role_arn) => {
                tracing::debug!("Assuming role {} for account {}", role_arn, account.account_id);
                let mut builder = AssumeRoleProvider::builder(role_arn)
                    .session_name(SESSION_NAME)
                    .region(region);
                if let Some(external_id) = account.external_id.as_deref() {
                    builder = builder.external_id(external_id);
                }
                let provider = builder.build().await;
                loader.credentials_provider(provider).load().await
            }
            None => loader.load().await,
        }
    }
}

#[async_trait]
impl ClientProvider for SdkClientProvider {
    async fn region_clients(&self, account: &AwsAccount, region: &str) -> Result<RegionClients> {
        let config = self.sdk_config(account, region).await;
        Ok(RegionClients {
            ecs: Box::new(SdkEcsClient {
                client: aws_sdk_ecs::Client::new(&config),
            }),
            elb: Box::new(SdkElbClient {
                client: aws_sdk_elasticloadbalancingv2::Client::new(&config),
            }),
        })
    }
}

/// Render an SDK error with its full source chain
fn sdk_error<E: std::error::Error>(operation: &str, err: E) -> anyhow::Error {
    anyhow::anyhow!("{} failed: {}", operation, DisplayErrorContext(err))
}

fn to_port(value: Option<i32>) -> Option<u16> {
    value.and_then(|p| u16::try_from(p).ok())
}

// =============================================================================
// ECS
// =============================================================================

struct SdkEcsClient {
    client: aws_sdk_ecs::Client,
}

#[async_trait]
impl EcsApi for SdkEcsClient {
    async fn list_clusters(&self) -> Result<Vec<String>> {
        let output = self
            .client
            .list_clusters()
            .send()
            .await
            .map_err(|e| sdk_error("ListClusters", e))?;
        Ok(output.cluster_arns().to_vec())
    }

    async fn list_services(&self, cluster: &str) -> Result<Vec<String>> {
        let output = self
            .client
            .list_services()
            .cluster(cluster)
            .send()
            .await
            .map_err(|e| sdk_error("ListServices", e))?;
        Ok(output.service_arns().to_vec())
    }

    async fn list_tasks(
        &self,
        cluster: &str,
        service: &str,
        next_token: Option<&str>,
    ) -> Result<ListTasksPage> {
        let output = self
            .client
            .list_tasks()
            .cluster(cluster)
            .service_name(service)
            .set_next_token(next_token.map(|t| t.to_string()))
            .send()
            .await
            .map_err(|e| sdk_error("ListTasks", e))?;
        Ok(ListTasksPage {
            task_arns: output.task_arns().to_vec(),
            next_token: output.next_token().map(|t| t.to_string()),
        })
    }

    async fn describe_tasks(&self, cluster: &str, task_arns: &[String]) -> Result<Vec<EcsTask>> {
        let output = self
            .client
            .describe_tasks()
            .cluster(cluster)
            .set_tasks(Some(task_arns.to_vec()))
            .send()
            .await
            .map_err(|e| sdk_error("DescribeTasks", e))?;

        let tasks = output
            .tasks()
            .iter()
            .map(|task| EcsTask {
                task_arn: task.task_arn().map(|s| s.to_string()),
                task_definition_arn: task.task_definition_arn().map(|s| s.to_string()),
                last_status: task.last_status().map(|s| s.to_string()),
                availability_zone: task.availability_zone().map(|s| s.to_string()),
                attachments: task
                    .attachments()
                    .iter()
                    .map(|attachment| TaskAttachment {
                        attachment_type: attachment.r#type().map(|s| s.to_string()),
                        details: attachment
                            .details()
                            .iter()
                            .filter_map(|kv| {
                                Some((kv.name()?.to_string(), kv.value()?.to_string()))
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        Ok(tasks)
    }

    async fn describe_task_definition(&self, task_definition_arn: &str) -> Result<TaskDefinition> {
        let output = self
            .client
            .describe_task_definition()
            .task_definition(task_definition_arn)
            .send()
            .await
            .map_err(|e| sdk_error("DescribeTaskDefinition", e))?;

        let definition = output
            .task_definition()
            .with_context(|| format!("No task definition returned for {}", task_definition_arn))?;

        Ok(TaskDefinition {
            task_definition_arn: definition.task_definition_arn().map(|s| s.to_string()),
            containers: definition
                .container_definitions()
                .iter()
                .map(|container| ContainerDefinition {
                    name: container.name().map(|s| s.to_string()),
                    port_mappings: container
                        .port_mappings()
                        .iter()
                        .map(|mapping| PortMapping {
                            container_port: to_port(mapping.container_port()),
                            host_port: to_port(mapping.host_port()),
                        })
                        .collect(),
                    docker_labels: container
                        .docker_labels()
                        .map(|labels| {
                            labels
                                .iter()
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect::<BTreeMap<_, _>>()
                        })
                        .unwrap_or_default(),
                })
                .collect(),
        })
    }

    async fn describe_services(
        &self,
        cluster: &str,
        service_arns: &[String],
    ) -> Result<Vec<ServiceDescription>> {
        let output = self
            .client
            .describe_services()
            .cluster(cluster)
            .set_services(Some(service_arns.to_vec()))
            .send()
            .await
            .map_err(|e| sdk_error("DescribeServices", e))?;

        Ok(output
            .services()
            .iter()
            .map(|service| ServiceDescription {
                service_arn: service.service_arn().map(|s| s.to_string()),
                target_group_arns: service
                    .load_balancers()
                    .iter()
                    .filter_map(|lb| lb.target_group_arn().map(|s| s.to_string()))
                    .collect(),
            })
            .collect())
    }
}

// =============================================================================
// Elastic Load Balancing v2
// =============================================================================

struct SdkElbClient {
    client: aws_sdk_elasticloadbalancingv2::Client,
}

#[async_trait]
impl ElbApi for SdkElbClient {
    async fn describe_target_groups(
        &self,
        target_group_arns: &[String],
    ) -> Result<Vec<TargetGroupDescription>> {
        let output = self
            .client
            .describe_target_groups()
            .set_target_group_arns(Some(target_group_arns.to_vec()))
            .send()
            .await
            .map_err(|e| sdk_error("DescribeTargetGroups", e))?;

        Ok(output
            .target_groups()
            .iter()
            .map(|group| TargetGroupDescription {
                target_group_arn: group.target_group_arn().map(|s| s.to_string()),
                load_balancer_arns: group.load_balancer_arns().to_vec(),
            })
            .collect())
    }
}

/// Maximum length of the error detail kept in a log line
const MAX_ERROR_DETAIL_LENGTH: usize = 120;

/// Format an AWS API error for an operator-facing log line
///
/// Known error classes get a hint in front of the first line of the error,
/// which names the failed operation and carries the request id.
pub fn format_aws_error(error: &anyhow::Error) -> String {
    let error_str = format!("{:#}", error);
    let first_line = error_str.lines().next().unwrap_or_default();

    let mut detail = first_line
        .chars()
        .filter(|c| c.is_ascii_graphic() || *c == ' ')
        .take(MAX_ERROR_DETAIL_LENGTH)
        .collect::<String>();
    if detail.len() < error_str.len() {
        detail.push_str("...");
    }

    let hint = if error_str.contains("AccessDenied") || error_str.contains("UnauthorizedOperation") {
        Some("Access denied. Check the IAM permissions of the exporter role.")
    } else if error_str.contains("ExpiredToken") || error_str.contains("InvalidClientTokenId") {
        Some("Credentials are invalid or expired.")
    } else if error_str.contains("Throttling") || error_str.contains("Rate exceeded") {
        Some("Throttled by AWS. Consider a longer refresh interval.")
    } else if error_str.contains("ClusterNotFoundException") {
        Some("Cluster not found.")
    } else if error_str.contains("dispatch failure") || error_str.contains("timed out") {
        Some("Could not reach the AWS endpoint.")
    } else {
        None
    };

    match hint {
        Some(hint) => format!("{} ({})", hint, detail),
        None => detail,
    }
}
