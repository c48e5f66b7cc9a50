//! Load balancer → ECS service routing inference

use super::ECS_NAMESPACE;
use crate::aws::RegionClients;
use crate::rate_limiter::{dimension_labels, RateLimiter};
use crate::resource::{Resource, ResourceMapper, ResourceType, RoutingEdge};
use anyhow::Result;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Maximum services per describe-services call
const DESCRIBE_SERVICES_CHUNK: usize = 10;
/// Maximum target groups per describe-target-groups call
const DESCRIBE_TARGET_GROUPS_CHUNK: usize = 20;

/// Derives `LoadBalancer -> Service` edges from service target groups
#[derive(Clone)]
pub struct LbRoutingBuilder {
    resource_mapper: ResourceMapper,
    rate_limiter: RateLimiter,
}

impl LbRoutingBuilder {
    pub fn new(rate_limiter: RateLimiter) -> Self {
        Self {
            resource_mapper: ResourceMapper::new(),
            rate_limiter,
        }
    }

    /// Routing edges of a cluster's services; empty if a lookup fails
    pub async fn get_routings(
        &self,
        clients: &RegionClients,
        cluster: &Resource,
        services: &[Resource],
    ) -> HashSet<RoutingEdge> {
        if services.is_empty() {
            return HashSet::new();
        }
        match self.try_get_routings(clients, cluster, services).await {
            Ok(edges) => edges,
            Err(e) => {
                tracing::error!(
                    "Failed to build routing for cluster {} in {}/{}: {:#}",
                    cluster.name,
                    cluster.account,
                    cluster.region,
                    e
                );
                HashSet::new()
            }
        }
    }

    async fn try_get_routings(
        &self,
        clients: &RegionClients,
        cluster: &Resource,
        services: &[Resource],
    ) -> Result<HashSet<RoutingEdge>> {
        let by_arn: HashMap<&str, &Resource> =
            services.iter().map(|s| (s.identifier.as_str(), s)).collect();

        let labels = dimension_labels(
            &cluster.account,
            &cluster.region,
            "describeServices",
            ECS_NAMESPACE,
        );
        let mut services_by_target_group: BTreeMap<String, Vec<&Resource>> = BTreeMap::new();
        for chunk in services.chunks(DESCRIBE_SERVICES_CHUNK) {
            let arns: Vec<String> = chunk.iter().map(|s| s.identifier.clone()).collect();
            let descriptions = self
                .rate_limiter
                .run("EcsClient/describeServices", &labels, || {
                    clients.ecs.describe_services(&cluster.name, &arns)
                })
                .await?;

            for description in descriptions {
                let Some(service) = description
                    .service_arn
                    .as_deref()
                    .and_then(|arn| by_arn.get(arn))
                else {
                    continue;
                };
                for target_group in description.target_group_arns {
                    services_by_target_group
                        .entry(target_group)
                        .or_default()
                        .push(*service);
                }
            }
        }

        let mut edges = HashSet::new();
        if services_by_target_group.is_empty() {
            return Ok(edges);
        }

        let labels = dimension_labels(
            &cluster.account,
            &cluster.region,
            "describeTargetGroups",
            ResourceType::TargetGroup.namespace(),
        );
        let target_group_arns: Vec<String> = services_by_target_group.keys().cloned().collect();
        for chunk in target_group_arns.chunks(DESCRIBE_TARGET_GROUPS_CHUNK) {
            let groups = self
                .rate_limiter
                .run("ElasticLoadBalancingV2/describeTargetGroups", &labels, || {
                    clients.elb.describe_target_groups(chunk)
                })
                .await?;

            for group in groups {
                let Some(targets) = group
                    .target_group_arn
                    .as_deref()
                    .and_then(|arn| services_by_target_group.get(arn))
                else {
                    continue;
                };
                let load_balancers = group
                    .load_balancer_arns
                    .iter()
                    .filter_map(|arn| self.resource_mapper.map(arn))
                    .filter(|lb| lb.resource_type == ResourceType::LoadBalancer);
                for lb in load_balancers {
                    for service in targets {
                        edges.insert(RoutingEdge::routes_to(lb.clone(), (*service).clone()));
                    }
                }
            }
        }

        tracing::debug!("Found {} routing edges in cluster {}", edges.len(), cluster.name);
        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::{
        EcsApi, EcsTask, ElbApi, ListTasksPage, ServiceDescription, TargetGroupDescription,
        TaskDefinition,
    };
    use crate::rate_limiter::Telemetry;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    const LB_ARN: &str =
        "arn:aws:elasticloadbalancing:us-west-2:111111111111:loadbalancer/app/web/50dc6c495c0c9188";
    const TG_ARN: &str =
        "arn:aws:elasticloadbalancing:us-west-2:111111111111:targetgroup/checkout/73e2d6bc24d8a067";

    #[derive(Default)]
    struct FakeEcs {
        describe_chunks: Arc<Mutex<Vec<usize>>>,
        fail: bool,
    }

    #[async_trait]
    impl EcsApi for FakeEcs {
        async fn list_clusters(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn list_services(&self, _: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
        async fn list_tasks(&self, _: &str, _: &str, _: Option<&str>) -> Result<ListTasksPage> {
            Ok(ListTasksPage::default())
        }
        async fn describe_tasks(&self, _: &str, _: &[String]) -> Result<Vec<EcsTask>> {
            Ok(Vec::new())
        }
        async fn describe_task_definition(&self, _: &str) -> Result<TaskDefinition> {
            Ok(TaskDefinition::default())
        }
        async fn describe_services(
            &self,
            _cluster: &str,
            service_arns: &[String],
        ) -> Result<Vec<ServiceDescription>> {
            if self.fail {
                anyhow::bail!("AccessDeniedException");
            }
            self.describe_chunks.lock().unwrap().push(service_arns.len());
            Ok(service_arns
                .iter()
                .map(|arn| ServiceDescription {
                    service_arn: Some(arn.clone()),
                    target_group_arns: if arn.ends_with("/checkout") {
                        vec![TG_ARN.to_string()]
                    } else {
                        Vec::new()
                    },
                })
                .collect())
        }
    }

    struct FakeElb;

    #[async_trait]
    impl ElbApi for FakeElb {
        async fn describe_target_groups(
            &self,
            target_group_arns: &[String],
        ) -> Result<Vec<TargetGroupDescription>> {
            Ok(target_group_arns
                .iter()
                .map(|arn| TargetGroupDescription {
                    target_group_arn: Some(arn.clone()),
                    load_balancer_arns: vec![LB_ARN.to_string(), "garbage".to_string()],
                })
                .collect())
        }
    }

    fn cluster() -> Resource {
        Resource::new(
            ResourceType::EcsCluster,
            "arn:aws:ecs:us-west-2:111111111111:cluster/prod",
            "us-west-2",
            "111111111111",
            "prod",
        )
    }

    fn service(name: &str) -> Resource {
        Resource::new(
            ResourceType::EcsService,
            &format!("arn:aws:ecs:us-west-2:111111111111:service/prod/{}", name),
            "us-west-2",
            "111111111111",
            name,
        )
    }

    fn builder() -> LbRoutingBuilder {
        LbRoutingBuilder::new(RateLimiter::new(Telemetry::unregistered().unwrap()))
    }

    #[tokio::test]
    async fn test_routes_load_balancer_to_service() {
        let clients = RegionClients {
            ecs: Box::new(FakeEcs::default()),
            elb: Box::new(FakeElb),
        };
        let services = vec![service("checkout"), service("worker")];

        let edges = builder().get_routings(&clients, &cluster(), &services).await;

        assert_eq!(edges.len(), 1);
        let edge = edges.iter().next().unwrap();
        assert_eq!(edge.from.resource_type, ResourceType::LoadBalancer);
        assert_eq!(edge.to.name, "checkout");
    }

    #[tokio::test]
    async fn test_describe_services_chunked_by_ten() {
        let chunks = Arc::new(Mutex::new(Vec::new()));
        let clients = RegionClients {
            ecs: Box::new(FakeEcs {
                describe_chunks: chunks.clone(),
                fail: false,
            }),
            elb: Box::new(FakeElb),
        };
        let services: Vec<Resource> = (0..23).map(|i| service(&format!("svc-{}", i))).collect();

        builder().get_routings(&clients, &cluster(), &services).await;

        assert_eq!(*chunks.lock().unwrap(), vec![10, 10, 3]);
    }

    #[tokio::test]
    async fn test_failure_yields_no_edges() {
        let clients = RegionClients {
            ecs: Box::new(FakeEcs {
                fail: true,
                ..Default::default()
            }),
            elb: Box::new(FakeElb),
        };

        let edges = builder()
            .get_routings(&clients, &cluster(), &[service("checkout")])
            .await;
        assert!(edges.is_empty());
    }
}
