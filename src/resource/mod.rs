//! Resource identity layer
//!
//! This module turns opaque AWS resource identifiers (ARNs and queue URLs)
//! into a typed entity model that the discovery exporters work with.
//!
//! # Module Structure
//!
//! - [`mapper`] - Ordered chain of pattern matchers: identifier -> [`Resource`]
//!
//! # Example
//!
//! ```ignore
//! use crate::resource::{ResourceMapper, ResourceType};
//!
//! let mapper = ResourceMapper::new();
//! let service = mapper
//!     .map("arn:aws:ecs:us-west-2:111111111111:service/prod/checkout")
//!     .unwrap();
//! assert_eq!(service.resource_type, ResourceType::EcsService);
//! assert_eq!(service.parent.unwrap().name, "prod");
//! ```

mod mapper;

pub use mapper::ResourceMapper;

use std::fmt;
use std::hash::{Hash, Hasher};

/// Resource families understood by the mapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    EcsCluster,
    EcsService,
    EcsTask,
    EcsTaskDef,
    LoadBalancer,
    TargetGroup,
    SqsQueue,
    DynamoDbTable,
    LambdaFunction,
    S3Bucket,
    SnsTopic,
    EventBus,
    AutoScalingGroup,
    ApiGateway,
    ApiGatewayStage,
}

impl ResourceType {
    /// CloudWatch namespace the resource publishes its metrics under
    pub fn namespace(&self) -> &'static str {
        match self {
            Self::EcsCluster | Self::EcsService | Self::EcsTask | Self::EcsTaskDef => "AWS/ECS",
            Self::LoadBalancer | Self::TargetGroup => "AWS/ApplicationELB",
            Self::SqsQueue => "AWS/SQS",
            Self::DynamoDbTable => "AWS/DynamoDB",
            Self::LambdaFunction => "AWS/Lambda",
            Self::S3Bucket => "AWS/S3",
            Self::SnsTopic => "AWS/SNS",
            Self::EventBus => "AWS/Events",
            Self::AutoScalingGroup => "AWS/AutoScaling",
            Self::ApiGateway | Self::ApiGatewayStage => "AWS/ApiGateway",
        }
    }

    /// AWS Config resource type name
    pub fn aws_type_name(&self) -> &'static str {
        match self {
            Self::EcsCluster => "AWS::ECS::Cluster",
            Self::EcsService => "AWS::ECS::Service",
            Self::EcsTask => "AWS::ECS::Task",
            Self::EcsTaskDef => "AWS::ECS::TaskDefinition",
            Self::LoadBalancer => "AWS::ElasticLoadBalancingV2::LoadBalancer",
            Self::TargetGroup => "AWS::ElasticLoadBalancingV2::TargetGroup",
            Self::SqsQueue => "AWS::SQS::Queue",
            Self::DynamoDbTable => "AWS::DynamoDB::Table",
            Self::LambdaFunction => "AWS::Lambda::Function",
            Self::S3Bucket => "AWS::S3::Bucket",
            Self::SnsTopic => "AWS::SNS::Topic",
            Self::EventBus => "AWS::Events::EventBus",
            Self::AutoScalingGroup => "AWS::AutoScaling::AutoScalingGroup",
            Self::ApiGateway => "AWS::ApiGateway::RestApi",
            Self::ApiGatewayStage => "AWS::ApiGateway::Stage",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.aws_type_name())
    }
}

/// Typed identity of a cloud object
///
/// Equality and hashing only consider the type and the identifier. A parent
/// built from a child's identifier (e.g. the cluster of a service) carries an
/// empty identifier.
#[derive(Debug, Clone)]
pub struct Resource {
    pub resource_type: ResourceType,
    pub identifier: String,
    pub region: String,
    pub account: String,
    pub name: String,
    pub sub_type: Option<String>,
    pub id: Option<String>,
    /// Task definition revision
    pub version: Option<String>,
    /// Owning resource, used for label propagation only
    pub parent: Option<Box<Resource>>,
}

impl Resource {
    pub fn new(
        resource_type: ResourceType,
        identifier: &str,
        region: &str,
        account: &str,
        name: &str,
    ) -> Self {
        Self {
            resource_type,
            identifier: identifier.to_string(),
            region: region.to_string(),
            account: account.to_string(),
            name: name.to_string(),
            sub_type: None,
            id: None,
            version: None,
            parent: None,
        }
    }

    pub fn with_sub_type(mut self, sub_type: &str) -> Self {
        self.sub_type = Some(sub_type.to_string());
        self
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_version(mut self, version: Option<&str>) -> Self {
        self.version = version.map(|v| v.to_string());
        self
    }

    pub fn child_of(mut self, parent: Resource) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.resource_type == other.resource_type && self.identifier == other.identifier
    }
}

impl Eq for Resource {}

impl Hash for Resource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.resource_type.hash(state);
        self.identifier.hash(state);
    }
}

/// Kind of relationship between two resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationType {
    /// Traffic sent to `from` is forwarded to `to`
    RoutesTo,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoutesTo => "ROUTES_TO",
        }
    }
}

/// Directed relationship between two resources
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingEdge {
    pub from: Resource,
    pub to: Resource,
    pub relation: RelationType,
}

impl RoutingEdge {
    pub fn routes_to(from: Resource, to: Resource) -> Self {
        Self {
            from,
            to,
            relation: RelationType::RoutesTo,
        }
    }
}
