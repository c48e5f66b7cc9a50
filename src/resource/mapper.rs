//! Resource Mapper
//!
//! Decodes ARNs (and SQS queue URLs) into [`Resource`] values using an ordered
//! chain of matchers. The first matcher that recognizes an identifier wins.

use super::{Resource, ResourceType};
use regex::{Captures, Regex};
use std::sync::OnceLock;

/// A single link in the matcher chain
struct Matcher {
    /// Cheap substring test run before the regex
    pre_check: fn(&str) -> bool,
    pattern: Regex,
    build: fn(&str, &Captures) -> Resource,
}

impl Matcher {
    fn new(
        pre_check: fn(&str) -> bool,
        pattern: &str,
        build: fn(&str, &Captures) -> Resource,
    ) -> Self {
        // Anchor both ends so a pattern must consume the whole identifier
        let pattern = Regex::new(&format!("^(?:{})$", pattern))
            .unwrap_or_else(|e| panic!("Invalid resource pattern {}: {}", pattern, e));
        Self {
            pre_check,
            pattern,
            build,
        }
    }

    fn get(&self, identifier: &str) -> Option<Resource> {
        if !(self.pre_check)(identifier) {
            return None;
        }
        let captures = self.pattern.captures(identifier)?;
        Some((self.build)(identifier, &captures))
    }
}

fn group<'a>(captures: &Captures<'a>, index: usize) -> &'a str {
    captures.get(index).map_or("", |m| m.as_str())
}

/// Matcher chain, compiled once per process
static MATCHERS: OnceLock<Vec<Matcher>> = OnceLock::new();

fn matchers() -> &'static [Matcher] {
    MATCHERS.get_or_init(|| {
        vec![
            Matcher::new(
                |arn| arn.contains(":sqs"),
                r"arn:aws:sqs:(.+?):(.+?):(.+)",
                |arn, c| {
                    Resource::new(ResourceType::SqsQueue, arn, group(c, 1), group(c, 2), group(c, 3))
                },
            ),
            Matcher::new(
                |arn| arn.contains(":dynamodb") && arn.contains(":table/"),
                r"arn:aws:dynamodb:(.*?):(.*?):table/(.+?)(/.+)?",
                |arn, c| {
                    Resource::new(ResourceType::DynamoDbTable, arn, group(c, 1), group(c, 2), group(c, 3))
                },
            ),
            Matcher::new(
                |arn| arn.contains(":lambda") && arn.contains(":function:"),
                r"arn:aws:lambda:(.*?):(.*?):function:(.+?)(:.+)?",
                |arn, c| {
                    Resource::new(ResourceType::LambdaFunction, arn, group(c, 1), group(c, 2), group(c, 3))
                },
            ),
            Matcher::new(
                |arn| arn.contains(":s3"),
                r"arn:aws:s3:(.*?):(.*?):(.+?)",
                |arn, c| {
                    Resource::new(ResourceType::S3Bucket, arn, group(c, 1), group(c, 2), group(c, 3))
                },
            ),
            Matcher::new(
                |arn| arn.contains(":sns"),
                r"arn:aws:sns:(.+?):(.+?):(.+)",
                |arn, c| {
                    Resource::new(ResourceType::SnsTopic, arn, group(c, 1), group(c, 2), group(c, 3))
                },
            ),
            Matcher::new(
                |arn| arn.contains(":events") && arn.contains(":event-bus/"),
                r"arn:aws:events:(.+?):(.+?):event-bus/(.+)",
                |arn, c| {
                    Resource::new(ResourceType::EventBus, arn, group(c, 1), group(c, 2), group(c, 3))
                },
            ),
            Matcher::new(
                |arn| arn.contains(":ecs") && arn.contains(":cluster/"),
                r"arn:aws:ecs:(.+?):(.+?):cluster/(.+)",
                |arn, c| {
                    Resource::new(ResourceType::EcsCluster, arn, group(c, 1), group(c, 2), group(c, 3))
                },
            ),
            Matcher::new(
                |arn| arn.contains(":ecs") && arn.contains(":service/"),
                r"arn:aws:ecs:(.+?):(.+?):service/(.+?)/(.+)",
                |arn, c| {
                    let cluster = Resource::new(
                        ResourceType::EcsCluster,
                        "",
                        group(c, 1),
                        group(c, 2),
                        group(c, 3),
                    );
                    Resource::new(ResourceType::EcsService, arn, group(c, 1), group(c, 2), group(c, 4))
                        .child_of(cluster)
                },
            ),
            Matcher::new(
                |arn| arn.contains(":ecs") && arn.contains(":task-definition/"),
                r"arn:aws:ecs:(.+?):(.+?):task-definition/(.+)",
                |arn, c| {
                    let family = group(c, 3);
                    // "name:revision"; a bare name leaves the version unset
                    let (name, version) = match family.split_once(':') {
                        Some((name, version)) => (name, Some(version)),
                        None => (family, None),
                    };
                    Resource::new(ResourceType::EcsTaskDef, arn, group(c, 1), group(c, 2), name)
                        .with_version(version)
                },
            ),
            Matcher::new(
                |arn| arn.contains(":ecs") && arn.contains(":task/"),
                r"arn:aws:ecs:(.+?):(.+?):task/.+?/(.+)",
                |arn, c| {
                    Resource::new(ResourceType::EcsTask, arn, group(c, 1), group(c, 2), group(c, 3))
                },
            ),
            Matcher::new(
                |arn| arn.contains("arn:aws:elasticloadbalancing"),
                r"arn:aws:elasticloadbalancing:(.+?):(.+?):loadbalancer/(.+?)/(.+?)/(.+)",
                |arn, c| {
                    Resource::new(ResourceType::LoadBalancer, arn, group(c, 1), group(c, 2), group(c, 4))
                        .with_sub_type(group(c, 3))
                        .with_id(group(c, 5))
                },
            ),
            Matcher::new(
                |arn| arn.contains("arn:aws:elasticloadbalancing") && arn.contains("targetgroup"),
                r"arn:aws:elasticloadbalancing:(.+?):(.+?):targetgroup/(.+?)/(.+)",
                |arn, c| {
                    Resource::new(ResourceType::TargetGroup, arn, group(c, 1), group(c, 2), group(c, 3))
                        .with_id(group(c, 4))
                },
            ),
            Matcher::new(
                |url| url.contains("https://sqs"),
                r"https://sqs\.(.+?)\.amazonaws\.com/(.+)/(.+)",
                |_, c| {
                    let (region, account, name) = (group(c, 1), group(c, 2), group(c, 3));
                    let arn = format!("arn:aws:sqs:{}:{}:{}", region, account, name);
                    Resource::new(ResourceType::SqsQueue, &arn, region, account, name)
                },
            ),
            Matcher::new(
                |arn| arn.contains("arn:aws:autoscaling:"),
                r"arn:aws:autoscaling:(.+?):(.+?):autoScalingGroup:(.+?):autoScalingGroupName/(.+)",
                |arn, c| {
                    Resource::new(ResourceType::AutoScalingGroup, arn, group(c, 1), group(c, 2), group(c, 4))
                        .with_id(group(c, 3))
                },
            ),
            // Stages must be tried before the bare API pattern, which would
            // otherwise swallow "<api>/stages/<stage>" as the API name
            Matcher::new(
                |arn| arn.contains("arn:aws:apigateway:") && arn.contains("/stages/"),
                r"arn:aws:apigateway:(.+?):(.*?):/restapis/(.+?)/stages/(.+)",
                |arn, c| {
                    let api = Resource::new(
                        ResourceType::ApiGateway,
                        "",
                        group(c, 1),
                        group(c, 2),
                        group(c, 3),
                    );
                    Resource::new(ResourceType::ApiGatewayStage, arn, group(c, 1), group(c, 2), group(c, 4))
                        .child_of(api)
                },
            ),
            Matcher::new(
                |arn| arn.contains("arn:aws:apigateway:") && !arn.contains("/stages/"),
                r"arn:aws:apigateway:(.+?):(.*?):/restapis/(.+)",
                |arn, c| {
                    Resource::new(ResourceType::ApiGateway, arn, group(c, 1), group(c, 2), group(c, 3))
                },
            ),
        ]
    })
}

/// Maps resource identifiers to typed [`Resource`] values
///
/// Stateless: all mappers share one compiled matcher chain.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceMapper;

impl ResourceMapper {
    pub fn new() -> Self {
        Self
    }

    /// Decode an identifier, or `None` when no matcher recognizes it
    pub fn map(&self, identifier: &str) -> Option<Resource> {
        matchers().iter().find_map(|m| m.get(identifier))
    }
}
