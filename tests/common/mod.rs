//! Common test utilities and in-memory AWS fakes for integration tests

#![allow(dead_code)]

pub mod mocks;

use ecs_discovery::config::{ConfigAccountProvider, ScrapeConfig, StaticConfigProvider};
use ecs_discovery::exporter::EcsServiceDiscoveryExporter;
use ecs_discovery::rate_limiter::{RateLimiter, Telemetry};
use mocks::MockClientProvider;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

pub const ACCOUNT: &str = "111111111111";

/// Config with task discovery on, scraping every exposed port
pub fn discovery_config(regions: &[&str], sd_file: &Path) -> ScrapeConfig {
    ScrapeConfig {
        regions: regions.iter().map(|r| r.to_string()).collect::<BTreeSet<_>>(),
        discover_ecs_tasks: true,
        discover_all_ecs_tasks_by_default: true,
        ecs_target_sd_file: sd_file.to_string_lossy().into_owned(),
        ..Default::default()
    }
}

pub fn exporter(
    config: ScrapeConfig,
    provider: MockClientProvider,
    telemetry: Telemetry,
) -> EcsServiceDiscoveryExporter {
    EcsServiceDiscoveryExporter::new(
        Arc::new(StaticConfigProvider::new(config)),
        ConfigAccountProvider::new(ACCOUNT),
        Arc::new(provider),
        RateLimiter::new(telemetry),
    )
}
