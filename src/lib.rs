//! ECS service discovery for Prometheus
//!
//! Discovers ECS services and their running tasks across AWS accounts and
//! regions, and publishes them as a `file_sd_configs` target file plus an
//! inventory metric.

pub mod aws;
pub mod config;
pub mod exporter;
pub mod rate_limiter;
pub mod resource;

/// Version injected at compile time via ECS_DISCOVERY_VERSION env var (set by
/// CI/CD), or "dev" for local builds.
pub const VERSION: &str = match option_env!("ECS_DISCOVERY_VERSION") {
    Some(v) => v,
    None => "dev",
};
