//! Configuration Management
//!
//! Loads the operator scrape configuration, either from the remote config API
//! or from a local YAML file, and hands out immutable snapshots of it.

use crate::rate_limiter::{DimensionLabels, RateLimiter, Telemetry};
use anyhow::{bail, Context, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "cloudwatch_scrape_config.yml";
pub const DEFAULT_SD_FILE: &str = "ecs-task-scrape-targets.yml";
pub const DEFAULT_METRIC_PATH: &str = "/metrics";

const ENV_ASSERT_HOST: &str = "ASSERT_HOST";
const ENV_ASSERT_USER: &str = "ASSERT_USER";
const ENV_ASSERT_SECRET_KEY: &str = "ASSERT_SECRET_KEY";
const ENV_REGIONS: &str = "REGIONS";
const ENV_ENABLE_ECS_SD: &str = "ENABLE_ECS_SD";
const ENV_AWS_ACCOUNT_ID: &str = "AWS_ACCOUNT_ID";

const REMOTE_CONFIG_PATH: &str = "/api-server/v1/config/aws-exporter";

/// Maximum length of response body to log
const MAX_LOG_BODY_LENGTH: usize = 200;

fn default_sd_file() -> String {
    DEFAULT_SD_FILE.to_string()
}

fn default_metric_path() -> String {
    DEFAULT_METRIC_PATH.to_string()
}

/// Operator scrape settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapeConfig {
    #[serde(default)]
    pub regions: BTreeSet<String>,
    /// Write the ECS scrape target file
    #[serde(default, alias = "discoverECSTasks")]
    pub discover_ecs_tasks: bool,
    /// Scrape every exposed port of containers that have no explicit override
    #[serde(default, alias = "discoverAllECSTasksByDefault")]
    pub discover_all_ecs_tasks_by_default: bool,
    #[serde(default = "default_sd_file", alias = "ecsTargetSDFile")]
    pub ecs_target_sd_file: String,
    #[serde(default, alias = "ecsTaskScrapeConfigs")]
    pub ecs_task_scrape_configs: Vec<EcsTaskDefScrapeConfig>,
    #[serde(default)]
    pub accounts: Vec<AwsAccount>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            regions: BTreeSet::new(),
            discover_ecs_tasks: false,
            discover_all_ecs_tasks_by_default: false,
            ecs_target_sd_file: default_sd_file(),
            ecs_task_scrape_configs: Vec::new(),
            accounts: Vec::new(),
        }
    }
}

/// Metric path override for a container, optionally narrowed to one port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EcsTaskDefScrapeConfig {
    #[serde(alias = "containerDefinitionName")]
    pub container_definition_name: String,
    /// `None` applies to every port of the container
    #[serde(
        default,
        alias = "containerPort",
        deserialize_with = "deserialize_container_port"
    )]
    pub container_port: Option<u16>,
    #[serde(default = "default_metric_path", alias = "metricPath")]
    pub metric_path: String,
}

/// A negative port is the "any port" sentinel and reads as `None`
fn deserialize_container_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Option::<i64>::deserialize(deserializer)? {
        Some(port) if port < 0 => Ok(None),
        Some(port) => u16::try_from(port).map(Some).map_err(|_| {
            serde::de::Error::custom(format!("container port {} out of range", port))
        }),
        None => Ok(None),
    }
}

/// An AWS account to discover
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AwsAccount {
    #[serde(default, alias = "accountId")]
    pub account_id: String,
    /// Role to assume before calling AWS
    #[serde(default, alias = "assumeRole")]
    pub role_arn: Option<String>,
    #[serde(default, alias = "externalId")]
    pub external_id: Option<String>,
    /// Empty means the top-level regions
    #[serde(default)]
    pub regions: BTreeSet<String>,
}

impl ScrapeConfig {
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for config in &self.ecs_task_scrape_configs {
            if !config.metric_path.starts_with('/') {
                bail!(
                    "Invalid metric path {:?} for container {}",
                    config.metric_path,
                    config.container_definition_name
                );
            }
            if !seen.insert((config.container_definition_name.as_str(), config.container_port)) {
                bail!(
                    "Duplicate scrape config for container {} port {:?}",
                    config.container_definition_name,
                    config.container_port
                );
            }
        }
        Ok(())
    }

    /// Scrape overrides keyed by container name, then port (`None` = any port)
    pub fn ecs_config_by_name_and_port(
        &self,
    ) -> BTreeMap<&str, BTreeMap<Option<u16>, &EcsTaskDefScrapeConfig>> {
        let mut by_name: BTreeMap<&str, BTreeMap<Option<u16>, &EcsTaskDefScrapeConfig>> =
            BTreeMap::new();
        for config in &self.ecs_task_scrape_configs {
            by_name
                .entry(config.container_definition_name.as_str())
                .or_default()
                .insert(config.container_port, config);
        }
        by_name
    }

    fn apply_env_overrides(&mut self, env: &HashMap<String, String>) {
        if let Some(regions) = env.get(ENV_REGIONS) {
            self.regions = regions
                .split(',')
                .map(|r| r.trim())
                .filter(|r| !r.is_empty())
                .map(|r| r.to_string())
                .collect();
        }
        if let Some(flag) = env.get(ENV_ENABLE_ECS_SD) {
            self.discover_ecs_tasks = is_enabled(flag);
        }
    }
}

fn is_enabled(flag: &str) -> bool {
    ["y", "yes", "true"]
        .iter()
        .any(|value| value.eq_ignore_ascii_case(flag.trim()))
}

fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let cut = body
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|i| *i <= MAX_LOG_BODY_LENGTH)
            .last()
            .unwrap_or(0);
        format!("{}... [truncated, {} bytes total]", &body[..cut], body.len())
    } else {
        body.to_string()
    };
    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

// =============================================================================
// Providers
// =============================================================================

/// Source of configuration snapshots
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Current snapshot; stays unchanged for as long as the caller holds it
    fn scrape_config(&self) -> Arc<ScrapeConfig>;

    /// Reload from the backing source
    async fn update(&self) {}
}

/// Fixed configuration
#[derive(Debug, Clone, Default)]
pub struct StaticConfigProvider {
    config: Arc<ScrapeConfig>,
}

impl StaticConfigProvider {
    pub fn new(config: ScrapeConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    fn scrape_config(&self) -> Arc<ScrapeConfig> {
        self.config.clone()
    }
}

/// Loads from the remote config API when its credentials are present, else
/// from a YAML file
pub struct FileConfigProvider {
    path: PathBuf,
    env: HashMap<String, String>,
    client: Client,
    rate_limiter: RateLimiter,
    cache: ArcSwap<ScrapeConfig>,
}

impl FileConfigProvider {
    /// Create a provider reading the process environment, and load once
    pub async fn new(path: impl AsRef<Path>, telemetry: Telemetry) -> Result<Self> {
        Self::with_env(path, std::env::vars().collect(), telemetry).await
    }

    /// Create a provider with an explicit environment, and load once
    pub async fn with_env(
        path: impl AsRef<Path>,
        env: HashMap<String, String>,
        telemetry: Telemetry,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("ecs-discovery/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let provider = Self {
            path: path.as_ref().to_path_buf(),
            env,
            client,
            rate_limiter: RateLimiter::new(telemetry),
            cache: ArcSwap::from_pointee(ScrapeConfig::default()),
        };
        provider.reload().await;
        Ok(provider)
    }

    async fn reload(&self) {
        let loaded = self
            .rate_limiter
            .run("loadConfig", &DimensionLabels::new(), || self.load())
            .await;
        let config = match loaded {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to load scrape configuration: {:#}", e);
                ScrapeConfig::default()
            }
        };
        self.cache.store(Arc::new(config));
    }

    async fn load(&self) -> Result<ScrapeConfig> {
        let remote = (
            self.env.get(ENV_ASSERT_HOST),
            self.env.get(ENV_ASSERT_USER),
            self.env.get(ENV_ASSERT_SECRET_KEY),
        );
        let mut config = match remote {
            (Some(host), Some(user), Some(key)) => self.load_remote(host, user, key).await?,
            _ => self.load_file()?,
        };
        config.validate()?;
        config.apply_env_overrides(&self.env);
        Ok(config)
    }

    async fn load_remote(&self, host: &str, user: &str, key: &str) -> Result<ScrapeConfig> {
        let url = format!("{}{}", host.trim_end_matches('/'), REMOTE_CONFIG_PATH);
        let url = url::Url::parse(&url).with_context(|| format!("Invalid config host {}", host))?;
        tracing::info!("Will load configuration from server [{}] and user [{}]", host, user);

        let response = self
            .client
            .get(url)
            .basic_auth(user, Some(key))
            .send()
            .await
            .context("Failed to send config request")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read config response body")?;

        if !status.is_success() {
            tracing::warn!(
                "Config API returned {} - {}; using empty configuration",
                status,
                sanitize_for_log(&body)
            );
            return Ok(ScrapeConfig::default());
        }

        serde_json::from_str(&body).context("Failed to parse config response JSON")
    }

    fn load_file(&self) -> Result<ScrapeConfig> {
        tracing::info!("Loading configuration from {:?}", self.path);
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {:?}", self.path))?;
        serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {:?}", self.path))
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    fn scrape_config(&self) -> Arc<ScrapeConfig> {
        self.cache.load_full()
    }

    async fn update(&self) {
        self.reload().await;
    }
}

/// Derives the accounts to discover from a configuration snapshot
#[derive(Debug, Clone, Default)]
pub struct ConfigAccountProvider {
    default_account_id: String,
}

impl ConfigAccountProvider {
    pub fn new(default_account_id: &str) -> Self {
        Self {
            default_account_id: default_account_id.to_string(),
        }
    }

    /// Use `AWS_ACCOUNT_ID` as the implicit account id
    pub fn from_env() -> Self {
        Self::new(&std::env::var(ENV_AWS_ACCOUNT_ID).unwrap_or_default())
    }

    pub fn accounts(&self, config: &ScrapeConfig) -> Vec<AwsAccount> {
        if config.accounts.is_empty() {
            return vec![AwsAccount {
                account_id: self.default_account_id.clone(),
                role_arn: None,
                external_id: None,
                regions: config.regions.clone(),
            }];
        }

        config
            .accounts
            .iter()
            .map(|account| {
                let mut account = account.clone();
                if account.regions.is_empty() {
                    account.regions = config.regions.clone();
                }
                account
            })
            .collect()
    }
}
