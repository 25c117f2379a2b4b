use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::github::{RepoSlug, RetryConfig, GITHUB_GRAPHQL_URL};
use crate::pipeline::RunMode;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.json";

/// GitHub caps `first` on connections at 100
const MAX_PAGE_SIZE: usize = 100;

/// Default worker cap; small keeps us clear of secondary rate limits
const DEFAULT_MAX_WORKERS: usize = 5;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no GitHub token found (set GITHUB_TOKEN or run: gh auth login)")]
    MissingToken,

    #[error("no repositories configured")]
    NoRepos,

    #[error("invalid repository {0:?} (expected owner/name)")]
    InvalidRepo(String),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("page_size must be at most {MAX_PAGE_SIZE}, got {0}")]
    PageSizeTooLarge(usize),
}

/// Contents of the config file
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub repos: Vec<String>,
    /// Mode used when the CLI doesn't pass one
    #[serde(default)]
    pub mode: Option<RunMode>,
    #[serde(flatten)]
    pub settings: Settings,
}

/// Tunables, all optional in the file
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: PathBuf,
    pub report_path: PathBuf,
    pub graphql_url: String,
    /// Defaults to min(repos, 5)
    pub workers: Option<usize>,
    pub page_size: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_rate_limit_wait_secs: u64,
    pub request_timeout_secs: u64,
    /// Abort repositories still running after this long
    pub run_timeout_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        let retry = RetryConfig::default();
        Self {
            db_path: PathBuf::from("data/github_stars.db"),
            report_path: PathBuf::from("reports/github_stargazer_dashboard.html"),
            graphql_url: GITHUB_GRAPHQL_URL.to_string(),
            workers: None,
            page_size: MAX_PAGE_SIZE,
            max_attempts: retry.max_attempts,
            base_delay_ms: retry.base_delay.as_millis() as u64,
            max_delay_ms: retry.max_delay.as_millis() as u64,
            max_rate_limit_wait_secs: retry.max_rate_limit_wait.as_secs(),
            request_timeout_secs: 30,
            run_timeout_secs: None,
        }
    }
}

impl ConfigFile {
    /// Read and parse the config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Config with no repositories and default settings, for stages that only
    /// read the database
    pub fn empty() -> Self {
        Self {
            repos: Vec::new(),
            mode: None,
            settings: Settings::default(),
        }
    }
}

/// Command-line values that take precedence over the file
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub mode: Option<RunMode>,
    pub workers: Option<usize>,
    pub db_path: Option<PathBuf>,
}

/// Validated, immutable configuration for an extract/load run
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub repos: Vec<RepoSlug>,
    pub token: String,
    pub mode: RunMode,
    pub db_path: PathBuf,
    pub graphql_url: String,
    pub workers: usize,
    pub page_size: usize,
    pub retry: RetryConfig,
    pub request_timeout: Duration,
    pub run_timeout: Option<Duration>,
}

impl PipelineConfig {
    /// Validate everything up front so a bad config fails before any request
    pub fn build(
        file: &ConfigFile,
        token: Option<String>,
        overrides: &Overrides,
    ) -> Result<Self, ConfigError> {
        let token = token
            .filter(|t| !t.trim().is_empty())
            .ok_or(ConfigError::MissingToken)?;

        let mut seen = HashSet::new();
        let mut repos = Vec::new();
        for raw in &file.repos {
            let slug = RepoSlug::parse(raw).ok_or_else(|| ConfigError::InvalidRepo(raw.clone()))?;
            if seen.insert(slug.full_name()) {
                repos.push(slug);
            }
        }
        if repos.is_empty() {
            return Err(ConfigError::NoRepos);
        }

        let settings = &file.settings;
        let workers = overrides
            .workers
            .or(settings.workers)
            .unwrap_or_else(|| repos.len().min(DEFAULT_MAX_WORKERS));
        if workers == 0 {
            return Err(ConfigError::Zero("workers"));
        }
        if settings.page_size == 0 {
            return Err(ConfigError::Zero("page_size"));
        }
        if settings.page_size > MAX_PAGE_SIZE {
            return Err(ConfigError::PageSizeTooLarge(settings.page_size));
        }
        if settings.max_attempts == 0 {
            return Err(ConfigError::Zero("max_attempts"));
        }
        if settings.request_timeout_secs == 0 {
            return Err(ConfigError::Zero("request_timeout_secs"));
        }

        Ok(Self {
            repos,
            token,
            mode: overrides.mode.or(file.mode).unwrap_or(RunMode::Incremental),
            db_path: overrides.db_path.clone().unwrap_or_else(|| settings.db_path.clone()),
            graphql_url: settings.graphql_url.clone(),
            workers,
            page_size: settings.page_size,
            retry: RetryConfig {
                max_attempts: settings.max_attempts,
                base_delay: Duration::from_millis(settings.base_delay_ms),
                max_delay: Duration::from_millis(settings.max_delay_ms),
                max_rate_limit_wait: Duration::from_secs(settings.max_rate_limit_wait_secs),
            },
            request_timeout: Duration::from_secs(settings.request_timeout_secs),
            run_timeout: settings.run_timeout_secs.map(Duration::from_secs),
        })
    }
}

/// Environment variables checked for a token, in order
const TOKEN_VARS: [&str; 2] = ["GITHUB_TOKEN", "GH_TOKEN"];

/// GitHub token from the environment, falling back to the `gh` CLI login
pub fn github_token() -> Option<String> {
    env_token(|var| std::env::var(var).ok()).or_else(gh_cli_token)
}

/// First non-blank value among `TOKEN_VARS`
fn env_token(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    TOKEN_VARS
        .iter()
        .filter_map(|var| lookup(var))
        .map(|token| token.trim().to_string())
        .find(|token| !token.is_empty())
}

fn gh_cli_token() -> Option<String> {
    let output = std::process::Command::new("gh")
        .args(["auth", "token"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!token.is_empty()).then_some(token)
}
