use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::StatusCode;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::formatting::truncate_str;

pub const GITHUB_GRAPHQL_URL: &str = "https://api.github.com/graphql";

/// Added on top of the reported reset time so we don't wake up a second early
const RATE_LIMIT_BUFFER: Duration = Duration::from_secs(5);

/// Used when GitHub signals a rate limit without saying when it resets
const FALLBACK_RATE_LIMIT_WAIT: Duration = Duration::from_secs(60);

/// Warn when the GraphQL point budget drops below this
const LOW_QUOTA_WARNING: u64 = 500;

// === Error Classification ===

/// Failure of a single page fetch.
///
/// Transient variants are retried by [`retry_with_backoff`]; everything else
/// surfaces immediately as a per-repository failure.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("GitHub API error {0}")]
    Server(StatusCode),

    #[error("rate limited, retry in {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("repository {0} not found")]
    NotFound(String),

    #[error("GitHub API rejected request ({status}): {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("GraphQL errors: {0}")]
    GraphQl(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: Box<FetchError> },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Request(_)
                | FetchError::Server(_)
                | FetchError::RateLimited { .. }
                | FetchError::Decode(_)
        )
    }
}

// === Retry ===

/// Retry configuration for page fetches
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single rate-limit sleep
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_rate_limit_wait: Duration::from_secs(15 * 60),
        }
    }
}

impl RetryConfig {
    /// Delay before the retry that follows failed attempt `attempt` (1-based).
    /// Doubles each time, capped at `max_delay`, with jitter in `[delay/2, delay]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let half = delay / 2;
        if half.is_zero() {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter)
    }

    fn wait_for(&self, error: &FetchError, attempt: u32) -> Duration {
        match error {
            FetchError::RateLimited { retry_after } => (*retry_after).min(self.max_rate_limit_wait),
            _ => self.backoff(attempt),
        }
    }
}

/// Execute an operation, retrying transient failures with exponential backoff.
/// Rate limits sleep until the reported reset instead of the normal backoff.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    label: &str,
    mut operation: F,
) -> std::result::Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, FetchError>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let error = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if !error.is_retryable() {
            return Err(error);
        }

        if attempt >= config.max_attempts {
            return Err(FetchError::Exhausted {
                attempts: attempt,
                last: Box::new(error),
            });
        }

        let delay = config.wait_for(&error, attempt);
        warn!(
            target: "stargaze::github",
            %label,
            attempt,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            %error,
            "retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

// === Domain Types ===

/// Traversal order over a repository's stargazers, by star time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn as_graphql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// `owner/name` identifier of a tracked repository
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoSlug {
    owner: String,
    name: String,
}

impl RepoSlug {
    /// Parse `owner/name`. Both halves must be non-empty and the name may not contain `/`.
    pub fn parse(slug: &str) -> Option<Self> {
        let (owner, name) = slug.trim().split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// One user's star on one repository
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StargazerEvent {
    pub repo_full_name: String,
    pub user_id: i64,
    pub login: String,
    pub starred_at: DateTime<Utc>,
}

/// One page of stargazers as returned by the API
#[derive(Debug, Clone)]
pub struct StargazerPage {
    pub events: Vec<StargazerEvent>,
    pub end_cursor: Option<String>,
    pub has_next_page: bool,
}

// === GraphQL Types ===

#[derive(Debug, Deserialize)]
struct GraphQlResponse {
    data: Option<StargazerData>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StargazerData {
    rate_limit: Option<GraphQlRateLimit>,
    repository: Option<RepositoryNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphQlRateLimit {
    cost: u64,
    remaining: u64,
    reset_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RepositoryNode {
    stargazers: StargazerConnection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StargazerConnection {
    page_info: PageInfo,
    edges: Vec<StargazerEdge>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    end_cursor: Option<String>,
    has_next_page: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StargazerEdge {
    starred_at: DateTime<Utc>,
    node: StargazerNode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StargazerNode {
    login: String,
    /// Null for deleted ("ghost") accounts
    database_id: Option<i64>,
}

/// Build the stargazer page query. Direction is inlined because GraphQL enums
/// can't be passed through `orderBy` variables without a custom input type.
fn stargazer_query(direction: Direction) -> String {
    format!(
        r#"query ($owner: String!, $name: String!, $first: Int!, $after: String) {{
  rateLimit {{ cost remaining resetAt }}
  repository(owner: $owner, name: $name) {{
    stargazers(first: $first, after: $after, orderBy: {{field: STARRED_AT, direction: {}}}) {{
      pageInfo {{ endCursor hasNextPage }}
      edges {{
        starredAt
        node {{ login databaseId }}
      }}
    }}
  }}
}}"#,
        direction.as_graphql()
    )
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn wait_until(reset: DateTime<Utc>) -> Duration {
    let secs = (reset - Utc::now()).num_seconds().max(0) as u64;
    Duration::from_secs(secs) + RATE_LIMIT_BUFFER
}

/// Decide whether a non-success response is a rate limit, and how long to wait.
///
/// GitHub signals primary limits with `x-ratelimit-remaining: 0` plus an epoch
/// `x-ratelimit-reset`, and secondary limits with `retry-after`.
fn rate_limit_wait(status: StatusCode, headers: &HeaderMap) -> Option<Duration> {
    if status != StatusCode::FORBIDDEN && status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }

    if let Some(secs) = header_u64(headers, "retry-after") {
        return Some(Duration::from_secs(secs));
    }

    let exhausted = header_u64(headers, "x-ratelimit-remaining") == Some(0);
    if !exhausted && status != StatusCode::TOO_MANY_REQUESTS {
        return None;
    }

    let wait = header_u64(headers, "x-ratelimit-reset")
        .and_then(|epoch| DateTime::from_timestamp(epoch as i64, 0))
        .map(wait_until)
        .unwrap_or(FALLBACK_RATE_LIMIT_WAIT);
    Some(wait)
}

// === Client ===

/// GitHub GraphQL client for stargazer pages
#[derive(Clone)]
pub struct GitHubClient {
    client: reqwest::Client,
    endpoint: String,
    token: String,
    retry: RetryConfig,
}

impl GitHubClient {
    pub fn new(
        token: String,
        endpoint: impl Into<String>,
        retry: RetryConfig,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("stargaze/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            token,
            retry,
        })
    }

    /// Fetch one page of stargazers, retrying transient failures.
    pub async fn fetch_stargazer_page(
        &self,
        repo: &RepoSlug,
        direction: Direction,
        after: Option<&str>,
        page_size: usize,
    ) -> std::result::Result<StargazerPage, FetchError> {
        let label = repo.full_name();
        retry_with_backoff(&self.retry, &label, || {
            self.fetch_page_once(repo, direction, after, page_size)
        })
        .await
    }

    async fn fetch_page_once(
        &self,
        repo: &RepoSlug,
        direction: Direction,
        after: Option<&str>,
        page_size: usize,
    ) -> std::result::Result<StargazerPage, FetchError> {
        let body = serde_json::json!({
            "query": stargazer_query(direction),
            "variables": {
                "owner": repo.owner(),
                "name": repo.name(),
                "first": page_size,
                "after": after,
            }
        });

        let start = std::time::Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/vnd.github+json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if let Some(retry_after) = rate_limit_wait(status, response.headers()) {
            return Err(FetchError::RateLimited { retry_after });
        }

        match status {
            s if s.is_success() => {}
            StatusCode::REQUEST_TIMEOUT => return Err(FetchError::Server(status)),
            s if s.is_server_error() => return Err(FetchError::Server(s)),
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound(repo.full_name())),
            s => {
                let body = response.text().await.unwrap_or_default();
                return Err(FetchError::Rejected {
                    status: s,
                    body: truncate_str(&body, 200),
                });
            }
        }

        let payload: GraphQlResponse = response
            .json()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        let GraphQlResponse { data, errors } = payload;
        let (rate_limit, repository) = match data {
            Some(data) => (data.rate_limit, data.repository),
            None => (None, None),
        };

        if !errors.is_empty() {
            return Err(classify_graphql_errors(&errors, repo, rate_limit.as_ref()));
        }

        if let Some(rate) = &rate_limit {
            if rate.remaining < LOW_QUOTA_WARNING {
                warn!(
                    target: "stargaze::github",
                    remaining = rate.remaining,
                    reset_at = %rate.reset_at,
                    "GraphQL quota low"
                );
            }
        }

        let connection = repository
            .ok_or_else(|| FetchError::NotFound(repo.full_name()))?
            .stargazers;

        let page_info = connection.page_info;
        if page_info.has_next_page && page_info.end_cursor.is_none() {
            return Err(FetchError::Decode(format!(
                "{}: hasNextPage without an endCursor",
                repo.full_name()
            )));
        }

        let repo_full_name = repo.full_name();
        let events: Vec<StargazerEvent> = connection
            .edges
            .into_iter()
            .filter_map(|edge| {
                let Some(user_id) = edge.node.database_id else {
                    debug!(target: "stargaze::github", repo = %repo_full_name, login = %edge.node.login, "skipping stargazer without database id");
                    return None;
                };
                Some(StargazerEvent {
                    repo_full_name: repo_full_name.clone(),
                    user_id,
                    login: edge.node.login,
                    starred_at: edge.starred_at,
                })
            })
            .collect();

        debug!(
            target: "stargaze::github",
            repo = %repo_full_name,
            after = after.unwrap_or("-"),
            events = events.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            cost = rate_limit.as_ref().map(|r| r.cost),
            "page fetched"
        );

        Ok(StargazerPage {
            events,
            end_cursor: page_info.end_cursor,
            has_next_page: page_info.has_next_page,
        })
    }
}

fn classify_graphql_errors(
    errors: &[GraphQlError],
    repo: &RepoSlug,
    rate_limit: Option<&GraphQlRateLimit>,
) -> FetchError {
    let is_rate_limit = errors.iter().any(|e| {
        e.kind.as_deref() == Some("RATE_LIMITED") || e.message.to_lowercase().contains("rate limit")
    });
    if is_rate_limit {
        let retry_after = rate_limit
            .map(|r| wait_until(r.reset_at))
            .unwrap_or(FALLBACK_RATE_LIMIT_WAIT);
        return FetchError::RateLimited { retry_after };
    }

    if errors.iter().any(|e| e.kind.as_deref() == Some("NOT_FOUND")) {
        return FetchError::NotFound(repo.full_name());
    }

    let messages: Vec<&str> = errors.iter().map(|e| e.message.as_str()).collect();
    FetchError::GraphQl(messages.join("; "))
}
