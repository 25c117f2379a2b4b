//! Test fixtures: an in-process fake of the GitHub stargazer GraphQL endpoint.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use crate::github::{Direction, GitHubClient, RetryConfig};

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

/// Fast retries so failure tests finish in milliseconds
pub fn test_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_rate_limit_wait: Duration::from_millis(5),
    }
}

pub fn test_client(uri: &str) -> GitHubClient {
    GitHubClient::new(
        "test-token".to_string(),
        format!("{}/graphql", uri),
        test_retry(),
        Duration::from_secs(5),
    )
    .unwrap()
}

/// Variables of one request received by the fake
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub after: Option<String>,
    pub first: usize,
    pub direction: Direction,
}

#[derive(Default)]
struct FakeState {
    stars: HashMap<String, Vec<(i64, String, DateTime<Utc>)>>,
    failing: HashSet<String>,
    requests: HashMap<String, Vec<RecordedRequest>>,
}

struct Responder(Arc<Mutex<FakeState>>);

impl Respond for Responder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = match request.body_json() {
            Ok(body) => body,
            Err(_) => return ResponseTemplate::new(400),
        };
        let query = body["query"].as_str().unwrap_or_default();
        let vars = &body["variables"];
        let repo = format!(
            "{}/{}",
            vars["owner"].as_str().unwrap_or_default(),
            vars["name"].as_str().unwrap_or_default()
        );
        let direction = if query.contains("direction: DESC") {
            Direction::Desc
        } else {
            Direction::Asc
        };
        let first = vars["first"].as_u64().unwrap_or(100) as usize;
        let after = vars["after"].as_str().map(String::from);

        let mut state = self.0.lock().unwrap();
        state.requests.entry(repo.clone()).or_default().push(RecordedRequest {
            after: after.clone(),
            first,
            direction,
        });

        if state.failing.contains(&repo) {
            return ResponseTemplate::new(502);
        }

        let Some(stars) = state.stars.get(&repo) else {
            return ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": { "repository": null },
                "errors": [{ "type": "NOT_FOUND", "message": format!("Could not resolve to a Repository with the name '{}'.", repo) }]
            }));
        };

        let mut ordered = stars.clone();
        ordered.sort_by(|a, b| a.2.cmp(&b.2).then(a.0.cmp(&b.0)));
        if direction == Direction::Desc {
            ordered.reverse();
        }

        let offset = after
            .as_deref()
            .and_then(|c| c.trim_start_matches('c').parse::<usize>().ok())
            .unwrap_or(0)
            .min(ordered.len());
        let end = (offset + first).min(ordered.len());

        let edges: Vec<serde_json::Value> = ordered[offset..end]
            .iter()
            .map(|(id, login, at)| {
                serde_json::json!({
                    "starredAt": at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
                    "node": { "login": login, "databaseId": id }
                })
            })
            .collect();

        let end_cursor = if end > offset { Some(format!("c{}", end)) } else { None };

        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {
                "rateLimit": { "cost": 1, "remaining": 4999, "resetAt": "2030-01-01T00:00:00Z" },
                "repository": {
                    "stargazers": {
                        "pageInfo": { "endCursor": end_cursor, "hasNextPage": end < ordered.len() },
                        "edges": edges
                    }
                }
            }
        }))
    }
}

/// Fake GraphQL server holding a mutable set of stargazers per repository
pub struct FakeGitHub {
    server: MockServer,
    state: Arc<Mutex<FakeState>>,
}

impl FakeGitHub {
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let state = Arc::new(Mutex::new(FakeState::default()));
        Mock::given(method("POST"))
            .and(path("/graphql"))
            .respond_with(Responder(state.clone()))
            .mount(&server)
            .await;
        Self { server, state }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    /// Add `(user_id, login, starred_at)` stars; an empty slice registers an empty repo
    pub fn add_stars(&self, repo: &str, stars: &[(i64, &str, &str)]) {
        let mut state = self.state.lock().unwrap();
        let entry = state.stars.entry(repo.to_string()).or_default();
        entry.extend(stars.iter().map(|(id, login, at)| (*id, login.to_string(), ts(at))));
    }

    /// Add `n` stars one hour apart; user ids continue from the existing count
    pub fn add_generated_stars(&self, repo: &str, n: usize) {
        let mut state = self.state.lock().unwrap();
        let entry = state.stars.entry(repo.to_string()).or_default();
        let start = entry.len();
        for i in start..start + n {
            entry.push((i as i64 + 1, format!("user{}", i + 1), Self::time_of(i)));
        }
    }

    /// Star time of the `i`-th generated star (0-based)
    pub fn generated_time(&self, i: usize) -> DateTime<Utc> {
        Self::time_of(i)
    }

    fn time_of(i: usize) -> DateTime<Utc> {
        ts("2024-01-01T00:00:00Z") + ChronoDuration::hours(i as i64)
    }

    /// Make every request for `repo` fail with 502
    pub fn fail_repo(&self, repo: &str) {
        self.state.lock().unwrap().failing.insert(repo.to_string());
    }

    pub fn requests(&self, repo: &str) -> Vec<RecordedRequest> {
        let state = self.state.lock().unwrap();
        state.requests.get(repo).cloned().unwrap_or_default()
    }
}
