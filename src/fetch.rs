//! Bounded parallel fan-out over the configured repositories
//!
//! Each repository is one unit of work. Failures stay with their repository;
//! a run-level deadline fails whatever has not finished when it passes.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use thiserror::Error;
use tokio::time::Instant;

use crate::extract::{extract_repo, RepoExtract};
use crate::github::{Direction, FetchError, GitHubClient, RepoSlug, StargazerEvent};

/// Why one repository's unit of work failed
#[derive(Debug, Error)]
pub enum RepoError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Fatal for the whole run
    #[error("store write failed: {0:#}")]
    Store(anyhow::Error),

    #[error("run deadline passed before the repository finished")]
    DeadlineExceeded,
}

/// A repository that could not be processed, with its cause
#[derive(Debug, Clone)]
pub struct RepoFailure {
    pub repo: String,
    pub cause: String,
}

/// Run `job` for every repository with at most `workers` in flight.
///
/// Outcomes are yielded in completion order. Dropping the stream cancels any
/// repository still in flight. Repositories whose turn comes after `deadline`
/// fail without starting; ones in flight at the deadline are aborted.
pub fn run_bounded<'a, T, F, Fut>(
    repos: &'a [RepoSlug],
    workers: usize,
    deadline: Option<Instant>,
    mut job: F,
) -> impl Stream<Item = (RepoSlug, Result<T, RepoError>)> + 'a
where
    F: FnMut(RepoSlug) -> Fut + 'a,
    Fut: Future<Output = Result<T, RepoError>> + 'a,
    T: 'a,
{
    stream::iter(repos.iter().cloned())
        .map(move |repo| {
            let expired = deadline.is_some_and(|d| Instant::now() >= d);
            let work = (!expired).then(|| job(repo.clone()));
            async move {
                let result = match (work, deadline) {
                    (None, _) => Err(RepoError::DeadlineExceeded),
                    (Some(work), Some(deadline)) => tokio::time::timeout_at(deadline, work)
                        .await
                        .unwrap_or(Err(RepoError::DeadlineExceeded)),
                    (Some(work), None) => work.await,
                };
                (repo, result)
            }
        })
        .buffer_unordered(workers.max(1))
}

/// Union of everything extracted in one fan-out
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub extracts: Vec<RepoExtract>,
    pub failures: Vec<RepoFailure>,
}

impl FetchOutcome {
    pub fn events(&self) -> impl Iterator<Item = &StargazerEvent> {
        self.extracts.iter().flat_map(|e| e.events.iter())
    }

    pub fn event_count(&self) -> usize {
        self.extracts.iter().map(|e| e.events.len()).sum()
    }
}

/// Extract every repository concurrently without touching the store.
///
/// `watermarks` bounds each repository's walk; repositories missing from the
/// map are fetched in full.
pub async fn extract_all(
    client: &GitHubClient,
    repos: &[RepoSlug],
    direction: Direction,
    watermarks: &HashMap<String, DateTime<Utc>>,
    page_size: usize,
    workers: usize,
    deadline: Option<Instant>,
) -> FetchOutcome {
    let results: Vec<_> = run_bounded(repos, workers, deadline, move |repo| async move {
        let watermark = watermarks.get(&repo.full_name()).copied();
        extract_repo(client, &repo, direction, watermark, page_size)
            .await
            .map_err(RepoError::from)
    })
    .collect()
    .await;

    let mut outcome = FetchOutcome::default();
    for (repo, result) in results {
        match result {
            Ok(extract) => outcome.extracts.push(extract),
            Err(e) => outcome.failures.push(RepoFailure {
                repo: repo.full_name(),
                cause: e.to_string(),
            }),
        }
    }
    outcome
}
