//! Backfill and incremental runs: extract every repository, merge into the
//! store and maintain the per-repository watermarks.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::db::{Database, MergeStats};
use crate::extract::{extract_repo, StopReason};
use crate::fetch::{run_bounded, RepoError, RepoFailure};
use crate::github::{Direction, GitHubClient, RepoSlug};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Drop the store and reload the full history
    Backfill,
    /// Fetch only stars newer than each repository's watermark
    Incremental,
}

impl RunMode {
    pub fn direction(&self) -> Direction {
        match self {
            RunMode::Backfill => Direction::Asc,
            RunMode::Incremental => Direction::Desc,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Backfill => write!(f, "backfill"),
            RunMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// Outcome of one successfully processed repository
#[derive(Debug, Clone)]
pub struct RepoReport {
    pub repo: String,
    pub pages: usize,
    /// Events that passed the watermark filter
    pub yielded: usize,
    pub stop: StopReason,
    pub merge: MergeStats,
    /// Watermark after the run; `None` for an empty repository
    pub watermark: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct RunSummary {
    pub mode: RunMode,
    pub duration: Duration,
    /// Sorted by repository name
    pub succeeded: Vec<RepoReport>,
    pub failed: Vec<RepoFailure>,
    pub rows_before: usize,
    pub rows_after: usize,
}

impl RunSummary {
    /// A run with any failed repository is degraded
    pub fn is_degraded(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn rows_merged(&self) -> usize {
        self.succeeded.iter().map(|r| r.merge.merged()).sum()
    }

    pub fn new_rows(&self) -> usize {
        self.rows_after.saturating_sub(self.rows_before)
    }
}

fn lock(store: &Mutex<Database>) -> Result<MutexGuard<'_, Database>, RepoError> {
    store
        .lock()
        .map_err(|_| RepoError::Store(anyhow!("database lock poisoned")))
}

/// Extract-then-merge for one repository
async fn process_repo(
    client: &GitHubClient,
    store: &Mutex<Database>,
    repo: RepoSlug,
    mode: RunMode,
    watermark: Option<DateTime<Utc>>,
    page_size: usize,
    extracted_at: DateTime<Utc>,
) -> Result<RepoReport, RepoError> {
    let extract = extract_repo(client, &repo, mode.direction(), watermark, page_size).await?;
    let full_name = repo.full_name();

    // Hold the lock only for the synchronous writes
    let merge = {
        let mut db = lock(store)?;
        let merge = db
            .merge_events(&extract.events, extracted_at)
            .map_err(RepoError::Store)?;

        if mode == RunMode::Incremental {
            if let Some(max) = extract.max_starred_at() {
                db.advance_watermark(&full_name, max)
                    .map_err(RepoError::Store)?;
            }
        }
        merge
    };

    let watermark = match (watermark, extract.max_starred_at()) {
        (Some(old), Some(new)) => Some(old.max(new)),
        (old, new) => old.or(new),
    };

    Ok(RepoReport {
        repo: full_name,
        pages: extract.pages,
        yielded: extract.events.len(),
        stop: extract.stop,
        merge,
        watermark,
    })
}

/// Run one extract/load pass in `config.mode`.
///
/// Repository failures are collected in the summary. A store failure aborts the
/// run and cancels every repository still in flight.
pub async fn run(config: &PipelineConfig, client: &GitHubClient) -> Result<RunSummary> {
    let mode = config.mode;
    let started = Instant::now();
    let extracted_at = Utc::now();
    let deadline = config
        .run_timeout
        .map(|t| tokio::time::Instant::now() + t);

    let (db, watermarks) = match mode {
        RunMode::Backfill => {
            let db = Database::recreate(&config.db_path)?;
            (db, HashMap::new())
        }
        RunMode::Incremental => {
            let db = Database::open(&config.db_path)?;
            let watermarks = db.watermarks().context("Failed to read watermarks")?;
            (db, watermarks)
        }
    };
    let rows_before = db.count_rows()?;

    info!(
        target: "stargaze::pipeline",
        mode = %mode,
        repos = config.repos.len(),
        workers = config.workers,
        rows_before,
        "starting run"
    );

    let store = Mutex::new(db);
    let mut succeeded = Vec::new();
    let mut failed = Vec::new();

    {
        let watermarks = &watermarks;
        let store = &store;
        let outcomes = run_bounded(&config.repos, config.workers, deadline, move |repo| {
            let watermark = watermarks.get(&repo.full_name()).copied();
            process_repo(
                client,
                store,
                repo,
                mode,
                watermark,
                config.page_size,
                extracted_at,
            )
        });
        let mut outcomes = std::pin::pin!(outcomes);

        while let Some((repo, result)) = outcomes.next().await {
            match result {
                Ok(report) => {
                    info!(
                        target: "stargaze::pipeline",
                        repo = %repo,
                        pages = report.pages,
                        inserted = report.merge.inserted,
                        updated = report.merge.updated,
                        stop = report.stop.as_str(),
                        "repository loaded"
                    );
                    succeeded.push(report);
                }
                Err(RepoError::Store(e)) => {
                    return Err(e.context(format!("Failed to store stargazers for {}", repo)));
                }
                Err(e) => {
                    warn!(target: "stargaze::pipeline", repo = %repo, error = %e, "repository failed");
                    failed.push(RepoFailure {
                        repo: repo.full_name(),
                        cause: e.to_string(),
                    });
                }
            }
        }
    }

    let mut db = store
        .into_inner()
        .map_err(|_| anyhow!("database lock poisoned"))?;

    if mode == RunMode::Backfill {
        let rebuilt = db.rebuild_watermarks()?;
        info!(target: "stargaze::pipeline", repos = rebuilt, "watermarks rebuilt");
    }

    let rows_after = db.count_rows()?;
    succeeded.sort_by(|a, b| a.repo.cmp(&b.repo));
    failed.sort_by(|a, b| a.repo.cmp(&b.repo));

    Ok(RunSummary {
        mode,
        duration: started.elapsed(),
        succeeded,
        failed,
        rows_before,
        rows_after,
    })
}
