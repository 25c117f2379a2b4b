use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::github::StargazerEvent;

/// Counts from one merged batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeStats {
    /// Keys that did not exist before the batch
    pub inserted: usize,
    /// Rows overwritten in place
    pub updated: usize,
}

impl MergeStats {
    pub fn merged(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Format a timestamp the way it is stored: RFC 3339, UTC, whole seconds.
/// Lexical order of the stored text equals time order.
pub fn to_db_ts(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn parse_db_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        // Workers share one connection, but a concurrent CLI run may hold the file
        conn.busy_timeout(std::time::Duration::from_secs(30))?;

        let db = Self {
            conn,
            path: path.to_path_buf(),
        };
        db.init()?;
        Ok(db)
    }

    /// Delete the database file (and its WAL/SHM siblings) and open an empty one.
    /// Backfill uses this so a rebuild never sees rows from an earlier run.
    pub fn recreate(path: &Path) -> Result<Self> {
        for suffix in ["", "-wal", "-shm"] {
            let mut target = path.as_os_str().to_owned();
            target.push(suffix);
            let target = PathBuf::from(target);
            match std::fs::remove_file(&target) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to delete {}", target.display()))
                }
            }
        }
        Self::open(path)
    }

    /// Open an in-memory database for testing
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self {
            conn,
            path: PathBuf::from(":memory:"),
        };
        db.init()?;
        Ok(db)
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get a reference to the underlying connection (for aggregation queries)
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            CREATE TABLE IF NOT EXISTS raw_github_stargazers (
                repo_full_name TEXT NOT NULL,
                user_id INTEGER NOT NULL,
                login TEXT NOT NULL,
                starred_at TEXT NOT NULL,
                extracted_at TEXT NOT NULL,
                PRIMARY KEY (repo_full_name, user_id)
            );

            CREATE INDEX IF NOT EXISTS idx_stargazers_repo_starred
                ON raw_github_stargazers(repo_full_name, starred_at);

            CREATE TABLE IF NOT EXISTS repo_watermarks (
                repo_full_name TEXT PRIMARY KEY,
                watermark TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // === Merge ===

    /// Upsert a batch of events keyed by (repo_full_name, user_id).
    ///
    /// Runs in a single transaction: either every row of the batch is applied
    /// or none is.
    pub fn merge_events(
        &mut self,
        events: &[StargazerEvent],
        extracted_at: DateTime<Utc>,
    ) -> Result<MergeStats> {
        if events.is_empty() {
            return Ok(MergeStats::default());
        }

        let extracted_at = to_db_ts(&extracted_at);
        let tx = self.conn.transaction()?;

        let before: i64 = tx.query_row("SELECT COUNT(*) FROM raw_github_stargazers", [], |row| row.get(0))?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO raw_github_stargazers (repo_full_name, user_id, login, starred_at, extracted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(repo_full_name, user_id) DO UPDATE SET
                    login = excluded.login,
                    starred_at = excluded.starred_at,
                    extracted_at = excluded.extracted_at",
            )?;

            for event in events {
                stmt.execute(params![
                    event.repo_full_name,
                    event.user_id,
                    event.login,
                    to_db_ts(&event.starred_at),
                    extracted_at,
                ])?;
            }
        }

        let after: i64 = tx.query_row("SELECT COUNT(*) FROM raw_github_stargazers", [], |row| row.get(0))?;
        tx.commit().context("Failed to commit merge batch")?;

        let inserted = (after - before).max(0) as usize;
        Ok(MergeStats {
            inserted,
            updated: events.len() - inserted,
        })
    }

    // === Watermarks ===

    /// Current watermark for a repo.
    ///
    /// Falls back to the newest stored star when no watermark row exists.
    #[cfg(test)]
    pub fn watermark(&self, repo_full_name: &str) -> Result<Option<DateTime<Utc>>> {
        use rusqlite::OptionalExtension;

        let stored: Option<String> = self
            .conn
            .query_row(
                "SELECT COALESCE(
                    (SELECT watermark FROM repo_watermarks WHERE repo_full_name = ?1),
                    (SELECT MAX(starred_at) FROM raw_github_stargazers WHERE repo_full_name = ?1)
                 )",
                [repo_full_name],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        stored
            .map(|s| parse_db_ts(0, &s))
            .transpose()
            .context("Corrupt watermark value")
    }

    /// Watermarks for every known repo, read once at the start of a run
    pub fn watermarks(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        let mut stmt = self.conn.prepare(
            "SELECT repo_full_name, MAX(starred_at) FROM raw_github_stargazers GROUP BY repo_full_name",
        )?;
        let mut marks: HashMap<String, DateTime<Utc>> = stmt
            .query_map([], |row| {
                let repo: String = row.get(0)?;
                let at: String = row.get(1)?;
                Ok((repo, parse_db_ts(1, &at)?))
            })?
            .collect::<rusqlite::Result<_>>()?;

        // Explicit watermark rows take precedence over the derived ones
        let mut stmt = self
            .conn
            .prepare("SELECT repo_full_name, watermark FROM repo_watermarks")?;
        let stored = stmt.query_map([], |row| {
            let repo: String = row.get(0)?;
            let at: String = row.get(1)?;
            Ok((repo, parse_db_ts(1, &at)?))
        })?;
        for entry in stored {
            let (repo, at) = entry?;
            marks.insert(repo, at);
        }

        Ok(marks)
    }

    /// Move a repo's watermark forward. Never moves it backwards.
    pub fn advance_watermark(&self, repo_full_name: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn.execute(
            "INSERT INTO repo_watermarks (repo_full_name, watermark, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(repo_full_name) DO UPDATE SET
                watermark = MAX(watermark, excluded.watermark),
                updated_at = excluded.updated_at",
            params![repo_full_name, to_db_ts(&at), to_db_ts(&Utc::now())],
        )?;
        Ok(())
    }

    /// Replace all watermarks with the newest stored star per repo
    pub fn rebuild_watermarks(&mut self) -> Result<usize> {
        let now = to_db_ts(&Utc::now());
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM repo_watermarks", [])?;
        let rebuilt = tx.execute(
            "INSERT INTO repo_watermarks (repo_full_name, watermark, updated_at)
             SELECT repo_full_name, MAX(starred_at), ?1
             FROM raw_github_stargazers
             GROUP BY repo_full_name",
            [now],
        )?;
        tx.commit()?;
        Ok(rebuilt)
    }

    // === Stats ===

    pub fn count_rows(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM raw_github_stargazers", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Row count per repo, sorted by repo name
    pub fn count_rows_by_repo(&self) -> Result<BTreeMap<String, usize>> {
        let mut stmt = self.conn.prepare(
            "SELECT repo_full_name, COUNT(*) FROM raw_github_stargazers GROUP BY repo_full_name",
        )?;
        let rows = stmt.query_map([], |row| {
            let repo: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((repo, count as usize))
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }

    /// When the data was last refreshed (newest `extracted_at`)
    pub fn last_extracted_at(&self) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<String> = self.conn.query_row(
            "SELECT MAX(extracted_at) FROM raw_github_stargazers",
            [],
            |row| row.get(0),
        )?;
        latest
            .map(|s| parse_db_ts(0, &s))
            .transpose()
            .context("Corrupt extracted_at value")
    }

    /// All stored events for a repo, oldest first
    #[cfg(test)]
    pub fn events_for_repo(&self, repo_full_name: &str) -> Result<Vec<StargazerEvent>> {
        let mut stmt = self.conn.prepare(
            "SELECT repo_full_name, user_id, login, starred_at
             FROM raw_github_stargazers
             WHERE repo_full_name = ?1
             ORDER BY starred_at, user_id",
        )?;
        let rows = stmt.query_map([repo_full_name], |row| {
            let starred_at: String = row.get(3)?;
            Ok(StargazerEvent {
                repo_full_name: row.get(0)?,
                user_id: row.get(1)?,
                login: row.get(2)?,
                starred_at: parse_db_ts(3, &starred_at)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<_>>()?)
    }
}
