//! Aggregation models materialized from the raw stargazer table

use anyhow::{Context, Result};
use tracing::info;

use crate::db::Database;

/// A model: output table name and the SELECT that produces it
pub struct Model {
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MODELS: &[Model] = &[
    Model {
        name: "stargazer_by_user",
        sql: include_str!("../sql/stargazer_by_user.sql"),
    },
    Model {
        name: "stargazer_by_month",
        sql: include_str!("../sql/stargazer_by_month.sql"),
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCount {
    pub user_id: i64,
    pub login: String,
    pub repos_starred: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthCount {
    pub repo_full_name: String,
    /// First day of the month, `YYYY-MM-01`
    pub month: String,
    pub stars: i64,
}

/// Rebuild every model table. All tables are replaced in one transaction, so
/// readers never see a mix of old and new outputs.
pub fn run_models(db: &mut Database) -> Result<Vec<(&'static str, usize)>> {
    let tx = db.conn_mut().transaction()?;
    let mut built = Vec::with_capacity(MODELS.len());

    for model in MODELS {
        let select = model.sql.trim().trim_end_matches(';');
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {name}; CREATE TABLE {name} AS {select};",
            name = model.name,
        ))
        .with_context(|| format!("Failed to build model {}", model.name))?;

        let rows: i64 = tx.query_row(&format!("SELECT COUNT(*) FROM {}", model.name), [], |row| {
            row.get(0)
        })?;
        info!(target: "stargaze::transform", model = model.name, rows, "model built");
        built.push((model.name, rows as usize));
    }

    tx.commit().context("Failed to commit models")?;
    Ok(built)
}

/// `stargazer_by_user`, most repositories first then by login
pub fn user_counts(db: &Database) -> Result<Vec<UserCount>> {
    let mut stmt = db
        .conn_ref()
        .prepare(
            "SELECT user_id, login, repos_starred
             FROM stargazer_by_user
             ORDER BY repos_starred DESC, login, user_id",
        )
        .context("stargazer_by_user is missing (run the transform first)")?;
    let rows = stmt.query_map([], |row| {
        Ok(UserCount {
            user_id: row.get(0)?,
            login: row.get(1)?,
            repos_starred: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// `stargazer_by_month`, by repository then month
pub fn month_counts(db: &Database) -> Result<Vec<MonthCount>> {
    let mut stmt = db
        .conn_ref()
        .prepare(
            "SELECT repo_full_name, month, stars
             FROM stargazer_by_month
             ORDER BY repo_full_name, month",
        )
        .context("stargazer_by_month is missing (run the transform first)")?;
    let rows = stmt.query_map([], |row| {
        Ok(MonthCount {
            repo_full_name: row.get(0)?,
            month: row.get(1)?,
            stars: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}
