//! Static HTML dashboard rendered from the aggregation tables

use anyhow::{Context, Result};
use chrono::{DateTime, Local, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::db::Database;
use crate::formatting::{escape_html, format_count};
use crate::transform::{month_counts, user_counts, MonthCount, UserCount};

/// Largest bucket in the repos-starred distribution
pub const MAX_REPOS_BUCKET: usize = 5;

/// Stars per repository per year with row and column totals
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearPivot {
    pub years: Vec<i32>,
    /// `(repo, stars per year, row total)`, largest total first
    pub rows: Vec<(String, Vec<usize>, usize)>,
    pub year_totals: Vec<usize>,
    pub total: usize,
}

pub fn year_pivot(months: &[MonthCount]) -> Result<YearPivot> {
    let mut cells: BTreeMap<(String, i32), usize> = BTreeMap::new();
    let mut years: Vec<i32> = Vec::new();

    for m in months {
        let year: i32 = m
            .month
            .get(..4)
            .and_then(|y| y.parse().ok())
            .with_context(|| format!("Invalid month value: {:?}", m.month))?;
        *cells.entry((m.repo_full_name.clone(), year)).or_default() += m.stars.max(0) as usize;
        if !years.contains(&year) {
            years.push(year);
        }
    }
    years.sort_unstable();

    let mut by_repo: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for ((repo, year), stars) in &cells {
        let idx = years.iter().position(|y| y == year).unwrap_or_default();
        by_repo.entry(repo.as_str()).or_insert_with(|| vec![0; years.len()])[idx] += stars;
    }

    let mut rows: Vec<(String, Vec<usize>, usize)> = by_repo
        .into_iter()
        .map(|(repo, counts)| {
            let total = counts.iter().sum();
            (repo.to_string(), counts, total)
        })
        .collect();
    // Stable sort keeps repo name order among equal totals
    rows.sort_by(|a, b| b.2.cmp(&a.2));

    let year_totals: Vec<usize> = (0..years.len())
        .map(|i| rows.iter().map(|(_, counts, _)| counts[i]).sum())
        .collect();
    let total = year_totals.iter().sum();

    Ok(YearPivot {
        years,
        rows,
        year_totals,
        total,
    })
}

/// Users bucketed by how many repositories they starred (1..=MAX_REPOS_BUCKET)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Distribution {
    pub counts: Vec<usize>,
    pub total: usize,
}

impl Distribution {
    /// Share of each bucket, one decimal place
    pub fn percentages(&self) -> Vec<String> {
        self.counts
            .iter()
            .map(|&c| {
                let pct = if self.total == 0 {
                    0.0
                } else {
                    c as f64 / self.total as f64 * 100.0
                };
                format!("{:.1}%", pct)
            })
            .collect()
    }
}

pub fn distribution(users: &[UserCount], max_repos: usize) -> Distribution {
    let mut counts = vec![0usize; max_repos];
    for user in users {
        if user.repos_starred >= 1 && user.repos_starred as usize <= max_repos {
            counts[user.repos_starred as usize - 1] += 1;
        }
    }
    let total = counts.iter().sum();
    Distribution { counts, total }
}

/// `3/7/2025 9:05AM` style stamp
pub fn format_refresh<Tz: TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format("%-m/%-d/%Y %-I:%M%p").to_string()
}

/// Everything the dashboard shows
#[derive(Debug)]
pub struct Dashboard {
    pub refreshed_at: Option<DateTime<Utc>>,
    pub pivot: YearPivot,
    pub distribution: Distribution,
    pub users: Vec<UserCount>,
}

impl Dashboard {
    /// Read the model tables; fails if the transform has not run yet
    pub fn load(db: &Database) -> Result<Self> {
        let months = month_counts(db)?;
        let users = user_counts(db)?;
        Ok(Self {
            refreshed_at: db.last_extracted_at()?,
            pivot: year_pivot(&months)?,
            distribution: distribution(&users, MAX_REPOS_BUCKET),
            users,
        })
    }

    pub fn render(&self) -> String {
        let refreshed = self
            .refreshed_at
            .map(|at| format_refresh(&at.with_timezone(&Local)))
            .unwrap_or_else(|| "Unknown".to_string());

        let mut html = String::new();
        html.push_str(HEAD);
        let _ = writeln!(html, "<h1>GitHub Stargazer Dashboard</h1>");
        let _ = writeln!(
            html,
            "<div class=\"refresh-timestamp\">Data Refreshed as of {}</div>",
            escape_html(&refreshed)
        );

        html.push_str("<div class=\"card\">\n<h2>GitHub Stars by Repo Time Series</h2>\n<div class=\"hscroll\">\n");
        self.render_pivot(&mut html);
        html.push_str("</div>\n</div>\n");

        html.push_str("<div class=\"card\">\n<h2>Distribution of Repos Starred</h2>\n");
        self.render_distribution(&mut html);
        html.push_str("</div>\n");

        html.push_str("<div class=\"card\">\n<h2>Individual Stargazers (Repos Starred)</h2>\n<div class=\"scroll\">\n");
        self.render_users(&mut html);
        html.push_str("</div>\n</div>\n");

        html.push_str("</body>\n</html>\n");
        html
    }

    fn render_pivot(&self, html: &mut String) {
        let pivot = &self.pivot;
        html.push_str("<table class=\"stargazer-table timeseries-table\">\n<thead><tr><th></th>");
        for year in &pivot.years {
            let _ = write!(html, "<th>{}</th>", year);
        }
        html.push_str("<th>Total</th></tr></thead>\n<tbody>\n");

        for (repo, counts, total) in &pivot.rows {
            let _ = write!(html, "<tr><th>{}</th>", escape_html(repo));
            for c in counts {
                let _ = write!(html, "<td>{}</td>", format_count(*c));
            }
            let _ = writeln!(html, "<td>{}</td></tr>", format_count(*total));
        }

        html.push_str("<tr><th>Total</th>");
        for c in &pivot.year_totals {
            let _ = write!(html, "<td>{}</td>", format_count(*c));
        }
        let _ = writeln!(html, "<td>{}</td></tr>", format_count(pivot.total));
        html.push_str("</tbody>\n</table>\n");
    }

    fn render_distribution(&self, html: &mut String) {
        let dist = &self.distribution;
        html.push_str("<table class=\"stargazer-table summary-table\">\n<thead><tr><th># of Repos Starred</th>");
        for i in 1..=dist.counts.len() {
            let label = if i == 1 { "repo" } else { "repos" };
            let _ = write!(html, "<th>{} {}</th>", i, label);
        }
        html.push_str("<th>Total</th></tr></thead>\n<tbody>\n<tr><th>Count Users</th>");
        for c in &dist.counts {
            let _ = write!(html, "<td>{}</td>", format_count(*c));
        }
        let _ = writeln!(html, "<td>{}</td></tr>", format_count(dist.total));

        html.push_str("<tr><th>%</th>");
        for pct in dist.percentages() {
            let _ = write!(html, "<td>{}</td>", pct);
        }
        html.push_str("<td>100%</td></tr>\n</tbody>\n</table>\n");
    }

    fn render_users(&self, html: &mut String) {
        html.push_str("<table class=\"stargazer-table users-table\">\n<thead><tr><th>User</th><th>Repos Starred</th></tr></thead>\n<tbody>\n");
        for user in &self.users {
            let _ = writeln!(
                html,
                "<tr><td>{}</td><td>{}</td></tr>",
                escape_html(&user.login),
                user.repos_starred
            );
        }
        html.push_str("</tbody>\n</table>\n");
    }
}

/// Render the dashboard from `db` and write it to `path`
pub fn write_report(db: &Database, path: &Path) -> Result<Dashboard> {
    let dashboard = Dashboard::load(db)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create report directory: {}", parent.display()))?;
    }
    std::fs::write(path, dashboard.render())
        .with_context(|| format!("Failed to write report: {}", path.display()))?;
    Ok(dashboard)
}

const HEAD: &str = r#"<!doctype html>
<html>
<head>
<meta charset="utf-8" />
<title>GitHub Stargazer Dashboard</title>
<meta name="viewport" content="width=device-width, initial-scale=1" />
<style>
  body { font-family: Arial, sans-serif; margin: 32px; color: #111; }
  h1 { margin: 0 0 10px 0; font-size: 28px; }
  h2 { margin-top: 34px; margin-bottom: 12px; font-size: 18px; }
  .refresh-timestamp { position: absolute; top: 20px; right: 32px; font-size: 12px; color: #888; letter-spacing: 0.5px; }
  .card { border: 1px solid #e5e5e5; border-radius: 10px; padding: 16px; margin-bottom: 18px; background: #fff; }
  table.stargazer-table { border-collapse: collapse; width: 100%; table-layout: fixed; }
  table.stargazer-table th, table.stargazer-table td { padding: 8px 10px; overflow: hidden; text-overflow: ellipsis; white-space: nowrap; text-align: left; }
  table.stargazer-table tr:nth-child(even) { background-color: #f6f6f6; }
  .hscroll { overflow-x: auto; border: 1px solid #eee; border-radius: 10px; }
  table.timeseries-table th:first-child { width: 150px; position: sticky; left: 0; background: #fff; }
  table.timeseries-table td { text-align: right; }
  table.summary-table { table-layout: auto; }
  .scroll { max-height: 720px; overflow: auto; border: 1px solid #eee; border-radius: 10px; }
  .scroll thead th { position: sticky; top: 0; background: #fff; }
</style>
</head>
<body>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::StargazerEvent;
    use crate::testing::ts;
    use crate::transform::run_models;

    fn month(repo: &str, month: &str, stars: i64) -> MonthCount {
        MonthCount {
            repo_full_name: repo.to_string(),
            month: month.to_string(),
            stars,
        }
    }

    fn user(login: &str, repos_starred: i64) -> UserCount {
        UserCount {
            user_id: 0,
            login: login.to_string(),
            repos_starred,
        }
    }

    #[test]
    fn test_year_pivot() {
        let months = vec![
            month("octo/a", "2023-11-01", 2),
            month("octo/a", "2024-01-01", 1),
            month("octo/a", "2024-02-01", 1),
            month("octo/b", "2024-05-01", 10),
        ];
        let pivot = year_pivot(&months).unwrap();

        assert_eq!(pivot.years, vec![2023, 2024]);
        assert_eq!(
            pivot.rows,
            vec![
                ("octo/b".to_string(), vec![0, 10], 10),
                ("octo/a".to_string(), vec![2, 2], 4),
            ]
        );
        assert_eq!(pivot.year_totals, vec![2, 12]);
        assert_eq!(pivot.total, 14);
    }

    #[test]
    fn test_year_pivot_rejects_bad_month() {
        assert!(year_pivot(&[month("octo/a", "n/a", 1)]).is_err());
    }

    #[test]
    fn test_distribution() {
        let users = vec![
            user("a", 1),
            user("b", 1),
            user("c", 2),
            user("d", 7),
        ];
        let dist = distribution(&users, 5);
        assert_eq!(dist.counts, vec![2, 1, 0, 0, 0]);
        assert_eq!(dist.total, 3);
        assert_eq!(
            dist.percentages(),
            vec!["66.7%", "33.3%", "0.0%", "0.0%", "0.0%"]
        );

        let empty = distribution(&[], 5);
        assert_eq!(empty.total, 0);
        assert_eq!(empty.percentages()[0], "0.0%");
    }

    #[test]
    fn test_format_refresh() {
        assert_eq!(format_refresh(&ts("2025-03-07T09:05:00Z")), "3/7/2025 9:05AM");
        assert_eq!(format_refresh(&ts("2025-12-17T21:30:00Z")), "12/17/2025 9:30PM");
    }

    #[test]
    fn test_write_report() {
        let mut db = Database::open_in_memory().unwrap();
        db.merge_events(
            &[
                StargazerEvent {
                    repo_full_name: "octo/demo".into(),
                    user_id: 1,
                    login: "<script>".into(),
                    starred_at: ts("2024-01-01T00:00:00Z"),
                },
                StargazerEvent {
                    repo_full_name: "octo/demo".into(),
                    user_id: 2,
                    login: "bob".into(),
                    starred_at: ts("2024-02-01T00:00:00Z"),
                },
            ],
            Utc::now(),
        )
        .unwrap();
        run_models(&mut db).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reports").join("dashboard.html");
        let dashboard = write_report(&db, &path).unwrap();
        assert_eq!(dashboard.pivot.total, 2);
        assert_eq!(dashboard.users.len(), 2);

        let html = std::fs::read_to_string(&path).unwrap();
        assert!(html.contains("Data Refreshed as of"));
        assert!(!html.contains("Unknown"));
        assert!(html.contains("<th>octo/demo</th>"));
        assert!(html.contains("<th>2024</th>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("<th>1 repo</th>"));
        assert!(html.contains("<td>100.0%</td>"));
    }

    #[test]
    fn test_report_requires_models() {
        let db = Database::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert!(write_report(&db, &dir.path().join("out.html")).is_err());
    }
}
