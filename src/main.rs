mod config;
mod db;
mod extract;
mod fetch;
mod formatting;
mod github;
mod pipeline;
mod report;
mod tasks;
#[cfg(test)]
mod testing;
mod transform;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use config::{ConfigFile, Overrides, PipelineConfig, DEFAULT_CONFIG_PATH};
use db::Database;
use formatting::{format_count, format_duration, truncate_str};
use github::GitHubClient;
use pipeline::{RunMode, RunSummary};
use tasks::{TaskGraph, TaskStatus};

/// Exit status of a run where some repositories failed
const DEGRADED_EXIT_CODE: i32 = 2;

#[derive(Parser)]
#[command(name = "stargaze")]
#[command(about = "Load GitHub stargazers into SQLite and report on them")]
#[command(after_help = "\x1b[36mExamples:\x1b[0m
  stargaze run --mode backfill    # Rebuild the store from full history
  stargaze run                    # Fetch stars newer than the watermarks
  stargaze pipeline               # Extract, transform and render the report")]
struct Cli {
    /// Path to the JSON config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Database file (overrides the config file)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract stargazers and merge them into the store
    Run {
        /// Run mode (default: from config, else incremental)
        #[arg(short, long, value_enum)]
        mode: Option<RunMode>,

        /// Number of repositories fetched in parallel (default: min(repos, 5))
        #[arg(short, long)]
        workers: Option<usize>,

        /// Fetch and report counts without writing to the store
        #[arg(long)]
        dry_run: bool,
    },
    /// Rebuild the aggregation tables
    Transform,
    /// Render the HTML dashboard
    Report {
        /// Output file (default: from config)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run extract/load, transform and report in order
    Pipeline {
        #[arg(short, long, value_enum)]
        mode: Option<RunMode>,

        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Show row counts and watermarks
    Stats,
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("stargaze=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stargaze=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let degraded = match cli.command {
        Some(Commands::Run { mode, workers, dry_run }) => {
            let file = ConfigFile::load(&cli.config)?;
            let overrides = Overrides {
                mode,
                workers,
                db_path: cli.db,
            };
            let config = PipelineConfig::build(&file, config::github_token(), &overrides)?;
            if dry_run {
                dry_run_extract(&config).await?
            } else {
                extract_and_load(&config).await?
            }
        }
        Some(Commands::Transform) => {
            let file = load_optional_config(&cli.config)?;
            let db_path = cli.db.unwrap_or(file.settings.db_path);
            run_transform(&db_path)?;
            false
        }
        Some(Commands::Report { output }) => {
            let file = load_optional_config(&cli.config)?;
            let db_path = cli.db.unwrap_or(file.settings.db_path);
            let output = output.unwrap_or(file.settings.report_path);
            render_report(&db_path, &output)?;
            false
        }
        Some(Commands::Pipeline { mode, workers }) => {
            let file = ConfigFile::load(&cli.config)?;
            let overrides = Overrides {
                mode,
                workers,
                db_path: cli.db,
            };
            let config = PipelineConfig::build(&file, config::github_token(), &overrides)?;
            run_pipeline(&config, &file.settings.report_path).await?
        }
        Some(Commands::Stats) => {
            let file = load_optional_config(&cli.config)?;
            let db_path = cli.db.unwrap_or(file.settings.db_path);
            show_stats(&db_path)?;
            false
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            eprintln!();
            std::process::exit(0);
        }
    };

    if degraded {
        std::process::exit(DEGRADED_EXIT_CODE);
    }
    Ok(())
}

/// Stages that only read the store can run without a config file
fn load_optional_config(path: &Path) -> Result<ConfigFile> {
    if path.exists() {
        ConfigFile::load(path)
    } else {
        Ok(ConfigFile::empty())
    }
}

fn build_client(config: &PipelineConfig) -> Result<GitHubClient> {
    GitHubClient::new(
        config.token.clone(),
        config.graphql_url.clone(),
        config.retry.clone(),
        config.request_timeout,
    )
}

/// Run extract/load and print the summary; returns whether the run was degraded
async fn extract_and_load(config: &PipelineConfig) -> Result<bool> {
    let client = build_client(config)?;
    eprintln!(
        "\x1b[36m..\x1b[0m {} run over {} repos ({} workers)",
        config.mode,
        config.repos.len(),
        config.workers
    );

    let summary = pipeline::run(config, &client).await?;
    print_summary(&summary);
    Ok(summary.is_degraded())
}

/// Fetch without touching the store
async fn dry_run_extract(config: &PipelineConfig) -> Result<bool> {
    let client = build_client(config)?;

    let watermarks = match config.mode {
        RunMode::Incremental if config.db_path.exists() => Database::open(&config.db_path)?.watermarks()?,
        _ => HashMap::new(),
    };

    eprintln!(
        "\x1b[36m..\x1b[0m Dry run ({}) over {} repos, nothing will be written",
        config.mode,
        config.repos.len()
    );

    let deadline = config.run_timeout.map(|t| tokio::time::Instant::now() + t);
    let outcome = fetch::extract_all(
        &client,
        &config.repos,
        config.mode.direction(),
        &watermarks,
        config.page_size,
        config.workers,
        deadline,
    )
    .await;

    let mut extracts: Vec<_> = outcome.extracts.iter().collect();
    extracts.sort_by_key(|e| e.repo.full_name());
    for extract in extracts {
        eprintln!(
            "  \x1b[32mok\x1b[0m {:<40} {:>8} stars  {:>4} pages  ({})",
            truncate_str(&extract.repo.full_name(), 40),
            format_count(extract.events.len()),
            extract.pages,
            extract.stop.as_str()
        );
    }
    for failure in &outcome.failures {
        eprintln!("  \x1b[31mx\x1b[0m {} - {}", failure.repo, failure.cause);
    }
    let users: HashSet<i64> = outcome.events().map(|e| e.user_id).collect();
    eprintln!(
        "\x1b[32mok\x1b[0m Would merge {} events from {} distinct users",
        format_count(outcome.event_count()),
        format_count(users.len())
    );

    Ok(!outcome.failures.is_empty())
}

fn print_summary(summary: &RunSummary) {
    eprintln!();
    eprintln!("\x1b[36mRun Summary\x1b[0m ({})\n", summary.mode);

    for repo in &summary.succeeded {
        eprintln!(
            "  \x1b[32mok\x1b[0m {:<40} +{:<6} pages={:<4} yielded={:<6} stop={:<9} \x1b[90mwatermark={}\x1b[0m",
            truncate_str(&repo.repo, 40),
            format_count(repo.merge.inserted),
            repo.pages,
            format_count(repo.yielded),
            repo.stop.as_str(),
            repo.watermark
                .as_ref()
                .map(db::to_db_ts)
                .unwrap_or_else(|| "-".to_string())
        );
    }
    for failure in &summary.failed {
        eprintln!("  \x1b[31mx\x1b[0m  {} - {}", failure.repo, failure.cause);
    }

    eprintln!();
    eprintln!("  \x1b[90mRows before:\x1b[0m   {}", format_count(summary.rows_before));
    eprintln!("  \x1b[90mRows after:\x1b[0m    {}", format_count(summary.rows_after));
    eprintln!("  \x1b[90mNew rows:\x1b[0m      {}", format_count(summary.new_rows()));
    eprintln!("  \x1b[90mRows merged:\x1b[0m   {}", format_count(summary.rows_merged()));
    eprintln!("  \x1b[90mDuration:\x1b[0m      {}", format_duration(summary.duration));

    if summary.is_degraded() {
        eprintln!(
            "\n\x1b[33m..\x1b[0m Degraded run: {} of {} repos failed",
            summary.failed.len(),
            summary.failed.len() + summary.succeeded.len()
        );
    } else {
        eprintln!("\n\x1b[32mok\x1b[0m All {} repos loaded", summary.succeeded.len());
    }
}

fn run_transform(db_path: &Path) -> Result<()> {
    let mut db = Database::open(db_path)?;
    for (model, rows) in transform::run_models(&mut db)? {
        eprintln!("\x1b[32mok\x1b[0m Built {} ({} rows)", model, format_count(rows));
    }
    Ok(())
}

fn render_report(db_path: &Path, output: &Path) -> Result<()> {
    let db = Database::open(db_path)?;
    let dashboard = report::write_report(&db, output)?;
    eprintln!(
        "\x1b[32mok\x1b[0m Saved {} ({} stargazers)",
        output.display(),
        format_count(dashboard.users.len())
    );
    Ok(())
}

/// extract_and_load -> transform -> report; returns whether the run was degraded
async fn run_pipeline(config: &PipelineConfig, report_path: &Path) -> Result<bool> {
    let degraded_flag = Cell::new(false);
    let degraded = &degraded_flag;

    let outcomes = TaskGraph::new()
        .task("extract_and_load", &[], move || async move {
            degraded.set(extract_and_load(config).await?);
            Ok(())
        })?
        .task("transform", &["extract_and_load"], move || async move {
            run_transform(&config.db_path)
        })?
        .task("report", &["transform"], move || async move {
            render_report(&config.db_path, report_path)
        })?
        .run()
        .await;

    eprintln!();
    let mut failed = false;
    for outcome in &outcomes {
        match &outcome.status {
            TaskStatus::Succeeded => eprintln!(
                "  \x1b[32mok\x1b[0m {:<18} {}",
                outcome.name,
                format_duration(outcome.duration)
            ),
            TaskStatus::Failed(cause) => {
                failed = true;
                eprintln!("  \x1b[31mx\x1b[0m  {:<18} {}", outcome.name, cause);
            }
            TaskStatus::Skipped { blocked_by } => eprintln!(
                "  \x1b[33m..\x1b[0m {:<18} skipped ({} did not succeed)",
                outcome.name, blocked_by
            ),
        }
    }

    if failed {
        anyhow::bail!("pipeline failed");
    }
    Ok(degraded_flag.get())
}

fn show_stats(db_path: &Path) -> Result<()> {
    let db = Database::open(db_path)?;
    let total = db.count_rows()?;
    let by_repo = db.count_rows_by_repo()?;
    let watermarks = db.watermarks()?;

    eprintln!("\x1b[36mStore Statistics\x1b[0m ({})\n", db.path().display());
    eprintln!("  \x1b[90mTotal stars:\x1b[0m     {}", format_count(total));
    eprintln!("  \x1b[90mRepositories:\x1b[0m    {}", by_repo.len());
    match db.last_extracted_at()? {
        Some(at) => eprintln!(
            "  \x1b[90mLast refresh:\x1b[0m    {}",
            report::format_refresh(&at.with_timezone(&chrono::Local))
        ),
        None => eprintln!("  \x1b[90mLast refresh:\x1b[0m    never"),
    }

    if by_repo.is_empty() {
        eprintln!("\n  \x1b[33mTip:\x1b[0m Run: stargaze run --mode backfill");
        return Ok(());
    }

    eprintln!();
    for (repo, count) in &by_repo {
        let watermark = watermarks
            .get(repo)
            .map(db::to_db_ts)
            .unwrap_or_else(|| "-".to_string());
        eprintln!(
            "  {:<40} {:>8}  \x1b[90m{}\x1b[0m",
            truncate_str(repo, 40),
            format_count(*count),
            watermark
        );
    }
    Ok(())
}
