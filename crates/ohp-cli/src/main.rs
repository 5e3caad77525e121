use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use ohp_core::{HarvestMode, SensitivityPolicy};
use ohp_planner::{range, report_recent_markdown, HarvestConfig, RunProfile};
use ohp_storage::PgFingerprintStore;

#[derive(Debug, Parser)]
#[command(name = "ohp")]
#[command(about = "Odds Harvest Planner command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Plan and run one incremental harvest.
    Harvest(HarvestArgs),
    /// Print the concrete dates or seasons a range expands to.
    Resolve {
        #[arg(long)]
        mode: HarvestMode,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
    /// Summarize the most recent harvest runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Apply fingerprint table migrations to DATABASE_URL.
    Migrate,
}

#[derive(Debug, Args)]
struct HarvestArgs {
    /// YAML run profile; flags below override its fields.
    #[arg(long)]
    profile: Option<PathBuf>,
    #[arg(long)]
    sport: Option<String>,
    #[arg(long)]
    mode: Option<HarvestMode>,
    #[arg(long, value_delimiter = ',')]
    leagues: Vec<String>,
    #[arg(long, value_delimiter = ',')]
    markets: Vec<String>,
    #[arg(long)]
    from: Option<String>,
    #[arg(long)]
    to: Option<String>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    sensitivity: Option<SensitivityPolicy>,
    #[arg(long = "match-link")]
    match_links: Vec<String>,
    /// Skip odds history; verdicts fall back to current odds only.
    #[arg(long, default_value_t = false)]
    preview: bool,
    #[arg(long)]
    max_pages: Option<u32>,
    #[arg(long)]
    target_bookmaker: Option<String>,
}

impl HarvestArgs {
    fn into_profile(self) -> Result<RunProfile> {
        let flags = RunProfile {
            sport: self.sport.unwrap_or_default(),
            mode: self.mode,
            leagues: self.leagues,
            markets: self.markets,
            from: self.from,
            to: self.to,
            concurrency: self.concurrency,
            sensitivity: self.sensitivity,
            match_links: self.match_links,
            preview: self.preview,
            max_pages: self.max_pages,
            target_bookmaker: self.target_bookmaker,
        };
        match self.profile {
            Some(path) => Ok(RunProfile::from_yaml_file(path)?.overlay(flags)),
            None => Ok(flags),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Harvest(args) => {
            let summary = ohp_planner::run_harvest_from_env(args.into_profile()?).await?;
            println!(
                "harvest complete: run_id={} units={}/{} new={} changed={} unchanged={} skip={:.1}% failed={} cancelled={}",
                summary.run_id,
                summary.succeeded_units,
                summary.planned_units,
                summary.new_count,
                summary.changed_count(),
                summary.unchanged_count,
                summary.skip_efficiency(),
                summary.failed_units.len(),
                summary.cancelled_units.len()
            );
            for warning in &summary.warnings {
                eprintln!("warning: {warning}");
            }
        }
        Commands::Resolve { mode, from, to } => {
            let today = Utc::now().date_naive();
            let resolved = range::resolve_tokens(from.as_deref(), to.as_deref(), mode, today)?;
            if resolved.unbounded_past() {
                println!("(open towards the past)");
            }
            for unit in resolved.units() {
                match unit {
                    ohp_core::RangeUnit::Date(date) => println!("{date}"),
                    ohp_core::RangeUnit::Season(season) => println!("{season}"),
                }
            }
            if resolved.unbounded_future() {
                println!("(open towards the future)");
            }
        }
        Commands::Report { runs } => {
            let config = HarvestConfig::from_env();
            println!("{}", report_recent_markdown(runs, &config.reports_dir)?);
        }
        Commands::Migrate => {
            let config = HarvestConfig::from_env();
            let Some(url) = config.database_url else {
                anyhow::bail!("DATABASE_URL is not set; the file fingerprint store needs no migration");
            };
            let store = PgFingerprintStore::connect(&url).await?;
            store.migrate().await?;
            println!("fingerprint migrations applied");
        }
    }

    Ok(())
}
