//! Rule validator (tally-rv)
//!
//! Static analysis over stored vendor rules. Writes a JSON report and a text
//! summary. Exits 1 when critical issues are found so it can gate CI, and 2
//! when validation itself could not run.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tally_ce::db::SqliteStore;
use tally_ce::rule_validator::{self, write_reports, RuleReport, EXIT_TOOL_ERROR};
use tally_ce::store::RuleSource;
use tally_ce::taxonomy::taxonomy;
use tally_common::config::TomlConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tally-rv")]
#[command(about = "Validate vendor categorization rules")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "TALLY_CONFIG")]
    config: Option<PathBuf>,

    /// Only analyze rules of this organization
    #[arg(long)]
    org: Option<String>,

    /// Directory for rule_validation.json / rule_validation.txt
    #[arg(long, default_value = "reports")]
    output_dir: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match tally_common::config::load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("tally-rv: Failed to load configuration: {}", e);
            return ExitCode::from(EXIT_TOOL_ERROR);
        }
    };

    tracing_subscriber::registry()
        .with(tally_ce::config::log_filter(&config))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match validate(&args, &config).await {
        Ok(report) => {
            print!("{}", report.summary());
            ExitCode::from(report.exit_code())
        }
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Rule validation could not run");
            eprintln!("tally-rv: {:#}", e);
            ExitCode::from(EXIT_TOOL_ERROR)
        }
    }
}

async fn validate(args: &Args, config: &TomlConfig) -> Result<RuleReport> {
    let pool = tally_common::db::init_database_pool(&config.database_path())
        .await
        .context("Failed to open database")?;
    let store = SqliteStore::new(pool);

    let listing = store
        .list_all_vendor_rules(args.org.as_deref())
        .await
        .context("Failed to load vendor rules")?;

    let scope = match &args.org {
        Some(org) => format!("organization {}", org),
        None => "all organizations".to_string(),
    };
    let report = rule_validator::analyze_listing(&listing, taxonomy(), &scope);

    write_reports(&report, &args.output_dir).context("Failed to write reports")?;
    Ok(report)
}
