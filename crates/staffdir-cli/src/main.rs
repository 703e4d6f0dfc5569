use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use staffdir_core::Table;
use staffdir_seed::{
    run_seed, run_verify, PipelineOptions, ReferenceCatalog, SeedConfig, StoreBackend,
};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "staffdir")]
#[command(about = "Seed, reset, and verify the construction staffing directory")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Populate the store from the catalog (the default command).
    Seed(SeedArgs),
    /// Audit the store against the catalog. Exits 1 when any check fails.
    /// Prints nothing; set RUST_LOG to get logs on stderr.
    Verify(StoreArgs),
    /// Validate a catalog and print what it would seed.
    Catalog {
        #[arg(long)]
        catalog: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct StoreArgs {
    /// YAML or JSON catalog; the built-in catalog when omitted.
    #[arg(long)]
    catalog: Option<PathBuf>,
    /// Overrides STAFFDIR_BACKEND.
    #[arg(long)]
    backend: Option<StoreBackend>,
}

#[derive(Debug, Default, Args)]
struct SeedArgs {
    #[command(flatten)]
    store: StoreArgs,
    /// Delete every seeded row before seeding.
    #[arg(long)]
    reset: bool,
    /// Audit the store after seeding.
    #[arg(long)]
    verify: bool,
    /// Fail when a fixture reference does not resolve.
    #[arg(long)]
    strict: bool,
    /// Write <dir>/<run_id>/seed_summary.json.
    #[arg(long)]
    report_dir: Option<PathBuf>,
}

/// Log level when RUST_LOG is unset. `verify` is silent unless asked.
fn default_log_filter(command: &Commands) -> &'static str {
    match command {
        Commands::Verify(_) => "off",
        Commands::Seed(_) | Commands::Catalog { .. } => "info",
    }
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_catalog(path: Option<&Path>) -> Result<ReferenceCatalog> {
    let catalog = match path {
        Some(path) => ReferenceCatalog::load(path)
            .with_context(|| format!("loading catalog {}", path.display()))?,
        None => ReferenceCatalog::builtin().context("loading built-in catalog")?,
    };
    catalog.validate().context("catalog failed validation")?;
    Ok(catalog)
}

fn load_config(backend: Option<StoreBackend>) -> Result<SeedConfig> {
    let config = SeedConfig::from_env().context("reading store configuration")?;
    Ok(match backend {
        Some(backend) => config.with_backend(backend),
        None => config,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Seed(SeedArgs::default()));
    init_tracing(default_log_filter(&command));

    match command {
        Commands::Seed(args) => {
            let catalog = load_catalog(args.store.catalog.as_deref())?;
            let config = load_config(args.store.backend)?;
            let options = PipelineOptions {
                reset: args.reset,
                verify: args.verify,
                strict: args.strict,
                ..PipelineOptions::default()
            };

            let summary = run_seed(&config, &catalog, options)
                .await
                .context("seed run failed")?;
            println!("seed complete: {}", summary.one_line());

            if let Some(dir) = &args.report_dir {
                let path = summary.write_to(dir).await?;
                info!(path = %path.display(), "wrote seed summary");
            }
            if let Some(report) = summary.verification.as_ref().filter(|r| !r.passed) {
                bail!(
                    "verification failed: {} of {} check(s)",
                    report.failures().count(),
                    report.checks.len()
                );
            }
        }
        Commands::Verify(args) => {
            let catalog = load_catalog(args.catalog.as_deref())?;
            let config = load_config(args.backend)?;
            let report = run_verify(&config, &catalog)
                .await
                .context("verification could not run")?;
            if !report.passed {
                warn!(failed = report.failures().count(), "store does not match the catalog");
                std::process::exit(1);
            }
            info!(checks = report.checks.len(), "store matches the catalog");
        }
        Commands::Catalog { catalog } => {
            let catalog = load_catalog(catalog.as_deref())?;
            println!("{}: {}", Table::Trades, catalog.trade_names().len());
            println!("{}: {}", Table::Regions, catalog.region_codes().len());
            println!("{}: {}", Table::Agencies, catalog.agencies.len());
            println!(
                "{}: {}",
                Table::AgencyCompliance,
                catalog.expected_compliance_records()
            );
            println!("{}: {}", Table::AgencyTrades, catalog.expected_trade_links());
            println!("{}: {}", Table::AgencyRegions, catalog.expected_region_links());
            println!("fingerprint: {}", catalog.fingerprint()?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_flags_parse() {
        let cli = Cli::try_parse_from([
            "staffdir", "seed", "--reset", "--verify", "--backend", "postgres", "--report-dir", "out",
        ])
        .expect("parse");
        let Some(Commands::Seed(args)) = cli.command else {
            panic!("expected seed");
        };
        assert!(args.reset && args.verify && !args.strict);
        assert_eq!(args.store.backend, Some(StoreBackend::Postgres));
        assert_eq!(args.report_dir, Some(PathBuf::from("out")));
    }

    #[test]
    fn bare_invocation_has_no_subcommand() {
        let cli = Cli::try_parse_from(["staffdir"]).expect("parse");
        assert!(cli.command.is_none());
        assert!(Cli::try_parse_from(["staffdir", "verify", "--backend", "mongo"]).is_err());
    }

    #[test]
    fn verify_logs_nothing_by_default() {
        let verify = Cli::try_parse_from(["staffdir", "verify"]).expect("parse");
        let command = verify.command.expect("verify command");
        assert_eq!(default_log_filter(&command), "off");
        assert_eq!(default_log_filter(&Commands::Seed(SeedArgs::default())), "info");
    }

    #[test]
    fn builtin_catalog_validates() {
        let catalog = load_catalog(None).expect("catalog");
        assert!(!catalog.agencies.is_empty());
    }
}
