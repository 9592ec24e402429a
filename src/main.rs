mod apply;
mod browser;
mod config;
mod db;
mod mail;
mod models;
mod sites;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use browser::Browser;
use config::Config;
use db::Database;
use mail::{MailClient, MailConfig};
use sites::title_qualifies;

#[derive(Parser)]
#[command(name = "harrier")]
#[command(about = "Job-alert triage: extract listings from alert emails and automate easy-apply")]
struct Cli {
    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Fetch job-alert emails and store extracted listings
    Fetch {
        /// Number of days to look back (defaults to email_check_age_days)
        #[arg(short, long)]
        days: Option<u32>,

        /// Show what would be stored without storing
        #[arg(long)]
        dry_run: bool,
    },

    /// Drive the browser through pending easy-apply listings
    Apply,

    /// Full pass: fetch then apply, gated by config flags
    Run {
        /// Show what would be stored without storing (fetch phase only)
        #[arg(long)]
        dry_run: bool,
    },

    /// List stored listings
    List {
        /// Only listings still eligible for application
        #[arg(long)]
        pending: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        // Setup faults and unrecovered errors land here with their full chain.
        error!("fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    let db = Database::open(config.database_path.clone())?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Fetch { days, dry_run } => {
            db.ensure_initialized()?;
            fetch_listings(&db, &config, days, dry_run)?;
        }

        Commands::Apply => {
            db.ensure_initialized()?;
            apply_pending(&db, &config).await?;
        }

        Commands::Run { dry_run } => {
            db.ensure_initialized()?;
            if config.find_new_jobs {
                fetch_listings(&db, &config, None, dry_run)?;
            } else {
                info!("find_new_jobs disabled, skipping fetch");
            }
            if config.apply_for_jobs {
                apply_pending(&db, &config).await?;
            } else {
                info!("apply_for_jobs disabled, skipping apply");
            }
        }

        Commands::List { pending } => {
            db.ensure_initialized()?;
            let jobs = if pending {
                let sites = config.sites();
                let senders: Vec<&str> = sites.iter().map(|s| s.alert_email()).collect();
                db.fetch_unapplied(&senders, config.max_apply_retries)?
            } else {
                db.list_jobs()?
            };
            print_jobs(&jobs);
        }
    }

    Ok(())
}

/// One triage pass: query the mailbox for every session site, sort messages
/// to their adapters, extract, filter titles, store with dedup.
fn fetch_listings(db: &Database, config: &Config, days: Option<u32>, dry_run: bool) -> Result<()> {
    let sites = config.sites();
    let filters = config.keyword_filters();
    let senders: Vec<&str> = sites.iter().map(|s| s.alert_email()).collect();

    let password_path = expand_tilde(&config.imap_password_file);
    let mail_config = MailConfig::from_password_file(
        &config.imap_server,
        config.imap_port,
        &config.imap_username,
        &password_path,
    )
    .context("Failed to build mail credentials")?;
    let client = MailClient::new(mail_config);

    let days = days.unwrap_or(config.email_check_age_days);
    info!(days, "searching for job alerts");
    let (messages, stats) = client.fetch_alerts(&senders, days)?;

    let mut total_inserted = 0;
    let mut total_kept = 0;
    for site in sites {
        let mut listings = Vec::new();
        for message in &messages {
            if site.combined_filter(message, &filters) {
                listings.extend(site.extract(message));
            }
        }
        let considered = listings.len();
        listings.retain(|job| title_qualifies(&job.title, &filters));
        info!(
            site = site.name(),
            considered,
            kept = listings.len(),
            discarded = considered - listings.len(),
            "title filter applied"
        );
        total_kept += listings.len();

        if dry_run {
            for job in &listings {
                println!(
                    "[DRY RUN] Would store: {} at {} ({})",
                    job.title,
                    job.company.as_deref().unwrap_or("Unknown"),
                    job.source_name
                );
            }
        } else {
            total_inserted += db.save_listings(&listings)?;
        }
    }

    println!("\nResults:");
    println!("  Emails found:  {}", stats.emails_found);
    println!("  Listings kept: {}", total_kept);
    println!("  New rows:      {}", total_inserted);
    if stats.parse_errors > 0 {
        println!("  Parse errors:  {}", stats.parse_errors);
    }
    if dry_run {
        println!("\n(Dry run - nothing was stored)");
    }
    Ok(())
}

/// One apply pass over the automatable session sites. The browser session is
/// released on every exit path, including a failed run.
async fn apply_pending(db: &Database, config: &Config) -> Result<()> {
    let sites = config.sites();
    let settings = apply::ApplySettings {
        max_retries: config.max_apply_retries,
        max_per_run: config.max_applications_per_run,
        cooldown_seconds: config.apply_cooldown_seconds,
    };

    let browser = Browser::launch(
        &config.webdriver_url,
        config.headless,
        config.driver_wait_seconds,
    )
    .await
    .context("Failed to start browser session")?;

    let outcome = apply::run(db, &browser, &sites, &settings).await;
    let quit = browser.quit().await;
    let summary = outcome?;
    quit.context("Failed to close browser session")?;

    println!("\nApply results:");
    println!("  Attempted: {}", summary.attempted);
    println!("  Applied:   {}", summary.applied);
    println!("  Closed:    {}", summary.closed);
    println!("  Skipped:   {}", summary.skipped);
    println!("  Failed:    {}", summary.failed);
    Ok(())
}

fn print_jobs(jobs: &[models::StoredJob]) {
    if jobs.is_empty() {
        println!("No listings found.");
        return;
    }
    println!(
        "{:<6} {:<26} {:<30} {:<18} {:>8} {:<20}",
        "ID", "SOURCE", "TITLE", "LOCATION", "TRIES", "APPLIED"
    );
    println!("{}", "-".repeat(112));
    for job in jobs {
        println!(
            "{:<6} {:<26} {:<30} {:<18} {:>8} {:<20}",
            job.id,
            truncate(&job.source_name, 24),
            truncate(&job.title, 28),
            truncate(job.location.as_deref().unwrap_or("-"), 16),
            job.apply_attempts,
            truncate(job.applied_timestamp.as_deref().unwrap_or("-"), 19),
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max.saturating_sub(3)])
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = std::env::var("HOME").unwrap_or_default();
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}
