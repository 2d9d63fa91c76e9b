//! alarm-relay - posts new AlertMobile alarm log entries to Slack.
//!
//! This is the binary entry point. See the `alarm_relay` library for the
//! poll loop and its components.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use alarm_relay::constants;
use alarm_relay::notifier::slack::fetch_user_map;
use alarm_relay::{
    AlertMobileClient, AlertMobileExtractor, Config, DedupStore, EventExtractor, HealthSignal,
    MentionPolicy, MessageFormatter, PollLoop, Portal, SlackNotifier, SystemClock,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;

/// mimalloc keeps the long-running process's footprint flat.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Global flag for signal-triggered shutdown (as Arc for signal-hook compatibility)
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(name = "alarm-relay")]
#[command(version, about = "Relays AlertMobile alarm log entries to Slack")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the portal and publish new entries until stopped (default)
    Run,
    /// Log in once and print the current entries, oldest first
    Fetch,
    /// Exit 0 if the health file was touched recently, 1 otherwise
    CheckHealth {
        /// Maximum age of the health file in seconds
        #[arg(long)]
        max_age: Option<u64>,
        /// Health file to check (defaults to HEALTH_FILE)
        #[arg(long)]
        file: Option<PathBuf>,
    },
}

fn run() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    log::info!(
        "Starting alarm-relay v{} for customer {}",
        env!("CARGO_PKG_VERSION"),
        config.customer_number
    );

    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;

    let health = HealthSignal::new(config.health_file.clone());
    health.init()?;

    let store = DedupStore::open(&config.state_file).context("Failed to open dedup store")?;
    log::info!(
        "Dedup store {} holds {} identities",
        store.path().display(),
        store.len()
    );

    let http = reqwest::blocking::Client::builder()
        .timeout(constants::HTTP_REQUEST_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;
    let users = fetch_user_map(
        &http,
        constants::SLACK_USERS_LIST_URL,
        config.slack_bearer.as_deref(),
    );
    let formatter = MessageFormatter::new(MentionPolicy::new(&config.no_mention_users, users));
    let notifier = SlackNotifier::with_client(
        http,
        &config.webhook_url,
        formatter,
        config.blocks_workaround,
    );

    let portal = AlertMobileClient::new(
        &config.portal_url,
        config.credentials(),
        Some(config.session_ttl),
    )?;

    let mut poll_loop = PollLoop::new(
        portal,
        AlertMobileExtractor,
        notifier,
        SystemClock,
        store,
        health,
        config.loop_settings(),
    );
    poll_loop.run(&SHUTDOWN_FLAG);

    log::info!("Shutting down...");
    Ok(())
}

fn fetch_once() -> Result<()> {
    let config = Config::from_env().context("Failed to load configuration")?;
    let portal = AlertMobileClient::new(
        &config.portal_url,
        config.credentials(),
        Some(config.session_ttl),
    )?;

    let mut session = portal
        .ensure_session(None, chrono::Utc::now())
        .context("Failed to log in to the portal")?;
    let page = portal
        .fetch(&mut session, constants::LISTING_PATH)
        .context("Failed to fetch the alarm listing")?;
    let events = AlertMobileExtractor
        .parse(&page)
        .context("Failed to parse the alarm listing")?;

    for event in &events {
        println!("{event}");
    }
    log::info!("{} events listed", events.len());
    Ok(())
}

fn check_health(max_age: Option<u64>, file: Option<PathBuf>) -> ExitCode {
    let path = file.or_else(|| {
        std::env::var("HEALTH_FILE")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from)
    });
    let Some(path) = path else {
        eprintln!("No health file configured (set HEALTH_FILE or pass --file)");
        return ExitCode::FAILURE;
    };

    let threshold = max_age
        .map(Duration::from_secs)
        .unwrap_or(constants::HEALTH_STALENESS_THRESHOLD);
    let health = HealthSignal::new(Some(path.clone()));
    match health.age() {
        Some(age) if age < threshold => {
            println!("healthy: {} touched {}s ago", path.display(), age.as_secs());
            ExitCode::SUCCESS
        }
        Some(age) => {
            println!(
                "unhealthy: {} touched {}s ago (limit {}s)",
                path.display(),
                age.as_secs(),
                threshold.as_secs()
            );
            ExitCode::FAILURE
        }
        None => {
            println!("unhealthy: {} is missing", path.display());
            ExitCode::FAILURE
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(),
        Commands::Fetch => fetch_once(),
        Commands::CheckHealth { max_age, file } => return check_health(max_age, file),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
