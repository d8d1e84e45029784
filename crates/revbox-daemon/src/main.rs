use chrono::Local;
use clap::Parser;
use revbox_scheduler::{run_rollover, ExecutorConfig, QuarterHourExecutor};
use revbox_storage::ReviewStore;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "revbox-daemon", about = "Keeps review schedules current")]
struct Args {
    /// Path to the schedule database.
    #[arg(long)]
    db: PathBuf,
    /// Execution budget for one firing, in seconds.
    #[arg(long, default_value_t = 600)]
    budget_secs: u64,
    /// Run a single rollover pass and exit instead of staying resident.
    #[arg(long, default_value_t = false)]
    once: bool,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    if args.once {
        run_once(&args.db);
        return;
    }

    // Fail fast on an unopenable or incompatible database before arming
    // the timer.
    if let Err(err) = ReviewStore::open(&args.db) {
        error!(event = "store_open_failed", error = %err, db = %args.db.display());
        return;
    }

    let mut config = ExecutorConfig::new(args.db.clone());
    config.firing_budget = Duration::from_secs(args.budget_secs);
    let executor = QuarterHourExecutor::new(config);

    info!(event = "daemon_start", db = %args.db.display(), budget_secs = args.budget_secs);

    tokio::select! {
        _ = executor.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!(event = "daemon_shutdown");
        }
    }
}

fn run_once(db: &Path) {
    let mut store = match ReviewStore::open(db) {
        Ok(store) => store,
        Err(err) => {
            error!(event = "store_open_failed", error = %err, db = %db.display());
            return;
        }
    };

    let as_of = Local::now().date_naive();
    match run_rollover(&mut store, as_of) {
        Ok(report) => info!(
            event = "rollover_complete",
            as_of = %as_of,
            items_scanned = report.items_scanned,
            items_repaired = report.items_repaired,
            items_failed = report.items_failed,
            rows_shifted = report.rows_shifted,
        ),
        Err(err) => error!(event = "rollover_failed", error = %err),
    }
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("REVBOX_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
