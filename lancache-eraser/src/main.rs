//! lancache-eraser - standalone cache-wipe worker process.
//!
//! Launched on demand by the daemon (or any host) to delete the 256 hex
//! shards under a lancache cache root. Runs to completion or until it
//! observes a cancel marker file, at which point it polls it between
//! shards and exits with status "cancelled" rather than treating that as
//! a failure.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use lancache_core::cache_eraser;
use lancache_core::model::DeleteMode;

const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, ValueEnum)]
enum DeleteModeArg {
    Preserve,
    Full,
    Rsync,
}

impl From<DeleteModeArg> for DeleteMode {
    fn from(value: DeleteModeArg) -> Self {
        match value {
            DeleteModeArg::Preserve => DeleteMode::Preserve,
            DeleteModeArg::Full => DeleteMode::Full,
            DeleteModeArg::Rsync => DeleteMode::Rsync,
        }
    }
}

/// Standalone lancache cache-wipe worker.
#[derive(Parser)]
#[command(name = "lancache-eraser", about = "Deletes the 256-shard lancache cache fan-out", version)]
struct Args {
    /// Root of the cache fan-out (expects 256 two-hex-digit shard directories).
    cache_root: PathBuf,

    /// Worker thread count, clamped to 1-16.
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// How aggressively to delete shard contents.
    #[arg(short, long, value_enum, default_value_t = DeleteModeArg::Preserve)]
    mode: DeleteModeArg,

    /// Where to write the atomically-rewritten progress document.
    #[arg(short, long)]
    progress_path: PathBuf,

    /// Path polled for a cancel marker; its presence cancels the run between shards.
    #[arg(long, default_value = "cancel_processing.marker")]
    cancel_marker: PathBuf,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("lancache_eraser={level}").parse().unwrap())
        .add_directive(format!("lancache_core={level}").parse().unwrap());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    info!(
        cache_root = %args.cache_root.display(),
        threads = args.threads,
        "lancache-eraser starting"
    );

    let cancel = Arc::new(AtomicBool::new(false));
    let poll_cancel = Arc::clone(&cancel);
    let marker_path = args.cancel_marker.clone();
    thread::spawn(move || {
        while !poll_cancel.load(Ordering::SeqCst) {
            if marker_path.exists() {
                info!("cancel marker observed, requesting shutdown");
                poll_cancel.store(true, Ordering::SeqCst);
                break;
            }
            thread::sleep(CANCEL_POLL_INTERVAL);
        }
    });

    let result = cache_eraser::run(
        &args.cache_root,
        args.threads,
        args.mode.into(),
        &args.progress_path,
        cancel,
    );

    match result {
        Ok(progress) => {
            info!(
                status = %progress.status,
                directories_processed = progress.directories_processed,
                bytes_deleted = progress.bytes_deleted,
                "cache erase finished"
            );
            if progress.status == "cancelled" {
                // Cancellation is a success path, not a failure.
                std::process::exit(0);
            }
        }
        Err(e) => {
            error!(error = %e, "cache erase failed");
            std::process::exit(1);
        }
    }
}
