//! lancached - LancacheManager core data-plane daemon.
//!
//! Tails a growing proxy access log into sessioned Downloads, sweeps stale
//! active sessions, and keeps a PICS depot/app mapping fresh on a schedule.
//! Cache erasure is exposed separately by the `lancache-eraser` binary,
//! launched on demand by a host process rather than run continuously here.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use lancache_core::events::ChannelEventSink;
use lancache_core::pics::session::{Credentials, SteamSession};
use lancache_core::state::{ApiKeySource, StateStore};
use lancache_core::supervisor::Supervisor;

/// LancacheManager core data-plane daemon.
#[derive(Parser)]
#[command(name = "lancached", about = "LancacheManager log processor and PICS crawler", version)]
struct Args {
    /// Directory holding state.json, the PICS JSON snapshot, and the SQLite database.
    #[arg(short, long, default_value = "./data")]
    data_dir: String,

    /// Path to the proxy access log to tail.
    #[arg(short, long, default_value = "/var/log/lancache/access.log")]
    log_path: String,

    /// SQLite database filename, resolved relative to --data-dir.
    #[arg(long, default_value = "lancache.db")]
    db_file: String,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber. Default level is INFO; `-q` restricts
/// to errors, `-v`/`-vv` raise verbosity.
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("lancached={level}").parse().unwrap())
        .add_directive(format!("lancache_core={level}").parse().unwrap());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Reads the Steam API credentials' encryption key from the environment,
/// generating and caching a local one when absent. A production deployment
/// typically delegates this to a secrets manager; this is the baseline a
/// standalone daemon falls back to.
struct EnvOrFileApiKey {
    path: PathBuf,
}

impl ApiKeySource for EnvOrFileApiKey {
    fn get_or_create_api_key(&self) -> Vec<u8> {
        if let Ok(key) = std::env::var("LANCACHE_STATE_KEY") {
            return key.into_bytes();
        }
        if let Ok(existing) = std::fs::read(&self.path) {
            if !existing.is_empty() {
                return existing;
            }
        }
        let mut key = vec![0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), key.as_mut_slice());
        if let Err(e) = std::fs::write(&self.path, &key) {
            warn!(error = %e, "failed to persist generated state encryption key");
        }
        key
    }
}

/// No real Steam-network crate exists in this workspace's dependency
/// ecosystem (see `pics::session` doc comment); until one is wired in, the
/// daemon runs the PICS crawler against a session that reports itself as
/// permanently unreachable rather than silently producing empty results.
struct UnavailableSteamSession;

impl SteamSession for UnavailableSteamSession {
    fn connect(&mut self) -> lancache_core::pics::session::SessionResult<()> {
        Err(lancache_core::pics::session::SessionError::ConnectTimeout)
    }

    fn disconnect(&mut self, _intentional: bool) {}

    fn logon_anonymous(&mut self) -> lancache_core::pics::session::SessionResult<()> {
        Err(lancache_core::pics::session::SessionError::NotConnected)
    }

    fn logon_with_token(&mut self, _credentials: &Credentials) -> lancache_core::pics::session::SessionResult<()> {
        Err(lancache_core::pics::session::SessionError::NotConnected)
    }

    fn is_logged_on(&self) -> bool {
        false
    }

    fn get_app_list(&mut self) -> lancache_core::pics::session::SessionResult<Vec<u32>> {
        Err(lancache_core::pics::session::SessionError::NotConnected)
    }

    fn get_changes_since(
        &mut self,
        _since: u32,
    ) -> lancache_core::pics::session::SessionResult<lancache_core::pics::session::ChangesSince> {
        Err(lancache_core::pics::session::SessionError::NotConnected)
    }

    fn get_access_tokens(
        &mut self,
        _app_ids: &[u32],
    ) -> lancache_core::pics::session::SessionResult<std::collections::HashMap<u32, u64>> {
        Err(lancache_core::pics::session::SessionError::NotConnected)
    }

    fn get_product_info(
        &mut self,
        _requests: &[lancache_core::pics::session::ProductInfoRequest],
    ) -> lancache_core::pics::session::SessionResult<lancache_core::pics::session::ProductInfoBatch> {
        Err(lancache_core::pics::session::SessionError::NotConnected)
    }

    fn current_change_number(&mut self) -> lancache_core::pics::session::SessionResult<u32> {
        Err(lancache_core::pics::session::SessionError::NotConnected)
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    info!("lancached {} ({}) starting", env!("CARGO_PKG_VERSION"), lancache_core::git_sha());
    info!(data_dir = %args.data_dir, log_path = %args.log_path, "config");

    let data_dir = PathBuf::from(&args.data_dir);
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        warn!(error = %e, "failed to create data directory, continuing anyway");
    }

    let key_source = EnvOrFileApiKey {
        path: data_dir.join("state.key"),
    };
    let state = Arc::new(StateStore::new(&data_dir, Box::new(key_source)));

    let (sink, events_rx) = ChannelEventSink::new(256);
    let events: Arc<dyn lancache_core::events::EventSink> = Arc::new(sink);
    // The event channel is drained by whatever UI/API host embeds this
    // binary's library crate. A standalone daemon has no such consumer, so
    // it just logs what would otherwise have been delivered.
    std::thread::spawn(move || {
        while let Ok(event) = events_rx.recv() {
            info!(event = %event.name, "engine event");
        }
    });

    let db_path = data_dir.join(&args.db_file);
    let log_path = PathBuf::from(&args.log_path);

    let mut supervisor = match Supervisor::new(
        db_path,
        log_path,
        data_dir,
        Arc::clone(&state),
        events,
        UnavailableSteamSession,
    ) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize supervisor");
            std::process::exit(1);
        }
    };

    if let Err(e) = supervisor.start() {
        tracing::error!(error = %e, "failed to start engines");
        std::process::exit(1);
    }
    info!("log processor, sweeper, and crawl scheduler running");

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        info!("received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }

    info!("shutting down");
    supervisor.stop();
    info!("lancached stopped");
}
