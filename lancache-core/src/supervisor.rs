//! Owns the lifecycle of the background engines for one running daemon
//! instance: the log processor (with its sweeper) and the PICS crawl
//! scheduler. The cache eraser is launched on demand rather than run
//! continuously, since it is a bounded operation rather than a long-lived
//! background task.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use crate::cache_eraser;
use crate::db::{Database, DbError};
use crate::events::EventSink;
use crate::log_processor::{sweeper, LogProcessor};
use crate::model::{CacheClearOperation, CacheClearStatus, DeleteMode};
use crate::pics::json_store::PicsJsonStore;
use crate::pics::session::SteamSession;
use crate::pics::PicsCrawler;
use crate::state::StateStore;

const CRAWL_SCHEDULER_TICK: Duration = Duration::from_millis(500);
const CRAWL_SCHEDULER_POLL: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum SupervisorError {
    Db(DbError),
    Io(std::io::Error),
}

impl fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupervisorError::Db(e) => write!(f, "database error: {e}"),
            SupervisorError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for SupervisorError {}
impl From<DbError> for SupervisorError {
    fn from(e: DbError) -> Self {
        SupervisorError::Db(e)
    }
}
impl From<std::io::Error> for SupervisorError {
    fn from(e: std::io::Error) -> Self {
        SupervisorError::Io(e)
    }
}

/// Ties together one daemon instance's engines. Generic over `S` so tests
/// can drive the crawler with `FakeSteamSession` instead of a real network
/// client.
pub struct Supervisor<S: SteamSession + Send + 'static> {
    db_path: PathBuf,
    log_path: PathBuf,
    data_dir: PathBuf,
    state: Arc<StateStore>,
    events: Arc<dyn EventSink>,
    crawler: Arc<Mutex<PicsCrawler<S>>>,
    cancel: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl<S: SteamSession + Send + 'static> Supervisor<S> {
    pub fn new(
        db_path: PathBuf,
        log_path: PathBuf,
        data_dir: PathBuf,
        state: Arc<StateStore>,
        events: Arc<dyn EventSink>,
        session: S,
    ) -> Result<Self, SupervisorError> {
        let crawler_db = Database::open(&db_path)?;
        let crawler = PicsCrawler::new(crawler_db, data_dir.clone(), Arc::clone(&state), session);
        Ok(Self {
            db_path,
            log_path,
            data_dir,
            state,
            events,
            crawler: Arc::new(Mutex::new(crawler)),
            cancel: Arc::new(AtomicBool::new(false)),
            handles: Vec::new(),
        })
    }

    /// Starts the log processor, sweeper, and crawl scheduler threads, each
    /// on its own dedicated `std::thread::spawn` sharing one cooperative
    /// cancellation flag. Returns immediately.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        let log_db = Database::open(&self.db_path)?;
        let json_store = PicsJsonStore::new(self.data_dir.clone());
        let mut processor = LogProcessor::new(
            self.log_path.clone(),
            log_db,
            json_store,
            Arc::clone(&self.state),
            Arc::clone(&self.events),
        )?;
        let processor_cancel = Arc::clone(&self.cancel);
        self.handles
            .push(thread::spawn(move || processor.run(&processor_cancel)));

        let sweeper_db = Database::open(&self.db_path)?;
        let sweeper_cancel = Arc::clone(&self.cancel);
        self.handles
            .push(thread::spawn(move || sweeper::run(&sweeper_db, sweeper_cancel)));

        let crawler = Arc::clone(&self.crawler);
        let state = Arc::clone(&self.state);
        let crawl_cancel = Arc::clone(&self.cancel);
        self.handles
            .push(thread::spawn(move || run_crawl_scheduler(crawler, state, crawl_cancel)));

        Ok(())
    }

    /// Requests all background threads to stop and blocks until they exit.
    /// Cancels any in-flight PICS rebuild first so the crawler thread can
    /// unwind promptly instead of running a batch to completion.
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Ok(crawler) = self.crawler.lock() {
            crawler.cancel_handle().store(true, Ordering::SeqCst);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }

    /// Launches a cache-erase operation on a dedicated thread, tracking its
    /// progress in `AppState.cache_clear_operations`.
    pub fn run_cache_erase(
        &self,
        cache_root: PathBuf,
        thread_count: usize,
        delete_mode: DeleteMode,
        op_id: String,
    ) -> JoinHandle<()> {
        let progress_path = self.data_dir.join(format!("cache_clear_progress_{op_id}.json"));
        let state = Arc::clone(&self.state);
        let events = Arc::clone(&self.events);
        let cancel = Arc::new(AtomicBool::new(false));

        let mut operation = CacheClearOperation::new(op_id.clone(), Utc::now());
        operation.status = CacheClearStatus::Running;
        state.update_state(|s| s.cache_clear_operations.push(operation.clone()));

        let op_id_for_thread = op_id;
        thread::spawn(move || {
            let result = cache_eraser::run(&cache_root, thread_count, delete_mode, &progress_path, cancel);
            state.update_state(|s| {
                let Some(op) = s
                    .cache_clear_operations
                    .iter_mut()
                    .find(|o| o.id == op_id_for_thread)
                else {
                    return;
                };
                op.end_time = Some(Utc::now());
                match &result {
                    Ok(progress) => {
                        op.status = if progress.status == "cancelled" {
                            CacheClearStatus::Cancelled
                        } else {
                            CacheClearStatus::Completed
                        };
                        op.directories_processed = progress.directories_processed;
                        op.total_directories = progress.total_directories;
                        op.bytes_deleted = progress.bytes_deleted;
                        op.files_deleted = progress.files_deleted;
                        op.percent_complete = progress.percent_complete;
                        op.message = progress.message.clone();
                    }
                    Err(e) => {
                        op.status = CacheClearStatus::Failed;
                        op.error = Some(e.to_string());
                    }
                }
            });
            events.emit("CacheClearCompleted", serde_json::json!({ "op_id": op_id_for_thread }));
        })
    }
}

/// Polls every `CRAWL_SCHEDULER_TICK` (fine-grained, so `stop()` is
/// responsive) but only checks due-ness every `CRAWL_SCHEDULER_POLL`.
fn run_crawl_scheduler<S: SteamSession + Send + 'static>(
    crawler: Arc<Mutex<PicsCrawler<S>>>,
    state: Arc<StateStore>,
    cancel: Arc<AtomicBool>,
) {
    let mut since_last_check = CRAWL_SCHEDULER_POLL;
    while !cancel.load(Ordering::SeqCst) {
        if since_last_check >= CRAWL_SCHEDULER_POLL {
            since_last_check = Duration::ZERO;
            let current = state.get_state();
            let due = match current.last_pics_crawl {
                None => true,
                Some(last) => {
                    let elapsed = Utc::now().signed_duration_since(last);
                    elapsed.num_seconds() as f64 >= current.crawl_interval_hours * 3600.0
                }
            };
            if due {
                let mut crawler = crawler.lock().expect("crawler mutex poisoned");
                if !crawler.try_start_rebuild(current.crawl_incremental_mode) {
                    warn!("PICS crawl scheduler tick found a rebuild already active, skipping");
                }
            }
        }
        thread::sleep(CRAWL_SCHEDULER_TICK);
        since_last_check += CRAWL_SCHEDULER_TICK;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pics::session::FakeSteamSession;

    struct FixedKey;
    impl crate::state::ApiKeySource for FixedKey {
        fn get_or_create_api_key(&self) -> Vec<u8> {
            b"k".to_vec()
        }
    }

    #[test]
    fn start_and_stop_joins_all_engine_threads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("access.log"), "").unwrap();
        let state = Arc::new(StateStore::new(dir.path(), Box::new(FixedKey)));
        let events: Arc<dyn EventSink> = Arc::new(crate::events::NullEventSink);

        let mut supervisor = Supervisor::new(
            dir.path().join("lancache.db"),
            dir.path().join("access.log"),
            dir.path().to_path_buf(),
            state,
            events,
            FakeSteamSession::default(),
        )
        .unwrap();

        supervisor.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        supervisor.stop();
    }

    #[test]
    fn cache_erase_records_a_completed_operation() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("access.log"), "").unwrap();
        let cache_root = dir.path().join("cache");
        for i in 0..256 {
            std::fs::create_dir_all(cache_root.join(format!("{i:02x}"))).unwrap();
        }
        let state = Arc::new(StateStore::new(dir.path(), Box::new(FixedKey)));
        let events: Arc<dyn EventSink> = Arc::new(crate::events::NullEventSink);

        let supervisor = Supervisor::new(
            dir.path().join("lancache.db"),
            dir.path().join("access.log"),
            dir.path().to_path_buf(),
            Arc::clone(&state),
            events,
            FakeSteamSession::default(),
        )
        .unwrap();

        let handle = supervisor.run_cache_erase(cache_root, 2, DeleteMode::Preserve, "op-1".to_string());
        handle.join().unwrap();

        let ops = state.get_state().cache_clear_operations;
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].status, CacheClearStatus::Completed);
    }
}
