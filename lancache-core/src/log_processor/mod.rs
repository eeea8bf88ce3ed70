//! Log Processor: tails a growing proxy access log, turns lines into
//! Downloads/stats, and runs the active-download sweeper alongside it.

pub mod parser;
pub mod resolver;
pub mod sessionizer;
pub mod sweeper;
pub mod tailer;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::db::Database;
use crate::events::EventSink;
use crate::model::LogEntry;
use crate::pics::json_store::PicsJsonStore;
use crate::state::StateStore;
use tailer::FileTailer;

const POLL_INTERVAL: Duration = Duration::from_secs(2);
const POST_SWEEP_BATCH: u32 = 200;

/// Result of one `drain_available` call.
struct DrainOutcome {
    lines_read: usize,
    /// `true` if a batch failed to commit and draining stopped early.
    stalled: bool,
}

/// Drives the tailer/parser/sessionizer loop for one log file. Owns its own
/// `Database` connection, matching the one-connection-per-thread convention
/// used across the engines (`rusqlite::Connection` is `Send`, not `Sync`).
pub struct LogProcessor {
    db: Database,
    json_store: PicsJsonStore,
    state: Arc<StateStore>,
    events: Arc<dyn EventSink>,
    tailer: FileTailer,
    bulk_marker_path: PathBuf,
    parse_failure_count: AtomicU64,
}

impl LogProcessor {
    pub fn new(
        log_path: PathBuf,
        db: Database,
        json_store: PicsJsonStore,
        state: Arc<StateStore>,
        events: Arc<dyn EventSink>,
    ) -> std::io::Result<Self> {
        let start_offset = state.log_position();
        let bulk_marker_path = state.data_dir().join("bulk_process.marker");
        let tailer = FileTailer::new(log_path, start_offset)?;
        Ok(Self {
            db,
            json_store,
            state,
            events,
            tailer,
            bulk_marker_path,
            parse_failure_count: AtomicU64::new(0),
        })
    }

    /// Runs until `cancel` is raised, polling for new log data every
    /// `POLL_INTERVAL` at EOF.
    pub fn run(&mut self, cancel: &AtomicBool) {
        while !cancel.load(Ordering::SeqCst) {
            let bulk_mode = self.bulk_marker_path.exists();
            if bulk_mode && self.state.log_position() != 0 {
                info!("bulk-processing marker present, resetting cursor to start of log");
                self.tailer.reset_to_start();
                self.state.set_log_position(0);
            }

            match self.drain_available(bulk_mode) {
                Ok(outcome) if outcome.lines_read == 0 => {
                    if bulk_mode {
                        self.finish_bulk_replay();
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                Ok(outcome) if outcome.stalled => {
                    // A batch failed to commit partway through this read;
                    // back off before retrying the same bytes instead of
                    // hot-looping against a database that's still failing.
                    thread::sleep(POLL_INTERVAL);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "log tail read failed");
                    thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    fn finish_bulk_replay(&self) {
        if std::fs::remove_file(&self.bulk_marker_path).is_ok() {
            info!("bulk replay complete, running depot-mapping sweep");
            self.run_post_process_sweep();
        }
    }

    /// Reads and commits everything currently available. `bulk` suppresses
    /// inline depot resolution and realtime events. Stops early, without
    /// draining further, if a batch fails to commit partway through.
    fn drain_available(&mut self, bulk: bool) -> std::io::Result<DrainOutcome> {
        let mut total = 0usize;
        loop {
            let lines = self.tailer.read_new_lines()?;
            if lines.is_empty() {
                return Ok(DrainOutcome { lines_read: total, stalled: false });
            }
            total += lines.len();
            if !self.ingest_lines(lines, bulk) {
                return Ok(DrainOutcome { lines_read: total, stalled: true });
            }
        }
    }

    /// Parses and commits one chunk of raw lines, advancing the log cursor
    /// no further than what actually committed. Returns `false` if a batch
    /// failed partway through, so the caller stops draining for this tick
    /// instead of reading ahead of an unresolved failure.
    fn ingest_lines(&mut self, lines: Vec<(String, u64)>, bulk: bool) -> bool {
        let full_extent = lines.last().map(|(_, offset)| *offset).unwrap_or_else(|| self.state.log_position());

        let mut entries: Vec<(LogEntry, u64)> = Vec::with_capacity(lines.len());
        for (line, end_offset) in &lines {
            if parser::should_drop(line) {
                continue;
            }
            match parser::parse_line(line) {
                Ok(Some(entry)) => entries.push((entry, *end_offset)),
                Ok(None) => {}
                Err(failure) => self.log_parse_failure(&failure),
            }
        }

        let realtime = !bulk;
        let mut committed_through = self.state.log_position();
        for batch in group_into_batches(&entries) {
            let batch_end_offset = batch.last().map(|(_, offset)| *offset).unwrap_or(committed_through);
            let batch_entries: Vec<LogEntry> = batch.into_iter().map(|(entry, _)| entry).collect();
            match sessionizer::commit_batch(&self.db, &batch_entries, realtime, self.events.as_ref(), &self.json_store) {
                Ok(_) => committed_through = batch_end_offset,
                Err(e) => {
                    // Roll the cursor back to the end of the last batch that
                    // did commit, so this batch (and anything read after it
                    // in this chunk) is replayed on the next poll instead of
                    // being skipped once a later read succeeds.
                    warn!(error = %e, "batch commit failed, skipping");
                    self.state.set_log_position(committed_through);
                    self.tailer.seek_to(committed_through);
                    return false;
                }
            }
        }

        // Every batch in this chunk committed: safe to advance past the
        // whole thing, including trailing lines that were dropped or
        // produced no entry.
        self.state.set_log_position(full_extent);
        self.tailer.seek_to(full_extent);
        true
    }

    fn log_parse_failure(&self, failure: &parser::ParseFailure) {
        let count = self.parse_failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count <= 100 || count % 10_000 == 0 {
            warn!(reason = failure.reason, line = %failure.line, count, "failed to parse log line");
        }
    }

    /// After a bulk replay, resolves every Download left with a known depot
    /// but no resolved app, logging progress every `POST_SWEEP_BATCH` rows
    /// processed.
    fn run_post_process_sweep(&self) {
        let mut processed = 0u64;
        loop {
            let unresolved = match self.db.find_unresolved_downloads(POST_SWEEP_BATCH) {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(error = %e, "post-process sweep query failed");
                    return;
                }
            };
            if unresolved.is_empty() {
                break;
            }
            for (download_id, depot_id) in unresolved {
                match resolver::resolve(&self.db, &self.json_store, depot_id) {
                    Ok(Some((app_id, app_name))) => {
                        if let Err(e) = self
                            .db
                            .set_download_resolution(download_id, app_id, app_name.as_deref(), None)
                        {
                            warn!(error = %e, download_id, "failed to persist resolved depot mapping");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(error = %e, download_id, "depot resolution lookup failed"),
                }
                processed += 1;
                if processed % 10 == 0 {
                    self.events.emit(
                        "BulkResolutionProgress",
                        serde_json::json!({ "processed": processed }),
                    );
                }
            }
        }
    }
}

/// Splits a run of parsed entries into consecutive same-`(client_ip,
/// service)` batches, preserving log order. Each entry carries the byte
/// offset of the line it came from, so a caller can persist the cursor up
/// to exactly the last entry in a successfully committed batch.
fn group_into_batches(entries: &[(LogEntry, u64)]) -> Vec<Vec<(LogEntry, u64)>> {
    let mut batches: Vec<Vec<(LogEntry, u64)>> = Vec::new();
    for entry in entries {
        match batches.last_mut() {
            Some(batch)
                if batch[0].0.client_ip == entry.0.client_ip && batch[0].0.service == entry.0.service =>
            {
                batch.push(entry.clone());
            }
            _ => batches.push(vec![entry.clone()]),
        }
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RingBufferEventSink;
    use std::io::Write;

    fn line(client_ip: &str, service: &str, depot: u32, bytes: u32, cache: &str) -> String {
        format!(
            r#"[{service}] {client_ip} - - - [22/Aug/2025:22:30:06 +0000] "GET /depot/{depot}/chunk/x HTTP/1.1" 200 {bytes} "-" "ua" "{cache}" "host" "-""#
        )
    }

    fn setup() -> (tempfile::TempDir, PathBuf, Database, PicsJsonStore, Arc<StateStore>) {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("access.log");
        std::fs::write(&log_path, "").unwrap();
        let db = Database::open_in_memory().unwrap();
        let json_store = PicsJsonStore::new(dir.path());
        struct NoKey;
        impl crate::state::ApiKeySource for NoKey {
            fn get_or_create_api_key(&self) -> Vec<u8> {
                b"test-key".to_vec()
            }
        }
        let state = Arc::new(StateStore::new(dir.path(), Box::new(NoKey)));
        (dir, log_path, db, json_store, state)
    }

    #[test]
    fn group_into_batches_splits_on_key_change() {
        let e1 = parser::parse_line(&line("10.0.0.5", "steam", 1, 100, "HIT")).unwrap().unwrap();
        let e2 = parser::parse_line(&line("10.0.0.5", "steam", 1, 200, "HIT")).unwrap().unwrap();
        let e3 = parser::parse_line(&line("10.0.0.6", "steam", 1, 300, "HIT")).unwrap().unwrap();
        let batches = group_into_batches(&[(e1, 10), (e2, 20), (e3, 30)]);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
        assert_eq!(batches[0].last().unwrap().1, 20);
        assert_eq!(batches[1].last().unwrap().1, 30);
    }

    #[test]
    fn realtime_ingest_creates_a_download_from_a_fresh_log_line() {
        let (_dir, log_path, db, json_store, state) = setup();
        let events: Arc<dyn EventSink> = Arc::new(RingBufferEventSink::new(10));
        let mut processor =
            LogProcessor::new(log_path.clone(), db, json_store, state.clone(), events).unwrap();

        let mut f = std::fs::OpenOptions::new().append(true).open(&log_path).unwrap();
        writeln!(f, "{}", line("10.0.0.9", "steam", 730, 1024, "HIT")).unwrap();
        drop(f);

        let outcome = processor.drain_available(false).unwrap();
        assert_eq!(outcome.lines_read, 1);
        assert!(!outcome.stalled);
        assert_eq!(state.log_position(), std::fs::metadata(&log_path).unwrap().len());

        let download = processor
            .db
            .find_active_download("10.0.0.9", "steam", Some(730))
            .unwrap()
            .unwrap();
        assert_eq!(download.cache_hit_bytes, 1024);
    }

    #[test]
    fn bulk_mode_skips_inline_resolution_and_events() {
        let (_dir, log_path, db, json_store, state) = setup();
        let sink = Arc::new(RingBufferEventSink::new(10));
        let events: Arc<dyn EventSink> = sink.clone();
        db.upsert_depot_mapping(730, 999, Some("Test Game"), crate::model::MappingSource::Pics, true, chrono::Utc::now())
            .unwrap();
        let mut processor =
            LogProcessor::new(log_path.clone(), db, json_store, state, events).unwrap();

        let mut f = std::fs::OpenOptions::new().append(true).open(&log_path).unwrap();
        writeln!(f, "{}", line("10.0.0.9", "steam", 730, 1024, "HIT")).unwrap();
        drop(f);

        processor.drain_available(true).unwrap();

        let download = processor
            .db
            .find_active_download("10.0.0.9", "steam", Some(730))
            .unwrap()
            .unwrap();
        assert!(download.game_app_id.is_none());
        assert!(sink.events().is_empty());
    }

    #[test]
    fn parse_failures_are_counted_and_sampled() {
        let (_dir, log_path, db, json_store, state) = setup();
        let events: Arc<dyn EventSink> = Arc::new(RingBufferEventSink::new(10));
        let processor = LogProcessor::new(log_path, db, json_store, state, events).unwrap();

        processor.log_parse_failure(&parser::ParseFailure {
            line: "garbage".to_string(),
            reason: "too few fields",
        });
        assert_eq!(processor.parse_failure_count.load(Ordering::SeqCst), 1);
    }
}
