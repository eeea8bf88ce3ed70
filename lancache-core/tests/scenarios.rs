//! End-to-end scenario tests exercised against the crate's public API
//! rather than its internal unit-test fixtures, one per numbered scenario.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};

use lancache_core::cache_eraser;
use lancache_core::db::Database;
use lancache_core::events::RingBufferEventSink;
use lancache_core::log_processor::{parser, sessionizer, sweeper};
use lancache_core::model::{CacheStatus, DeleteMode};
use lancache_core::pics::json_store::PicsJsonStore;
use lancache_core::pics::session::{AppProductInfo, ChangesSince, DepotInfo, FakeSteamSession};
use lancache_core::pics::PicsCrawler;
use lancache_core::state::{ApiKeySource, StateStore};

struct FixedKey;
impl ApiKeySource for FixedKey {
    fn get_or_create_api_key(&self) -> Vec<u8> {
        b"scenario-test-key".to_vec()
    }
}

fn raw_line(client_ip: &str, depot: u32, bytes: u32, cache: &str) -> String {
    format!(
        r#"[steam] {client_ip} - - - [22/Aug/2025:22:30:06 +0000] "GET /depot/{depot}/chunk/abc HTTP/1.1" 200 {bytes} "-" "Valve/Steam" "{cache}" "cache.steamcontent.com" "-""#
    )
}

#[test]
fn s1_single_hit_steam() {
    let db = Database::open_in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = PicsJsonStore::new(dir.path());
    let sink = RingBufferEventSink::new(10);

    let entry = parser::parse_line(&raw_line("10.0.0.5", 835575, 524288, "HIT"))
        .unwrap()
        .unwrap();
    let outcome = sessionizer::commit_batch(&db, &[entry], true, &sink, &store)
        .unwrap()
        .unwrap();

    assert!(outcome.is_new_download);
    assert_eq!(outcome.hit_bytes, 524288);
    assert_eq!(outcome.miss_bytes, 0);

    let download = db.find_active_download("10.0.0.5", "steam", Some(835575)).unwrap().unwrap();
    assert_eq!(download.cache_hit_bytes, 524288);
    assert!(download.is_active);
}

#[test]
fn s2_session_extension_then_sweeper_close() {
    let db = Database::open_in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = PicsJsonStore::new(dir.path());
    let sink = RingBufferEventSink::new(10);
    let t0 = Utc.with_ymd_and_hms(2025, 8, 22, 22, 30, 0).unwrap();

    let mut first = parser::parse_line(&raw_line("10.0.0.5", 730, 1_048_576, "MISS")).unwrap().unwrap();
    first.timestamp = t0;
    let first_outcome = sessionizer::commit_batch(&db, &[first], true, &sink, &store).unwrap().unwrap();

    let mut second = parser::parse_line(&raw_line("10.0.0.5", 730, 2_097_152, "HIT")).unwrap().unwrap();
    second.timestamp = t0 + ChronoDuration::seconds(90);
    let second_outcome = sessionizer::commit_batch(&db, &[second], true, &sink, &store).unwrap().unwrap();

    assert_eq!(first_outcome.download_id, second_outcome.download_id);
    let download = db.find_active_download("10.0.0.5", "steam", Some(730)).unwrap().unwrap();
    assert_eq!(download.cache_hit_bytes, 2_097_152);
    assert_eq!(download.cache_miss_bytes, 1_048_576);

    // The sweeper's one-minute cutoff is relative to the wall clock, so a
    // Download left with a far-past `end_time` stands in for "90 seconds
    // of further real idleness" without the test sleeping for it.
    db.extend_download(download.id, t0 + ChronoDuration::seconds(90), None, 0, 0, None).unwrap();
    let closed = sweeper::sweep_once(&db).unwrap();
    assert_eq!(closed, 1);
    assert!(db.find_active_download("10.0.0.5", "steam", Some(730)).unwrap().is_none());
}

#[test]
fn s3_session_split_past_five_minute_gap() {
    let db = Database::open_in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = PicsJsonStore::new(dir.path());
    let sink = RingBufferEventSink::new(10);
    let t0 = Utc.with_ymd_and_hms(2025, 8, 22, 22, 30, 0).unwrap();

    let mut first = parser::parse_line(&raw_line("10.0.0.5", 730, 1_048_576, "MISS")).unwrap().unwrap();
    first.timestamp = t0;
    let first_outcome = sessionizer::commit_batch(&db, &[first], true, &sink, &store).unwrap().unwrap();
    db.close_download(first_outcome.download_id).unwrap();

    let mut second = parser::parse_line(&raw_line("10.0.0.5", 730, 2_097_152, "HIT")).unwrap().unwrap();
    second.timestamp = t0 + ChronoDuration::minutes(7);
    let second_outcome = sessionizer::commit_batch(&db, &[second], true, &sink, &store).unwrap().unwrap();

    assert!(second_outcome.is_new_download);
    assert_ne!(first_outcome.download_id, second_outcome.download_id);

    let closed_first = db.find_most_recent_inactive_download("10.0.0.5", "steam", Some(730)).unwrap();
    assert!(closed_first.is_none() || closed_first.unwrap().id != second_outcome.download_id);
}

#[test]
fn s4_depot_extraction_filter_for_filestreaming_urls() {
    assert_eq!(parser::extract_depot_id("/depot/123/filestreamingservice/files/abc"), Some(123));

    let db = Database::open_in_memory().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = PicsJsonStore::new(dir.path());
    let sink = RingBufferEventSink::new(10);

    let line = r#"[steam] 10.0.0.9 - - - [22/Aug/2025:22:30:06 +0000] "GET /depot/123/filestreamingservice/files/abc HTTP/1.1" 200 2048 "-" "Valve/Steam" "MISS" "cache.steamcontent.com" "-""#;
    let entry = parser::parse_line(line).unwrap().unwrap();
    assert!(entry.depot_id.is_none());

    sessionizer::commit_batch(&db, &[entry], true, &sink, &store).unwrap().unwrap();
    let download = db.find_active_download_any_depot("10.0.0.9", "steam").unwrap().unwrap();
    assert!(download.depot_id.is_none());
    assert!(download.game_app_id.is_none());
}

#[test]
fn s5_pics_incremental_with_forced_full() {
    let mut session = FakeSteamSession::default();
    session.current_change_number = 180_000;
    session.changes = ChangesSince {
        requires_full_app_update: true,
        ..Default::default()
    };
    session.app_list = vec![730];
    session.product_info.insert(
        730,
        AppProductInfo {
            app_id: 730,
            name: Some("Counter-Strike 2".to_string()),
            depots: vec![DepotInfo { depot_id: 731, owner_app_id: None }],
            dlc_app_ids: vec![],
        },
    );

    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().unwrap();
    let state = Arc::new(StateStore::new(dir.path(), Box::new(FixedKey)));
    state.update_state(|s| s.depot_processing.last_change_number = 100_000);

    let mut crawler = PicsCrawler::new(db, dir.path(), Arc::clone(&state), session);
    assert!(crawler.try_start_rebuild(true));

    let progress = crawler.get_progress();
    assert!(progress.last_scan_was_forced);
    assert_eq!(progress.last_change_number, 180_000);

    let final_state = state.get_state();
    assert!(final_state.has_data_loaded);
}

#[test]
fn s6_cache_eraser_cancellation_mid_run() {
    let dir = tempfile::tempdir().unwrap();
    let cache_root = dir.path().join("cache");
    for i in 0..256u32 {
        let shard = cache_root.join(format!("{i:02x}"));
        std::fs::create_dir_all(&shard).unwrap();
        std::fs::write(shard.join("chunk.bin"), vec![0u8; 1024]).unwrap();
    }

    let progress_path = dir.path().join("progress.json");
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_trigger = Arc::clone(&cancel);
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(5));
        cancel_trigger.store(true, Ordering::SeqCst);
    });

    let result = cache_eraser::run(&cache_root, 1, DeleteMode::Preserve, &progress_path, cancel).unwrap();

    assert_eq!(result.status, "cancelled");
    assert_eq!(result.total_directories, 256);
    assert!(result.directories_processed <= 256);
}

#[test]
fn cache_status_hit_classification_matches_log_grammar() {
    assert!(CacheStatus::Hit.is_hit_like());
    assert!(!CacheStatus::Miss.is_hit_like());
}
