//! One-time migration of legacy per-feature files into the consolidated
//! `AppState` document, and removal of stale `operation_states` entries.

use std::fs;
use std::path::Path;

use chrono::Utc;
use tracing::warn;

use crate::model::AppState;

/// Folds any legacy files found in `data_dir` into `state`, deleting each
/// one once its contents have been absorbed. Safe to call on every
/// startup: once the legacy files are gone this is a no-op.
pub fn migrate_legacy_files(state: &mut AppState, data_dir: &Path) {
    let position_path = data_dir.join("position.txt");
    if let Ok(raw) = fs::read_to_string(&position_path) {
        if let Ok(position) = raw.trim().parse::<u64>() {
            state.log_processing.position = position;
        } else {
            warn!(path = %position_path.display(), "legacy position.txt did not parse as u64");
        }
        let _ = fs::remove_file(&position_path);
    }

    let setup_path = data_dir.join("setup_completed.txt");
    if setup_path.exists() {
        state.setup_completed = true;
        let _ = fs::remove_file(&setup_path);
    }

    let crawl_path = data_dir.join("last_pics_crawl.txt");
    if let Ok(raw) = fs::read_to_string(&crawl_path) {
        if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(raw.trim()) {
            state.last_pics_crawl = Some(parsed.with_timezone(&Utc));
        } else {
            warn!(path = %crawl_path.display(), "legacy last_pics_crawl.txt did not parse as RFC3339");
        }
        let _ = fs::remove_file(&crawl_path);
    }

    let cache_clear_path = data_dir.join("cache_clear_status.json");
    if let Ok(raw) = fs::read_to_string(&cache_clear_path) {
        match serde_json::from_str(&raw) {
            Ok(ops) => state.cache_clear_operations = ops,
            Err(e) => warn!(error = %e, "legacy cache_clear_status.json failed to parse"),
        }
        let _ = fs::remove_file(&cache_clear_path);
    }

    let operation_states_path = data_dir.join("operation_states.json");
    if let Ok(raw) = fs::read_to_string(&operation_states_path) {
        match serde_json::from_str(&raw) {
            Ok(states) => state.operation_states = states,
            Err(e) => warn!(error = %e, "legacy operation_states.json failed to parse"),
        }
        let _ = fs::remove_file(&operation_states_path);
    }
}

/// Drops stale `log_processing` operation-state entries: any
/// `type="log_processing" ∧ status="processing"` entry older than 24h.
pub fn cleanup_stale_operations(state: &mut AppState) {
    let now = Utc::now();
    state.operation_states.retain(|op| !op.is_stale(now));
}
