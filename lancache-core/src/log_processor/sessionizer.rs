//! Turns a batch of same-`(client_ip, service)` log entries into a
//! Download session, rollup stat updates, and per-line records. One call
//! per batch; batches are formed sequentially from the tail so a
//! Download's counters are never touched concurrently.

use chrono::{DateTime, Duration, Utc};

use crate::db::{Database, DbResult};
use crate::events::EventSink;
use crate::model::LogEntry;
use crate::pics::json_store::PicsJsonStore;

const SESSION_IDLE_GAP: Duration = Duration::minutes(5);

pub struct BatchOutcome {
    pub download_id: i64,
    pub is_new_download: bool,
    pub hit_bytes: i64,
    pub miss_bytes: i64,
}

/// Commits one batch of entries sharing `(client_ip, service)`. `realtime`
/// controls both depot resolution (looked up inline only in realtime mode)
/// and whether a `DownloadUpdate` event is emitted afterward.
pub fn commit_batch(
    db: &Database,
    entries: &[LogEntry],
    realtime: bool,
    events: &dyn EventSink,
    json_store: &PicsJsonStore,
) -> DbResult<Option<BatchOutcome>> {
    let Some(first) = entries.first() else {
        return Ok(None);
    };
    let client_ip = first.client_ip.clone();
    let service = first.service.clone();

    let hit_bytes: i64 = entries
        .iter()
        .filter(|e| e.cache_status.is_hit_like())
        .map(|e| e.bytes_served)
        .sum();
    let miss_bytes: i64 = entries
        .iter()
        .filter(|e| !e.cache_status.is_hit_like())
        .map(|e| e.bytes_served)
        .sum();
    let batch_start = entries.iter().map(|e| e.timestamp).min().unwrap();
    let batch_end = entries.iter().map(|e| e.timestamp).max().unwrap();
    let last_url = entries.last().map(|e| e.url.as_str());
    let batch_depot_id = entries.iter().rev().find_map(|e| e.depot_id);

    let depot_known = service == "steam" && batch_depot_id.is_some();

    let (download_id, is_new_download) = if depot_known {
        resolve_depot_session(db, &client_ip, &service, batch_depot_id, batch_start)?
    } else {
        resolve_plain_session(db, &client_ip, &service, batch_start)?
    };

    db.extend_download(download_id, batch_end, last_url, hit_bytes, miss_bytes, batch_depot_id)?;

    db.upsert_client_stats(&client_ip, hit_bytes, miss_bytes, batch_end, is_new_download)?;
    db.upsert_service_stats(&service, hit_bytes, miss_bytes, batch_end, is_new_download)?;

    for entry in entries {
        db.insert_log_entry(
            download_id,
            entry.timestamp,
            &entry.client_ip,
            &entry.service,
            &entry.url,
            entry.status_code,
            entry.bytes_served,
            entry.cache_status,
            entry.depot_id,
        )?;
    }

    if realtime {
        if let Some(depot_id) = batch_depot_id {
            if let Some((app_id, app_name)) = db
                .find_depot_owner(depot_id)?
                .or_else(|| json_store.load().resolve_owner(depot_id))
            {
                db.set_download_resolution(download_id, app_id, app_name.as_deref(), None)?;
            }
        }
        events.emit(
            "DownloadUpdate",
            serde_json::json!({
                "download_id": download_id,
                "client_ip": client_ip,
                "service": service,
                "hit_bytes": hit_bytes,
                "miss_bytes": miss_bytes,
                "is_new_download": is_new_download,
            }),
        );
    }

    Ok(Some(BatchOutcome {
        download_id,
        is_new_download,
        hit_bytes,
        miss_bytes,
    }))
}

/// Steam-with-known-depot branch: prefers an already-active session, then
/// a recently-inactive one within the idle gap, before opening a new row.
fn resolve_depot_session(
    db: &Database,
    client_ip: &str,
    service: &str,
    depot_id: Option<u32>,
    batch_start: DateTime<Utc>,
) -> DbResult<(i64, bool)> {
    if let Some(active) = db.find_active_download(client_ip, service, depot_id)? {
        return Ok((active.id, false));
    }
    if let Some(inactive) = db.find_most_recent_inactive_download(client_ip, service, depot_id)? {
        if batch_start.signed_duration_since(inactive.end_time) <= SESSION_IDLE_GAP {
            db.reopen_and_extend_download(inactive.id, inactive.end_time, None, 0, 0, depot_id)?;
            // Reviving a recently-inactive session is deliberately NOT
            // counted as a new download, even though a row is "opened"
            // again from the caller's point of view.
            return Ok((inactive.id, false));
        }
    }
    let id = db.insert_download(service, client_ip, depot_id, batch_start, batch_start, None, 0, 0)?;
    Ok((id, true))
}

/// Non-Steam (or depot-unknown) branch: extends any active session for the
/// client regardless of depot, closing and reopening once the idle gap
/// is exceeded.
fn resolve_plain_session(
    db: &Database,
    client_ip: &str,
    service: &str,
    batch_start: DateTime<Utc>,
) -> DbResult<(i64, bool)> {
    if let Some(active) = db.find_active_download_any_depot(client_ip, service)? {
        if batch_start.signed_duration_since(active.end_time) <= SESSION_IDLE_GAP {
            return Ok((active.id, false));
        }
        db.close_download(active.id)?;
    }
    let id = db.insert_download(service, client_ip, None, batch_start, batch_start, None, 0, 0)?;
    Ok((id, true))
}
