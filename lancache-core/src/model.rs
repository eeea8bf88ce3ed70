//! Shared data model for the log processor, PICS crawler, state store, and
//! cache eraser. Field names are `snake_case` here and mapped to the
//! on-disk/DB casing at the persistence boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cache status recorded by the edge proxy for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheStatus {
    Hit,
    Miss,
    Expired,
    Updating,
    Stale,
    Bypass,
    Revalidated,
    Unknown,
}

impl CacheStatus {
    /// Parses the third quoted field after the response size. Unrecognized
    /// or missing tokens fall back to `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "HIT" => CacheStatus::Hit,
            "MISS" => CacheStatus::Miss,
            "EXPIRED" => CacheStatus::Expired,
            "UPDATING" => CacheStatus::Updating,
            "STALE" => CacheStatus::Stale,
            "BYPASS" => CacheStatus::Bypass,
            "REVALIDATED" => CacheStatus::Revalidated,
            _ => CacheStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Expired => "EXPIRED",
            CacheStatus::Updating => "UPDATING",
            CacheStatus::Stale => "STALE",
            CacheStatus::Bypass => "BYPASS",
            CacheStatus::Revalidated => "REVALIDATED",
            CacheStatus::Unknown => "UNKNOWN",
        }
    }

    /// Whether this status counts as a cache hit for byte accounting
    /// purposes (HIT and REVALIDATED both avoid a full origin fetch).
    pub fn is_hit_like(&self) -> bool {
        matches!(self, CacheStatus::Hit | CacheStatus::Revalidated)
    }
}

/// Parsed representation of one proxy log line (ingest-time only; not
/// persisted as its own entity — see `LogEntryRecord`).
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub service: String,
    pub url: String,
    pub status_code: i32,
    pub bytes_served: i64,
    pub cache_status: CacheStatus,
    pub depot_id: Option<u32>,
}

/// A contiguous transfer by one client for one service (+depot for Steam).
#[derive(Debug, Clone)]
pub struct Download {
    pub id: i64,
    pub service: String,
    pub client_ip: String,
    pub depot_id: Option<u32>,
    pub game_app_id: Option<u32>,
    pub game_name: Option<String>,
    pub game_image_url: Option<String>,
    pub last_url: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub cache_hit_bytes: i64,
    pub cache_miss_bytes: i64,
    pub is_active: bool,
}

/// One row per parsed log line, foreign-keyed to its `Download`. Stored
/// verbatim; no deduplication is performed.
#[derive(Debug, Clone)]
pub struct LogEntryRecord {
    pub id: i64,
    pub download_id: i64,
    pub timestamp: DateTime<Utc>,
    pub client_ip: String,
    pub service: String,
    pub url: String,
    pub status_code: i32,
    pub bytes_served: i64,
    pub cache_status: CacheStatus,
    pub depot_id: Option<u32>,
}

/// Aggregated per-`client_ip` counters.
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub client_ip: String,
    pub total_hit_bytes: i64,
    pub total_miss_bytes: i64,
    pub last_seen: Option<DateTime<Utc>>,
    pub total_downloads: i64,
}

/// Aggregated per-`service` counters, same shape as `ClientStats`.
#[derive(Debug, Clone, Default)]
pub struct ServiceStats {
    pub service: String,
    pub total_hit_bytes: i64,
    pub total_miss_bytes: i64,
    pub last_seen: Option<DateTime<Utc>>,
    pub total_downloads: i64,
}

/// Where a `SteamDepotMapping` row was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingSource {
    Pics,
    Json,
    Realtime,
    PostProcess,
}

impl MappingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingSource::Pics => "pics",
            MappingSource::Json => "json",
            MappingSource::Realtime => "realtime",
            MappingSource::PostProcess => "post_process",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pics" => Some(MappingSource::Pics),
            "json" => Some(MappingSource::Json),
            "realtime" => Some(MappingSource::Realtime),
            "post_process" => Some(MappingSource::PostProcess),
            _ => None,
        }
    }
}

/// `(depot_id, app_id)` pair. A depot may map to multiple apps; exactly one
/// carries `is_owner = true`.
#[derive(Debug, Clone)]
pub struct SteamDepotMapping {
    pub depot_id: u32,
    pub app_id: u32,
    pub app_name: Option<String>,
    pub source: MappingSource,
    pub is_owner: bool,
    pub discovered_at: DateTime<Utc>,
}

/// Status of a cache-clear operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum CacheClearStatus {
    Preparing,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Delete semantics for the cache eraser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    Preserve,
    Full,
    Rsync,
}

impl Default for DeleteMode {
    fn default() -> Self {
        DeleteMode::Preserve
    }
}

/// A finished or in-flight erase operation, persisted in `AppState`. The
/// cancel handle is ephemeral and lives only in the running process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheClearOperation {
    pub id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: CacheClearStatus,
    pub message: String,
    pub directories_processed: u32,
    pub total_directories: u32,
    pub bytes_deleted: u64,
    pub files_deleted: u64,
    pub percent_complete: f64,
    pub error: Option<String>,
}

impl CacheClearOperation {
    pub fn new(id: String, start_time: DateTime<Utc>) -> Self {
        Self {
            id,
            start_time,
            end_time: None,
            status: CacheClearStatus::Preparing,
            message: String::new(),
            directories_processed: 0,
            total_directories: 256,
            bytes_deleted: 0,
            files_deleted: 0,
            percent_complete: 0.0,
            error: None,
        }
    }
}

/// Generic keyed mini-state blob with a 24-hour TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationState {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    /// Free-form payload; unknown shapes round-trip verbatim.
    pub data: serde_json::Value,
}

impl OperationState {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.kind == "log_processing"
            && self.status == "processing"
            && now.signed_duration_since(self.created_at) > chrono::Duration::hours(24)
    }
}

/// Authentication mode for the PICS crawler's Steam session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SteamAuthMode {
    Anonymous,
    Authenticated,
}

impl Default for SteamAuthMode {
    fn default() -> Self {
        SteamAuthMode::Anonymous
    }
}

/// Steam credentials. `refresh_token` and `guard_data` are encrypted at
/// rest (see `crate::state::crypto`); this struct holds the plaintext form
/// used in memory once decrypted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SteamAuth {
    pub mode: SteamAuthMode,
    pub username: Option<String>,
    pub refresh_token: Option<String>,
    pub guard_data: Option<String>,
    pub last_authenticated: Option<DateTime<Utc>>,
}

/// Snapshot of the currently running (or most recently completed) PICS
/// crawl, resumable across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DepotProcessingState {
    pub active: bool,
    pub status: String,
    pub total_apps: u64,
    pub apps_processed: u64,
    pub total_depots_found: u64,
    /// Apps still to be processed — persisted so a crawl can resume.
    pub remaining_apps: Vec<u32>,
    pub last_change_number: u32,
    pub last_scan_was_forced: bool,
}

/// Log-processing cursor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogProcessingState {
    pub position: u64,
}

/// The single consolidated, atomically-written state document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppState {
    pub log_processing: LogProcessingState,
    pub depot_processing: DepotProcessingState,
    pub cache_clear_operations: Vec<CacheClearOperation>,
    pub operation_states: Vec<OperationState>,
    pub setup_completed: bool,
    pub last_pics_crawl: Option<DateTime<Utc>>,
    pub crawl_interval_hours: f64,
    pub crawl_incremental_mode: bool,
    pub has_data_loaded: bool,
    pub last_data_mapping_count: u64,
    pub steam_auth: SteamAuth,
    pub last_updated: DateTime<Utc>,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            log_processing: LogProcessingState::default(),
            depot_processing: DepotProcessingState::default(),
            cache_clear_operations: Vec::new(),
            operation_states: Vec::new(),
            setup_completed: false,
            last_pics_crawl: None,
            crawl_interval_hours: 1.0,
            crawl_incremental_mode: true,
            has_data_loaded: false,
            last_data_mapping_count: 0,
            steam_auth: SteamAuth::default(),
            last_updated: Utc::now(),
        }
    }
}

/// One depot's entry in the PICS JSON snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PicsJsonDepotEntry {
    pub app_ids: Vec<u32>,
    pub app_names: Vec<String>,
    pub owner_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PicsJsonMetadata {
    pub last_updated: DateTime<Utc>,
    pub last_change_number: u32,
    pub total_depots: usize,
    pub total_apps: usize,
}

/// Authoritative on-disk snapshot of all depot mappings, used as a fallback
/// source of truth when the database is empty or sparse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PicsJsonData {
    pub metadata: PicsJsonMetadata,
    pub depot_mappings: HashMap<String, PicsJsonDepotEntry>,
}

impl PicsJsonData {
    pub fn new() -> Self {
        Self {
            metadata: PicsJsonMetadata {
                last_updated: Utc::now(),
                last_change_number: 0,
                total_depots: 0,
                total_apps: 0,
            },
            depot_mappings: HashMap::new(),
        }
    }

    /// Looks up the owning app for a depot: the explicit `owner_id` if
    /// present, else the first app id recorded.
    pub fn resolve_owner(&self, depot_id: u32) -> Option<(u32, Option<String>)> {
        let entry = self.depot_mappings.get(&depot_id.to_string())?;
        let owner = entry.owner_id.or_else(|| entry.app_ids.first().copied())?;
        let idx = entry.app_ids.iter().position(|id| *id == owner);
        let name = idx.and_then(|i| entry.app_names.get(i)).cloned();
        Some((owner, name))
    }
}

impl Default for PicsJsonData {
    fn default() -> Self {
        Self::new()
    }
}
