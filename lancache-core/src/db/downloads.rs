//! Queries against the `Downloads` table: session lookup, open/extend/close,
//! and the depot-resolution sweep used by both realtime and bulk modes.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DbResult};
use crate::model::{CacheStatus, Download};

fn row_to_download(row: &Row) -> rusqlite::Result<Download> {
    Ok(Download {
        id: row.get(0)?,
        service: row.get(1)?,
        client_ip: row.get(2)?,
        depot_id: row.get::<_, Option<i64>>(3)?.map(|v| v as u32),
        game_app_id: row.get::<_, Option<i64>>(4)?.map(|v| v as u32),
        game_name: row.get(5)?,
        game_image_url: row.get(6)?,
        last_url: row.get(7)?,
        start_time: parse_ts(row.get::<_, String>(8)?),
        end_time: parse_ts(row.get::<_, String>(9)?),
        cache_hit_bytes: row.get(10)?,
        cache_miss_bytes: row.get(11)?,
        is_active: row.get::<_, i64>(12)? != 0,
    })
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap())
}

const SELECT_COLUMNS: &str = "id, service, client_ip, depot_id, game_app_id, game_name, \
     game_image_url, last_url, start_time, end_time, cache_hit_bytes, cache_miss_bytes, is_active";

impl Database {
    /// Finds the active Download for `(client_ip, service, depot_id)`.
    /// `depot_id` participates in the lookup key only for Steam sessions;
    /// non-Steam callers pass `None`.
    pub fn find_active_download(
        &self,
        client_ip: &str,
        service: &str,
        depot_id: Option<u32>,
    ) -> DbResult<Option<Download>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM Downloads \
             WHERE client_ip = ?1 AND service = ?2 AND is_active = 1 \
             AND depot_id IS ?3 ORDER BY id DESC LIMIT 1"
        );
        let result = self
            .connection()
            .query_row(&sql, params![client_ip, service, depot_id.map(|d| d as i64)], row_to_download)
            .optional()?;
        Ok(result)
    }

    /// Finds the most recently active Download for `(client_ip, service)`
    /// without constraining on depot — used for the non-Steam or
    /// depot-unknown branch of the sessionizer, where any still-active
    /// session for the pair should be extended regardless of the depot it
    /// was opened with.
    pub fn find_active_download_any_depot(
        &self,
        client_ip: &str,
        service: &str,
    ) -> DbResult<Option<Download>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM Downloads \
             WHERE client_ip = ?1 AND service = ?2 AND is_active = 1 \
             ORDER BY id DESC LIMIT 1"
        );
        let result = self
            .connection()
            .query_row(&sql, params![client_ip, service], row_to_download)
            .optional()?;
        Ok(result)
    }

    /// Finds the most recently closed Download for the same triple, used to
    /// decide whether a reopened session should be merged rather than
    /// started fresh.
    pub fn find_most_recent_inactive_download(
        &self,
        client_ip: &str,
        service: &str,
        depot_id: Option<u32>,
    ) -> DbResult<Option<Download>> {
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM Downloads \
             WHERE client_ip = ?1 AND service = ?2 AND is_active = 0 \
             AND depot_id IS ?3 ORDER BY end_time DESC LIMIT 1"
        );
        let result = self
            .connection()
            .query_row(&sql, params![client_ip, service, depot_id.map(|d| d as i64)], row_to_download)
            .optional()?;
        Ok(result)
    }

    pub fn insert_download(
        &self,
        service: &str,
        client_ip: &str,
        depot_id: Option<u32>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        last_url: Option<&str>,
        cache_hit_bytes: i64,
        cache_miss_bytes: i64,
    ) -> DbResult<i64> {
        self.connection().execute(
            "INSERT INTO Downloads \
             (service, client_ip, depot_id, last_url, start_time, end_time, \
              cache_hit_bytes, cache_miss_bytes, is_active) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)",
            params![
                service,
                client_ip,
                depot_id.map(|d| d as i64),
                last_url,
                start_time.to_rfc3339(),
                end_time.to_rfc3339(),
                cache_hit_bytes,
                cache_miss_bytes,
            ],
        )?;
        Ok(self.connection().last_insert_rowid())
    }

    /// Reopens a previously-closed Download (the recently-inactive session
    /// merge case), extends it with a fresh batch, and flips it active
    /// again.
    pub fn reopen_and_extend_download(
        &self,
        id: i64,
        end_time: DateTime<Utc>,
        last_url: Option<&str>,
        add_hit_bytes: i64,
        add_miss_bytes: i64,
        depot_id: Option<u32>,
    ) -> DbResult<()> {
        self.extend_download(id, end_time, last_url, add_hit_bytes, add_miss_bytes, depot_id)?;
        self.connection()
            .execute("UPDATE Downloads SET is_active = 1 WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn extend_download(
        &self,
        id: i64,
        end_time: DateTime<Utc>,
        last_url: Option<&str>,
        add_hit_bytes: i64,
        add_miss_bytes: i64,
        depot_id: Option<u32>,
    ) -> DbResult<()> {
        self.connection().execute(
            "UPDATE Downloads SET \
             end_time = ?1, \
             last_url = COALESCE(?2, last_url), \
             cache_hit_bytes = cache_hit_bytes + ?3, \
             cache_miss_bytes = cache_miss_bytes + ?4, \
             depot_id = COALESCE(depot_id, ?5) \
             WHERE id = ?6",
            params![
                end_time.to_rfc3339(),
                last_url,
                add_hit_bytes,
                add_miss_bytes,
                depot_id.map(|d| d as i64),
                id,
            ],
        )?;
        Ok(())
    }

    pub fn close_download(&self, id: i64) -> DbResult<()> {
        self.connection()
            .execute("UPDATE Downloads SET is_active = 0 WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Finds active Downloads idle past `cutoff`, capped at `limit` rows —
    /// the sweeper's batch unit, kept small so one tick never holds the
    /// connection for long.
    pub fn find_stale_active_downloads(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> DbResult<Vec<i64>> {
        let mut stmt = self.connection().prepare(
            "SELECT id FROM Downloads WHERE is_active = 1 AND end_time < ?1 \
             ORDER BY id LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(params![cutoff.to_rfc3339(), limit], |row| row.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    /// Closes a batch of stale Downloads by id in one statement.
    pub fn close_downloads(&self, ids: &[i64]) -> DbResult<()> {
        for id in ids {
            self.close_download(*id)?;
        }
        Ok(())
    }

    /// Downloads still missing a resolved app, for the post-process sweep.
    pub fn find_unresolved_downloads(&self, limit: u32) -> DbResult<Vec<(i64, u32)>> {
        let mut stmt = self.connection().prepare(
            "SELECT id, depot_id FROM Downloads \
             WHERE depot_id IS NOT NULL AND game_app_id IS NULL \
             ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], |row| {
                let id: i64 = row.get(0)?;
                let depot: i64 = row.get(1)?;
                Ok((id, depot as u32))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_download_resolution(
        &self,
        id: i64,
        app_id: u32,
        app_name: Option<&str>,
        game_image_url: Option<&str>,
    ) -> DbResult<()> {
        self.connection().execute(
            "UPDATE Downloads SET game_app_id = ?1, game_name = ?2, game_image_url = ?3 \
             WHERE id = ?4",
            params![app_id as i64, app_name, game_image_url, id],
        )?;
        Ok(())
    }

    pub fn insert_log_entry(
        &self,
        download_id: i64,
        timestamp: DateTime<Utc>,
        client_ip: &str,
        service: &str,
        url: &str,
        status_code: i32,
        bytes_served: i64,
        cache_status: CacheStatus,
        depot_id: Option<u32>,
    ) -> DbResult<i64> {
        self.connection().execute(
            "INSERT INTO LogEntries \
             (download_id, timestamp, client_ip, service, url, status_code, \
              bytes_served, cache_status, depot_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                download_id,
                timestamp.to_rfc3339(),
                client_ip,
                service,
                url,
                status_code,
                bytes_served,
                cache_status.as_str(),
                depot_id.map(|d| d as i64),
            ],
        )?;
        Ok(self.connection().last_insert_rowid())
    }
}
