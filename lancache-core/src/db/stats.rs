//! Upserts for the `ClientStats` and `ServiceStats` rollup tables.

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{Database, DbResult};

impl Database {
    pub fn upsert_client_stats(
        &self,
        client_ip: &str,
        add_hit_bytes: i64,
        add_miss_bytes: i64,
        last_seen: DateTime<Utc>,
        new_download: bool,
    ) -> DbResult<()> {
        self.connection().execute(
            "INSERT INTO ClientStats (client_ip, total_hit_bytes, total_miss_bytes, last_seen, total_downloads) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(client_ip) DO UPDATE SET \
                total_hit_bytes = total_hit_bytes + excluded.total_hit_bytes, \
                total_miss_bytes = total_miss_bytes + excluded.total_miss_bytes, \
                last_seen = excluded.last_seen, \
                total_downloads = total_downloads + ?6",
            params![
                client_ip,
                add_hit_bytes,
                add_miss_bytes,
                last_seen.to_rfc3339(),
                if new_download { 1 } else { 0 },
                if new_download { 1 } else { 0 },
            ],
        )?;
        Ok(())
    }

    pub fn upsert_service_stats(
        &self,
        service: &str,
        add_hit_bytes: i64,
        add_miss_bytes: i64,
        last_seen: DateTime<Utc>,
        new_download: bool,
    ) -> DbResult<()> {
        self.connection().execute(
            "INSERT INTO ServiceStats (service, total_hit_bytes, total_miss_bytes, last_seen, total_downloads) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(service) DO UPDATE SET \
                total_hit_bytes = total_hit_bytes + excluded.total_hit_bytes, \
                total_miss_bytes = total_miss_bytes + excluded.total_miss_bytes, \
                last_seen = excluded.last_seen, \
                total_downloads = total_downloads + ?6",
            params![
                service,
                add_hit_bytes,
                add_miss_bytes,
                last_seen.to_rfc3339(),
                if new_download { 1 } else { 0 },
                if new_download { 1 } else { 0 },
            ],
        )?;
        Ok(())
    }
}
