//! `SteamDepotMappings` CRUD: `(depot_id, app_id)` rows with owner
//! semantics (exactly one owning app per depot).

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};

use super::{Database, DbResult};
use crate::model::{MappingSource, SteamDepotMapping};

impl Database {
    /// Upserts one `(depot_id, app_id)` mapping. `is_owner` is only ever
    /// promoted from false to true on conflict, never demoted, so a later
    /// write from a lower-priority source cannot steal ownership away from
    /// an already-established owner.
    pub fn upsert_depot_mapping(
        &self,
        depot_id: u32,
        app_id: u32,
        app_name: Option<&str>,
        source: MappingSource,
        is_owner: bool,
        discovered_at: DateTime<Utc>,
    ) -> DbResult<()> {
        self.connection().execute(
            "INSERT INTO SteamDepotMappings (depot_id, app_id, app_name, source, is_owner, discovered_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(depot_id, app_id) DO UPDATE SET \
                app_name = COALESCE(excluded.app_name, app_name), \
                is_owner = is_owner OR excluded.is_owner",
            params![
                depot_id,
                app_id,
                app_name,
                source.as_str(),
                is_owner,
                discovered_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Finds the owning app for a depot, following the DB's `is_owner` flag
    /// and falling back to the first-discovered row when no row is flagged
    /// owner yet.
    pub fn find_depot_owner(&self, depot_id: u32) -> DbResult<Option<(u32, Option<String>)>> {
        let owner = self
            .connection()
            .query_row(
                "SELECT app_id, app_name FROM SteamDepotMappings \
                 WHERE depot_id = ?1 AND is_owner = 1 LIMIT 1",
                params![depot_id],
                |row| Ok((row.get::<_, i64>(0)? as u32, row.get(1)?)),
            )
            .optional()?;
        if owner.is_some() {
            return Ok(owner);
        }
        let fallback = self
            .connection()
            .query_row(
                "SELECT app_id, app_name FROM SteamDepotMappings \
                 WHERE depot_id = ?1 ORDER BY discovered_at LIMIT 1",
                params![depot_id],
                |row| Ok((row.get::<_, i64>(0)? as u32, row.get(1)?)),
            )
            .optional()?;
        Ok(fallback)
    }

    pub fn list_depot_mappings(&self, depot_id: u32) -> DbResult<Vec<SteamDepotMapping>> {
        let mut stmt = self.connection().prepare(
            "SELECT depot_id, app_id, app_name, source, is_owner, discovered_at \
             FROM SteamDepotMappings WHERE depot_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![depot_id], |row| {
                let source_raw: String = row.get(3)?;
                let discovered_raw: String = row.get(5)?;
                Ok(SteamDepotMapping {
                    depot_id: row.get::<_, i64>(0)? as u32,
                    app_id: row.get::<_, i64>(1)? as u32,
                    app_name: row.get(2)?,
                    source: MappingSource::parse(&source_raw).unwrap_or(MappingSource::Realtime),
                    is_owner: row.get::<_, i64>(4)? != 0,
                    discovered_at: DateTime::parse_from_rfc3339(&discovered_raw)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc.timestamp_opt(0, 0).unwrap()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
