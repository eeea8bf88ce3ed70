//! Depot-to-app resolution used by the realtime ingest path: the DB mapping
//! table is checked first, then the PICS JSON snapshot. Bulk mode skips
//! this and instead relies on the post-ingest sweep in
//! `pics::PicsCrawler::manually_apply_depot_mappings`.

use crate::db::{Database, DbResult};
use crate::pics::json_store::PicsJsonStore;

/// Resolves `depot_id` to `(app_id, app_name)`, checking the database
/// first and falling back to the on-disk JSON snapshot.
pub fn resolve(db: &Database, json_store: &PicsJsonStore, depot_id: u32) -> DbResult<Option<(u32, Option<String>)>> {
    if let Some(owner) = db.find_depot_owner(depot_id)? {
        return Ok(Some(owner));
    }
    Ok(json_store.load().resolve_owner(depot_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MappingSource, PicsJsonDepotEntry};

    #[test]
    fn db_mapping_takes_precedence_over_json() {
        let db = Database::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = PicsJsonStore::new(dir.path());
        store
            .full_replace(
                [(
                    835575,
                    PicsJsonDepotEntry {
                        app_ids: vec![999],
                        app_names: vec!["Wrong App".to_string()],
                        owner_id: Some(999),
                    },
                )],
                1,
            )
            .unwrap();
        db.upsert_depot_mapping(835575, 730, Some("Counter-Strike 2"), MappingSource::Pics, true, chrono::Utc::now())
            .unwrap();

        let resolved = resolve(&db, &store, 835575).unwrap().unwrap();
        assert_eq!(resolved.0, 730);
    }

    #[test]
    fn falls_back_to_json_when_db_has_no_mapping() {
        let db = Database::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = PicsJsonStore::new(dir.path());
        store
            .full_replace(
                [(
                    441,
                    PicsJsonDepotEntry {
                        app_ids: vec![440],
                        app_names: vec!["Team Fortress 2".to_string()],
                        owner_id: Some(440),
                    },
                )],
                1,
            )
            .unwrap();

        let resolved = resolve(&db, &store, 441).unwrap().unwrap();
        assert_eq!(resolved.0, 440);
    }

    #[test]
    fn returns_none_when_unresolved_anywhere() {
        let db = Database::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = PicsJsonStore::new(dir.path());

        assert!(resolve(&db, &store, 1).unwrap().is_none());
    }
}
