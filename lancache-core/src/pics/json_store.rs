//! Read/write of `pics_depot_mappings.json`, the authoritative on-disk
//! snapshot used as a fallback when the database is empty or sparse.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::model::{PicsJsonData, PicsJsonDepotEntry, PicsJsonMetadata};

pub struct PicsJsonStore {
    path: PathBuf,
}

impl PicsJsonStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: data_dir.into().join("pics_depot_mappings.json"),
        }
    }

    pub fn load(&self) -> PicsJsonData {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    fn write_atomic(&self, data: &PicsJsonData) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(data)?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json.as_bytes())?;
        {
            let f = fs::File::open(&tmp_path)?;
            f.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)
    }

    /// Incremental crawls call this: existing entries are kept, and a
    /// depot's data is only replaced if the incoming entry is non-empty,
    /// so a partial batch can never blank out previously-known mappings.
    pub fn merge_with_validate(
        &self,
        incoming: impl IntoIterator<Item = (u32, PicsJsonDepotEntry)>,
        last_change_number: u32,
    ) -> std::io::Result<PicsJsonData> {
        let mut data = self.load();
        for (depot_id, entry) in incoming {
            if entry.app_ids.is_empty() {
                continue;
            }
            data.depot_mappings.insert(depot_id.to_string(), entry);
        }
        self.finalize_metadata(&mut data, last_change_number);
        self.write_atomic(&data)?;
        Ok(data)
    }

    /// Full crawls call this: the on-disk snapshot is replaced wholesale.
    pub fn full_replace(
        &self,
        mappings: impl IntoIterator<Item = (u32, PicsJsonDepotEntry)>,
        last_change_number: u32,
    ) -> std::io::Result<PicsJsonData> {
        let mut data = PicsJsonData::new();
        for (depot_id, entry) in mappings {
            data.depot_mappings.insert(depot_id.to_string(), entry);
        }
        self.finalize_metadata(&mut data, last_change_number);
        self.write_atomic(&data)?;
        Ok(data)
    }

    fn finalize_metadata(&self, data: &mut PicsJsonData, last_change_number: u32) {
        let total_apps: usize = data
            .depot_mappings
            .values()
            .flat_map(|e| e.app_ids.iter())
            .collect::<std::collections::HashSet<_>>()
            .len();
        data.metadata = PicsJsonMetadata {
            last_updated: Utc::now(),
            last_change_number,
            total_depots: data.depot_mappings.len(),
            total_apps,
        };
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(app_id: u32, name: &str) -> PicsJsonDepotEntry {
        PicsJsonDepotEntry {
            app_ids: vec![app_id],
            app_names: vec![name.to_string()],
            owner_id: Some(app_id),
        }
    }

    #[test]
    fn merge_preserves_existing_entries_not_in_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let store = PicsJsonStore::new(dir.path());

        store.merge_with_validate([(1, entry(100, "App A"))], 500).unwrap();
        store.merge_with_validate([(2, entry(200, "App B"))], 501).unwrap();

        let data = store.load();
        assert!(data.depot_mappings.contains_key("1"));
        assert!(data.depot_mappings.contains_key("2"));
        assert_eq!(data.metadata.last_change_number, 501);
    }

    #[test]
    fn merge_skips_empty_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = PicsJsonStore::new(dir.path());
        store.merge_with_validate([(1, entry(100, "App A"))], 1).unwrap();

        let empty = PicsJsonDepotEntry {
            app_ids: vec![],
            app_names: vec![],
            owner_id: None,
        };
        store.merge_with_validate([(1, empty)], 2).unwrap();

        let data = store.load();
        assert_eq!(data.depot_mappings["1"].app_ids, vec![100]);
    }

    #[test]
    fn full_replace_drops_entries_not_in_the_new_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = PicsJsonStore::new(dir.path());
        store.merge_with_validate([(1, entry(100, "Old"))], 1).unwrap();

        store.full_replace([(2, entry(200, "New"))], 2).unwrap();

        let data = store.load();
        assert!(!data.depot_mappings.contains_key("1"));
        assert!(data.depot_mappings.contains_key("2"));
    }
}
