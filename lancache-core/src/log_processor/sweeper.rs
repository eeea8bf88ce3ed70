//! Active-download sweeper: closes Downloads that have gone idle for more
//! than a minute without a subsequent log line to extend them, so a session
//! does not stay flagged active forever once traffic for it stops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use crate::db::{Database, DbResult};

const TICK_INTERVAL: Duration = Duration::from_secs(30);
const IDLE_CUTOFF: ChronoDuration = ChronoDuration::minutes(1);
const BATCH_SIZE: u32 = 10;
const INTER_BATCH_PAUSE: Duration = Duration::from_millis(50);

/// Runs one sweep: repeatedly pulls up to `BATCH_SIZE` stale active
/// Downloads and closes them, pausing between batches so the sweep never
/// monopolizes the connection against the ingest path. Returns the total
/// number of Downloads closed.
pub fn sweep_once(db: &Database) -> DbResult<usize> {
    let cutoff = Utc::now() - IDLE_CUTOFF;
    let mut total = 0usize;
    loop {
        let stale = db.find_stale_active_downloads(cutoff, BATCH_SIZE)?;
        if stale.is_empty() {
            break;
        }
        let batch_len = stale.len();
        db.close_downloads(&stale)?;
        total += batch_len;
        if batch_len < BATCH_SIZE as usize {
            break;
        }
        thread::sleep(INTER_BATCH_PAUSE);
    }
    Ok(total)
}

/// Runs the sweeper loop on the calling thread until `cancel` is raised,
/// ticking every `TICK_INTERVAL`. Intended to be the body of a dedicated
/// `std::thread::spawn` owned by the supervisor.
pub fn run(db: &Database, cancel: Arc<AtomicBool>) {
    while !cancel.load(Ordering::SeqCst) {
        if let Err(e) = sweep_once(db) {
            tracing::warn!(error = %e, "active-download sweep failed");
        }
        let mut waited = Duration::ZERO;
        while waited < TICK_INTERVAL {
            if cancel.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(Duration::from_millis(200));
            waited += Duration::from_millis(200);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn sweep_closes_downloads_idle_past_cutoff() {
        let db = Database::open_in_memory().unwrap();
        let old = Utc::now() - ChronoDuration::minutes(10);
        db.insert_download("steam", "10.0.0.5", Some(1), old, old, None, 0, 0).unwrap();
        let fresh = Utc::now();
        db.insert_download("steam", "10.0.0.6", Some(2), fresh, fresh, None, 0, 0).unwrap();

        let closed = sweep_once(&db).unwrap();
        assert_eq!(closed, 1);
        assert!(db.find_active_download("10.0.0.5", "steam", Some(1)).unwrap().is_none());
        assert!(db.find_active_download("10.0.0.6", "steam", Some(2)).unwrap().is_some());
    }

    #[test]
    fn sweep_processes_more_than_one_batch() {
        let db = Database::open_in_memory().unwrap();
        let old = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        for i in 0..25 {
            db.insert_download("steam", &format!("10.0.0.{i}"), Some(i as u32), old, old, None, 0, 0)
                .unwrap();
        }

        let closed = sweep_once(&db).unwrap();
        assert_eq!(closed, 25);
    }

    #[test]
    fn sweep_is_a_no_op_when_nothing_is_stale() {
        let db = Database::open_in_memory().unwrap();
        let fresh = Utc::now();
        db.insert_download("steam", "10.0.0.5", Some(1), fresh, fresh, None, 0, 0).unwrap();

        assert_eq!(sweep_once(&db).unwrap(), 0);
    }
}
