//! SQLite persistence for occupancy aggregates.

use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use vigil_core::aggregator::{OccupancyAggregate, OccupancySink, SinkError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS function_info (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    function_id      INTEGER NOT NULL,
    timestamp        INTEGER NOT NULL,
    avg_people_count REAL    NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_function_info_fn_ts ON function_info (function_id, timestamp);
";

/// Shared handle to the aggregates database.
pub struct OccupancyStore {
    conn: Mutex<Connection>,
}

impl OccupancyStore {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(dir = %parent.display(), error = %e, "could not create database directory");
            }
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Most recent aggregates for a function, newest first.
    pub fn recent(&self, function_id: i64, limit: usize) -> Result<Vec<OccupancyAggregate>, SinkError> {
        let conn = self.conn.lock().map_err(|_| SinkError::Closed)?;
        let mut stmt = conn
            .prepare(
                "SELECT function_id, timestamp, avg_people_count FROM function_info
                 WHERE function_id = ?1 ORDER BY timestamp DESC, id DESC LIMIT ?2",
            )
            .map_err(storage)?;
        let rows = stmt
            .query_map(params![function_id, limit as i64], |row| {
                Ok(OccupancyAggregate {
                    function_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    avg_people_count: row.get(2)?,
                })
            })
            .map_err(storage)?;
        let out = rows.collect::<Result<Vec<_>, _>>().map_err(storage)?;
        Ok(out)
    }
}

impl OccupancySink for OccupancyStore {
    fn persist(&self, aggregate: &OccupancyAggregate) -> Result<(), SinkError> {
        let conn = self.conn.lock().map_err(|_| SinkError::Closed)?;
        conn.execute(
            "INSERT INTO function_info (function_id, timestamp, avg_people_count) VALUES (?1, ?2, ?3)",
            params![aggregate.function_id, aggregate.timestamp, aggregate.avg_people_count],
        )
        .map_err(storage)?;
        Ok(())
    }
}

fn storage(e: rusqlite::Error) -> SinkError {
    SinkError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn aggregate(function_id: i64, timestamp: i64, avg: f64) -> OccupancyAggregate {
        OccupancyAggregate {
            function_id,
            timestamp,
            avg_people_count: avg,
        }
    }

    #[test]
    fn test_persist_and_read_back() {
        let store = OccupancyStore::open_in_memory().unwrap();
        store.persist(&aggregate(1, 100, 0.5)).unwrap();
        store.persist(&aggregate(1, 700, 2.25)).unwrap();
        store.persist(&aggregate(2, 700, 9.0)).unwrap();

        let rows = store.recent(1, 10).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].timestamp, 700);
        assert_relative_eq!(rows[0].avg_people_count, 2.25);
        assert_eq!(rows[1].timestamp, 100);
    }

    #[test]
    fn test_recent_respects_limit() {
        let store = OccupancyStore::open_in_memory().unwrap();
        for ts in 0..5 {
            store.persist(&aggregate(3, ts, 1.0)).unwrap();
        }
        assert_eq!(store.recent(3, 2).unwrap().len(), 2);
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("occupancy.db");
        {
            let store = OccupancyStore::open(&path).unwrap();
            store.persist(&aggregate(1, 42, 3.0)).unwrap();
        }
        let store = OccupancyStore::open(&path).unwrap();
        assert_eq!(store.recent(1, 1).unwrap()[0].timestamp, 42);
    }
}
