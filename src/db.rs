use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use crate::quota::QuotaRecord;

const DATE_FORMAT: &str = "%Y-%m-%d";

/// SQLite storage for usage records and settings.
///
/// One connection behind a mutex; callers share it through `Arc<Database>`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            // A missing parent surfaces as an open error below
            let _ = std::fs::create_dir_all(parent);
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            -- One row per calendar day
            CREATE TABLE IF NOT EXISTS usage_statistics (
                date TEXT PRIMARY KEY,
                units_used INTEGER NOT NULL DEFAULT 0,
                research_count INTEGER NOT NULL DEFAULT 0,
                material_count INTEGER NOT NULL DEFAULT 0,
                analysis_count INTEGER NOT NULL DEFAULT 0,
                usage_minutes INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Settings blobs keyed by section
            CREATE TABLE IF NOT EXISTS app_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        f(&conn)
    }

    // ============ Usage Statistics ============

    pub fn load_usage_records(&self) -> Result<Vec<QuotaRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT date, units_used, research_count, material_count, analysis_count, usage_minutes
                 FROM usage_statistics ORDER BY date ASC",
            )?;

            let rows = stmt.query_map([], |row| {
                let date: String = row.get(0)?;
                Ok((
                    date,
                    QuotaRecord {
                        date: NaiveDate::MIN,
                        consumed_units: row.get::<_, i64>(1)? as u64,
                        research_count: row.get::<_, i64>(2)? as u64,
                        material_count: row.get::<_, i64>(3)? as u64,
                        analysis_count: row.get::<_, i64>(4)? as u64,
                        usage_minutes: row.get::<_, i64>(5)? as u64,
                    },
                ))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (date, mut record) = row?;
                // Rows with an unreadable date are skipped rather than failing the load
                if let Ok(parsed) = NaiveDate::parse_from_str(&date, DATE_FORMAT) {
                    record.date = parsed;
                    records.push(record);
                }
            }
            Ok(records)
        })
    }

    pub fn upsert_usage_record(&self, record: &QuotaRecord) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let date = record.date.format(DATE_FORMAT).to_string();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO usage_statistics
                    (date, units_used, research_count, material_count, analysis_count, usage_minutes, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
                 ON CONFLICT(date) DO UPDATE SET
                    units_used = excluded.units_used,
                    research_count = excluded.research_count,
                    material_count = excluded.material_count,
                    analysis_count = excluded.analysis_count,
                    usage_minutes = excluded.usage_minutes,
                    updated_at = excluded.updated_at",
                params![
                    date,
                    record.consumed_units as i64,
                    record.research_count as i64,
                    record.material_count as i64,
                    record.analysis_count as i64,
                    record.usage_minutes as i64,
                    now
                ],
            )?;
            Ok(())
        })
    }

    pub fn clear_usage(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM usage_statistics", [])?;
            Ok(())
        })
    }

    // ============ Settings ============

    pub fn load_setting(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT value FROM app_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn save_setting(&self, key: &str, value: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(date: &str, units: u64) -> QuotaRecord {
        QuotaRecord {
            consumed_units: units,
            ..QuotaRecord::empty(NaiveDate::parse_from_str(date, DATE_FORMAT).unwrap())
        }
    }

    #[test]
    fn test_usage_upsert_and_load() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_usage_record(&record("2026-03-02", 40)).unwrap();
        db.upsert_usage_record(&record("2026-03-01", 10)).unwrap();
        db.upsert_usage_record(&record("2026-03-02", 55)).unwrap();

        let records = db.load_usage_records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].date.to_string(), "2026-03-01");
        assert_eq!(records[1].consumed_units, 55);
    }

    #[test]
    fn test_clear_usage() {
        let db = Database::open_in_memory().unwrap();
        db.upsert_usage_record(&record("2026-03-02", 40)).unwrap();
        db.clear_usage().unwrap();
        assert!(db.load_usage_records().unwrap().is_empty());
    }

    #[test]
    fn test_settings_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.load_setting("analysis").unwrap(), None);
        db.save_setting("analysis", "{\"a\":1}").unwrap();
        db.save_setting("analysis", "{\"a\":2}").unwrap();
        assert_eq!(db.load_setting("analysis").unwrap().as_deref(), Some("{\"a\":2}"));
    }

    #[test]
    fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("forme.db");
        {
            let db = Database::open(&path).unwrap();
            db.upsert_usage_record(&record("2026-01-15", 7)).unwrap();
        }
        let reopened = Database::open(&path).unwrap();
        assert_eq!(reopened.load_usage_records().unwrap()[0].consumed_units, 7);
    }
}
