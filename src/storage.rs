use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local, NaiveDate};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};

use crate::track::DetectionRecord;

/// Where the engine hands completed tracks.
///
/// Implementations may block; the engine only calls them from its persistence worker.
pub trait PersistenceSink: Send {
    /// Store `record` durably and return its row id.
    fn persist(&mut self, record: &DetectionRecord) -> Result<i64>;

    /// Records already stored for `date`. Seeds the engine's daily counter.
    fn count_on(&mut self, date: NaiveDate) -> Result<u64>;
}

/// Queryable detection history.
pub trait DetectionStore: Send {
    fn insert(&mut self, record: &DetectionRecord) -> Result<i64>;

    fn get(&mut self, id: i64) -> Result<Option<StoredDetection>>;

    /// Detections on `date`, newest start first.
    fn list_for_date(&mut self, date: NaiveDate) -> Result<Vec<StoredDetection>>;

    /// All detections, newest start first.
    fn list(&mut self, limit: usize, offset: usize) -> Result<Vec<StoredDetection>>;

    /// Returns false when no row had this id.
    fn delete(&mut self, id: i64) -> Result<bool>;

    fn count_for_date(&mut self, date: NaiveDate) -> Result<u64>;
}

impl<T: DetectionStore> PersistenceSink for T {
    fn persist(&mut self, record: &DetectionRecord) -> Result<i64> {
        self.insert(record)
    }

    fn count_on(&mut self, date: NaiveDate) -> Result<u64> {
        self.count_for_date(date)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoredDetection {
    pub id: i64,
    #[serde(flatten)]
    pub record: DetectionRecord,
}

pub struct SqliteDetectionStore {
    conn: Connection,
}

impl SqliteDetectionStore {
    /// Open (or create) the database at `db_path`. `file:` URIs are accepted, which lets
    /// tests share an in-memory database between connections.
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = crate::open_db_connection(db_path)
            .with_context(|| format!("open detection database {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              track_id INTEGER NOT NULL,
              detection_date TEXT NOT NULL,
              start_time TEXT NOT NULL,
              end_time TEXT NOT NULL,
              start_epoch_ms INTEGER NOT NULL,
              peak_confidence REAL NOT NULL,
              frame_count INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_detections_date ON detections(detection_date);
            CREATE INDEX IF NOT EXISTS idx_detections_start ON detections(start_epoch_ms);
            "#,
        )?;
        Ok(())
    }

    fn query(&self, sql: &str, args: impl rusqlite::Params) -> Result<Vec<StoredDetection>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_row(row)?);
        }
        Ok(out)
    }
}

const SELECT_COLUMNS: &str = "SELECT id, track_id, detection_date, start_time, end_time, \
     peak_confidence, frame_count FROM detections";

fn read_row(row: &Row<'_>) -> Result<StoredDetection> {
    let track_id: i64 = row.get(1)?;
    let date: String = row.get(2)?;
    let start: String = row.get(3)?;
    let end: String = row.get(4)?;
    let peak_confidence: f64 = row.get(5)?;
    let frame_count: i64 = row.get(6)?;
    Ok(StoredDetection {
        id: row.get(0)?,
        record: DetectionRecord {
            track_id: u64::try_from(track_id).map_err(|_| anyhow!("corrupt row: track_id"))?,
            detection_date: date
                .parse()
                .with_context(|| format!("corrupt row: detection_date '{}'", date))?,
            start_time: parse_timestamp(&start)?,
            end_time: parse_timestamp(&end)?,
            peak_confidence: peak_confidence as f32,
            frame_count: u32::try_from(frame_count)
                .map_err(|_| anyhow!("corrupt row: frame_count"))?,
        },
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Local>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("corrupt row: timestamp '{}'", raw))?
        .with_timezone(&Local))
}

impl DetectionStore for SqliteDetectionStore {
    fn insert(&mut self, record: &DetectionRecord) -> Result<i64> {
        let track_id =
            i64::try_from(record.track_id).map_err(|_| anyhow!("track id exceeds i64 range"))?;
        self.conn.execute(
            r#"
            INSERT INTO detections(track_id, detection_date, start_time, end_time,
                                   start_epoch_ms, peak_confidence, frame_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                track_id,
                record.detection_date.to_string(),
                record.start_time.to_rfc3339(),
                record.end_time.to_rfc3339(),
                record.start_time.timestamp_millis(),
                record.peak_confidence as f64,
                record.frame_count as i64,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn get(&mut self, id: i64) -> Result<Option<StoredDetection>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE id = ?1", SELECT_COLUMNS))?;
        let row = stmt
            .query_row(params![id], |row| Ok(read_row(row)))
            .optional()?;
        row.transpose()
    }

    fn list_for_date(&mut self, date: NaiveDate) -> Result<Vec<StoredDetection>> {
        self.query(
            &format!(
                "{} WHERE detection_date = ?1 ORDER BY start_epoch_ms DESC, id DESC",
                SELECT_COLUMNS
            ),
            params![date.to_string()],
        )
    }

    fn list(&mut self, limit: usize, offset: usize) -> Result<Vec<StoredDetection>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        self.query(
            &format!(
                "{} ORDER BY start_epoch_ms DESC, id DESC LIMIT ?1 OFFSET ?2",
                SELECT_COLUMNS
            ),
            params![limit, offset],
        )
    }

    fn delete(&mut self, id: i64) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM detections WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    fn count_for_date(&mut self, date: NaiveDate) -> Result<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM detections WHERE detection_date = ?1",
            params![date.to_string()],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDetectionStore {
    rows: Vec<StoredDetection>,
    next_id: i64,
}

impl InMemoryDetectionStore {
    fn sorted(mut rows: Vec<StoredDetection>) -> Vec<StoredDetection> {
        rows.sort_by(|a, b| {
            b.record
                .start_time
                .cmp(&a.record.start_time)
                .then(b.id.cmp(&a.id))
        });
        rows
    }
}

impl DetectionStore for InMemoryDetectionStore {
    fn insert(&mut self, record: &DetectionRecord) -> Result<i64> {
        self.next_id += 1;
        self.rows.push(StoredDetection {
            id: self.next_id,
            record: record.clone(),
        });
        Ok(self.next_id)
    }

    fn get(&mut self, id: i64) -> Result<Option<StoredDetection>> {
        Ok(self.rows.iter().find(|row| row.id == id).cloned())
    }

    fn list_for_date(&mut self, date: NaiveDate) -> Result<Vec<StoredDetection>> {
        Ok(Self::sorted(
            self.rows
                .iter()
                .filter(|row| row.record.detection_date == date)
                .cloned()
                .collect(),
        ))
    }

    fn list(&mut self, limit: usize, offset: usize) -> Result<Vec<StoredDetection>> {
        Ok(Self::sorted(self.rows.clone())
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    fn delete(&mut self, id: i64) -> Result<bool> {
        let before = self.rows.len();
        self.rows.retain(|row| row.id != id);
        Ok(self.rows.len() != before)
    }

    fn count_for_date(&mut self, date: NaiveDate) -> Result<u64> {
        Ok(self
            .rows
            .iter()
            .filter(|row| row.record.detection_date == date)
            .count() as u64)
    }
}

/// A store shared between the engine's persistence worker and the API.
#[derive(Clone)]
pub struct SharedStore {
    inner: Arc<Mutex<Box<dyn DetectionStore>>>,
}

impl SharedStore {
    pub fn new(store: impl DetectionStore + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(store))),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut dyn DetectionStore) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_mut())
    }
}

impl DetectionStore for SharedStore {
    fn insert(&mut self, record: &DetectionRecord) -> Result<i64> {
        self.with(|store| store.insert(record))
    }

    fn get(&mut self, id: i64) -> Result<Option<StoredDetection>> {
        self.with(|store| store.get(id))
    }

    fn list_for_date(&mut self, date: NaiveDate) -> Result<Vec<StoredDetection>> {
        self.with(|store| store.list_for_date(date))
    }

    fn list(&mut self, limit: usize, offset: usize) -> Result<Vec<StoredDetection>> {
        self.with(|store| store.list(limit, offset))
    }

    fn delete(&mut self, id: i64) -> Result<bool> {
        self.with(|store| store.delete(id))
    }

    fn count_for_date(&mut self, date: NaiveDate) -> Result<u64> {
        self.with(|store| store.count_for_date(date))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn record(track_id: u64, start_offset_s: i64) -> DetectionRecord {
        let start = Local
            .with_ymd_and_hms(2024, 6, 1, 12, 0, 0)
            .single()
            .unwrap()
            + Duration::seconds(start_offset_s);
        DetectionRecord {
            track_id,
            detection_date: start.date_naive(),
            start_time: start,
            end_time: start + Duration::seconds(4),
            peak_confidence: 0.75,
            frame_count: 12,
        }
    }

    fn exercise(store: &mut dyn DetectionStore) {
        let first = store.insert(&record(1, 0)).unwrap();
        let second = store.insert(&record(2, 60)).unwrap();
        let third = store.insert(&record(3, 30)).unwrap();
        assert!(first < second && second < third);

        let got = store.get(second).unwrap().unwrap();
        assert_eq!(got.record, record(2, 60));
        assert!(store.get(9_999).unwrap().is_none());

        let date = record(1, 0).detection_date;
        let ids: Vec<_> = store
            .list_for_date(date)
            .unwrap()
            .iter()
            .map(|row| row.record.track_id)
            .collect();
        assert_eq!(ids, vec![2, 3, 1]);
        assert_eq!(store.count_for_date(date).unwrap(), 3);
        assert_eq!(
            store
                .count_for_date(date.succ_opt().unwrap())
                .unwrap(),
            0
        );

        let page: Vec<_> = store
            .list(1, 1)
            .unwrap()
            .iter()
            .map(|row| row.record.track_id)
            .collect();
        assert_eq!(page, vec![3]);

        assert!(store.delete(first).unwrap());
        assert!(!store.delete(first).unwrap());
        assert_eq!(store.count_for_date(date).unwrap(), 2);
    }

    #[test]
    fn sqlite_store_round_trips_and_orders() {
        let mut store = SqliteDetectionStore::open(&crate::shared_memory_uri()).unwrap();
        exercise(&mut store);
    }

    #[test]
    fn in_memory_store_matches_sqlite_semantics() {
        let mut store = InMemoryDetectionStore::default();
        exercise(&mut store);
    }

    #[test]
    fn shared_store_is_a_persistence_sink() {
        let shared = SharedStore::new(InMemoryDetectionStore::default());
        let mut sink: Box<dyn PersistenceSink> = Box::new(shared.clone());
        let id = sink.persist(&record(7, 0)).unwrap();
        let mut reader = shared;
        assert_eq!(reader.get(id).unwrap().unwrap().record.track_id, 7);
        assert_eq!(sink.count_on(record(7, 0).detection_date).unwrap(), 1);
    }

    #[test]
    fn sqlite_connections_share_memory_database() {
        let uri = crate::shared_memory_uri();
        let mut writer = SqliteDetectionStore::open(&uri).unwrap();
        let mut reader = SqliteDetectionStore::open(&uri).unwrap();
        let id = writer.insert(&record(4, 0)).unwrap();
        assert_eq!(reader.get(id).unwrap().unwrap().record.track_id, 4);
    }
}
