//! SQLite storage backend
//!
//! Holds the device registry, the measurement table and device log messages
//! in one database file. The connection is not `Sync`, so it lives behind a
//! mutex and every call runs on the blocking thread pool.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE devices (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     name TEXT NOT NULL UNIQUE,
//!     description TEXT NOT NULL DEFAULT '',
//!     interval_secs REAL NOT NULL DEFAULT 60,
//!     buffer INTEGER NOT NULL DEFAULT 2
//! );
//! CREATE TABLE sensors (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     device_id INTEGER NOT NULL REFERENCES devices(id),
//!     name TEXT NOT NULL,
//!     calibration_offset REAL NOT NULL DEFAULT 0
//! );
//! CREATE TABLE measurements (
//!     tag TEXT NOT NULL,
//!     timestamp_ms INTEGER NOT NULL,
//!     value REAL NOT NULL,
//!     comment TEXT
//! );
//! CREATE INDEX idx_measurements_tag_time ON measurements(tag, timestamp_ms);
//! CREATE TABLE logs (...);
//! ```
//!
//! Measurements are append-only; samples sharing a tag and millisecond are
//! all kept. A series is written in one transaction, and an insert whose
//! caller gave up waiting rolls back instead of committing, so a retried
//! series is never stored twice.

use super::{calibrated_values, DeviceStore, StoreError, TimeseriesSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iotedge_shared::utils::time::{from_unix_millis, to_unix_millis};
use iotedge_shared::{Device, DeviceDesc, LogMessage, RecordId, Sensor, Series};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS devices (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    interval_secs REAL NOT NULL DEFAULT 60,
    buffer INTEGER NOT NULL DEFAULT 2
);
CREATE TABLE IF NOT EXISTS sensors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id INTEGER NOT NULL REFERENCES devices(id),
    name TEXT NOT NULL,
    calibration_offset REAL NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_sensors_device ON sensors(device_id);
CREATE INDEX IF NOT EXISTS idx_sensors_name ON sensors(name);
CREATE TABLE IF NOT EXISTS measurements (
    tag TEXT NOT NULL,
    timestamp_ms INTEGER NOT NULL,
    value REAL NOT NULL,
    comment TEXT
);
CREATE INDEX IF NOT EXISTS idx_measurements_tag_time ON measurements(tag, timestamp_ms);
CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp_ms INTEGER NOT NULL,
    device TEXT NOT NULL,
    text TEXT NOT NULL DEFAULT '',
    level INTEGER NOT NULL DEFAULT 1
);
";

/// Flags an insert as abandoned once its future is dropped.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

const DEVICE_COLUMNS: &str = "id, name, description, interval_secs, buffer";
const SENSOR_COLUMNS: &str = "id, device_id, name, calibration_offset";

/// SQLite-backed device registry and measurement sink
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("create directory {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await?
    }

    /// Stored (timestamp, value) pairs for `tag`, oldest first.
    pub async fn measurements(&self, tag: &str) -> Result<Vec<(DateTime<Utc>, f64)>, StoreError> {
        let tag = tag.to_string();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp_ms, value FROM measurements WHERE tag = ?1 ORDER BY timestamp_ms ASC, rowid ASC",
            )?;
            let rows = stmt
                .query_map([&tag], |row| {
                    Ok((from_unix_millis(row.get::<_, i64>(0)?), row.get::<_, f64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Most recent device log messages, newest first.
    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<LogMessage>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT device, text, level FROM logs ORDER BY timestamp_ms DESC, id DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map([limit as i64], |row| {
                    Ok(LogMessage {
                        device: row.get(0)?,
                        text: row.get(1)?,
                        level: row.get::<_, i32>(2)?.into(),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Calibration offset of the sensor named `tag`, if one is registered.
    pub async fn sensor_offset(&self, tag: &str) -> Result<Option<f32>, StoreError> {
        let tag = tag.to_string();
        self.run(move |conn| Self::lookup_offset(conn, &tag)).await
    }

    fn lookup_offset(conn: &Connection, tag: &str) -> Result<Option<f32>, StoreError> {
        let offset = conn
            .query_row(
                "SELECT calibration_offset FROM sensors WHERE name = ?1 ORDER BY id LIMIT 1",
                [tag],
                |row| row.get::<_, f64>(0),
            )
            .optional()?;
        Ok(offset.map(|o| o as f32))
    }

    fn row_to_device(row: &rusqlite::Row) -> rusqlite::Result<Device> {
        Ok(Device {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            interval: row.get::<_, f64>(3)? as f32,
            buffer: row.get(4)?,
        })
    }

    fn row_to_sensor(row: &rusqlite::Row) -> rusqlite::Result<Sensor> {
        Ok(Sensor {
            id: row.get(0)?,
            device_id: row.get(1)?,
            name: row.get(2)?,
            offset: row.get::<_, f64>(3)? as f32,
        })
    }

    fn find_device(conn: &Connection, name: &str) -> Result<Option<Device>, StoreError> {
        let device = conn
            .query_row(
                &format!("SELECT {} FROM devices WHERE name = ?1", DEVICE_COLUMNS),
                [name],
                Self::row_to_device,
            )
            .optional()?;
        Ok(device)
    }
}

#[async_trait]
impl DeviceStore for SqliteStore {
    async fn get_or_create_device(&self, desc: &DeviceDesc) -> Result<Device, StoreError> {
        let desc = desc.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO devices (name, description, interval_secs, buffer)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    desc.name,
                    desc.description,
                    iotedge_shared::DEFAULT_INTERVAL_SECS as f64,
                    iotedge_shared::DEFAULT_BUFFER
                ],
            )?;
            let device = Self::find_device(&tx, &desc.name)?
                .ok_or_else(|| StoreError::device_not_found(desc.name.clone()))?;
            tx.commit()?;
            if inserted == 1 {
                tracing::debug!(device = %device.name, id = device.id, "created device");
            }
            Ok(device)
        })
        .await
    }

    async fn get_device(&self, name: &str) -> Result<Device, StoreError> {
        let name = name.to_string();
        self.run(move |conn| {
            Self::find_device(conn, &name)?.ok_or_else(|| StoreError::device_not_found(name))
        })
        .await
    }

    async fn get_sensors(&self, device_id: RecordId) -> Result<Vec<Sensor>, StoreError> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sensors WHERE device_id = ?1 ORDER BY id",
                SENSOR_COLUMNS
            ))?;
            let sensors = stmt
                .query_map([device_id], Self::row_to_sensor)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(sensors)
        })
        .await
    }

    async fn insert_sensor(&self, sensor: &Sensor) -> Result<Sensor, StoreError> {
        let sensor = sensor.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO sensors (device_id, name, calibration_offset) VALUES (?1, ?2, ?3)",
                params![sensor.device_id, sensor.name, sensor.offset as f64],
            )?;
            Ok(Sensor {
                id: conn.last_insert_rowid(),
                ..sensor
            })
        })
        .await
    }

    async fn configure_device(&self, device: &Device) -> Result<(), StoreError> {
        let device = device.clone();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE devices SET description = ?1, buffer = ?2, interval_secs = ?3 WHERE id = ?4",
                params![
                    device.description,
                    device.buffer,
                    device.interval as f64,
                    device.id
                ],
            )?;
            if updated != 1 {
                return Err(StoreError::device_not_found(device.name));
            }
            Ok(())
        })
        .await
    }

    async fn configure_sensor(&self, sensor: &Sensor) -> Result<(), StoreError> {
        let sensor = sensor.clone();
        self.run(move |conn| {
            let updated = conn.execute(
                "UPDATE sensors SET calibration_offset = ?1 WHERE id = ?2",
                params![sensor.offset as f64, sensor.id],
            )?;
            if updated != 1 {
                return Err(StoreError::sensor_not_found(sensor.name));
            }
            Ok(())
        })
        .await
    }

    async fn insert_log(&self, message: &LogMessage) -> Result<(), StoreError> {
        let message = message.clone();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO logs (timestamp_ms, device, text, level) VALUES (?1, ?2, ?3, ?4)",
                params![
                    to_unix_millis(&Utc::now()),
                    message.device,
                    message.text,
                    i32::from(message.level)
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl TimeseriesSink for SqliteStore {
    async fn insert(&self, series: &Series) -> Result<(), StoreError> {
        let series = series.clone();
        let abandoned = Arc::new(AtomicBool::new(false));
        let _abandon = AbandonOnDrop(abandoned.clone());
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let offset = Self::lookup_offset(&tx, &series.tag)?;
            let values = calibrated_values(&series, offset);
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO measurements (tag, timestamp_ms, value, comment)
                     VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (i, (timestamp, value)) in series.timestamps.iter().zip(values).enumerate() {
                    stmt.execute(params![
                        series.tag,
                        to_unix_millis(timestamp),
                        value,
                        series.comment(i)
                    ])?;
                }
            }
            if abandoned.load(Ordering::SeqCst) {
                return Err(StoreError::Backend(format!(
                    "insert of '{}' abandoned by caller",
                    series.tag
                )));
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn check(&self) -> Result<(), StoreError> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}
