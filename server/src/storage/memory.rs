//! In-process storage backend
//!
//! Implements both [`DeviceStore`] and [`TimeseriesSink`] on plain vectors.
//! Used for the `memory` storage mode and throughout the tests, which can
//! inject insert failures and latency.

use super::{calibrated_values, DeviceStore, StoreError, TimeseriesSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use iotedge_shared::{Device, DeviceDesc, LogMessage, RecordId, Sensor, Series};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// One stored measurement row
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub tag: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub comment: Option<String>,
}

#[derive(Debug, Default)]
struct Tables {
    devices: Vec<Device>,
    sensors: Vec<Sensor>,
    logs: Vec<LogMessage>,
    measurements: Vec<Measurement>,
    next_id: RecordId,
}

impl Tables {
    fn next_id(&mut self) -> RecordId {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_always: AtomicBool,
    fail_next: AtomicUsize,
    insert_delay_ms: AtomicU64,
    insert_attempts: AtomicUsize,
    rejected_tags: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `insert` fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.fail_always.store(failing, Ordering::SeqCst);
    }

    /// Make the next `count` inserts fail.
    pub fn fail_next_inserts(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Make every `insert` of `tag` fail, the way a backend constraint would.
    pub fn reject_tag(&self, tag: &str) {
        self.rejected_tags.lock().push(tag.to_string());
    }

    /// Delay every `insert` by `delay` before it succeeds or fails.
    pub fn set_insert_delay(&self, delay: Duration) {
        self.insert_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of `insert` calls so far, including failed ones.
    pub fn insert_attempts(&self) -> usize {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    /// All stored measurements for `tag`, in insertion order.
    pub fn measurements(&self, tag: &str) -> Vec<Measurement> {
        self.tables
            .lock()
            .measurements
            .iter()
            .filter(|m| m.tag == tag)
            .cloned()
            .collect()
    }

    pub fn measurement_count(&self) -> usize {
        self.tables.lock().measurements.len()
    }

    pub fn logs(&self) -> Vec<LogMessage> {
        self.tables.lock().logs.clone()
    }

    fn should_fail(&self, tag: &str) -> bool {
        if self.fail_always.load(Ordering::SeqCst) {
            return true;
        }
        if self.rejected_tags.lock().iter().any(|t| t == tag) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DeviceStore for MemoryStore {
    async fn get_or_create_device(&self, desc: &DeviceDesc) -> Result<Device, StoreError> {
        let mut tables = self.tables.lock();
        if let Some(device) = tables.devices.iter().find(|d| d.name == desc.name) {
            return Ok(device.clone());
        }
        let device = Device {
            id: tables.next_id(),
            ..Device::unsaved(desc.name.clone(), desc.description.clone())
        };
        tables.devices.push(device.clone());
        Ok(device)
    }

    async fn get_device(&self, name: &str) -> Result<Device, StoreError> {
        self.tables
            .lock()
            .devices
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| StoreError::device_not_found(name))
    }

    async fn get_sensors(&self, device_id: RecordId) -> Result<Vec<Sensor>, StoreError> {
        Ok(self
            .tables
            .lock()
            .sensors
            .iter()
            .filter(|s| s.device_id == device_id)
            .cloned()
            .collect())
    }

    async fn insert_sensor(&self, sensor: &Sensor) -> Result<Sensor, StoreError> {
        let mut tables = self.tables.lock();
        if !tables.devices.iter().any(|d| d.id == sensor.device_id) {
            return Err(StoreError::device_not_found(sensor.device_id.to_string()));
        }
        let sensor = Sensor {
            id: tables.next_id(),
            ..sensor.clone()
        };
        tables.sensors.push(sensor.clone());
        Ok(sensor)
    }

    async fn configure_device(&self, device: &Device) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let stored = tables
            .devices
            .iter_mut()
            .find(|d| d.id == device.id)
            .ok_or_else(|| StoreError::device_not_found(device.name.clone()))?;
        stored.interval = device.interval;
        stored.buffer = device.buffer;
        stored.description = device.description.clone();
        Ok(())
    }

    async fn configure_sensor(&self, sensor: &Sensor) -> Result<(), StoreError> {
        let mut tables = self.tables.lock();
        let stored = tables
            .sensors
            .iter_mut()
            .find(|s| s.id == sensor.id)
            .ok_or_else(|| StoreError::sensor_not_found(sensor.name.clone()))?;
        stored.offset = sensor.offset;
        Ok(())
    }

    async fn insert_log(&self, message: &LogMessage) -> Result<(), StoreError> {
        self.tables.lock().logs.push(message.clone());
        Ok(())
    }
}

#[async_trait]
impl TimeseriesSink for MemoryStore {
    async fn insert(&self, series: &Series) -> Result<(), StoreError> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.insert_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.should_fail(&series.tag) {
            return Err(StoreError::Backend("injected insert failure".into()));
        }

        let mut tables = self.tables.lock();
        let offset = tables
            .sensors
            .iter()
            .find(|s| s.name == series.tag)
            .map(|s| s.offset);
        let values = calibrated_values(series, offset);
        for (i, (timestamp, value)) in series.timestamps.iter().zip(values).enumerate() {
            tables.measurements.push(Measurement {
                tag: series.tag.clone(),
                timestamp: *timestamp,
                value,
                comment: series.comment(i).map(str::to_string),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(name: &str) -> DeviceDesc {
        DeviceDesc {
            name: name.to_string(),
            sensors: vec![],
            description: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let store = MemoryStore::new();
        let first = store.get_or_create_device(&desc("dev1")).await.unwrap();
        let second = store.get_or_create_device(&desc("dev1")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.get_device("dev1").await.unwrap().id, first.id);
    }

    #[tokio::test]
    async fn test_get_device_not_found() {
        let store = MemoryStore::new();
        let err = store.get_device("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_insert_applies_sensor_offset() {
        let store = MemoryStore::new();
        let dev = store.get_or_create_device(&desc("dev1")).await.unwrap();
        let mut sensor = store
            .insert_sensor(&Sensor {
                id: 0,
                device_id: dev.id,
                name: "dev1Temp".to_string(),
                offset: 0.0,
            })
            .await
            .unwrap();
        sensor.offset = -4.0;
        store.configure_sensor(&sensor).await.unwrap();

        store
            .insert(&Series::single("dev1Temp", Utc::now(), 24.0))
            .await
            .unwrap();
        assert_eq!(store.measurements("dev1Temp")[0].value, 20.0);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        let series = Series::single("t1", Utc::now(), 1.0);
        store.fail_next_inserts(2);
        assert!(store.insert(&series).await.is_err());
        assert!(store.insert(&series).await.is_err());
        assert!(store.insert(&series).await.is_ok());
        assert_eq!(store.insert_attempts(), 3);
        assert_eq!(store.measurement_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_tag_fails_only_that_tag() {
        let store = MemoryStore::new();
        store.reject_tag("bad");
        assert!(store.insert(&Series::single("bad", Utc::now(), 1.0)).await.is_err());
        assert!(store.insert(&Series::single("good", Utc::now(), 1.0)).await.is_ok());
        assert_eq!(store.measurement_count(), 1);
    }
}
