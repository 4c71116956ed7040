//! Device registry operations behind the administrative endpoints.

use crate::audit;
use crate::storage::{with_timeout, DeviceStore, StoreError};
use iotedge_shared::{
    ConfigureDeviceRequest, ConfigureSensorRequest, Device, DeviceDesc, LogLevel, LogMessage, Sensor,
};
use std::sync::Arc;
use std::time::Duration;

/// Deadline for administrative store calls
pub const ADMIN_TIMEOUT: Duration = Duration::from_secs(40);

#[derive(Clone)]
pub struct DeviceRegistry {
    store: Arc<dyn DeviceStore>,
    timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn DeviceStore>) -> Self {
        Self {
            store,
            timeout: ADMIN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a booting device and any sensors it reports that are new.
    ///
    /// A sensor that cannot be inserted is logged and skipped; the device
    /// record is returned either way.
    pub async fn init_device(&self, desc: &DeviceDesc) -> Result<Device, StoreError> {
        let device = with_timeout(self.timeout, self.store.get_or_create_device(desc)).await?;
        let known = with_timeout(self.timeout, self.store.get_sensors(device.id)).await?;

        let mut added = 0;
        for name in &desc.sensors {
            if known.iter().any(|s| &s.name == name) {
                continue;
            }
            let sensor = Sensor {
                id: 0,
                device_id: device.id,
                name: name.clone(),
                offset: 0.0,
            };
            match with_timeout(self.timeout, self.store.insert_sensor(&sensor)).await {
                Ok(sensor) => {
                    added += 1;
                    tracing::debug!(device = %device.name, sensor = %sensor.name, "registered sensor");
                }
                Err(e) => {
                    tracing::error!(device = %device.name, sensor = %name, "failed to register sensor: {}", e)
                }
            }
        }

        audit::device_initialized(&device.name, known.len() + added);
        Ok(device)
    }

    pub async fn configure_device(&self, req: &ConfigureDeviceRequest) -> Result<Device, StoreError> {
        let mut device = with_timeout(self.timeout, self.store.get_device(&req.name)).await?;
        device.interval = req.interval;
        device.buffer = req.buffer;
        with_timeout(self.timeout, self.store.configure_device(&device)).await?;

        audit::device_configured(&device.name, device.interval, device.buffer);
        Ok(device)
    }

    /// Set a sensor's calibration offset; returns the owning device.
    pub async fn configure_sensor(&self, req: &ConfigureSensorRequest) -> Result<Device, StoreError> {
        let device = with_timeout(self.timeout, self.store.get_device(&req.name)).await?;
        let sensors = with_timeout(self.timeout, self.store.get_sensors(device.id)).await?;
        let mut sensor = sensors
            .into_iter()
            .find(|s| s.name == req.sensor_name)
            .ok_or_else(|| StoreError::sensor_not_found(req.sensor_name.clone()))?;

        sensor.offset = req.offset;
        with_timeout(self.timeout, self.store.configure_sensor(&sensor)).await?;

        audit::sensor_configured(&device.name, &sensor.name, sensor.offset);
        Ok(device)
    }

    /// Record a device log message and echo it into the server log.
    pub async fn log_message(&self, message: &LogMessage) -> Result<(), StoreError> {
        let device = message.device.as_str();
        match message.level {
            LogLevel::Debug => tracing::debug!(device = %device, "{}", message.text),
            LogLevel::Info => tracing::info!(device = %device, "{}", message.text),
            LogLevel::Warning => tracing::warn!(device = %device, "{}", message.text),
            LogLevel::Error => tracing::error!(device = %device, "{}", message.text),
        }
        with_timeout(self.timeout, self.store.insert_log(message)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;

    fn registry() -> (Arc<MemoryStore>, DeviceRegistry) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), DeviceRegistry::new(store))
    }

    fn desc(sensors: &[&str]) -> DeviceDesc {
        DeviceDesc {
            name: "Basel3".to_string(),
            sensors: sensors.iter().map(|s| s.to_string()).collect(),
            description: "Basel3 v1.0".to_string(),
        }
    }

    #[tokio::test]
    async fn test_init_device_registers_new_sensors_once() {
        let (store, registry) = registry();
        let device = registry
            .init_device(&desc(&["Basel3Temperature", "Basel3Humidity"]))
            .await
            .unwrap();
        assert_eq!(device.interval, 60.0);

        let again = registry
            .init_device(&desc(&["Basel3Temperature", "Basel3Pressure"]))
            .await
            .unwrap();
        assert_eq!(again.id, device.id);

        let names: Vec<String> = store
            .get_sensors(device.id)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["Basel3Temperature", "Basel3Humidity", "Basel3Pressure"]);
    }

    #[tokio::test]
    async fn test_configure_device() {
        let (_, registry) = registry();
        registry.init_device(&desc(&[])).await.unwrap();

        let device = registry
            .configure_device(&ConfigureDeviceRequest {
                name: "Basel3".to_string(),
                interval: 10.0,
                buffer: 5,
            })
            .await
            .unwrap();
        assert_eq!(device.interval, 10.0);
        assert_eq!(device.buffer, 5);

        let missing = registry
            .configure_device(&ConfigureDeviceRequest {
                name: "ghost".to_string(),
                interval: 1.0,
                buffer: 1,
            })
            .await;
        assert!(missing.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_configure_sensor_offset() {
        let (store, registry) = registry();
        let device = registry.init_device(&desc(&["Basel3Temperature"])).await.unwrap();

        let returned = registry
            .configure_sensor(&ConfigureSensorRequest {
                name: "Basel3".to_string(),
                sensor_name: "Basel3Temperature".to_string(),
                offset: -1.5,
            })
            .await
            .unwrap();
        assert_eq!(returned.id, device.id);
        assert_eq!(store.get_sensors(device.id).await.unwrap()[0].offset, -1.5);

        let err = registry
            .configure_sensor(&ConfigureSensorRequest {
                name: "Basel3".to_string(),
                sensor_name: "Nope".to_string(),
                offset: 1.0,
            })
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::sensor_not_found("Nope"));
    }

    #[tokio::test]
    async fn test_log_message_is_stored() {
        let (store, registry) = registry();
        let message = LogMessage {
            device: "Basel3".to_string(),
            text: "sensor read failed".to_string(),
            level: LogLevel::Error,
        };
        registry.log_message(&message).await.unwrap();
        assert_eq!(store.logs(), vec![message]);
    }
}
