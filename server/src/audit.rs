//! Audit logging for registry changes and operational events.
//!
//! All events are emitted via `tracing` with a dedicated target so they can be
//! filtered and formatted (e.g. JSON) separately from the regular log.

use tracing::{info, warn};

pub const AUDIT_TARGET: &str = "iotedge::audit";

/// A device announced itself via init-device.
pub fn device_initialized(device: &str, sensors: usize) {
    info!(
        target: AUDIT_TARGET,
        event = "device_initialized",
        device = %device,
        sensors = sensors,
    );
}

pub fn device_configured(device: &str, interval: f32, buffer: i32) {
    info!(
        target: AUDIT_TARGET,
        event = "device_configured",
        device = %device,
        interval = interval,
        buffer = buffer,
    );
}

pub fn sensor_configured(device: &str, sensor: &str, offset: f32) {
    info!(
        target: AUDIT_TARGET,
        event = "sensor_configured",
        device = %device,
        sensor = %sensor,
        offset = offset,
    );
}

/// A request was turned away because its permit was held.
pub fn request_rejected_busy(permit: &str, path: &str) {
    warn!(
        target: AUDIT_TARGET,
        event = "request_rejected",
        result = "busy",
        permit = %permit,
        path = %path,
    );
}

/// Samples were dropped because a flush cycle ran out of time.
pub fn flush_data_lost(series: usize, samples: usize) {
    warn!(
        target: AUDIT_TARGET,
        event = "flush_data_lost",
        series = series,
        samples = samples,
    );
}

/// Log admin HTTP request (metrics, readiness, liveness).
pub fn admin_http_request(path: &str, status: u16) {
    info!(
        target: AUDIT_TARGET,
        event = "admin_http_request",
        path = %path,
        status = %status,
    );
}
