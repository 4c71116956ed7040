//! Admission gate: non-blocking permits that shed load instead of queuing it.

use crate::{audit, metrics};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GateError {
    #[error("{0} permit is held by another request")]
    Busy(&'static str),
}

/// A binary permit. Cloning shares the same underlying token.
#[derive(Debug, Clone)]
pub struct Permit {
    name: &'static str,
    slot: Arc<Semaphore>,
}

/// Proof of holding a [`Permit`]; dropping it releases the permit.
///
/// The guard is `'static`, so it can be moved into a spawned task.
#[derive(Debug)]
pub struct PermitGuard {
    name: &'static str,
    _permit: OwnedSemaphorePermit,
}

impl Permit {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            slot: Arc::new(Semaphore::new(1)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Take the permit if it is free, without waiting.
    pub fn try_acquire(&self) -> Result<PermitGuard, GateError> {
        match self.slot.clone().try_acquire_owned() {
            Ok(permit) => Ok(PermitGuard {
                name: self.name,
                _permit: permit,
            }),
            Err(_) => {
                metrics::GATE_REJECTIONS_TOTAL
                    .with_label_values(&[self.name])
                    .inc();
                Err(GateError::Busy(self.name))
            }
        }
    }

    pub fn is_held(&self) -> bool {
        self.slot.available_permits() == 0
    }
}

impl PermitGuard {
    pub fn permit_name(&self) -> &'static str {
        self.name
    }
}

/// The two independent permits guarding the HTTP surface.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    /// Device/sensor mutation and direct sensor-value submission
    pub admin: Permit,
    /// Batched timeseries writes
    pub ingest: Permit,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self {
            admin: Permit::new("admin"),
            ingest: Permit::new("ingest"),
        }
    }

    /// Acquire `permit`, auditing a rejection against `path`.
    pub fn admit(permit: &Permit, path: &str) -> Result<PermitGuard, GateError> {
        permit.try_acquire().map_err(|e| {
            audit::request_rejected_busy(permit.name(), path);
            e
        })
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}
