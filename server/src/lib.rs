//! IoT edge telemetry server
//!
//! Devices push samples over HTTP or publish them to the embedded MQTT
//! broker. Broker samples are collected in an [`buffer::AggregationBuffer`]
//! and written to the timeseries sink once per flush period.

pub mod audit;
pub mod broker;
pub mod buffer;
pub mod config;
pub mod flush;
pub mod forward;
pub mod gate;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod server;
pub mod storage;
