//! HTTP surfaces: the device-facing ingestion API and the admin server.

pub mod api;
pub mod http;
