//! Data model shared between server and clients

pub mod device;
pub mod logging;
pub mod series;
