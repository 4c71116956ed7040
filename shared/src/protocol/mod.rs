//! Protocol definitions shared by the server and its clients
//!
//! `http` holds the HTTP route table and JSON envelopes, `mqtt` the topic
//! conventions of the embedded broker.

pub mod http;
pub mod mqtt;
