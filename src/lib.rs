//! indriya: a sensor hub daemon and client library
//!
//! Aggregates physical sensor devices, synthesizes fusion sensors from
//! them, and multiplexes the resulting event streams to client processes
//! over a Unix-domain-socket protocol.

pub mod app;
pub mod client;
pub mod config;
pub mod error;
pub mod hal;
pub mod ipc;
pub mod protocol;
pub mod sensor;
pub mod server;

pub use error::{Error, Result};
