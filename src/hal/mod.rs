//! Hardware abstraction: device drivers loaded by the daemon
//!
//! Real drivers live out of tree and come in through the `SensorDevice`
//! trait. The built-in `mock` driver simulates an accelerometer and a
//! gyroscope for development and tests.

pub mod mock;

use crate::config::HalConfig;
use crate::error::{Error, Result};
use crate::sensor::device::SensorDevice;

/// Instantiate the device set named by the config
pub fn load_devices(config: &HalConfig) -> Result<Vec<Box<dyn SensorDevice>>> {
    match config.driver.as_str() {
        "mock" => mock::load(config),
        other => Err(Error::InvalidParameter(format!(
            "unknown HAL driver '{other}'"
        ))),
    }
}
