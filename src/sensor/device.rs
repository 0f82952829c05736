//! Device abstraction under the handler layer
//!
//! A `SensorDevice` is the driver-facing half of a sensor. Each operation
//! comes in two parts: a capability hook (`on_*`) the handler consults
//! first, and a concrete operation that runs only when the hook declines
//! with [`Policy::Default`]. A driver that paces or powers itself overrides
//! the hook and answers [`Policy::Handled`]; a plain driver leaves the
//! hooks alone and implements the concrete operations its hardware needs.

use crate::error::Result;
use crate::sensor::data::SensorData;
use crate::sensor::info::SensorInfo;
use std::os::unix::io::RawFd;

/// Outcome of a capability hook that did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// The device fully handled the operation; the concrete operation is
    /// skipped
    Handled,
    /// The device declined; the handler runs the concrete operation
    Default,
}

/// Driver-facing sensor interface.
///
/// Hooks default to `Ok(Policy::Default)` and concrete operations default
/// to no-op success, so a minimal driver implements only `info`,
/// `get_data`, and its event source.
pub trait SensorDevice: Send {
    /// Immutable description of this sensor
    fn info(&self) -> &SensorInfo;

    /// Consulted when the first observer starts the sensor
    fn on_start(&mut self) -> Result<Policy> {
        Ok(Policy::Default)
    }

    /// Consulted when the last observer stops the sensor
    fn on_stop(&mut self) -> Result<Policy> {
        Ok(Policy::Default)
    }

    /// Consulted with the aggregated sampling interval in milliseconds
    fn on_interval(&mut self, _interval_ms: i32) -> Result<Policy> {
        Ok(Policy::Default)
    }

    /// Consulted with the aggregated batch latency in milliseconds
    fn on_batch_latency(&mut self, _latency_ms: i32) -> Result<Policy> {
        Ok(Policy::Default)
    }

    /// Consulted for integer attributes with no dedicated hook
    fn on_attribute_int(&mut self, _attribute: i32, _value: i32) -> Result<Policy> {
        Ok(Policy::Default)
    }

    /// Consulted before flushing batched samples
    fn on_flush(&mut self) -> Result<Policy> {
        Ok(Policy::Default)
    }

    /// Power the hardware up
    fn enable(&mut self) -> Result<()> {
        Ok(())
    }

    /// Power the hardware down
    fn disable(&mut self) -> Result<()> {
        Ok(())
    }

    /// Program the sampling interval into the hardware
    fn set_interval(&mut self, _interval_ms: i32) -> Result<()> {
        Ok(())
    }

    /// Program the batch latency into the hardware
    fn set_batch_latency(&mut self, _latency_ms: i32) -> Result<()> {
        Ok(())
    }

    /// Apply an integer attribute to the hardware
    fn set_attribute_int(&mut self, _attribute: i32, _value: i32) -> Result<()> {
        Ok(())
    }

    /// Force out batched samples; flushed data arrives via `read_events`
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Most recent sample on demand
    fn get_data(&mut self) -> Result<SensorData>;

    /// Readable fd that signals pending samples, if the device is fd-driven
    fn poll_fd(&self) -> Option<RawFd> {
        None
    }

    /// Drain pending samples after `poll_fd` signalled readability
    fn read_events(&mut self) -> Result<Vec<SensorData>> {
        Ok(Vec::new())
    }
}
