//! Bridges device event fds into the reactor
//!
//! Physical devices that expose a readable fd get a persistent event-loop
//! registration; each readiness tick drains the device and fans the samples
//! out through its handler.

use crate::error::Result;
use crate::ipc::event_loop::{EventCondition, EventHandler, EventId, INVALID_EVENT_ID, LoopHandle};
use crate::sensor::handler::SharedHandler;
use crate::sensor::registry::SensorRegistry;
use parking_lot::Mutex;
use std::os::unix::io::RawFd;

struct DeviceEventHandler {
    handler: SharedHandler,
}

impl EventHandler for DeviceEventHandler {
    fn handle(&mut self, _fd: RawFd, condition: EventCondition) -> Result<bool> {
        if condition.intersects(EventCondition::HUP | EventCondition::NVAL) {
            log::warn!(
                "device fd for {} went away",
                self.handler.lock().info().uri
            );
            return Ok(false);
        }
        if let Err(e) = self.handler.lock().dispatch_events() {
            log::warn!("device read failed: {}", e);
        }
        Ok(true)
    }
}

/// Register every fd-driven sensor with the reactor. Returns the
/// registration ids so shutdown can unhook them.
pub fn register_device_events(
    registry: &Mutex<SensorRegistry>,
    loop_handle: &LoopHandle,
) -> Vec<EventId> {
    let handlers = registry.lock().handlers();
    let mut ids = Vec::new();
    for handler in handlers {
        let fd = match handler.lock().poll_fd() {
            Some(fd) => fd,
            None => continue,
        };
        let id = loop_handle.add_event(
            fd,
            EventCondition::IN | EventCondition::HUP | EventCondition::NVAL,
            Box::new(DeviceEventHandler { handler }),
        );
        if id == INVALID_EVENT_ID {
            log::warn!("could not register device fd {}", fd);
        } else {
            ids.push(id);
        }
    }
    log::info!("{} device fd(s) registered with the reactor", ids.len());
    ids
}
