//! Provider-published sensors
//!
//! A client process can register itself as a sensor provider: it connects,
//! announces a `SensorInfo`, and then pushes samples over its channel. The
//! daemon wraps the announcement in an external sensor handler whose
//! control messages travel back over the same channel, so the provider
//! hears start/stop/interval changes and can pace itself.

use crate::error::Result;
use crate::ipc::channel::Channel;
use crate::ipc::message::Message;
use crate::protocol::{ListenerAttrInt, cmd};
use crate::sensor::external::ExternalControl;
use std::sync::Arc;

/// Forwards lifecycle and demand changes to the provider's channel
pub struct ProviderControl {
    channel: Arc<Channel>,
}

impl ProviderControl {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    fn send(&self, msg: Message) -> Result<()> {
        self.channel.send(Arc::new(msg))
    }
}

impl ExternalControl for ProviderControl {
    fn start(&self) -> Result<()> {
        self.send(Message::new(cmd::PROVIDER_START))
    }

    fn stop(&self) -> Result<()> {
        self.send(Message::new(cmd::PROVIDER_STOP))
    }

    fn set_interval(&self, interval_ms: i32) -> Result<()> {
        self.send(Message::with_body(
            cmd::PROVIDER_ATTR_INT,
            &ListenerAttrInt {
                listener_id: 0,
                attribute: crate::protocol::attr::INTERVAL,
                value: interval_ms,
            }
            .encode(),
        ))
    }

    fn set_attribute_int(&self, attribute: i32, value: i32) -> Result<()> {
        self.send(Message::with_body(
            cmd::PROVIDER_ATTR_INT,
            &ListenerAttrInt {
                listener_id: 0,
                attribute,
                value,
            }
            .encode(),
        ))
    }
}
