//! Listener proxy: the server-side stand-in for one client subscription
//!
//! A proxy is the terminal sink of the observer graph. It forwards each
//! sample to its client channel as an asynchronous event message; when the
//! channel is gone it answers `Drop` so fan-out sheds it on the spot. A
//! proxy's demands (interval, batch latency) live in the handler and vanish
//! with it, so stopping reverts the sensor to the remaining observers'
//! aggregate.

use crate::error::Result;
use crate::ipc::channel::Channel;
use crate::ipc::message::Message;
use crate::protocol::{ListenerAccuracyEvent, ListenerAttrInt, ListenerAttrStr, ListenerEvent, cmd};
use crate::sensor::data::SensorData;
use crate::sensor::handler::{
    ObserverAction, ObserverId, SensorObserver, SharedHandler, next_observer_id,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub struct ListenerProxy {
    id: ObserverId,
    uri: String,
    handler: SharedHandler,
    channel: Weak<Channel>,
    started: AtomicBool,
    // per-listener attributes (passive mode, pause policy, ...); these
    // scope to one subscription and never reach the shared handler
    attrs: Mutex<HashMap<i32, i32>>,
}

impl ListenerProxy {
    pub fn new(uri: String, handler: SharedHandler, channel: &Arc<Channel>) -> Arc<Self> {
        Arc::new(Self {
            id: next_observer_id(),
            uri,
            handler,
            channel: Arc::downgrade(channel),
            started: AtomicBool::new(false),
            attrs: Mutex::new(HashMap::new()),
        })
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn handler(&self) -> &SharedHandler {
        &self.handler
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Attach to the sensor; idempotent per proxy
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let observer: Arc<dyn SensorObserver> = self.clone();
        if let Err(e) = self.handler.lock().start(observer) {
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        Ok(())
    }

    /// Detach from the sensor, dropping this proxy's demands with it
    pub fn stop(&self) -> Result<()> {
        if !self.started.swap(false, Ordering::AcqRel) {
            // never attached, but demands may have been recorded
            let mut handler = self.handler.lock();
            handler.set_interval(self.id, 0)?;
            handler.set_batch_latency(self.id, 0)?;
            return Ok(());
        }
        let mut handler = self.handler.lock();
        // fan-out may have shed this proxy already (dead channel); a stop
        // after that is a success, not a protocol error
        if !handler.has_observer(self.id) {
            return Ok(());
        }
        handler.stop(self.id)
    }

    /// Store a per-listener attribute value
    pub fn set_local_attr(&self, attribute: i32, value: i32) {
        self.attrs.lock().insert(attribute, value);
    }

    /// Read back a per-listener attribute, if it was ever set
    pub fn local_attr(&self, attribute: i32) -> Option<i32> {
        self.attrs.lock().get(&attribute).copied()
    }

    fn post(&self, msg: Message) -> ObserverAction {
        let Some(channel) = self.channel.upgrade() else {
            return ObserverAction::Drop;
        };
        match channel.send(Arc::new(msg)) {
            Ok(()) => ObserverAction::Continue,
            Err(e) => {
                log::debug!("listener {} unreachable: {}", self.id, e);
                ObserverAction::Drop
            }
        }
    }
}

impl SensorObserver for ListenerProxy {
    fn id(&self) -> ObserverId {
        self.id
    }

    fn update(&self, _uri: &str, data: &SensorData) -> ObserverAction {
        let event = ListenerEvent {
            listener_id: self.id,
            data: data.clone(),
        };
        self.post(Message::with_body(cmd::LISTENER_EVENT, &event.encode()))
    }

    fn on_accuracy(&self, _uri: &str, timestamp: u64, accuracy: i32) {
        let event = ListenerAccuracyEvent {
            listener_id: self.id,
            timestamp,
            accuracy,
        };
        self.post(Message::with_body(
            cmd::LISTENER_ACCURACY_EVENT,
            &event.encode(),
        ));
    }

    fn on_attribute_int(&self, _uri: &str, attribute: i32, value: i32) {
        let body = ListenerAttrInt {
            listener_id: self.id,
            attribute,
            value,
        };
        self.post(Message::with_body(cmd::LISTENER_SET_ATTR_INT, &body.encode()));
    }

    fn on_attribute_str(&self, _uri: &str, attribute: i32, value: &[u8]) {
        let body = ListenerAttrStr {
            listener_id: self.id,
            attribute,
            value: value.to_vec(),
        };
        self.post(Message::with_body(cmd::LISTENER_SET_ATTR_STR, &body.encode()));
    }
}
