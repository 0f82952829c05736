//! Client library for talking to the daemon
//!
//! One connection carries both request/reply traffic and the event stream.
//! Replies are matched to requests by the echoed header id, so events can
//! interleave freely. Two background threads per client:
//!
//! - the loop thread pumps the client-side reactor (inbound messages,
//!   async sends),
//! - the delivery thread runs user callbacks, fed through a blocking
//!   queue so a slow callback never stalls the reactor.

use crate::error::{Error, Result};
use crate::ipc::channel::{Channel, ChannelHandler};
use crate::ipc::client::IpcClient;
use crate::ipc::event_loop::EventLoop;
use crate::ipc::message::Message;
use crate::protocol::{
    AttrIntReply, HasPrivilege, ListenerAccuracyEvent, ListenerAttrInt, ListenerAttrStr,
    ListenerConnect, ListenerConnectReply, ListenerGetAttr, ListenerRef, ManagerAttrInt,
    ProviderPublish, attr, cmd,
};
use crate::sensor::data::SensorData;
use crate::sensor::info::SensorInfo;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// How long a request waits for its reply
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub type DataCallback = Box<dyn Fn(&SensorData) + Send>;
pub type AttrIntCallback = Box<dyn Fn(i32, i32) + Send>;
pub type AccuracyCallback = Box<dyn Fn(u64, i32) + Send>;

#[derive(Default)]
struct ListenerCallbacks {
    data: Mutex<Option<DataCallback>>,
    attr_int: Mutex<Option<AttrIntCallback>>,
    accuracy: Mutex<Option<AccuracyCallback>>,
}

enum Delivery {
    Data {
        listener_id: u32,
        data: SensorData,
    },
    AttrInt {
        listener_id: u32,
        attribute: i32,
        value: i32,
    },
    Accuracy {
        listener_id: u32,
        timestamp: u64,
        accuracy: i32,
    },
    Shutdown,
}

struct ClientCore {
    channel: Mutex<Option<Arc<Channel>>>,
    waiters: Mutex<HashMap<u64, Sender<Message>>>,
    callbacks: Mutex<HashMap<u32, Arc<ListenerCallbacks>>>,
    delivery_tx: Sender<Delivery>,
}

impl ClientCore {
    fn channel(&self) -> Result<Arc<Channel>> {
        self.channel.lock().clone().ok_or(Error::NotConnected)
    }

    /// Send one command and block for its reply
    fn request(&self, command: u32, body: &[u8]) -> Result<Message> {
        let channel = self.channel()?;
        let msg = Message::with_body(command, body);
        let id = msg.id();
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.waiters.lock().insert(id, tx);

        if let Err(e) = channel.send_sync(&msg) {
            self.waiters.lock().remove(&id);
            return Err(e);
        }
        let reply = match rx.recv_timeout(REPLY_TIMEOUT) {
            Ok(reply) => reply,
            Err(_) => {
                self.waiters.lock().remove(&id);
                return Err(Error::Timeout);
            }
        };
        if reply.err() != 0 {
            return Err(Error::from_wire(reply.err()));
        }
        Ok(reply)
    }
}

struct ClientChannelHandler {
    core: Arc<ClientCore>,
}

impl ChannelHandler for ClientChannelHandler {
    fn read(&self, _channel: &Arc<Channel>, message: Message) {
        // a registered waiter means this is a reply
        if let Some(waiter) = self.core.waiters.lock().remove(&message.id()) {
            let _ = waiter.send(message);
            return;
        }
        match message.cmd() {
            cmd::LISTENER_EVENT => match crate::protocol::ListenerEvent::decode(message.body()) {
                Ok(event) => {
                    let _ = self.core.delivery_tx.send(Delivery::Data {
                        listener_id: event.listener_id,
                        data: event.data,
                    });
                }
                Err(e) => log::warn!("malformed event: {}", e),
            },
            cmd::LISTENER_SET_ATTR_INT => match ListenerAttrInt::decode(message.body()) {
                Ok(change) => {
                    let _ = self.core.delivery_tx.send(Delivery::AttrInt {
                        listener_id: change.listener_id,
                        attribute: change.attribute,
                        value: change.value,
                    });
                }
                Err(e) => log::warn!("malformed attribute event: {}", e),
            },
            cmd::LISTENER_ACCURACY_EVENT => match ListenerAccuracyEvent::decode(message.body()) {
                Ok(event) => {
                    let _ = self.core.delivery_tx.send(Delivery::Accuracy {
                        listener_id: event.listener_id,
                        timestamp: event.timestamp,
                        accuracy: event.accuracy,
                    });
                }
                Err(e) => log::warn!("malformed accuracy event: {}", e),
            },
            cmd::MANAGER_SENSOR_ADDED | cmd::MANAGER_SENSOR_REMOVED => {
                log::debug!("sensor list changed (cmd {:#06x})", message.cmd());
            }
            other => log::debug!("unsolicited message cmd {:#06x} ignored", other),
        }
    }

    fn disconnected(&self, _channel: &Arc<Channel>) {
        // fail every in-flight request
        self.core.waiters.lock().clear();
        *self.core.channel.lock() = None;
        log::debug!("client channel disconnected");
    }
}

/// Connection to the daemon
pub struct SensorClient {
    core: Arc<ClientCore>,
    loop_handle: crate::ipc::event_loop::LoopHandle,
    loop_thread: Option<thread::JoinHandle<()>>,
    delivery_thread: Option<thread::JoinHandle<()>>,
}

impl SensorClient {
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut event_loop = EventLoop::new()?;
        let loop_handle = event_loop.handle();

        let (delivery_tx, delivery_rx) = crossbeam_channel::unbounded();
        let core = Arc::new(ClientCore {
            channel: Mutex::new(None),
            waiters: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            delivery_tx,
        });

        let handler = Arc::new(ClientChannelHandler { core: core.clone() });
        let channel = IpcClient::new(path).connect(handler, &loop_handle, true)?;
        *core.channel.lock() = Some(channel);

        let loop_thread = thread::Builder::new()
            .name("indriya-client-loop".into())
            .spawn(move || {
                if let Err(e) = event_loop.run(None) {
                    log::error!("client loop failed: {}", e);
                }
            })?;

        let delivery_core = core.clone();
        let delivery_thread = thread::Builder::new()
            .name("indriya-client-deliver".into())
            .spawn(move || deliver(delivery_core, delivery_rx))?;

        Ok(Self {
            core,
            loop_handle,
            loop_thread: Some(loop_thread),
            delivery_thread: Some(delivery_thread),
        })
    }

    /// Descriptions of every sensor the daemon serves
    pub fn sensor_list(&self) -> Result<Vec<SensorInfo>> {
        let reply = self.core.request(cmd::MANAGER_SENSOR_LIST, &[])?;
        SensorInfo::deserialize_list(reply.body())
    }

    /// Whether this process may access the sensor behind `uri`
    pub fn has_privilege(&self, uri: &str) -> Result<bool> {
        match self.core.request(cmd::HAS_PRIVILEGE, &HasPrivilege { uri: uri.into() }.encode()) {
            Ok(_) => Ok(true),
            Err(Error::PermissionDenied(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Set a sensor attribute daemon-wide, without a listener
    pub fn set_sensor_attribute(&self, uri: &str, attribute: i32, value: i32) -> Result<()> {
        self.core.request(
            cmd::MANAGER_SET_ATTR_INT,
            &ManagerAttrInt {
                uri: uri.into(),
                attribute,
                value,
            }
            .encode(),
        )?;
        Ok(())
    }

    /// Create a listener on the sensor behind `uri` (exact or tail pattern)
    pub fn create_listener(&self, uri: &str) -> Result<SensorListener> {
        let reply = self
            .core
            .request(cmd::LISTENER_CONNECT, &ListenerConnect { uri: uri.into() }.encode())?;
        let id = ListenerConnectReply::decode(reply.body())?.listener_id;
        let callbacks = Arc::new(ListenerCallbacks::default());
        self.core.callbacks.lock().insert(id, callbacks.clone());
        Ok(SensorListener {
            core: self.core.clone(),
            callbacks,
            id,
        })
    }

    /// Register this connection as the provider of a new sensor
    pub fn register_provider(&self, info: &SensorInfo) -> Result<SensorProvider> {
        self.core.request(cmd::PROVIDER_CONNECT, &info.serialize())?;
        Ok(SensorProvider {
            core: self.core.clone(),
            uri: info.uri.clone(),
        })
    }

    /// Tear the connection down and join the background threads
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(channel) = self.core.channel.lock().take() {
            channel.disconnect();
        }
        self.loop_handle.stop();
        if let Some(t) = self.loop_thread.take() {
            let _ = t.join();
        }
        let _ = self.core.delivery_tx.send(Delivery::Shutdown);
        if let Some(t) = self.delivery_thread.take() {
            let _ = t.join();
        }
    }
}

impl Drop for SensorClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn deliver(core: Arc<ClientCore>, rx: Receiver<Delivery>) {
    while let Ok(delivery) = rx.recv() {
        match delivery {
            Delivery::Data { listener_id, data } => {
                let callbacks = core.callbacks.lock().get(&listener_id).cloned();
                if let Some(cb) = callbacks
                    && let Some(f) = cb.data.lock().as_ref()
                {
                    f(&data);
                }
            }
            Delivery::AttrInt {
                listener_id,
                attribute,
                value,
            } => {
                let callbacks = core.callbacks.lock().get(&listener_id).cloned();
                if let Some(cb) = callbacks
                    && let Some(f) = cb.attr_int.lock().as_ref()
                {
                    f(attribute, value);
                }
            }
            Delivery::Accuracy {
                listener_id,
                timestamp,
                accuracy,
            } => {
                let callbacks = core.callbacks.lock().get(&listener_id).cloned();
                if let Some(cb) = callbacks
                    && let Some(f) = cb.accuracy.lock().as_ref()
                {
                    f(timestamp, accuracy);
                }
            }
            Delivery::Shutdown => break,
        }
    }
}

/// One subscription to one sensor
pub struct SensorListener {
    core: Arc<ClientCore>,
    callbacks: Arc<ListenerCallbacks>,
    id: u32,
}

impl SensorListener {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Callback for the event stream, run on the delivery thread
    pub fn set_data_callback<F>(&self, f: F)
    where
        F: Fn(&SensorData) + Send + 'static,
    {
        *self.callbacks.data.lock() = Some(Box::new(f));
    }

    /// Callback for attribute changes made by other observers
    pub fn set_attribute_callback<F>(&self, f: F)
    where
        F: Fn(i32, i32) + Send + 'static,
    {
        *self.callbacks.attr_int.lock() = Some(Box::new(f));
    }

    /// Callback for stream accuracy changes, run on the delivery thread
    pub fn set_accuracy_callback<F>(&self, f: F)
    where
        F: Fn(u64, i32) + Send + 'static,
    {
        *self.callbacks.accuracy.lock() = Some(Box::new(f));
    }

    pub fn start(&self) -> Result<()> {
        self.core
            .request(cmd::LISTENER_START, &ListenerRef { listener_id: self.id }.encode())?;
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        self.core
            .request(cmd::LISTENER_STOP, &ListenerRef { listener_id: self.id }.encode())?;
        Ok(())
    }

    pub fn set_interval(&self, interval_ms: i32) -> Result<()> {
        self.set_attribute_int(attr::INTERVAL, interval_ms)
    }

    pub fn set_max_batch_latency(&self, latency_ms: i32) -> Result<()> {
        self.set_attribute_int(attr::MAX_BATCH_LATENCY, latency_ms)
    }

    pub fn flush(&self) -> Result<()> {
        self.set_attribute_int(attr::FLUSH, 0)
    }

    pub fn set_attribute_int(&self, attribute: i32, value: i32) -> Result<()> {
        self.core.request(
            cmd::LISTENER_SET_ATTR_INT,
            &ListenerAttrInt {
                listener_id: self.id,
                attribute,
                value,
            }
            .encode(),
        )?;
        Ok(())
    }

    pub fn set_attribute_str(&self, attribute: i32, value: &[u8]) -> Result<()> {
        self.core.request(
            cmd::LISTENER_SET_ATTR_STR,
            &ListenerAttrStr {
                listener_id: self.id,
                attribute,
                value: value.to_vec(),
            }
            .encode(),
        )?;
        Ok(())
    }

    pub fn get_attribute_int(&self, attribute: i32) -> Result<i32> {
        let reply = self.core.request(
            cmd::LISTENER_GET_ATTR_INT,
            &ListenerGetAttr {
                listener_id: self.id,
                attribute,
            }
            .encode(),
        )?;
        Ok(AttrIntReply::decode(reply.body())?.value)
    }

    /// Most recent sample, on demand
    pub fn get_data(&self) -> Result<SensorData> {
        let reply = self
            .core
            .request(cmd::LISTENER_GET_DATA, &ListenerRef { listener_id: self.id }.encode())?;
        SensorData::decode(reply.body())
    }
}

impl Drop for SensorListener {
    fn drop(&mut self) {
        self.core.callbacks.lock().remove(&self.id);
    }
}

/// Publishing side of a provider-registered sensor
pub struct SensorProvider {
    core: Arc<ClientCore>,
    uri: String,
}

impl SensorProvider {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Push one sample into the daemon
    pub fn publish(&self, data: SensorData) -> Result<()> {
        self.core.request(
            cmd::PROVIDER_PUBLISH,
            &ProviderPublish {
                uri: self.uri.clone(),
                data,
            }
            .encode(),
        )?;
        Ok(())
    }
}
