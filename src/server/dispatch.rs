//! Command dispatch for one server-side connection
//!
//! Every accepted channel gets its own `ServerChannelHandler`, which owns
//! the listener proxies and the optional provider registration created over
//! that connection. Replies go out synchronously (ordered ahead of any
//! event traffic the command triggers); attribute-change notifications and
//! sensor added/removed announcements go out asynchronously after the
//! reply is on the wire.
//!
//! Protocol-level failures (bad body, unknown command, missing privilege)
//! answer with an error reply and leave the connection open. Transport
//! failures tear the connection down, which releases everything the peer
//! created through the `disconnected` path.

use crate::error::{Error, Result};
use crate::ipc::channel::{Channel, ChannelHandler};
use crate::ipc::message::Message;
use crate::protocol::{
    AttrIntReply, DataListReply, HasPrivilege, ListenerAttrInt, ListenerAttrStr, ListenerConnect,
    ListenerConnectReply, ListenerGetAttr, ListenerRef, ManagerAttrInt, ProviderPublish, attr, cmd,
};
use crate::sensor::application::ProviderControl;
use crate::sensor::external::ExternalSensorHandler;
use crate::sensor::handler::SharedHandler;
use crate::sensor::info::{Cursor, SensorInfo};
use crate::sensor::registry::SensorRegistry;
use crate::server::permission::{PermissionChecker, check_access};
use crate::server::proxy::ListenerProxy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// State shared by every connection: the registry, the privilege oracle,
/// and the live-connection list used for daemon-wide announcements
pub struct ServerState {
    registry: Mutex<SensorRegistry>,
    checker: Box<dyn PermissionChecker>,
    connections: Mutex<Vec<Weak<Channel>>>,
}

impl ServerState {
    pub fn new(registry: SensorRegistry, checker: Box<dyn PermissionChecker>) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(registry),
            checker,
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> &Mutex<SensorRegistry> {
        &self.registry
    }

    /// Remember a connection for announcements
    pub fn track(&self, channel: &Arc<Channel>) {
        self.connections.lock().push(Arc::downgrade(channel));
    }

    /// Best-effort async fan-out to every live connection
    fn announce(&self, command: u32, body: &[u8]) {
        let mut connections = self.connections.lock();
        connections.retain(|weak| match weak.upgrade() {
            Some(ch) if ch.is_connected() => {
                if let Err(e) = ch.send(Arc::new(Message::with_body(command, body))) {
                    log::debug!("announcement send failed: {}", e);
                }
                true
            }
            _ => false,
        });
    }
}

struct ProviderEntry {
    uri: String,
    handler: Arc<Mutex<ExternalSensorHandler>>,
}

/// Work deferred until after the reply is sent
enum AfterReply {
    None,
    AttrInt {
        handler: SharedHandler,
        exclude: u32,
        attribute: i32,
        value: i32,
    },
    AttrStr {
        handler: SharedHandler,
        exclude: u32,
        attribute: i32,
        value: Vec<u8>,
    },
    SensorAdded(SensorInfo),
}

pub struct ServerChannelHandler {
    state: Arc<ServerState>,
    listeners: Mutex<HashMap<u32, Arc<ListenerProxy>>>,
    provider: Mutex<Option<ProviderEntry>>,
}

impl ServerChannelHandler {
    pub fn new(state: Arc<ServerState>) -> Arc<Self> {
        Arc::new(Self {
            state,
            listeners: Mutex::new(HashMap::new()),
            provider: Mutex::new(None),
        })
    }

    fn listener(&self, id: u32) -> Result<Arc<ListenerProxy>> {
        self.listeners
            .lock()
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownListener(id))
    }

    fn handle(&self, channel: &Arc<Channel>, msg: &Message) -> Result<(Vec<u8>, AfterReply)> {
        match msg.cmd() {
            cmd::MANAGER_CONNECT => Ok((Vec::new(), AfterReply::None)),

            cmd::MANAGER_SENSOR_LIST => {
                let registry = self.state.registry.lock();
                if !registry.is_initialized() {
                    return Err(Error::NotInitialized);
                }
                Ok((registry.serialize_list(), AfterReply::None))
            }

            cmd::MANAGER_SET_ATTR_INT => {
                let req = ManagerAttrInt::decode(msg.body())?;
                let (info, handler) = {
                    let registry = self.state.registry.lock();
                    (registry.lookup_info(&req.uri)?, registry.lookup(&req.uri)?)
                };
                check_access(self.state.checker.as_ref(), channel.fd(), &info)?;
                let changed = handler
                    .lock()
                    .set_attribute_int(0, req.attribute, req.value)?;
                let after = if changed {
                    AfterReply::AttrInt {
                        handler,
                        exclude: 0,
                        attribute: req.attribute,
                        value: req.value,
                    }
                } else {
                    AfterReply::None
                };
                Ok((Vec::new(), after))
            }

            cmd::MANAGER_GET_ATTR_INT => {
                let req = ManagerAttrInt::decode(msg.body())?;
                let (info, handler) = {
                    let registry = self.state.registry.lock();
                    (registry.lookup_info(&req.uri)?, registry.lookup(&req.uri)?)
                };
                check_access(self.state.checker.as_ref(), channel.fd(), &info)?;
                let value = handler.lock().get_attribute_int(req.attribute)?;
                Ok((AttrIntReply { value }.encode(), AfterReply::None))
            }

            cmd::LISTENER_CONNECT => {
                let req = ListenerConnect::decode(msg.body())?;
                let (info, handler) = {
                    let registry = self.state.registry.lock();
                    (registry.lookup_info(&req.uri)?, registry.lookup(&req.uri)?)
                };
                // privilege gate before the listener exists at all
                check_access(self.state.checker.as_ref(), channel.fd(), &info)?;
                let proxy = ListenerProxy::new(info.uri, handler, channel);
                let id = proxy.id();
                self.listeners.lock().insert(id, proxy);
                log::debug!("listener {} created on fd {}", id, channel.fd());
                Ok((
                    ListenerConnectReply { listener_id: id }.encode(),
                    AfterReply::None,
                ))
            }

            cmd::LISTENER_START => {
                let req = ListenerRef::decode(msg.body())?;
                self.listener(req.listener_id)?.start()?;
                Ok((Vec::new(), AfterReply::None))
            }

            cmd::LISTENER_STOP => {
                let req = ListenerRef::decode(msg.body())?;
                self.listener(req.listener_id)?.stop()?;
                Ok((Vec::new(), AfterReply::None))
            }

            cmd::LISTENER_SET_ATTR_INT => {
                let req = ListenerAttrInt::decode(msg.body())?;
                let proxy = self.listener(req.listener_id)?;
                let handler = proxy.handler().clone();
                match req.attribute {
                    attr::INTERVAL => {
                        handler.lock().set_interval(proxy.id(), req.value)?;
                        Ok((Vec::new(), AfterReply::None))
                    }
                    attr::MAX_BATCH_LATENCY => {
                        handler.lock().set_batch_latency(proxy.id(), req.value)?;
                        Ok((Vec::new(), AfterReply::None))
                    }
                    attr::FLUSH => {
                        handler.lock().flush(proxy.id())?;
                        Ok((Vec::new(), AfterReply::None))
                    }
                    // these scope to one subscription: stored on the proxy,
                    // never shared through the handler or broadcast
                    attr::PASSIVE_MODE | attr::PAUSE_POLICY | attr::AXIS_ORIENTATION => {
                        proxy.set_local_attr(req.attribute, req.value);
                        Ok((Vec::new(), AfterReply::None))
                    }
                    attribute => {
                        let changed =
                            handler
                                .lock()
                                .set_attribute_int(proxy.id(), attribute, req.value)?;
                        let after = if changed {
                            AfterReply::AttrInt {
                                handler,
                                exclude: proxy.id(),
                                attribute,
                                value: req.value,
                            }
                        } else {
                            AfterReply::None
                        };
                        Ok((Vec::new(), after))
                    }
                }
            }

            cmd::LISTENER_SET_ATTR_STR => {
                let req = ListenerAttrStr::decode(msg.body())?;
                let proxy = self.listener(req.listener_id)?;
                let handler = proxy.handler().clone();
                let changed =
                    handler
                        .lock()
                        .set_attribute_str(proxy.id(), req.attribute, &req.value)?;
                let after = if changed {
                    AfterReply::AttrStr {
                        handler,
                        exclude: proxy.id(),
                        attribute: req.attribute,
                        value: req.value,
                    }
                } else {
                    AfterReply::None
                };
                Ok((Vec::new(), after))
            }

            cmd::LISTENER_GET_ATTR_INT => {
                let req = ListenerGetAttr::decode(msg.body())?;
                let proxy = self.listener(req.listener_id)?;
                let value = match req.attribute {
                    attr::PASSIVE_MODE | attr::PAUSE_POLICY | attr::AXIS_ORIENTATION => proxy
                        .local_attr(req.attribute)
                        .ok_or_else(|| {
                            Error::InvalidParameter(format!(
                                "attribute {} never set",
                                req.attribute
                            ))
                        })?,
                    attribute => proxy.handler().lock().get_attribute_int(attribute)?,
                };
                Ok((AttrIntReply { value }.encode(), AfterReply::None))
            }

            cmd::LISTENER_GET_ATTR_STR => {
                let req = ListenerGetAttr::decode(msg.body())?;
                let proxy = self.listener(req.listener_id)?;
                let value = proxy.handler().lock().get_attribute_str(req.attribute)?;
                Ok((value, AfterReply::None))
            }

            cmd::LISTENER_GET_DATA => {
                let req = ListenerRef::decode(msg.body())?;
                let proxy = self.listener(req.listener_id)?;
                let data = proxy.handler().lock().get_data()?;
                Ok((data.encode(), AfterReply::None))
            }

            cmd::LISTENER_GET_DATA_LIST => {
                // body: [u32 count][u32 listener_id]*
                let mut cur = Cursor::new(msg.body());
                let count = cur.get_u32()? as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let id = cur.get_u32()?;
                    let proxy = self.listener(id)?;
                    // a failing sensor truncates the list, earlier entries
                    // still go back to the caller
                    match proxy.handler().lock().get_data() {
                        Ok(data) => entries.push(data),
                        Err(e) => {
                            log::debug!("get_data for listener {} failed: {}", id, e);
                            break;
                        }
                    }
                }
                Ok((DataListReply { entries }.encode(), AfterReply::None))
            }

            cmd::HAS_PRIVILEGE => {
                let req = HasPrivilege::decode(msg.body())?;
                let info = self.state.registry.lock().lookup_info(&req.uri)?;
                check_access(self.state.checker.as_ref(), channel.fd(), &info)?;
                Ok((Vec::new(), AfterReply::None))
            }

            cmd::PROVIDER_CONNECT => {
                let info = SensorInfo::deserialize(msg.body())?;
                if self.provider.lock().is_some() {
                    return Err(Error::InvalidParameter(
                        "connection already provides a sensor".into(),
                    ));
                }
                let handler = self.state.registry.lock().register_external(
                    info.clone(),
                    Box::new(ProviderControl::new(channel.clone())),
                )?;
                *self.provider.lock() = Some(ProviderEntry {
                    uri: info.uri.clone(),
                    handler,
                });
                log::info!("provider sensor {} registered on fd {}", info.uri, channel.fd());
                Ok((Vec::new(), AfterReply::SensorAdded(info)))
            }

            cmd::PROVIDER_PUBLISH => {
                let req = ProviderPublish::decode(msg.body())?;
                let handler = {
                    let provider = self.provider.lock();
                    match provider.as_ref() {
                        Some(entry) if entry.uri == req.uri => entry.handler.clone(),
                        Some(_) => {
                            return Err(Error::InvalidParameter(format!(
                                "connection does not provide {}",
                                req.uri
                            )));
                        }
                        None => return Err(Error::SensorNotFound(req.uri)),
                    }
                };
                handler.lock().publish(&req.data);
                Ok((Vec::new(), AfterReply::None))
            }

            other => Err(Error::UnknownCommand(other)),
        }
    }

    fn run_after(&self, after: AfterReply) {
        match after {
            AfterReply::None => {}
            AfterReply::AttrInt {
                handler,
                exclude,
                attribute,
                value,
            } => handler
                .lock()
                .broadcast_attribute_int(exclude, attribute, value),
            AfterReply::AttrStr {
                handler,
                exclude,
                attribute,
                value,
            } => handler
                .lock()
                .broadcast_attribute_str(exclude, attribute, &value),
            AfterReply::SensorAdded(info) => {
                self.state
                    .announce(cmd::MANAGER_SENSOR_ADDED, &info.serialize());
            }
        }
    }
}

impl ChannelHandler for ServerChannelHandler {
    fn read(&self, channel: &Arc<Channel>, message: Message) {
        let (reply, after) = match self.handle(channel, &message) {
            Ok((body, after)) => (
                Message::reply_to(message.cmd(), message.id(), &body),
                after,
            ),
            Err(e) => {
                log::debug!("command {:#06x} failed: {}", message.cmd(), e);
                (
                    Message::error_reply(message.cmd(), message.id(), e.errno()),
                    AfterReply::None,
                )
            }
        };
        if let Err(e) = channel.send_sync(&reply) {
            log::warn!("reply send failed on fd {}: {}", channel.fd(), e);
            channel.disconnect();
            return;
        }
        self.run_after(after);
    }

    fn read_error(&self, channel: &Arc<Channel>, error: &Error) {
        // oversized frame was drained; tell the peer and keep going
        if let Error::OversizedMessage { cmd, .. } = error {
            let reply = Message::error_reply(*cmd, 0, error.errno());
            if let Err(e) = channel.send_sync(&reply) {
                log::warn!("error reply send failed: {}", e);
                channel.disconnect();
            }
        }
    }

    fn disconnected(&self, channel: &Arc<Channel>) {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for (id, proxy) in listeners {
            if let Err(e) = proxy.stop() {
                log::debug!("listener {} cleanup: {}", id, e);
            }
        }
        if let Some(entry) = self.provider.lock().take() {
            match self.state.registry.lock().deregister(&entry.uri) {
                Ok(info) => {
                    self.state
                        .announce(cmd::MANAGER_SENSOR_REMOVED, &info.serialize());
                }
                Err(e) => log::debug!("provider {} cleanup: {}", entry.uri, e),
            }
        }
        log::debug!("connection fd {} cleaned up", channel.fd());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::event_loop::EventLoop;
    use crate::ipc::socket::StreamSocket;
    use crate::sensor::data::SensorData;
    use crate::sensor::device::SensorDevice;
    use crate::sensor::info::SensorType;
    use crate::server::permission::AllowAll;
    use std::os::unix::io::RawFd;
    use std::os::unix::net::UnixStream;

    const ACCEL: &str = "http://example.org/sensor/general/accelerometer/mock";
    const PRIVILEGED: &str = "http://example.org/sensor/healthinfo/pedometer/mock";

    struct Dev {
        info: SensorInfo,
    }

    impl Dev {
        fn boxed(uri: &str, privilege: &str, min_interval: i32) -> Box<dyn SensorDevice> {
            Box::new(Dev {
                info: SensorInfo {
                    sensor_type: SensorType::Accelerometer,
                    uri: uri.into(),
                    model: "mock".into(),
                    vendor: "test".into(),
                    min_range: -10.0,
                    max_range: 10.0,
                    resolution: 0.01,
                    min_interval,
                    max_batch_count: 0,
                    wakeup_supported: false,
                    privilege: privilege.into(),
                },
            })
        }
    }

    impl SensorDevice for Dev {
        fn info(&self) -> &SensorInfo {
            &self.info
        }

        fn get_data(&mut self) -> Result<SensorData> {
            Ok(SensorData {
                timestamp: 777,
                accuracy: 2,
                values: vec![0.0, 0.0, 9.81],
            })
        }
    }

    struct DenyAll;

    impl PermissionChecker for DenyAll {
        fn has_privilege(&self, _peer_fd: RawFd, _privilege: &str) -> bool {
            false
        }
    }

    struct Harness {
        server: Arc<ServerChannelHandler>,
        server_chan: Arc<Channel>,
        client_chan: Arc<Channel>,
        _event_loop: EventLoop,
    }

    fn harness(checker: Box<dyn PermissionChecker>) -> Harness {
        let mut registry = SensorRegistry::new();
        registry
            .init(
                vec![
                    Dev::boxed(ACCEL, "", 10),
                    Dev::boxed(PRIVILEGED, "healthinfo", 100),
                ],
                vec![],
                vec![],
            )
            .unwrap();
        let state = ServerState::new(registry, checker);
        let server = ServerChannelHandler::new(state.clone());

        let event_loop = EventLoop::new().unwrap();
        let (a, b) = UnixStream::pair().unwrap();
        let server_chan = Channel::new(StreamSocket::from_stream(a).unwrap());
        server_chan
            .bind(server.clone(), &event_loop.handle(), false)
            .unwrap();
        state.track(&server_chan);
        let client_chan = Channel::new(StreamSocket::from_stream(b).unwrap());
        Harness {
            server,
            server_chan,
            client_chan,
            _event_loop: event_loop,
        }
    }

    impl Harness {
        /// Push a request through the dispatcher and collect the reply
        fn request(&self, command: u32, body: &[u8]) -> Message {
            let msg = Message::with_body(command, body);
            let id = msg.id();
            self.server.read(&self.server_chan, msg);
            let reply = self.client_chan.read_sync().unwrap();
            assert_eq!(reply.id(), id, "reply must echo the request id");
            assert_eq!(reply.cmd(), command);
            reply
        }
    }

    #[test]
    fn test_sensor_list_roundtrip() {
        let h = harness(Box::new(AllowAll));
        let reply = h.request(cmd::MANAGER_SENSOR_LIST, &[]);
        assert_eq!(reply.err(), 0);
        let list = SensorInfo::deserialize_list(reply.body()).unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].uri, ACCEL);
        assert_eq!(list[0].min_interval, 10);
    }

    #[test]
    fn test_listener_lifecycle() {
        let h = harness(Box::new(AllowAll));
        let reply = h.request(
            cmd::LISTENER_CONNECT,
            &ListenerConnect { uri: ACCEL.into() }.encode(),
        );
        assert_eq!(reply.err(), 0);
        let listener_id = ListenerConnectReply::decode(reply.body()).unwrap().listener_id;

        let reply = h.request(cmd::LISTENER_START, &ListenerRef { listener_id }.encode());
        assert_eq!(reply.err(), 0);

        let reply = h.request(cmd::LISTENER_GET_DATA, &ListenerRef { listener_id }.encode());
        assert_eq!(reply.err(), 0);
        let data = SensorData::decode(reply.body()).unwrap();
        assert_eq!(data.timestamp, 777);

        let reply = h.request(cmd::LISTENER_STOP, &ListenerRef { listener_id }.encode());
        assert_eq!(reply.err(), 0);
    }

    #[test]
    fn test_privilege_denied_before_any_mutation() {
        let h = harness(Box::new(DenyAll));
        let reply = h.request(
            cmd::LISTENER_CONNECT,
            &ListenerConnect {
                uri: PRIVILEGED.into(),
            }
            .encode(),
        );
        assert_eq!(reply.err(), -libc::EACCES);
        assert!(reply.is_empty());
        assert!(h.server.listeners.lock().is_empty());
    }

    #[test]
    fn test_has_privilege_reports_in_err_field() {
        let h = harness(Box::new(AllowAll));
        let reply = h.request(
            cmd::HAS_PRIVILEGE,
            &HasPrivilege {
                uri: PRIVILEGED.into(),
            }
            .encode(),
        );
        assert_eq!(reply.err(), 0);

        let h = harness(Box::new(DenyAll));
        let reply = h.request(
            cmd::HAS_PRIVILEGE,
            &HasPrivilege {
                uri: PRIVILEGED.into(),
            }
            .encode(),
        );
        assert_eq!(reply.err(), -libc::EACCES);
    }

    #[test]
    fn test_unknown_command_keeps_connection_alive() {
        let h = harness(Box::new(AllowAll));
        let reply = h.request(0x7777, &[]);
        assert_eq!(reply.err(), -libc::EINVAL);
        assert!(h.server_chan.is_connected());

        // connection still serves commands
        let reply = h.request(cmd::MANAGER_CONNECT, &[]);
        assert_eq!(reply.err(), 0);
    }

    #[test]
    fn test_unknown_listener_rejected() {
        let h = harness(Box::new(AllowAll));
        let reply = h.request(cmd::LISTENER_START, &ListenerRef { listener_id: 999 }.encode());
        assert_eq!(reply.err(), -libc::ENOENT);
    }

    #[test]
    fn test_interval_routed_through_attribute_command() {
        let h = harness(Box::new(AllowAll));
        let reply = h.request(
            cmd::LISTENER_CONNECT,
            &ListenerConnect { uri: ACCEL.into() }.encode(),
        );
        let listener_id = ListenerConnectReply::decode(reply.body()).unwrap().listener_id;
        h.request(cmd::LISTENER_START, &ListenerRef { listener_id }.encode());

        // below the device minimum of 10ms, must clamp rather than fail
        let reply = h.request(
            cmd::LISTENER_SET_ATTR_INT,
            &ListenerAttrInt {
                listener_id,
                attribute: attr::INTERVAL,
                value: 3,
            }
            .encode(),
        );
        assert_eq!(reply.err(), 0);
    }

    #[test]
    fn test_subscription_attrs_do_not_cross_listeners() {
        let h = harness(Box::new(AllowAll));
        let mut ids = [0u32; 2];
        for id in &mut ids {
            let reply = h.request(
                cmd::LISTENER_CONNECT,
                &ListenerConnect { uri: ACCEL.into() }.encode(),
            );
            *id = ListenerConnectReply::decode(reply.body()).unwrap().listener_id;
            h.request(cmd::LISTENER_START, &ListenerRef { listener_id: *id }.encode());
        }

        let reply = h.request(
            cmd::LISTENER_SET_ATTR_INT,
            &ListenerAttrInt {
                listener_id: ids[0],
                attribute: attr::PAUSE_POLICY,
                value: 1,
            }
            .encode(),
        );
        assert_eq!(reply.err(), 0);

        // the setter reads its own value back; a change event to the other
        // listener would arrive ahead of these replies and break correlation
        let reply = h.request(
            cmd::LISTENER_GET_ATTR_INT,
            &ListenerGetAttr {
                listener_id: ids[0],
                attribute: attr::PAUSE_POLICY,
            }
            .encode(),
        );
        assert_eq!(reply.err(), 0);
        assert_eq!(AttrIntReply::decode(reply.body()).unwrap().value, 1);

        let reply = h.request(
            cmd::LISTENER_GET_ATTR_INT,
            &ListenerGetAttr {
                listener_id: ids[1],
                attribute: attr::PAUSE_POLICY,
            }
            .encode(),
        );
        assert_eq!(reply.err(), -libc::EINVAL);
    }

    #[test]
    fn test_provider_connect_publish_and_cleanup() {
        let h = harness(Box::new(AllowAll));
        let info = SensorInfo {
            sensor_type: SensorType::Custom(77),
            uri: "http://example.org/sensor/custom/steps/provider".into(),
            model: "app".into(),
            vendor: "app".into(),
            min_range: 0.0,
            max_range: 1e6,
            resolution: 1.0,
            min_interval: 0,
            max_batch_count: 0,
            wakeup_supported: false,
            privilege: String::new(),
        };
        let reply = h.request(cmd::PROVIDER_CONNECT, &info.serialize());
        assert_eq!(reply.err(), 0);
        assert_eq!(h.server.state.registry.lock().len(), 3);

        // duplicate provider on the same connection is refused
        let reply = h.request(cmd::PROVIDER_CONNECT, &info.serialize());
        assert_eq!(reply.err(), -libc::EINVAL);

        let reply = h.request(
            cmd::PROVIDER_PUBLISH,
            &ProviderPublish {
                uri: info.uri.clone(),
                data: SensorData::now(vec![42.0]),
            }
            .encode(),
        );
        assert_eq!(reply.err(), 0);

        // disconnect removes the provider sensor from the registry
        h.server.disconnected(&h.server_chan);
        assert_eq!(h.server.state.registry.lock().len(), 2);
    }

    #[test]
    fn test_get_data_list_truncates_on_failure() {
        let h = harness(Box::new(AllowAll));
        let reply = h.request(
            cmd::LISTENER_CONNECT,
            &ListenerConnect { uri: ACCEL.into() }.encode(),
        );
        let listener_id = ListenerConnectReply::decode(reply.body()).unwrap().listener_id;

        let mut body = Vec::new();
        body.extend_from_slice(&1u32.to_le_bytes());
        body.extend_from_slice(&listener_id.to_le_bytes());
        let reply = h.request(cmd::LISTENER_GET_DATA_LIST, &body);
        assert_eq!(reply.err(), 0);
        let list = DataListReply::decode(reply.body()).unwrap();
        assert_eq!(list.entries.len(), 1);
    }
}
