//! IPC channel: one connected socket plus its event-loop registrations
//!
//! A channel exclusively owns its socket; dropping the channel closes it.
//! Two send paths with different guarantees:
//!
//! - `send_sync`/`read_sync`: blocking (bounded by the socket receive
//!   timeout) header-then-body transfer, strictly ordered on one channel.
//!   Used for short request/reply exchanges. Outbound frames are serialized
//!   by a per-channel write lock, so concurrent senders never interleave
//!   header and body bytes.
//! - `send`: asynchronous, queued. Registers a one-shot OUT-ready handler
//!   that performs the transfer when the fd becomes writable, retrying up to
//!   3 times with a 3ms backoff while the kernel send buffer sits above a
//!   128KB high-water mark, then drops the message (logged). Two overlapping
//!   async sends are independent one-shot registrations; callers needing
//!   strict ordering use `send_sync`.
//!
//! Reactor-driven reads go through `try_read`, which buffers partial
//! headers and bodies across readiness events instead of blocking the loop
//! for a slow peer.
//!
//! `disconnect()` is idempotent: it cancels all pending registrations plus
//! the primary one, fires the handler's `disconnected` callback exactly
//! once, and shuts the socket down.

use crate::error::{Error, Result};
use crate::ipc::event_loop::{
    EventCondition, EventHandler, EventId, INVALID_EVENT_ID, LoopHandle,
};
use crate::ipc::message::{HEADER_SIZE, Header, MAX_MSG_CAPACITY, Message};
use crate::ipc::socket::StreamSocket;
use parking_lot::Mutex;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Kernel outbound buffer level above which async sends back off
pub const SEND_BUF_HIGH_WATER: usize = 128 * 1024;

/// Async send attempts before the message is shed
const SEND_RETRY_LIMIT: u32 = 3;

/// Backoff between async send attempts
const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(3);

nix::ioctl_read_bad!(ioctl_outq, libc::TIOCOUTQ, libc::c_int);

/// Bytes sitting unsent in the kernel send buffer for `fd`
fn outq_bytes(fd: RawFd) -> usize {
    let mut n: libc::c_int = 0;
    // SAFETY: TIOCOUTQ reads an int; fd is a live socket
    match unsafe { ioctl_outq(fd, &mut n) } {
        Ok(_) => n.max(0) as usize,
        Err(_) => 0,
    }
}

/// Callbacks a channel owner receives
pub trait ChannelHandler: Send + Sync {
    /// Outbound connection established (client side)
    fn connected(&self, _channel: &Arc<Channel>) {}

    /// Channel torn down; called exactly once per channel
    fn disconnected(&self, _channel: &Arc<Channel>) {}

    /// A complete inbound message
    fn read(&self, channel: &Arc<Channel>, message: Message);

    /// A protocol-level read failure that did not kill the connection
    /// (e.g. an oversized message that was drained off the stream)
    fn read_error(&self, _channel: &Arc<Channel>, _error: &Error) {}
}

struct ChannelState {
    connected: bool,
    /// Primary (persistent) read registration
    event_id: EventId,
    /// One-shot async send/read registrations still in flight
    pending_ids: Vec<EventId>,
    handler: Option<Arc<dyn ChannelHandler>>,
    loop_handle: Option<LoopHandle>,
}

/// Partial inbound frame carried across readiness events. A slow peer may
/// deliver a header or body in fragments; the reactor must never block
/// waiting for the rest.
#[derive(Default)]
struct ReadState {
    hdr_buf: [u8; HEADER_SIZE],
    hdr_got: usize,
    header: Option<Header>,
    body: Vec<u8>,
    body_got: usize,
    /// Oversized-frame drain in progress: bytes left, plus the header
    /// fields for the eventual error report
    skip_remaining: usize,
    skip_cmd: u32,
    skip_declared: usize,
}

/// One IPC connection
pub struct Channel {
    socket: StreamSocket,
    state: Mutex<ChannelState>,
    read_state: Mutex<ReadState>,
    /// Serializes whole frames; concurrent senders must not interleave
    /// header and body bytes on the wire
    write_lock: Mutex<()>,
}

impl Channel {
    /// Wrap a connected socket. The channel now owns it.
    pub fn new(socket: StreamSocket) -> Arc<Self> {
        Arc::new(Self {
            socket,
            state: Mutex::new(ChannelState {
                connected: false,
                event_id: INVALID_EVENT_ID,
                pending_ids: Vec::new(),
                handler: None,
                loop_handle: None,
            }),
            read_state: Mutex::new(ReadState::default()),
            write_lock: Mutex::new(()),
        })
    }

    /// Server side: associate a handler and (optionally) register the fd for
    /// readiness notification
    pub fn bind(
        self: &Arc<Self>,
        handler: Arc<dyn ChannelHandler>,
        loop_handle: &LoopHandle,
        register: bool,
    ) -> Result<()> {
        self.attach(handler, loop_handle, register)
    }

    /// Client side: same as `bind` but fires the `connected` callback
    pub fn connect(
        self: &Arc<Self>,
        handler: Arc<dyn ChannelHandler>,
        loop_handle: &LoopHandle,
        register: bool,
    ) -> Result<()> {
        self.attach(handler.clone(), loop_handle, register)?;
        handler.connected(self);
        Ok(())
    }

    fn attach(
        self: &Arc<Self>,
        handler: Arc<dyn ChannelHandler>,
        loop_handle: &LoopHandle,
        register: bool,
    ) -> Result<()> {
        let mut st = self.state.lock();
        st.handler = Some(handler);
        st.loop_handle = Some(loop_handle.clone());
        st.connected = true;
        if register {
            self.socket.set_nonblocking(true)?;
            let id = loop_handle.add_event(
                self.socket.fd(),
                EventCondition::IN | EventCondition::HUP | EventCondition::NVAL,
                Box::new(ChannelReadHandler {
                    channel: Arc::downgrade(self),
                }),
            );
            if id == INVALID_EVENT_ID {
                return Err(Error::Other("event loop unavailable".into()));
            }
            st.event_id = id;
        }
        Ok(())
    }

    /// Raw fd, used as a connection identity key and for privilege checks
    pub fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    /// True until `disconnect()` runs
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Bound on this connection's synchronous transfers
    pub fn recv_timeout(&self) -> Duration {
        self.socket.recv_timeout()
    }

    /// Blocking ordered send: header first, then body (skipped when empty).
    /// One frame goes out at a time; concurrent callers queue on the write
    /// lock instead of interleaving.
    pub fn send_sync(&self, msg: &Message) -> Result<()> {
        let _frame = self.write_lock.lock();
        self.socket.send_exact(&msg.header().to_bytes())?;
        if !msg.is_empty() {
            self.socket.send_exact(msg.body())?;
        }
        Ok(())
    }

    /// Blocking ordered receive, bounded by the socket receive timeout.
    ///
    /// A header declaring a body above [`MAX_MSG_CAPACITY`] is rejected
    /// before any body is read into the message; the declared bytes are
    /// drained off the stream so subsequent framing stays aligned.
    pub fn read_sync(&self) -> Result<Message> {
        let mut hdr_buf = [0u8; HEADER_SIZE];
        self.socket.recv_exact(&mut hdr_buf)?;
        let header = Header::from_bytes(&hdr_buf);
        let len = header.length as usize;
        if len > MAX_MSG_CAPACITY {
            self.socket.skip_exact(len)?;
            return Err(Error::OversizedMessage {
                cmd: header.cmd,
                declared: len,
            });
        }
        let mut body = vec![0u8; len];
        if len > 0 {
            self.socket.recv_exact(&mut body)?;
        }
        Ok(Message::from_parts(header, body))
    }

    /// Non-blocking read for readiness-driven callers. `Ok(Some)` when a
    /// whole frame is in, `Ok(None)` when the stream ran dry mid-frame; the
    /// partial frame is kept and resumed on the next readiness event.
    ///
    /// An oversized frame is drained incrementally and reported as
    /// [`Error::OversizedMessage`] once its last byte is off the stream;
    /// framing stays aligned and the connection survives.
    pub fn try_read(&self) -> Result<Option<Message>> {
        let mut st = self.read_state.lock();
        loop {
            if st.skip_remaining > 0 {
                let mut scratch = [0u8; 4096];
                let want = scratch.len().min(st.skip_remaining);
                match self.socket.recv_some(&mut scratch[..want])? {
                    Some(n) => {
                        st.skip_remaining -= n;
                        if st.skip_remaining == 0 {
                            return Err(Error::OversizedMessage {
                                cmd: st.skip_cmd,
                                declared: st.skip_declared,
                            });
                        }
                    }
                    None => return Ok(None),
                }
                continue;
            }

            if st.header.is_none() {
                if st.hdr_got < HEADER_SIZE {
                    let got = st.hdr_got;
                    match self.socket.recv_some(&mut st.hdr_buf[got..])? {
                        Some(n) => st.hdr_got += n,
                        None => return Ok(None),
                    }
                    if st.hdr_got < HEADER_SIZE {
                        continue;
                    }
                }
                let header = Header::from_bytes(&st.hdr_buf);
                st.hdr_got = 0;
                let len = header.length as usize;
                if len > MAX_MSG_CAPACITY {
                    st.skip_remaining = len;
                    st.skip_cmd = header.cmd;
                    st.skip_declared = len;
                    continue;
                }
                st.body = vec![0u8; len];
                st.body_got = 0;
                st.header = Some(header);
            }

            if st.body_got < st.body.len() {
                let got = st.body_got;
                match self.socket.recv_some(&mut st.body[got..])? {
                    Some(n) => st.body_got += n,
                    None => return Ok(None),
                }
                if st.body_got < st.body.len() {
                    continue;
                }
            }

            let Some(header) = st.header.take() else {
                continue;
            };
            let body = std::mem::take(&mut st.body);
            st.body_got = 0;
            return Ok(Some(Message::from_parts(header, body)));
        }
    }

    /// Asynchronous send: queue the message behind a one-shot OUT-ready
    /// registration. Best-effort; may shed the message under backpressure.
    pub fn send(self: &Arc<Self>, msg: Arc<Message>) -> Result<()> {
        let loop_handle = {
            let st = self.state.lock();
            if !st.connected {
                return Err(Error::NotConnected);
            }
            st.loop_handle.clone().ok_or(Error::NotConnected)?
        };

        let reg_id = Arc::new(AtomicU64::new(INVALID_EVENT_ID));
        let id = loop_handle.add_event(
            self.socket.fd(),
            EventCondition::OUT | EventCondition::HUP | EventCondition::NVAL,
            Box::new(AsyncSendHandler {
                channel: Arc::downgrade(self),
                msg,
                retries: 0,
                reg_id: reg_id.clone(),
            }),
        );
        if id == INVALID_EVENT_ID {
            return Err(Error::Other("event loop unavailable".into()));
        }
        reg_id.store(id, Ordering::Release);
        self.state.lock().pending_ids.push(id);
        Ok(())
    }

    /// Asynchronous read: one-shot IN-ready registration that delivers the
    /// next inbound message through the handler without blocking the caller
    pub fn read(self: &Arc<Self>) -> Result<()> {
        let loop_handle = {
            let st = self.state.lock();
            if !st.connected {
                return Err(Error::NotConnected);
            }
            st.loop_handle.clone().ok_or(Error::NotConnected)?
        };

        let reg_id = Arc::new(AtomicU64::new(INVALID_EVENT_ID));
        let id = loop_handle.add_event(
            self.socket.fd(),
            EventCondition::IN | EventCondition::HUP | EventCondition::NVAL,
            Box::new(AsyncReadHandler {
                channel: Arc::downgrade(self),
                reg_id: reg_id.clone(),
            }),
        );
        if id == INVALID_EVENT_ID {
            return Err(Error::Other("event loop unavailable".into()));
        }
        reg_id.store(id, Ordering::Release);
        self.state.lock().pending_ids.push(id);
        Ok(())
    }

    /// Tear the channel down. Idempotent: the second and later calls are
    /// no-ops.
    pub fn disconnect(self: &Arc<Self>) {
        let (handler, loop_handle, event_id, pending) = {
            let mut st = self.state.lock();
            if !st.connected {
                return;
            }
            st.connected = false;
            (
                st.handler.take(),
                st.loop_handle.take(),
                std::mem::replace(&mut st.event_id, INVALID_EVENT_ID),
                std::mem::take(&mut st.pending_ids),
            )
        };

        if let Some(lh) = loop_handle {
            for id in pending {
                lh.remove_event(id);
            }
            if event_id != INVALID_EVENT_ID {
                lh.remove_event(event_id);
            }
        }
        if let Some(h) = handler {
            h.disconnected(self);
        }
        self.socket.shutdown();
    }

    fn current_handler(&self) -> Option<Arc<dyn ChannelHandler>> {
        self.state.lock().handler.clone()
    }

    fn finish_pending(&self, id: EventId) {
        if id == INVALID_EVENT_ID {
            return;
        }
        self.state.lock().pending_ids.retain(|p| *p != id);
    }
}

/// Persistent per-channel read registration
struct ChannelReadHandler {
    channel: Weak<Channel>,
}

impl EventHandler for ChannelReadHandler {
    fn handle(&mut self, _fd: RawFd, condition: EventCondition) -> Result<bool> {
        let Some(ch) = self.channel.upgrade() else {
            return Ok(false);
        };
        if condition.intersects(EventCondition::HUP | EventCondition::NVAL) {
            ch.disconnect();
            return Ok(false);
        }
        // Drain every complete frame; a partial one stays buffered in the
        // channel until the next readiness event
        loop {
            match ch.try_read() {
                Ok(Some(msg)) => {
                    if let Some(handler) = ch.current_handler() {
                        handler.read(&ch, msg);
                    }
                    if !ch.is_connected() {
                        return Ok(false);
                    }
                }
                Ok(None) => return Ok(true),
                // Stream stayed aligned; protocol error, connection survives
                Err(e @ Error::OversizedMessage { .. }) => {
                    if let Some(handler) = ch.current_handler() {
                        handler.read_error(&ch, &e);
                    }
                }
                Err(e) => {
                    log::debug!("channel read failed, disconnecting: {}", e);
                    ch.disconnect();
                    return Ok(false);
                }
            }
        }
    }
}

/// One-shot async send registration
struct AsyncSendHandler {
    channel: Weak<Channel>,
    msg: Arc<Message>,
    retries: u32,
    reg_id: Arc<AtomicU64>,
}

impl EventHandler for AsyncSendHandler {
    fn handle(&mut self, fd: RawFd, condition: EventCondition) -> Result<bool> {
        let Some(ch) = self.channel.upgrade() else {
            return Ok(false);
        };
        let my_id = self.reg_id.load(Ordering::Acquire);
        if condition.intersects(EventCondition::HUP | EventCondition::NVAL) {
            ch.finish_pending(my_id);
            return Ok(false);
        }

        if outq_bytes(fd) > SEND_BUF_HIGH_WATER {
            self.retries += 1;
            if self.retries >= SEND_RETRY_LIMIT {
                log::warn!(
                    "send buffer congested, dropping message cmd={:#06x} after {} retries",
                    self.msg.cmd(),
                    self.retries
                );
                ch.finish_pending(my_id);
                return Ok(false);
            }
            std::thread::sleep(SEND_RETRY_BACKOFF);
            return Ok(true);
        }

        if let Err(e) = ch.send_sync(&self.msg) {
            log::debug!("async send failed: {}", e);
        }
        ch.finish_pending(my_id);
        Ok(false)
    }
}

/// One-shot async read registration
struct AsyncReadHandler {
    channel: Weak<Channel>,
    reg_id: Arc<AtomicU64>,
}

impl EventHandler for AsyncReadHandler {
    fn handle(&mut self, _fd: RawFd, condition: EventCondition) -> Result<bool> {
        let Some(ch) = self.channel.upgrade() else {
            return Ok(false);
        };
        let my_id = self.reg_id.load(Ordering::Acquire);
        if condition.intersects(EventCondition::HUP | EventCondition::NVAL) {
            ch.finish_pending(my_id);
            ch.disconnect();
            return Ok(false);
        }
        match ch.try_read() {
            Ok(Some(msg)) => {
                ch.finish_pending(my_id);
                if let Some(handler) = ch.current_handler() {
                    handler.read(&ch, msg);
                }
                Ok(false)
            }
            // Mid-frame; stay registered until the frame completes
            Ok(None) => Ok(true),
            Err(e @ Error::OversizedMessage { .. }) => {
                ch.finish_pending(my_id);
                if let Some(handler) = ch.current_handler() {
                    handler.read_error(&ch, &e);
                }
                Ok(false)
            }
            Err(e) => {
                ch.finish_pending(my_id);
                log::debug!("async read failed, disconnecting: {}", e);
                ch.disconnect();
                Ok(false)
            }
        }
    }
}
