//! IPC server: accepts incoming connections and registers each as a channel

use crate::error::Result;
use crate::ipc::channel::Channel;
use crate::ipc::event_loop::{EventCondition, EventHandler, EventId, INVALID_EVENT_ID, LoopHandle};
use crate::ipc::socket::ServerSocket;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Invoked once per accepted connection with the freshly wrapped channel.
/// The callee is expected to `bind` the channel into the loop.
pub type AcceptCallback = Box<dyn Fn(Arc<Channel>) -> Result<()> + Send>;

/// Listens on the well-known socket path and hands each accepted connection
/// to the accept callback
pub struct IpcServer {
    event_id: EventId,
    loop_handle: LoopHandle,
}

impl IpcServer {
    /// Bind (or adopt the socket-activation fd), listen, and register the
    /// accept handler with the event loop. `recv_timeout` bounds synchronous
    /// transfers on every accepted connection.
    pub fn start<P: AsRef<Path>>(
        path: P,
        recv_timeout: Duration,
        loop_handle: &LoopHandle,
        on_accept: AcceptCallback,
    ) -> Result<Self> {
        let mut socket = ServerSocket::new(path);
        socket.bind()?;
        let fd = socket.fd()?;

        let event_id = loop_handle.add_event(
            fd,
            EventCondition::IN,
            Box::new(AcceptEventHandler {
                socket,
                recv_timeout,
                on_accept,
            }),
        );
        if event_id == INVALID_EVENT_ID {
            return Err(crate::error::Error::Other("event loop unavailable".into()));
        }

        Ok(Self {
            event_id,
            loop_handle: loop_handle.clone(),
        })
    }

    /// Deregister the accept handler (closes the listening socket)
    pub fn stop(&self) {
        self.loop_handle.remove_event(self.event_id);
    }
}

/// Persistent registration on the listening fd. Owns the server socket; the
/// socket dies with the registration.
struct AcceptEventHandler {
    socket: ServerSocket,
    recv_timeout: Duration,
    on_accept: AcceptCallback,
}

impl EventHandler for AcceptEventHandler {
    fn handle(&mut self, _fd: RawFd, condition: EventCondition) -> Result<bool> {
        if condition.intersects(EventCondition::HUP | EventCondition::NVAL) {
            log::error!("listening socket failed, stopping accept handler");
            return Ok(false);
        }
        // Drain every pending connection; accept is non-blocking
        while let Some(mut stream) = self.socket.accept()? {
            stream.set_recv_timeout(self.recv_timeout)?;
            let channel = Channel::new(stream);
            log::debug!("accepted client connection fd={}", channel.fd());
            if let Err(e) = (self.on_accept)(channel) {
                log::warn!("accept callback failed: {}", e);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::event_loop::EventLoop;
    use crate::ipc::socket::StreamSocket;
    use parking_lot::Mutex;

    #[test]
    fn test_accepted_channels_carry_configured_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("accept.sock");
        let mut el = EventLoop::new().unwrap();

        let accepted: Arc<Mutex<Vec<Arc<Channel>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = accepted.clone();
        let _server = IpcServer::start(
            &path,
            Duration::from_millis(250),
            &el.handle(),
            Box::new(move |ch| {
                sink.lock().push(ch);
                Ok(())
            }),
        )
        .unwrap();

        let _client = StreamSocket::connect(&path).unwrap();
        el.run(Some(100)).unwrap();

        let accepted = accepted.lock();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].recv_timeout(), Duration::from_millis(250));
    }
}
