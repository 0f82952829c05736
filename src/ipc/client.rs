//! IPC client: one outbound channel to the well-known socket path

use crate::error::Result;
use crate::ipc::channel::{Channel, ChannelHandler};
use crate::ipc::event_loop::LoopHandle;
use crate::ipc::socket::StreamSocket;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Factory for outbound channels to the daemon
pub struct IpcClient {
    path: PathBuf,
}

impl IpcClient {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Establish one channel. With `register = true` the channel's fd joins
    /// the caller's event loop for inbound event delivery; with `false` the
    /// channel is only usable for synchronous request/reply.
    pub fn connect(
        &self,
        handler: Arc<dyn ChannelHandler>,
        loop_handle: &LoopHandle,
        register: bool,
    ) -> Result<Arc<Channel>> {
        let socket = StreamSocket::connect(&self.path)?;
        let channel = Channel::new(socket);
        channel.connect(handler, loop_handle, register)?;
        log::debug!("connected to {} fd={}", self.path.display(), channel.fd());
        Ok(channel)
    }
}
