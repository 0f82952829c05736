//! Asynchronous IPC core: message framing, sockets, event loop, channels

pub mod channel;
pub mod client;
pub mod event_loop;
pub mod message;
pub mod server;
pub mod socket;

pub use channel::{Channel, ChannelHandler};
pub use client::IpcClient;
pub use event_loop::{EventCondition, EventHandler, EventId, EventLoop, LoopHandle};
pub use message::{MAX_MSG_CAPACITY, Message};
pub use server::IpcServer;
pub use socket::{SeqPacketSocket, ServerSocket, StreamSocket};
