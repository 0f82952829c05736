//! Server side: dispatch, listener proxies, privilege checks, device events

pub mod dispatch;
pub mod event;
pub mod permission;
pub mod proxy;

pub use dispatch::{ServerChannelHandler, ServerState};
pub use event::register_device_events;
pub use permission::{AllowAll, PermissionChecker, check_access};
pub use proxy::ListenerProxy;
