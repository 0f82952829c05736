//! Daemon orchestration
//!
//! Wires the pieces together: loads the HAL, initializes the registry,
//! starts the IPC server on the reactor, and runs until SIGINT/SIGTERM.

use crate::config::AppConfig;
use crate::error::Result;
use crate::hal;
use crate::ipc::event_loop::EventLoop;
use crate::ipc::server::IpcServer;
use crate::sensor::registry::SensorRegistry;
use crate::server::dispatch::{ServerChannelHandler, ServerState};
use crate::server::event::register_device_events;
use crate::server::permission::{AllowAll, PermissionChecker};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::thread;

pub struct App {
    config: AppConfig,
    checker: Option<Box<dyn PermissionChecker>>,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            checker: None,
        }
    }

    /// Swap in a privilege oracle; without one every access is granted
    pub fn with_permission_checker(mut self, checker: Box<dyn PermissionChecker>) -> Self {
        self.checker = Some(checker);
        self
    }

    /// Run until a termination signal stops the reactor
    pub fn run(mut self) -> Result<()> {
        let devices = hal::load_devices(&self.config.hal)?;
        let mut registry = SensorRegistry::new();
        registry.init(devices, Vec::new(), Vec::new())?;

        let checker = self.checker.take().unwrap_or_else(|| Box::new(AllowAll));
        let state = ServerState::new(registry, checker);

        let mut event_loop = EventLoop::new()?;
        let handle = event_loop.handle();

        let device_events = register_device_events(state.registry(), &handle);

        let accept_state = state.clone();
        let accept_handle = handle.clone();
        let server = IpcServer::start(
            &self.config.ipc.socket_path,
            std::time::Duration::from_millis(self.config.ipc.recv_timeout_ms),
            &handle,
            Box::new(move |channel| {
                let handler = ServerChannelHandler::new(accept_state.clone());
                channel.bind(handler, &accept_handle, true)?;
                accept_state.track(&channel);
                Ok(())
            }),
        )?;

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let signal_handle = handle.clone();
        thread::Builder::new()
            .name("indriya-signals".into())
            .spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    log::info!("signal {} received, shutting down", sig);
                    signal_handle.stop();
                }
            })?;

        log::info!("indriyad listening on {}", self.config.ipc.socket_path);
        event_loop.run(None)?;

        server.stop();
        for id in device_events {
            handle.remove_event(id);
        }
        state.registry().lock().deinit();
        log::info!("indriyad stopped");
        Ok(())
    }
}
