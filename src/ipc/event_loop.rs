//! Single-threaded cooperative event loop
//!
//! One reactor thread multiplexes all registered file descriptors through
//! `poll(2)`. Registration hands handler ownership to the loop and returns an
//! opaque monotonically increasing 64-bit id (0 is reserved for "failed").
//! A handler whose `handle()` returns `Ok(false)` (or an error) is
//! deregistered; such handlers are queued for deferred release and dropped
//! once per iteration after dispatch, because multiple pending events within
//! one poll pass may still reference the same channel.
//!
//! `stop()` is safe to call from inside a handler callback: it only queues a
//! control message and writes the wakeup pipe, so unwinding happens at the
//! top of the next iteration rather than mid-dispatch.

use crate::error::{Error, Result};
use crossbeam_channel::{Receiver, Sender};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Opaque registration id. 0 is never a valid registration.
pub type EventId = u64;

/// Returned by [`LoopHandle::add_event`] when registration failed
pub const INVALID_EVENT_ID: EventId = 0;

bitflags::bitflags! {
    /// Readiness conditions a handler can register interest in / receive
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventCondition: u8 {
        const IN   = 0b0001;
        const OUT  = 0b0010;
        const HUP  = 0b0100;
        const NVAL = 0b1000;
    }
}

impl EventCondition {
    fn to_poll_flags(self) -> PollFlags {
        let mut flags = PollFlags::empty();
        if self.contains(EventCondition::IN) {
            flags |= PollFlags::POLLIN;
        }
        if self.contains(EventCondition::OUT) {
            flags |= PollFlags::POLLOUT;
        }
        flags
    }

    fn from_poll_flags(flags: PollFlags) -> Self {
        let mut cond = EventCondition::empty();
        if flags.contains(PollFlags::POLLIN) {
            cond |= EventCondition::IN;
        }
        if flags.contains(PollFlags::POLLOUT) {
            cond |= EventCondition::OUT;
        }
        if flags.intersects(PollFlags::POLLHUP | PollFlags::POLLERR) {
            cond |= EventCondition::HUP;
        }
        if flags.contains(PollFlags::POLLNVAL) {
            cond |= EventCondition::NVAL;
        }
        cond
    }
}

/// Callback registered for fd readiness.
///
/// Returning `Ok(false)` deregisters the handler (one-shot handlers use
/// this); returning `Ok(true)` keeps the registration alive.
pub trait EventHandler: Send {
    fn handle(&mut self, fd: RawFd, condition: EventCondition) -> Result<bool>;
}

enum Ctl {
    Add {
        id: EventId,
        fd: RawFd,
        cond: EventCondition,
        handler: Box<dyn EventHandler>,
    },
    Remove {
        id: EventId,
    },
    Stop,
}

/// Cloneable handle for registering events and stopping the loop from any
/// thread (including from inside a handler callback)
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<Ctl>,
    next_id: Arc<AtomicU64>,
    wakeup_w: Arc<OwnedFd>,
}

impl LoopHandle {
    /// Register interest in `cond` on `fd`. Ownership of `handler` transfers
    /// to the loop. Returns [`INVALID_EVENT_ID`] if the loop is gone.
    pub fn add_event(
        &self,
        fd: RawFd,
        cond: EventCondition,
        handler: Box<dyn EventHandler>,
    ) -> EventId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if self
            .tx
            .send(Ctl::Add {
                id,
                fd,
                cond,
                handler,
            })
            .is_err()
        {
            return INVALID_EVENT_ID;
        }
        self.wake();
        id
    }

    /// Deregister and destroy the handler registered under `id`
    pub fn remove_event(&self, id: EventId) {
        if id == INVALID_EVENT_ID {
            return;
        }
        let _ = self.tx.send(Ctl::Remove { id });
        self.wake();
    }

    /// Request loop termination at the next iteration boundary
    pub fn stop(&self) {
        let _ = self.tx.send(Ctl::Stop);
        self.wake();
    }

    fn wake(&self) {
        let _ = nix::unistd::write(&*self.wakeup_w, &[1u8]);
    }
}

struct Registration {
    fd: RawFd,
    cond: EventCondition,
    handler: Box<dyn EventHandler>,
}

/// The reactor
pub struct EventLoop {
    rx: Receiver<Ctl>,
    handle: LoopHandle,
    registrations: HashMap<EventId, Registration>,
    wakeup_r: OwnedFd,
    stop_requested: bool,
    /// Deregistered-mid-dispatch handlers, dropped once per iteration
    release_queue: Vec<Registration>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let (wakeup_r, wakeup_w) = nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK)?;

        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = LoopHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
            wakeup_w: Arc::new(wakeup_w),
        };

        Ok(Self {
            rx,
            handle,
            registrations: HashMap::new(),
            wakeup_r,
            stop_requested: false,
            release_queue: Vec::new(),
        })
    }

    /// Handle for registering events from other components/threads
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// Number of live registrations (bounded by in-flight operations plus
    /// persistent channel/accept handlers)
    pub fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    /// Run the loop on the calling thread, dispatching handlers as fds
    /// become ready. With `timeout_ms = Some(t)`, a one-shot timer stops the
    /// loop after `t` milliseconds; `None` runs until [`LoopHandle::stop`].
    pub fn run(&mut self, timeout_ms: Option<u64>) -> Result<()> {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        self.stop_requested = false;
        let wakeup_fd = self.wakeup_r.as_raw_fd();

        loop {
            self.drain_control();
            if self.stop_requested {
                break;
            }
            let poll_timeout = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        break;
                    }
                    let ms = (d - now).as_millis().min(u128::from(u16::MAX)) as u16;
                    PollTimeout::from(ms)
                }
                None => PollTimeout::NONE,
            };

            let ids: Vec<EventId> = self.registrations.keys().copied().collect();
            let mut pollfds: Vec<PollFd> = Vec::with_capacity(ids.len() + 1);
            // SAFETY: wakeup_r and all registered fds outlive this iteration;
            // registrations are only mutated between poll passes.
            pollfds.push(PollFd::new(
                unsafe { BorrowedFd::borrow_raw(wakeup_fd) },
                PollFlags::POLLIN,
            ));
            for id in &ids {
                let reg = &self.registrations[id];
                pollfds.push(PollFd::new(
                    unsafe { BorrowedFd::borrow_raw(reg.fd) },
                    reg.cond.to_poll_flags(),
                ));
            }

            match poll(&mut pollfds, poll_timeout) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(Error::Os(e)),
            }

            let mut ready: Vec<(EventId, EventCondition)> = Vec::new();
            let wakeup_ready = pollfds[0]
                .revents()
                .map(|r| !r.is_empty())
                .unwrap_or(false);
            for (i, id) in ids.iter().enumerate() {
                if let Some(revents) = pollfds[i + 1].revents()
                    && !revents.is_empty()
                {
                    ready.push((*id, EventCondition::from_poll_flags(revents)));
                }
            }
            drop(pollfds);

            if wakeup_ready {
                self.drain_wakeup();
            }

            for (id, cond) in ready {
                let keep = match self.registrations.get_mut(&id) {
                    // Deregistered earlier in this same pass
                    None => continue,
                    Some(reg) => {
                        let fd = reg.fd;
                        match reg.handler.handle(fd, cond) {
                            Ok(keep) => keep,
                            Err(e) => {
                                log::debug!("event handler {} failed: {}", id, e);
                                false
                            }
                        }
                    }
                };
                if !keep && let Some(reg) = self.registrations.remove(&id) {
                    self.release_queue.push(reg);
                }
            }

            // Apply removals queued by handlers during dispatch, then drop
            // everything deregistered this pass in one place.
            self.drain_control();
            self.release_queue.clear();
            if self.stop_requested {
                break;
            }
        }

        // Loop teardown: queued handlers still release deferred
        self.release_queue.clear();
        Ok(())
    }

    fn drain_control(&mut self) {
        while let Ok(ctl) = self.rx.try_recv() {
            match ctl {
                Ctl::Add {
                    id,
                    fd,
                    cond,
                    handler,
                } => {
                    self.registrations
                        .insert(id, Registration { fd, cond, handler });
                }
                Ctl::Remove { id } => {
                    if let Some(reg) = self.registrations.remove(&id) {
                        self.release_queue.push(reg);
                    }
                }
                Ctl::Stop => self.stop_requested = true,
            }
        }
    }

    fn drain_wakeup(&self) {
        let mut buf = [0u8; 64];
        loop {
            // SAFETY: wakeup_r is a live nonblocking pipe read end
            let n = unsafe {
                libc::read(
                    self.wakeup_r.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < buf.len() as isize {
                break;
            }
        }
    }
}
