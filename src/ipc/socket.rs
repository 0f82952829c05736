//! Unix domain stream socket layer
//!
//! One `send`/`recv` contract: both loop internally until the requested size
//! is fully transferred or a hard error occurs. Transient errors (`EINTR`,
//! `EAGAIN`/`EWOULDBLOCK`) are retried after a short sleep and never
//! propagated to the caller; a zero-byte `recv` return is peer shutdown and
//! surfaces as [`Error::ConnectionClosed`].
//!
//! The server side prefers a pre-opened listener handed down by the service
//! manager (socket activation, fd 3) and falls back to binding its own
//! socket with world-rw permissions.

use crate::error::{Error, Result};
use nix::sys::socket::{self, AddressFamily, MsgFlags, SockFlag, SockType, UnixAddr};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Default bounded timeout for synchronous reads
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Sleep between transient-error retries
const RETRY_SLEEP: Duration = Duration::from_millis(1);

/// First fd passed by the service manager under socket activation
const ACTIVATION_FD_START: RawFd = 3;

/// A connected stream socket
pub struct StreamSocket {
    stream: UnixStream,
    recv_timeout: Duration,
}

impl StreamSocket {
    /// Wrap an accepted/connected stream, applying the default recv timeout
    pub fn from_stream(stream: UnixStream) -> Result<Self> {
        stream.set_read_timeout(Some(DEFAULT_RECV_TIMEOUT))?;
        Ok(Self {
            stream,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        })
    }

    /// Connect to the well-known socket path
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let stream = UnixStream::connect(path)?;
        Self::from_stream(stream)
    }

    /// Bound timeout for synchronous receives
    pub fn set_recv_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.stream.set_read_timeout(Some(timeout))?;
        self.recv_timeout = timeout;
        Ok(())
    }

    pub fn recv_timeout(&self) -> Duration {
        self.recv_timeout
    }

    /// Switch between blocking (sync calls) and non-blocking (reactor) mode
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.stream.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Raw fd for event-loop registration
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    /// Send the whole buffer, retrying transient errors
    pub fn send_exact(&self, buf: &[u8]) -> Result<()> {
        let deadline = Instant::now() + self.recv_timeout.max(DEFAULT_RECV_TIMEOUT);
        let mut sent = 0;
        while sent < buf.len() {
            match (&self.stream).write(&buf[sent..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => sent += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    std::thread::sleep(RETRY_SLEEP);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// Receive exactly `buf.len()` bytes, retrying transient errors up to the
    /// configured receive timeout
    pub fn recv_exact(&self, buf: &mut [u8]) -> Result<()> {
        let deadline = Instant::now() + self.recv_timeout;
        let mut got = 0;
        while got < buf.len() {
            match (&self.stream).read(&mut buf[got..]) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    std::thread::sleep(RETRY_SLEEP);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    /// One read attempt for readiness-driven callers. `Ok(None)` means the
    /// stream has no bytes right now; the caller keeps its partial frame and
    /// waits for the next readiness event. Never sleeps.
    pub fn recv_some(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        loop {
            match (&self.stream).read(buf) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Discard exactly `count` bytes from the stream. Used to keep framing
    /// aligned after rejecting an oversized message.
    pub fn skip_exact(&self, mut count: usize) -> Result<()> {
        let mut scratch = [0u8; 4096];
        while count > 0 {
            let n = count.min(scratch.len());
            self.recv_exact(&mut scratch[..n])?;
            count -= n;
        }
        Ok(())
    }

    /// Shut down both directions
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// A connected sequenced-packet socket.
///
/// Same transfer contract as [`StreamSocket`] (bounded retries on transient
/// errors, `ConnectionClosed` on EOF, `Timeout` past the deadline) but the
/// kernel preserves packet boundaries: one `send_packet` arrives as exactly
/// one `recv_packet`, so no header/body framing is needed on top.
pub struct SeqPacketSocket {
    fd: OwnedFd,
    recv_timeout: Duration,
}

impl SeqPacketSocket {
    /// Connect to a sequenced-packet listener at `path`
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let fd = socket::socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_NONBLOCK,
            None,
        )?;
        let addr = UnixAddr::new(path.as_ref())?;
        socket::connect(fd.as_raw_fd(), &addr)?;
        Ok(Self {
            fd,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        })
    }

    /// Connected pair, for transports living inside one process
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = socket::socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_NONBLOCK,
        )?;
        Ok((
            Self {
                fd: a,
                recv_timeout: DEFAULT_RECV_TIMEOUT,
            },
            Self {
                fd: b,
                recv_timeout: DEFAULT_RECV_TIMEOUT,
            },
        ))
    }

    pub fn set_recv_timeout(&mut self, timeout: Duration) {
        self.recv_timeout = timeout;
    }

    pub fn recv_timeout(&self) -> Duration {
        self.recv_timeout
    }

    /// Raw fd for event-loop registration
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Send one packet; the kernel keeps its boundary. Packets are sent
    /// whole or not at all.
    pub fn send_packet(&self, buf: &[u8]) -> Result<()> {
        let deadline = Instant::now() + self.recv_timeout.max(DEFAULT_RECV_TIMEOUT);
        loop {
            match socket::send(self.fd.as_raw_fd(), buf, MsgFlags::empty()) {
                Ok(n) if n == buf.len() => return Ok(()),
                Ok(n) => {
                    return Err(Error::Other(format!(
                        "short seqpacket send: {n} of {}",
                        buf.len()
                    )));
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(nix::errno::Errno::EAGAIN) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    std::thread::sleep(RETRY_SLEEP);
                }
                Err(e) => return Err(Error::Os(e)),
            }
        }
    }

    /// Receive one packet into `buf`, returning its length. A packet larger
    /// than `buf` is truncated by the kernel.
    pub fn recv_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let deadline = Instant::now() + self.recv_timeout;
        loop {
            match socket::recv(self.fd.as_raw_fd(), buf, MsgFlags::empty()) {
                Ok(0) => return Err(Error::ConnectionClosed),
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => {}
                Err(nix::errno::Errno::EAGAIN) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout);
                    }
                    std::thread::sleep(RETRY_SLEEP);
                }
                Err(e) => return Err(Error::Os(e)),
            }
        }
    }

    /// Shut down both directions
    pub fn shutdown(&self) {
        let _ = socket::shutdown(self.fd.as_raw_fd(), socket::Shutdown::Both);
    }
}

/// The server's listening socket
pub struct ServerSocket {
    path: PathBuf,
    listener: Option<UnixListener>,
    /// True when the listener was self-bound (we own the filesystem entry)
    self_bound: bool,
}

impl ServerSocket {
    /// Create an unbound server socket for `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            listener: None,
            self_bound: false,
        }
    }

    /// Bind and listen. Prefers a socket-activation fd; otherwise binds the
    /// path itself with world-rw permissions. Calling this while already
    /// listening is a no-op success.
    pub fn bind(&mut self) -> Result<()> {
        if self.listener.is_some() {
            return Ok(());
        }

        if let Some(listener) = Self::take_activation_fd() {
            log::info!("Using socket-activation fd for {}", self.path.display());
            listener.set_nonblocking(true)?;
            self.listener = Some(listener);
            return Ok(());
        }

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        // Stale socket file from a previous run blocks bind()
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }

        let listener = UnixListener::bind(&self.path)?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o666))?;
        listener.set_nonblocking(true)?;
        self.listener = Some(listener);
        self.self_bound = true;
        log::info!("Listening on {}", self.path.display());
        Ok(())
    }

    /// Accept one pending connection, if any
    pub fn accept(&self) -> Result<Option<StreamSocket>> {
        let listener = self.listener.as_ref().ok_or(Error::NotConnected)?;
        match listener.accept() {
            Ok((stream, _)) => Ok(Some(StreamSocket::from_stream(stream)?)),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Raw fd for event-loop registration
    pub fn fd(&self) -> Result<RawFd> {
        self.listener
            .as_ref()
            .map(|l| l.as_raw_fd())
            .ok_or(Error::NotConnected)
    }

    /// Pick up a listener fd passed by the service manager, if present
    fn take_activation_fd() -> Option<UnixListener> {
        let pid: u32 = std::env::var("LISTEN_PID").ok()?.parse().ok()?;
        if pid != std::process::id() {
            return None;
        }
        let fds: i32 = std::env::var("LISTEN_FDS").ok()?.parse().ok()?;
        if fds < 1 {
            return None;
        }
        // Consume so a second bind cannot double-wrap the fd
        unsafe {
            std::env::remove_var("LISTEN_FDS");
            std::env::remove_var("LISTEN_PID");
        }
        // SAFETY: fd 3 is owned by this process under the activation protocol
        Some(unsafe { UnixListener::from_raw_fd(ACTIVATION_FD_START) })
    }
}

impl Drop for ServerSocket {
    fn drop(&mut self) {
        if self.self_bound {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_path(name: &str) -> PathBuf {
        let dir = tempfile::tempdir().unwrap();
        // Keep the dir alive by leaking: test processes are short-lived
        let path = dir.path().join(name);
        std::mem::forget(dir);
        path
    }

    #[test]
    fn test_bind_is_idempotent() {
        let path = socket_path("idem.sock");
        let mut server = ServerSocket::new(&path);
        server.bind().unwrap();
        server.bind().unwrap();
        assert!(server.fd().is_ok());
    }

    #[test]
    fn test_send_recv_roundtrip() {
        let path = socket_path("echo.sock");
        let mut server = ServerSocket::new(&path);
        server.bind().unwrap();

        let client = StreamSocket::connect(&path).unwrap();
        client.send_exact(b"ping").unwrap();

        // Accept may race the connect; poll briefly
        let accepted = loop {
            if let Some(s) = server.accept().unwrap() {
                break s;
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        let mut buf = [0u8; 4];
        accepted.recv_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn test_zero_read_is_connection_closed() {
        let path = socket_path("closed.sock");
        let mut server = ServerSocket::new(&path);
        server.bind().unwrap();

        let client = StreamSocket::connect(&path).unwrap();
        let accepted = loop {
            if let Some(s) = server.accept().unwrap() {
                break s;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        drop(client);

        let mut buf = [0u8; 1];
        match accepted.recv_exact(&mut buf) {
            Err(Error::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_recv_some_reports_empty_stream_without_blocking() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let reader = StreamSocket::from_stream(b).unwrap();
        reader.set_nonblocking(true).unwrap();

        let mut buf = [0u8; 8];
        assert!(reader.recv_some(&mut buf).unwrap().is_none());

        let writer = StreamSocket::from_stream(a).unwrap();
        writer.send_exact(b"abc").unwrap();
        assert_eq!(reader.recv_some(&mut buf).unwrap(), Some(3));
        assert_eq!(&buf[..3], b"abc");
    }

    #[test]
    fn test_seqpacket_preserves_packet_boundaries() {
        let (a, b) = SeqPacketSocket::pair().unwrap();
        a.send_packet(b"first").unwrap();
        a.send_packet(b"second-longer").unwrap();

        let mut buf = [0u8; 64];
        let n = b.recv_packet(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"first");
        let n = b.recv_packet(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"second-longer");
    }

    #[test]
    fn test_seqpacket_peer_close_surfaces() {
        let (a, mut b) = SeqPacketSocket::pair().unwrap();
        drop(a);
        b.set_recv_timeout(Duration::from_millis(100));
        let mut buf = [0u8; 8];
        match b.recv_packet(&mut buf) {
            Err(Error::ConnectionClosed) => {}
            other => panic!("expected ConnectionClosed, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_recv_timeout() {
        let path = socket_path("timeout.sock");
        let mut server = ServerSocket::new(&path);
        server.bind().unwrap();

        let mut client = StreamSocket::connect(&path).unwrap();
        client
            .set_recv_timeout(Duration::from_millis(50))
            .unwrap();

        let mut buf = [0u8; 1];
        match client.recv_exact(&mut buf) {
            Err(Error::Timeout) => {}
            other => panic!("expected Timeout, got {:?}", other.err()),
        }
    }
}
