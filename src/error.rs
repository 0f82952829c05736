//! Error types for the indriya sensor hub

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Sensor hub error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Low-level OS call failure (poll, pipe, ioctl)
    #[error("OS error: {0}")]
    Os(#[from] nix::errno::Errno),

    /// Peer closed the connection
    #[error("Connection closed by peer")]
    ConnectionClosed,

    /// Channel is not connected
    #[error("Channel not connected")]
    NotConnected,

    /// Communication timeout
    #[error("Communication timeout")]
    Timeout,

    /// Declared message body exceeds the fixed capacity
    #[error("Message too large: command {cmd:#06x} declared {declared} bytes")]
    OversizedMessage {
        /// Command code from the offending header
        cmd: u32,
        /// Declared body length
        declared: usize,
    },

    /// Malformed message body
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Unknown command code
    #[error("Unknown command: {0:#06x}")]
    UnknownCommand(u32),

    /// Caller lacks a required privilege
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No sensor registered under the given URI
    #[error("Sensor not found: {0}")]
    SensorNotFound(String),

    /// A sensor with this URI already exists
    #[error("Duplicate sensor URI: {0}")]
    DuplicateUri(String),

    /// Fusion sensor dependency could not be resolved
    #[error("Unresolved dependency: {fusion} requires {required}")]
    UnresolvedDependency {
        /// URI of the fusion sensor being registered
        fusion: String,
        /// Required URI that did not resolve
        required: String,
    },

    /// No hardware sensors were found at startup
    #[error("No hardware sensors available")]
    NoHardware,

    /// Registry used before init() or after deinit()
    #[error("Registry not initialized")]
    NotInitialized,

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Listener id not known to the dispatcher
    #[error("Unknown listener: {0}")]
    UnknownListener(u32),

    /// No data available from the sensor yet
    #[error("No sensor data available")]
    NoData,

    /// TOML parse error
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("Config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Negative errno-style code carried in the wire header `err` field.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Io(e) => -e.raw_os_error().unwrap_or(libc::EIO),
            Error::Os(e) => -(*e as i32),
            Error::ConnectionClosed => -libc::EPIPE,
            Error::NotConnected => -libc::ENOTCONN,
            Error::Timeout => -libc::ETIMEDOUT,
            Error::OversizedMessage { .. } => -libc::EMSGSIZE,
            Error::InvalidMessage(_) => -libc::EBADMSG,
            Error::UnknownCommand(_) => -libc::EINVAL,
            Error::PermissionDenied(_) => -libc::EACCES,
            Error::SensorNotFound(_) => -libc::ENOENT,
            Error::DuplicateUri(_) => -libc::EEXIST,
            Error::UnresolvedDependency { .. } => -libc::ENODEV,
            Error::NoHardware => -libc::ENODEV,
            Error::NotInitialized => -libc::EAGAIN,
            Error::InvalidParameter(_) => -libc::EINVAL,
            Error::UnknownListener(_) => -libc::ENOENT,
            Error::NoData => -libc::ENODATA,
            Error::ConfigParse(_) | Error::ConfigWrite(_) => -libc::EINVAL,
            Error::Other(_) => -libc::EIO,
        }
    }

    /// Best-effort reconstruction from a wire `err` code in a reply header
    pub fn from_wire(code: i32) -> Error {
        match -code {
            libc::EACCES => Error::PermissionDenied("denied by server".into()),
            libc::ENOENT => Error::SensorNotFound("reported by server".into()),
            libc::ENODATA => Error::NoData,
            libc::ETIMEDOUT => Error::Timeout,
            libc::EPIPE => Error::ConnectionClosed,
            _ => Error::Other(format!("server replied with error {code}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::PermissionDenied("x".into()).errno(), -libc::EACCES);
        assert_eq!(Error::SensorNotFound("x".into()).errno(), -libc::ENOENT);
        assert_eq!(
            Error::OversizedMessage { cmd: 1, declared: 9 }.errno(),
            -libc::EMSGSIZE
        );
        assert_eq!(Error::ConnectionClosed.errno(), -libc::EPIPE);
    }
}
