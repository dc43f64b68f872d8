use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};

pub type Result<T> = std::result::Result<T, WizError>;

/// JSON-RPC code devices return for a method their firmware does not implement.
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug)]
pub enum WizError {
    /// No datagram arrived on the exchange socket before the overall deadline.
    Timeout { target: SocketAddr, attempts: u32 },
    /// Socket create, bind, send or receive failed.
    Connection(String),
    /// Malformed JSON or an unexpected message shape.
    Parse(String),
    /// Device answered with "method not found".
    UnsupportedMethod { method: String },
    /// Device answered with any other error object.
    Device { code: i64, message: String },
    Config(String),
}

impl fmt::Display for WizError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { target, attempts } => {
                write!(f, "no response from {target} after {attempts} datagrams")
            }
            Self::Connection(msg) => write!(f, "connection error: {msg}"),
            Self::Parse(msg) => write!(f, "parse error: {msg}"),
            Self::UnsupportedMethod { method } => {
                write!(f, "method '{method}' is not supported by this device")
            }
            Self::Device { code, message } => write!(f, "device error {code}: {message}"),
            Self::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for WizError {}

impl From<io::Error> for WizError {
    fn from(err: io::Error) -> Self {
        Self::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for WizError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl WizError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Why the push listener could not be started. Reported through
/// `PushManager::last_failure`, never returned as an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushStartFailure {
    PortInUse { port: u16 },
    Bind(String),
    NoSourceAddress { target: IpAddr },
}

impl fmt::Display for PushStartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortInUse { port } => write!(
                f,
                "udp port {port} is already in use; another push listener may be running"
            ),
            Self::Bind(msg) => write!(f, "could not bind push listener: {msg}"),
            Self::NoSourceAddress { target } => {
                write!(f, "could not determine a local address to reach {target}")
            }
        }
    }
}
