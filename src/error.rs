use std::net::SocketAddr;

/// Crate-wide error type.
///
/// Every failure mode named in the error handling design (malformed
/// messages, digest failures, unreachable peers, loop/forwarding limits,
/// and CDR I/O) is a variant here rather than a component-local error type,
/// so the routing engine can match on `Error` once and decide the SIP
/// status code to synthesize.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("parse error: {0}")]
    ParseError(String),

    #[error("missing required header {0}")]
    MissingHeader(&'static str),

    #[error("authentication required")]
    AuthRequired,

    #[error("authentication failed")]
    AuthFailed,

    #[error("no route to {0}")]
    NoRoute(String),

    #[error("network unreachable sending to {addr}: {source}")]
    NetworkUnreachable {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("network error sending to {addr}: {source}")]
    NetworkError {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("loop detected at {0}")]
    LoopDetected(String),

    #[error("max-forwards exceeded")]
    MaxForwardsExceeded,

    #[error("dialog timeout for call-id {0}")]
    Timeout(String),

    #[error("registrar error: {0}")]
    RegistrarError(String),

    #[error("cdr error: {0}")]
    CdrError(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("transport bind error: {0}")]
    BindError(std::io::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<rsip::Error> for Error {
    fn from(e: rsip::Error) -> Self {
        Error::ParseError(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::ConfigError(e.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::CdrError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an outbound send failure, used by the transport and
/// routing layers to pick the right synthesized SIP response (4.2/7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendErrorKind {
    HostUnreachable,
    Other,
}

impl SendErrorKind {
    pub fn classify(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => {
                SendErrorKind::HostUnreachable
            }
            ErrorKind::AddrNotAvailable | ErrorKind::ConnectionRefused => {
                SendErrorKind::HostUnreachable
            }
            _ => match err.raw_os_error() {
                // EHOSTUNREACH(113) / ENETUNREACH(101) on Linux; std's
                // `ErrorKind` match above already covers the portable case,
                // this is the raw-errno fallback for kernels where those
                // don't map to the stable `ErrorKind` variants yet.
                Some(113) | Some(101) => SendErrorKind::HostUnreachable,
                // 64/65 are EHOSTDOWN/EHOSTUNREACH on BSD-family kernels,
                // but ENONET/ENOPKG on Linux — do not treat them as
                // host-unreachable there.
                #[cfg(any(
                    target_os = "macos",
                    target_os = "ios",
                    target_os = "freebsd",
                    target_os = "netbsd",
                    target_os = "openbsd",
                    target_os = "dragonfly"
                ))]
                Some(64) | Some(65) => SendErrorKind::HostUnreachable,
                _ => SendErrorKind::Other,
            },
        }
    }
}
