use std::io;
use thiserror::Error;

/// Errors surfaced by the session layer.
///
/// Inner-loop packet defects (bad CRC, unrecoverable FEC sets, malformed
/// segments) never appear here; they are counted in [`crate::snmp`] and
/// swallowed so a single bad datagram cannot tear down a session.
#[derive(Debug, Error)]
pub enum NetError {
    /// A read/write/accept deadline elapsed. Recoverable; retry if desired.
    #[error("i/o deadline reached")]
    Timeout,
    /// The session was closed locally. Terminal.
    #[error("broken pipe")]
    ClosedPipe,
    /// The operation is not available on this session kind (for example
    /// socket options on an accepted session that shares the listener's
    /// socket). Reported, non-fatal.
    #[error("invalid operation")]
    InvalidOperation,
    #[error("socket read: {0}")]
    SocketRead(io::Error),
    #[error("socket write: {0}")]
    SocketWrite(io::Error),
    #[error("unknown cipher {0:?}")]
    UnknownCipher(String),
    /// AEAD tag verification failed on an inbound packet.
    #[error("packet authentication failed")]
    AuthFailed,
    #[error("invalid fec parameters {data}/{parity}")]
    InvalidFecParams { data: usize, parity: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl NetError {
    /// Clones the error for fan-out to every blocked waiter; io errors carry
    /// kind+message only.
    pub fn duplicate(&self) -> NetError {
        match self {
            NetError::Timeout => NetError::Timeout,
            NetError::ClosedPipe => NetError::ClosedPipe,
            NetError::InvalidOperation => NetError::InvalidOperation,
            NetError::SocketRead(e) => NetError::SocketRead(io::Error::new(e.kind(), e.to_string())),
            NetError::SocketWrite(e) => {
                NetError::SocketWrite(io::Error::new(e.kind(), e.to_string()))
            }
            NetError::UnknownCipher(s) => NetError::UnknownCipher(s.clone()),
            NetError::AuthFailed => NetError::AuthFailed,
            NetError::InvalidFecParams { data, parity } => NetError::InvalidFecParams {
                data: *data,
                parity: *parity,
            },
            NetError::Io(e) => NetError::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }
}

impl From<NetError> for io::Error {
    fn from(e: NetError) -> io::Error {
        match e {
            NetError::Timeout => io::Error::new(io::ErrorKind::TimedOut, "i/o deadline reached"),
            NetError::ClosedPipe => io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"),
            NetError::Io(inner) => inner,
            NetError::SocketRead(inner) | NetError::SocketWrite(inner) => inner,
            other => io::Error::other(other.to_string()),
        }
    }
}
