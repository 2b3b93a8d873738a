use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("invalid protocol frame")]
    InvalidProtocol,
    #[error("unsupported mux version {0}")]
    InvalidVersion(u8),
    #[error("i/o deadline reached")]
    Timeout,
    #[error("broken pipe")]
    ClosedPipe,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<MuxError> for io::Error {
    fn from(e: MuxError) -> io::Error {
        match e {
            MuxError::Timeout => io::Error::new(io::ErrorKind::TimedOut, "i/o deadline reached"),
            MuxError::ClosedPipe => io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"),
            MuxError::Io(inner) => inner,
            other => io::Error::other(other.to_string()),
        }
    }
}
