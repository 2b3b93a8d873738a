use thiserror::Error;

/// Errors surfaced by the ARQ core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KcpError {
    #[error("receive queue empty")]
    RecvQueueEmpty,
    #[error("message spans more fragments than received so far")]
    ExpectingFragment,
    /// The caller's buffer cannot hold the next complete message. Carries the
    /// required size so the caller can retry or drain incrementally.
    #[error("receive buffer too small, need {0} bytes")]
    RecvBufTooSmall(usize),
    #[error("payload of {0} bytes exceeds the receive window")]
    SendPayloadTooBig(usize),
    #[error("datagram of {0} bytes shorter than the segment header")]
    ShortDatagram(usize),
    #[error("segment declares {declared} payload bytes but {remaining} remain")]
    TruncatedSegment { declared: usize, remaining: usize },
    #[error("unknown segment command {0}")]
    UnknownCommand(u8),
    #[error("conversation id {got} does not match {expected}")]
    ConvMismatch { expected: u32, got: u32 },
    #[error("mtu {0} out of range")]
    InvalidMtu(usize),
}
