//! # Sluice KCP
//!
//! The ARQ core of the sluice tunnel: a wire-exact implementation of the KCP
//! protocol (conversation state, sliding window, selective and fast
//! retransmission, congestion control) as a synchronous state machine.
//!
//! The state machine performs no I/O of its own. Callers feed it decrypted
//! datagrams via [`Conversation::input`], drain application bytes with
//! [`Conversation::recv`], and drive periodic flushes with
//! [`Conversation::update`], which hands finished MTU-sized packets to an
//! output sink. Timing is caller-supplied as a 32-bit millisecond clock so the
//! core stays deterministic under test.

pub mod error;
pub mod pool;
pub mod segment;

mod kcp;

pub use error::KcpError;
pub use kcp::{
    Conversation, FlushStats, CMD_ACK, CMD_PUSH, CMD_WASK, CMD_WINS, KCP_OVERHEAD, MTU_DEF,
    WND_RCV, WND_SND,
};
pub use segment::{conv_of, sn_of};
