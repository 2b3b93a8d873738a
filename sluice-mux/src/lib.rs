//! # Sluice Mux
//!
//! Layers many logical byte streams over one reliable session using a small
//! length-delimited framing protocol (versions 1 and 2), plus the plumbing
//! that stitches a stream to an upstream TCP/Unix socket: the bidirectional
//! pipe with coordinated shutdown, a Snappy compression filter and a
//! permutation-pad obfuscation filter.

pub mod conn;
pub mod error;
pub mod filters;
pub mod frame;
pub mod pipe;
pub mod session;
pub mod stream;

pub use conn::Conn;
pub use error::MuxError;
pub use filters::{QppConn, QppPad, SnappyConn};
pub use frame::{CMD_FIN, CMD_NOP, CMD_PSH, CMD_SYN, CMD_UPD, HEADER_SIZE};
pub use pipe::pipe;
pub use session::{MuxConfig, MuxSession};
pub use stream::MuxStream;
