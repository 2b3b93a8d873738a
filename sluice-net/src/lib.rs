//! # Sluice Net
//!
//! The encrypted, FEC-protected UDP session layer: it binds the ARQ core from
//! `sluice-kcp` to a packet socket, frames every datagram with a nonce, a
//! CRC32 and a block cipher, weaves Reed-Solomon parity through the packet
//! stream, and drives per-session flushes for any number of sessions from one
//! shared timer scheduler with a fixed worker count.
//!
//! Dial with [`Session::dial`], accept with [`Listener::bind`]. Sessions
//! expose blocking, deadline-aware `read`/`write` in the shape the stream
//! multiplexer consumes.

pub mod crypt;
pub mod error;
pub mod fec;
pub mod scheduler;
pub mod session;
pub mod snmp;

pub use crypt::{new_block_crypt, stretch_key, BlockCrypt, CRYPT_HEADER_SIZE, NONCE_SIZE};
pub use error::NetError;
pub use fec::{FecDecoder, FecEncoder, FEC_HEADER_SIZE, FEC_HEADER_SIZE_PLUS2, TYPE_DATA, TYPE_PARITY};
pub use scheduler::TimedSched;
pub use session::{Listener, Session, SessionConfig};
pub use snmp::Snmp;
