//! # Sluice
//!
//! The tunnel endpoints: configuration loading (flags plus JSON), the
//! listen/dial address grammar with port ranges, conversation management with
//! timed rotation, and the SNMP counter dump loop. The heavy lifting lives in
//! `sluice-kcp`, `sluice-net` and `sluice-mux`.

pub mod config;
pub mod endpoint;

pub use config::{parse_multi_port, Config, MultiPort};
