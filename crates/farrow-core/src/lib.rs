//! # farrow-core
//!
//! Wire protocol and Linux isolation pipeline for the farrow spawn
//! server.
//!
//! This crate provides everything below the event loop:
//! - the datagram protocol (opcodes, bounded decoder/encoder,
//!   `SCM_RIGHTS` file-descriptor passing)
//! - the spawn configuration model (`PreparedChildProcess` and its
//!   sub-records)
//! - the child-side isolation pipeline (namespaces, mount tree,
//!   cgroup placement, resource limits, credentials, seccomp)
//! - the fork/exec engine

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cgroup;
pub mod config;
pub mod datagram;
pub mod error;
pub mod hook;
pub mod isolation;
pub mod parser;
pub mod payload;
pub mod prepared;
pub mod protocol;
pub mod rlimits;
pub mod serializer;
pub mod spawn;

pub use cgroup::CgroupState;
pub use config::SpawnConfig;
pub use error::SpawnError;
pub use prepared::{PreparedChildProcess, UidGid};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, SpawnError>;
