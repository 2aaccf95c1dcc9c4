//! # farrow-daemon
//!
//! The spawn server: a single-threaded event loop that accepts spawn
//! requests from unprivileged workers over UNIX datagram sockets,
//! forks isolated children through `farrow-core`, and reports their
//! exits.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod connection;
pub mod registry;
pub mod server;
