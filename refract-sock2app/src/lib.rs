//! Refract sock2app — maps local ports to owning applications.
//!
//! A forwarded flow only carries addresses; attribution (which app opened
//! this socket) comes from rescanning the kernel's proc-style connection
//! tables and joining socket inodes back to processes. The table is
//! refreshed lazily on lookup misses and aged out by a periodic sweeper.

pub mod proc_scan;
pub mod table;

use thiserror::Error;

pub use proc_scan::ProcfsSource;
pub use table::{ConnectionSource, ConnectionTable, SocketOwner};

/// Identity of the application owning a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppDescriptor {
    pub pid: u32,
    pub uid: u32,
    pub name: String,
    pub exe: Option<String>,
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Invalid socket address")]
    InvalidSocketAddr,
    #[error("System error: {0}")]
    System(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ResolveError>;
