//! quick-counter: a networked counter.
//!
//! The server accepts TCP connections, reads fixed-width increment
//! requests, atomically adds each amount to one shared counter and replies
//! with the new total.
//!
//! - `codec`: 8-byte little-endian frame encoding
//! - `counter`: the shared atomic counter
//! - `connection`: per-connection request loop
//! - `server`: listener lifecycle and accept loop
//! - `client`: request/response client
//! - `config`: CLI and TOML configuration for the server binary

pub mod address;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod counter;
pub mod registry;
pub mod server;
pub mod workload;

pub use address::{AddrError, Endpoint, Network};
pub use client::{Client, ClientError};
pub use connection::ShutdownBehavior;
pub use counter::Counter;
pub use server::{Server, ServerError, ServerOptions};
