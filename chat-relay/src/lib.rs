//! Multi-client text relay over TCP.
//!
//! Clients connect, send a username as their first frame, and then exchange
//! chat lines through the server, which also republishes the roster of
//! connected users whenever someone joins or leaves. Frames are a 4-byte
//! big-endian length followed by UTF-8 text.
//!
//! - [`codec`] encodes and decodes length-prefixed frames.
//! - [`session`] drives one connection from handshake to close.
//! - [`registry`] is the shared, lock-protected map of live sessions.
//! - [`broadcast`] fans chat messages and roster updates out to sessions.
//! - [`server`] accepts connections and handles shutdown.
//! - [`cli`] and [`client`] back the `chat-relay` binary.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use server::{Server, ShutdownHandle, listen, serve};
