//! Peer-to-peer RPC on top of the channel transport and session registry.
//!
//! - **BridgeServer**: publishes a session and serves named callbacks.
//! - **BridgeClient**: connects to published sessions and executes calls.
//! - **BridgeCore**: registry handle and log fan-out shared by both.
//!
//! A server that was called with an origin session hands its callback a
//! [`Caller`] connected back to that origin, so the callee can call the
//! caller while the first request is still in flight.

pub mod callback;
pub mod client;
pub mod core;
pub mod protocol;
pub mod server;

pub use callback::{callback_fn, Caller, FnCallback, RemoteCallback};
pub use client::BridgeClient;
pub use self::core::{BridgeCore, LogLevel, LogObserver};
pub use protocol::{CallRequest, Reply};
pub use server::{BridgeServer, BridgeServerBuilder, StopHandle};
