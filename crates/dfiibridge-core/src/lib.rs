//! dfiibridge - session-brokered peer-to-peer RPC.
//!
//! Processes discover each other through a shared on-disk registry of session
//! descriptors, then call named functions on one another over a
//! request/reply TCP channel. Any process can be a server, a client, or both.
//!
//! # Example
//!
//! ```rust,ignore
//! use dfiibridge::{callback_fn, BridgeClient, BridgeServer};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> dfiibridge::Result<()> {
//!     let mut server = BridgeServer::builder().userdata("role", "worker").build()?;
//!     server.register_function("echo", callback_fn(|args| Ok(args.join(" "))))?;
//!     server.listen_async().await?;
//!
//!     let mut client = BridgeClient::new(server.core().fork());
//!     client.connect_to(server.session()).await?;
//!     let replies = client
//!         .execute("echo", &["hello".into()], true, Some(Duration::from_secs(2)))
//!         .await?;
//!     assert_eq!(replies, vec!["hello".to_string()]);
//!
//!     server.stop().await
//! }
//! ```

pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod platform;
pub mod registry;
pub mod session;

// Re-export commonly used types
pub use bridge::{
    callback_fn, BridgeClient, BridgeCore, BridgeServer, BridgeServerBuilder, CallRequest, Caller,
    LogLevel, LogObserver, RemoteCallback, Reply, StopHandle,
};
pub use channel::{Channel, ChannelClient, ChannelServer};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use registry::{Eviction, EvictionReason, SessionManager};
pub use session::Session;
