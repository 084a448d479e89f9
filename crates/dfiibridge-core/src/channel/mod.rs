//! Point-to-point request/reply transport.
//!
//! A [`Channel`] moves opaque byte messages over one TCP socket using strict
//! request/reply lockstep:
//!
//! - **ChannelClient**: the requester. Connects outward with bounded retries,
//!   sends one request, then reads exactly one reply.
//! - **ChannelServer**: the replier. Binds one port, accepts any number of
//!   requester connections and hands their requests out one at a time.
//! - **frame**: length-prefixed framing shared by both sides.
//!
//! Addresses use the `tcp://host:port` form; `*` as host binds the wildcard
//! address.

pub mod client;
pub mod frame;
pub mod server;

pub use client::ChannelClient;
pub use server::ChannelServer;

use crate::config::BridgeConfig;
use crate::{BridgeError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::error::Elapsed;

/// Blocking framed send/receive over one socket.
#[async_trait::async_trait]
pub trait Channel: Send {
    /// Send one message, failing with `TransportTimeout` if it is not
    /// accepted within `timeout` (`None` waits forever).
    async fn send(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<()>;

    /// Wait for one full message, failing with `TransportTimeout` once
    /// `timeout` elapses (`None` waits forever).
    async fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>>;

    /// Release the socket. Safe to call repeatedly.
    fn close(&mut self);

    /// Network name of the local machine.
    fn get_hostname(&self) -> Result<String> {
        get_hostname()
    }
}

/// Resolve the local machine's network name.
pub fn get_hostname() -> Result<String> {
    crate::platform::local_hostname()
}

/// Split a `tcp://host:port` address into its host and port.
///
/// The scheme is optional; `*` is mapped to the IPv4 wildcard address.
pub fn parse_address(address: &str) -> Result<(String, u16)> {
    let rest = match address.split_once("://") {
        Some((scheme, rest)) if scheme == BridgeConfig::SCHEME => rest,
        Some((scheme, _)) => {
            return Err(BridgeError::Protocol(format!(
                "unsupported scheme '{}' in address {}",
                scheme, address
            )))
        }
        None => address,
    };

    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| BridgeError::Protocol(format!("address {} has no port", address)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| BridgeError::Protocol(format!("address {} has an invalid port", address)))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = if host.is_empty() || host == BridgeConfig::WILDCARD_HOST {
        "0.0.0.0".to_string()
    } else {
        host.to_string()
    };

    Ok((host, port))
}

/// Run `fut` with an optional deadline.
pub(crate) async fn with_deadline<F: Future>(
    timeout: Option<Duration>,
    fut: F,
) -> std::result::Result<F::Output, Elapsed> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await,
        None => Ok(fut.await),
    }
}
