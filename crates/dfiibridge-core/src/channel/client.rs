//! Requester side of the transport.
//!
//! A `ChannelClient` owns at most one outbound TCP stream, bound to at most one
//! target at a time. Changing the target means `close()` followed by a new
//! `connect()`.

use super::frame::{read_frame, write_frame};
use super::{parse_address, with_deadline, Channel};
use crate::config::BridgeConfig;
use crate::session::Session;
use crate::{BridgeError, Result};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Outbound request/reply channel.
#[derive(Debug, Default)]
pub struct ChannelClient {
    stream: Option<TcpStream>,
    endpoint: Option<String>,
    session: Option<Session>,
}

impl ChannelClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the target session used by [`connect`](Self::connect).
    ///
    /// An existing connection is left untouched.
    pub fn set_session(&mut self, session: Session) {
        self.session = Some(session);
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Address of the last successful connection.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Connect to `address`, trying up to `max_attempts` times.
    ///
    /// Each attempt waits at most `BridgeConfig::CONNECT_ATTEMPT_TIMEOUT` for
    /// the connection to be established. A no-op if already connected.
    pub async fn connect_endpoint(&mut self, address: &str, max_attempts: u32) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let (host, port) = parse_address(address)?;
        let attempts = max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(
                BridgeConfig::CONNECT_ATTEMPT_TIMEOUT,
                TcpStream::connect((host.as_str(), port)),
            )
            .await
            {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Could not disable Nagle on {}: {}", address, e);
                    }
                    self.stream = Some(stream);
                    self.endpoint = Some(address.to_string());
                    debug!("Connected to {} (attempt {}/{})", address, attempt, attempts);
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(e) => {
                    last_error = format!(
                        "no confirmation within {:?}: {}",
                        BridgeConfig::CONNECT_ATTEMPT_TIMEOUT,
                        e
                    )
                }
            }

            debug!(
                "Connect attempt {}/{} to {} failed: {}",
                attempt, attempts, address, last_error
            );
            if attempt < attempts {
                tokio::time::sleep(BridgeConfig::CONNECT_RETRY_DELAY).await;
            }
        }

        Err(BridgeError::ConnectionFailed {
            endpoint: address.to_string(),
            message: format!("gave up after {} attempts: {}", attempts, last_error),
            source: None,
        })
    }

    /// Connect to the session set with [`set_session`](Self::set_session).
    pub async fn connect(&mut self) -> Result<()> {
        let address = match &self.session {
            Some(session) if session.is_valid() => session.address(),
            Some(session) => {
                return Err(BridgeError::InvalidSession(format!(
                    "session {} is incomplete",
                    session
                )))
            }
            None => return Err(BridgeError::InvalidSession("no target session set".to_string())),
        };

        self.connect_endpoint(&address, BridgeConfig::DEFAULT_CONNECT_ATTEMPTS)
            .await
    }

    /// Close and connect again to the last endpoint.
    pub async fn reconnect(&mut self) -> Result<()> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| BridgeError::InvalidSession("no previous endpoint".to_string()))?;

        self.close();
        self.connect_endpoint(&endpoint, BridgeConfig::DEFAULT_CONNECT_ATTEMPTS)
            .await
    }

    fn endpoint_label(&self) -> String {
        self.endpoint.clone().unwrap_or_else(|| "<unknown>".to_string())
    }
}

#[async_trait::async_trait]
impl Channel for ChannelClient {
    async fn send(&mut self, data: &[u8], timeout: Option<Duration>) -> Result<()> {
        if data.is_empty() {
            return Err(BridgeError::EmptyPayload);
        }
        let endpoint = self.endpoint_label();
        let stream = self.stream.as_mut().ok_or(BridgeError::NotConnected)?;

        let outcome = with_deadline(timeout, write_frame(stream, data)).await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                warn!("Send to {} failed: {}", endpoint, e);
                self.close();
                Err(e)
            }
            Err(elapsed) => {
                self.close();
                Err(BridgeError::TransportTimeout {
                    timeout: timeout.unwrap_or_default(),
                    message: format!("send to {}: {}", endpoint, elapsed),
                })
            }
        }
    }

    async fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let endpoint = self.endpoint_label();
        let stream = self.stream.as_mut().ok_or(BridgeError::NotConnected)?;

        // Any failure leaves the stream out of request/reply lockstep, so it is dropped.
        let outcome = with_deadline(timeout, read_frame(stream)).await;
        match outcome {
            Ok(Ok(Some(payload))) => Ok(payload),
            Ok(Ok(None)) => {
                self.close();
                Err(BridgeError::ConnectionFailed {
                    endpoint,
                    message: "peer closed the connection".to_string(),
                    source: None,
                })
            }
            Ok(Err(e)) => {
                self.close();
                Err(e)
            }
            Err(elapsed) => {
                self.close();
                Err(BridgeError::TransportTimeout {
                    timeout: timeout.unwrap_or_default(),
                    message: format!("recv from {}: {}", endpoint, elapsed),
                })
            }
        }
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!("Closed channel to {}", self.endpoint_label());
        }
    }
}
