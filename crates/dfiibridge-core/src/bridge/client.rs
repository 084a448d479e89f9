//! Bridge client: connects to one or more servers and executes calls on them.

use super::callback::Caller;
use super::core::{BridgeCore, LogLevel};
use super::protocol::CallRequest;
use crate::channel::{Channel, ChannelClient};
use crate::session::Session;
use crate::{BridgeError, Result};
use std::time::Duration;

/// Outbound side of the bridge.
///
/// Holds one channel per connected server. `execute` sends the same call to
/// every channel and returns their replies in connection order.
#[derive(Debug)]
pub struct BridgeClient {
    core: BridgeCore,
    channels: Vec<ChannelClient>,
    origin: Option<Session>,
}

impl BridgeClient {
    pub fn new(core: BridgeCore) -> Self {
        Self {
            core,
            channels: Vec::new(),
            origin: None,
        }
    }

    pub fn core(&self) -> &BridgeCore {
        &self.core
    }

    /// Open a new channel to `session`.
    ///
    /// On failure the peer's registry entry is deleted before the error is
    /// returned, so the next lookup no longer finds it.
    pub async fn connect_to(&mut self, session: &Session) -> Result<()> {
        let mut channel = ChannelClient::new();
        channel.set_session(session.clone());

        match channel.connect().await {
            Ok(()) => {
                self.core
                    .log(LogLevel::Debug, &format!("Connected to session {}", session));
                self.channels.push(channel);
                Ok(())
            }
            Err(e) => {
                self.core.log(
                    LogLevel::Warn,
                    &format!("Could not connect to session {}: {}", session, e),
                );
                if let Err(delete_err) = self.core.sessions().delete(session) {
                    self.core.log(
                        LogLevel::Warn,
                        &format!("Failed to remove stale session {}: {}", session, delete_err),
                    );
                }
                Err(BridgeError::connection_failed(session.address(), e))
            }
        }
    }

    /// Connect to each session in turn, returning one result per session.
    ///
    /// A failure does not stop the remaining attempts.
    pub async fn connect_to_many(&mut self, sessions: &[Session]) -> Vec<Result<()>> {
        let mut results = Vec::with_capacity(sessions.len());
        for session in sessions {
            results.push(self.connect_to(session).await);
        }
        results
    }

    /// Advertise this client's own listening session so callees can call back.
    pub fn set_origin(&mut self, session: Session) {
        self.origin = Some(session);
    }

    pub fn origin(&self) -> Option<&Session> {
        self.origin.as_ref()
    }

    pub fn connection_count(&self) -> usize {
        self.channels.len()
    }

    /// Sessions of the connected channels, in connection order.
    pub fn connected_sessions(&self) -> Vec<Session> {
        self.channels
            .iter()
            .filter_map(|channel| channel.session().cloned())
            .collect()
    }

    pub fn disconnect_all(&mut self) {
        for channel in &mut self.channels {
            channel.close();
        }
        self.channels.clear();
    }

    /// Call `name` on every connected server.
    ///
    /// The reply is always awaited, even when `request_reply` is false; the
    /// server answers every request. A transport failure on any channel
    /// aborts the whole call. Remote failures are not errors here: they come
    /// back as `"failure <message>"` strings.
    pub async fn execute(
        &mut self,
        name: &str,
        args: &[String],
        request_reply: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<String>> {
        if self.channels.is_empty() {
            return Err(BridgeError::NoEndpoints);
        }
        if name.is_empty() {
            return Err(BridgeError::EmptyFunctionName);
        }

        let (origin_hostname, origin_port) = match &self.origin {
            Some(origin) if origin.is_valid() => {
                (Some(origin.hostname().to_string()), Some(origin.port()))
            }
            _ => (None, None),
        };

        let mut replies = Vec::with_capacity(self.channels.len());
        for channel in &mut self.channels {
            let key = channel
                .session()
                .map(|session| session.key().to_string())
                .unwrap_or_default();
            let request = CallRequest {
                func: name.to_string(),
                key,
                args: args.to_vec(),
                request_reply,
                origin_hostname: origin_hostname.clone(),
                origin_port,
            };

            channel.send(&request.to_bytes()?, timeout).await?;
            let reply = channel.recv(timeout).await?;
            let reply = String::from_utf8(reply)
                .map_err(|_| BridgeError::Protocol("reply is not valid UTF-8".to_string()))?;
            replies.push(reply);
        }

        self.core.log(
            LogLevel::Debug,
            &format!("Executed {} on {} endpoint(s)", name, replies.len()),
        );
        Ok(replies)
    }
}

#[async_trait::async_trait]
impl Caller for BridgeClient {
    fn origin(&self) -> Option<&Session> {
        BridgeClient::origin(self)
    }

    async fn call(
        &mut self,
        name: &str,
        args: Vec<String>,
        request_reply: bool,
        timeout: Option<Duration>,
    ) -> Result<Vec<String>> {
        self.execute(name, &args, request_reply, timeout).await
    }
}
