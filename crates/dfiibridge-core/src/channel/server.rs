//! Replier side of the transport.
//!
//! Binds one TCP port for its whole lifetime, accepts requester connections
//! and funnels their requests into a single queue. `recv()` hands out one
//! request at a time and the following `send()` answers that same requester,
//! so callers process requests strictly one after another.
//!
//! # Thread Safety
//!
//! The accept loop and one reader task per connection run on the tokio
//! runtime. They only talk to the `ChannelServer` through an mpsc queue and
//! per-request oneshot reply slots.

use super::frame::{read_frame, write_frame};
use super::{parse_address, with_deadline, Channel};
use crate::config::BridgeConfig;
use crate::{BridgeError, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One request waiting for the server to answer it.
struct InboundRequest {
    payload: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

/// Inbound request/reply channel.
#[derive(Default)]
pub struct ChannelServer {
    bind_address: Option<String>,
    inbound: Option<mpsc::Receiver<InboundRequest>>,
    pending: Option<oneshot::Sender<Vec<u8>>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
}

impl ChannelServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind to an explicit `tcp://host:port` address and start accepting.
    pub async fn bind(&mut self, address: &str) -> Result<()> {
        if self.is_bound() {
            return Err(BridgeError::Protocol(format!(
                "channel already bound to {}",
                self.bind_address.as_deref().unwrap_or_default()
            )));
        }

        let (host, port) = parse_address(address)?;
        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| BridgeError::ConnectionFailed {
                endpoint: address.to_string(),
                message: format!("bind failed: {}", e),
                source: None,
            })?;
        let local = listener.local_addr()?;
        let resolved = format!("{}://{}", BridgeConfig::SCHEME, format_socket_addr(local));

        info!("Channel listening on {}", resolved);

        let (queue_tx, queue_rx) = mpsc::channel(BridgeConfig::INBOUND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        self.accept_task = Some(tokio::spawn(Self::accept_loop(
            listener,
            queue_tx,
            shutdown_rx,
        )));
        self.inbound = Some(queue_rx);
        self.shutdown_tx = Some(shutdown_tx);
        self.bind_address = Some(resolved);

        Ok(())
    }

    /// Bind to an OS-assigned port on every interface.
    pub async fn bind_free_port(&mut self) -> Result<()> {
        self.bind(BridgeConfig::DEFAULT_BIND_ADDRESS).await
    }

    /// The resolved address recorded at bind time.
    pub fn bind_address(&self) -> Option<&str> {
        self.bind_address.as_deref()
    }

    pub fn is_bound(&self) -> bool {
        self.accept_task.is_some()
    }

    /// Port parsed from the trailing component of the bind address.
    pub fn get_port(&self) -> Result<u16> {
        let address = self.bind_address.as_deref().ok_or(BridgeError::NotConnected)?;
        address
            .rsplit(':')
            .next()
            .and_then(|port| port.parse().ok())
            .ok_or_else(|| BridgeError::Protocol(format!("no port in bind address {}", address)))
    }

    async fn accept_loop(
        listener: TcpListener,
        queue: mpsc::Sender<InboundRequest>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!("Channel accept loop shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let queue = queue.clone();
                            let mut conn_shutdown = shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Channel connection from {}", peer_addr);
                                if let Err(e) = Self::handle_connection(stream, queue, &mut conn_shutdown).await {
                                    debug!("Channel connection {} ended: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Channel accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        mut stream: TcpStream,
        queue: mpsc::Sender<InboundRequest>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.split();

        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }

            let payload = tokio::select! {
                result = read_frame(&mut reader) => {
                    match result? {
                        Some(frame) => frame,
                        None => return Ok(()), // Clean disconnect
                    }
                }
                _ = shutdown_rx.changed() => return Ok(()),
            };

            let (reply_tx, reply_rx) = oneshot::channel();
            if queue
                .send(InboundRequest {
                    payload,
                    reply: reply_tx,
                })
                .await
                .is_err()
            {
                return Ok(()); // Server side went away
            }

            // No shutdown arm here: a reply handed over just before close()
            // must still reach the wire. Closing drops every unanswered
            // reply slot, which ends this wait.
            let reply = match reply_rx.await {
                Ok(bytes) => bytes,
                Err(_) => return Ok(()),
            };

            write_frame(&mut writer, &reply).await?;
        }
    }
}

#[async_trait::async_trait]
impl Channel for ChannelServer {
    /// Answer the request returned by the previous `recv()`.
    ///
    /// The reply is handed to the connection task immediately, so `timeout`
    /// never elapses here.
    async fn send(&mut self, data: &[u8], _timeout: Option<Duration>) -> Result<()> {
        let reply = self
            .pending
            .take()
            .ok_or_else(|| BridgeError::Protocol("no request awaiting a reply".to_string()))?;

        reply
            .send(data.to_vec())
            .map_err(|_| BridgeError::Protocol("requester disconnected before the reply".to_string()))
    }

    async fn recv(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>> {
        if self.pending.take().is_some() {
            warn!("Dropping unanswered request before receiving the next one");
        }

        let inbound = self.inbound.as_mut().ok_or(BridgeError::NotConnected)?;
        let outcome = with_deadline(timeout, inbound.recv()).await;

        match outcome {
            Ok(Some(request)) => {
                self.pending = Some(request.reply);
                Ok(request.payload)
            }
            Ok(None) => Err(BridgeError::Protocol("inbound queue closed".to_string())),
            Err(elapsed) => Err(BridgeError::TransportTimeout {
                timeout: timeout.unwrap_or_default(),
                message: elapsed.to_string(),
            }),
        }
    }

    fn close(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.accept_task.take() {
            task.abort();
            debug!(
                "Channel on {} closed",
                self.bind_address.as_deref().unwrap_or("<unbound>")
            );
        }
        self.pending = None;
        self.inbound = None;
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.close();
    }
}

fn format_socket_addr(addr: SocketAddr) -> String {
    match addr {
        SocketAddr::V4(v4) => format!("{}:{}", v4.ip(), v4.port()),
        SocketAddr::V6(v6) => format!("[{}]:{}", v6.ip(), v6.port()),
    }
}
