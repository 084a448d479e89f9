//! Bridge server: publishes a session and dispatches incoming calls.
//!
//! # Lifecycle
//!
//! `Idle → Listening → Idle`. Entering `Listening` binds a port, generates a
//! fresh access key and publishes the session descriptor. Leaving it closes
//! the port and deletes the descriptor.
//!
//! - `listen()` runs the receive loop on the calling task until stopped.
//! - `listen_async()` runs it on a spawned task and returns once the session
//!   is published.
//! - `stop()` (or a remote `dfiibridge_exit` call) ends the loop.
//!
//! The loop serves one request at a time. Nothing a request does, including
//! a panicking callback, terminates it: every failure becomes a
//! `"failure <message>"` reply.

use super::callback::{Caller, RemoteCallback};
use super::client::BridgeClient;
use super::core::{BridgeCore, LogLevel};
use super::protocol::{CallRequest, Reply};
use crate::channel::{Channel, ChannelServer};
use crate::config::BridgeConfig;
use crate::registry::SessionManager;
use crate::session::Session;
use crate::{BridgeError, Result};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;

type FunctionTable = Arc<RwLock<HashMap<String, Arc<dyn RemoteCallback>>>>;

/// Clonable handle that asks a listening server to stop.
///
/// Useful with [`BridgeServer::listen`], which holds the server for the
/// lifetime of the loop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    /// Request the loop to stop. It exits within one poll interval.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Returns the server's process id.
struct InfoCallback;

#[async_trait::async_trait]
impl RemoteCallback for InfoCallback {
    async fn call(&self, _args: Vec<String>, _caller: Option<&mut dyn Caller>) -> Result<String> {
        Ok(std::process::id().to_string())
    }
}

/// Stops the server that received it and acknowledges with an empty reply.
struct ExitCallback {
    running: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl RemoteCallback for ExitCallback {
    async fn call(&self, _args: Vec<String>, _caller: Option<&mut dyn Caller>) -> Result<String> {
        self.running.store(false, Ordering::SeqCst);
        Ok(String::new())
    }
}

/// Inbound side of the bridge.
pub struct BridgeServer {
    core: BridgeCore,
    functions: FunctionTable,
    hostname: Option<String>,
    bind_address: String,
    userdata: BTreeMap<String, String>,
    session: Session,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<()>>>,
}

impl BridgeServer {
    /// Server on `core`'s registry, binding an ephemeral port on every
    /// interface and advertising the machine's host name.
    pub fn new(core: BridgeCore) -> Self {
        let running = Arc::new(AtomicBool::new(false));
        let mut functions: HashMap<String, Arc<dyn RemoteCallback>> = HashMap::new();
        functions.insert(BridgeConfig::INFO_FUNCTION.to_string(), Arc::new(InfoCallback));
        functions.insert(
            BridgeConfig::EXIT_FUNCTION.to_string(),
            Arc::new(ExitCallback {
                running: running.clone(),
            }),
        );

        Self {
            core,
            functions: Arc::new(RwLock::new(functions)),
            hostname: None,
            bind_address: BridgeConfig::DEFAULT_BIND_ADDRESS.to_string(),
            userdata: BTreeMap::new(),
            session: Session::default(),
            running,
            worker: None,
        }
    }

    pub fn builder() -> BridgeServerBuilder {
        BridgeServerBuilder::default()
    }

    pub fn core(&self) -> &BridgeCore {
        &self.core
    }

    /// The session published by the most recent `listen`.
    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: self.running.clone(),
        }
    }

    /// Register `callback` under `name`.
    ///
    /// Names are permanent for the server's lifetime; a second registration
    /// under the same name fails and leaves the first in place.
    pub fn register_function(
        &self,
        name: impl Into<String>,
        callback: Arc<dyn RemoteCallback>,
    ) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(BridgeError::EmptyName);
        }

        let mut table = self
            .functions
            .write()
            .map_err(|_| BridgeError::Other("function table lock poisoned".to_string()))?;
        if table.contains_key(&name) {
            return Err(BridgeError::DuplicateName(name));
        }

        self.core
            .log(LogLevel::Debug, &format!("Registered function {}", name));
        table.insert(name, callback);
        Ok(())
    }

    /// Registered function names, sorted.
    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .functions
            .read()
            .map(|table| table.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Publish the session and serve requests on the calling task until stopped.
    pub async fn listen(&mut self) -> Result<()> {
        self.stop().await?;
        let serve = self.start_listening().await?;
        serve.run().await
    }

    /// Publish the session and serve requests on a spawned task.
    ///
    /// A previously running worker is stopped and joined first.
    pub async fn listen_async(&mut self) -> Result<()> {
        self.stop().await?;
        let serve = self.start_listening().await?;
        self.worker = Some(tokio::spawn(serve.run()));
        Ok(())
    }

    /// Stop the receive loop and wait for the worker, if any. Idempotent.
    pub async fn stop(&mut self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);

        if let Some(worker) = self.worker.take() {
            match worker.await {
                Ok(result) => result?,
                Err(e) => {
                    return Err(BridgeError::Other(format!("server worker failed: {}", e)));
                }
            }
        }

        Ok(())
    }

    async fn start_listening(&mut self) -> Result<ServeLoop> {
        let mut channel = ChannelServer::new();
        channel.bind(&self.bind_address).await?;
        let port = channel.get_port()?;

        let hostname = match &self.hostname {
            Some(hostname) => hostname.clone(),
            None => channel.get_hostname()?,
        };
        let key = uuid::Uuid::new_v4().simple().to_string();
        let session = Session::new(hostname, port, key, BridgeConfig::PROTOCOL_VERSION)
            .with_userdata(self.userdata.clone());

        self.core.sessions().write(&session)?;
        self.session = session.clone();
        self.running.store(true, Ordering::SeqCst);

        self.core.log(
            LogLevel::Info,
            &format!(
                "Bridge server listening as {} ({})",
                session,
                channel.bind_address().unwrap_or_default()
            ),
        );

        Ok(ServeLoop {
            channel,
            core: self.core.clone(),
            functions: self.functions.clone(),
            session,
            running: self.running.clone(),
        })
    }
}

impl Drop for BridgeServer {
    fn drop(&mut self) {
        // A detached worker still unregisters itself once it sees the flag.
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Everything the receive loop owns while the server is listening.
struct ServeLoop {
    channel: ChannelServer,
    core: BridgeCore,
    functions: FunctionTable,
    session: Session,
    running: Arc<AtomicBool>,
}

impl ServeLoop {
    async fn run(mut self) -> Result<()> {
        let mut outcome = Ok(());

        while self.running.load(Ordering::SeqCst) {
            let payload = match self
                .channel
                .recv(Some(BridgeConfig::SERVER_POLL_INTERVAL))
                .await
            {
                Ok(payload) => payload,
                Err(BridgeError::TransportTimeout { .. }) => continue,
                Err(e) => {
                    self.core
                        .log(LogLevel::Error, &format!("Receive loop failed: {}", e));
                    outcome = Err(e);
                    break;
                }
            };

            let reply = self.handle(payload).await;

            if let Err(e) = self
                .channel
                .send(reply.as_bytes(), Some(BridgeConfig::SERVER_REPLY_TIMEOUT))
                .await
            {
                self.core
                    .log(LogLevel::Warn, &format!("Failed to send reply: {}", e));
            }
        }

        self.shutdown();
        outcome
    }

    fn shutdown(&mut self) {
        self.channel.close();
        match self.core.sessions().delete(&self.session) {
            Ok(_) => self.core.log(
                LogLevel::Info,
                &format!("Bridge server {} stopped", self.session),
            ),
            Err(e) => self.core.log(
                LogLevel::Warn,
                &format!("Failed to unregister session {}: {}", self.session, e),
            ),
        }
    }

    async fn handle(&self, payload: Vec<u8>) -> String {
        if payload.is_empty() {
            return Reply::failure_payload("empty request");
        }

        match self.dispatch(&payload).await {
            Ok(reply) => reply,
            Err(e) => {
                self.core
                    .log(LogLevel::Warn, &format!("Request failed: {}", e));
                Reply::failure_payload(e)
            }
        }
    }

    async fn dispatch(&self, payload: &[u8]) -> Result<String> {
        let request = CallRequest::parse(payload)?;
        if request.key != self.session.key() {
            return Err(BridgeError::InvalidKey);
        }

        let callback = {
            let table = self
                .functions
                .read()
                .map_err(|_| BridgeError::Other("function table lock poisoned".to_string()))?;
            table.get(&request.func).cloned()
        }
        .ok_or_else(|| BridgeError::UnknownFunction(request.func.clone()))?;

        self.core.log(
            LogLevel::Debug,
            &format!("Dispatching {} ({} args)", request.func, request.args.len()),
        );

        let mut reverse = match request.origin() {
            Some((hostname, port)) => Some(self.reverse_client(hostname, port).await?),
            None => None,
        };
        let caller = reverse.as_mut().map(|client| client as &mut dyn Caller);

        match AssertUnwindSafe(callback.call(request.args, caller))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Other(format!(
                "callback {} panicked",
                request.func
            ))),
        }
    }

    /// Client connected back to the caller's advertised session.
    async fn reverse_client(&self, hostname: &str, port: u16) -> Result<BridgeClient> {
        let origin = self.core.sessions().get(hostname, port, false).await?;
        let mut client = BridgeClient::new(self.core.fork());
        client.connect_to(&origin).await?;
        client.set_origin(origin);
        Ok(client)
    }
}

/// Builder for configuring a [`BridgeServer`].
///
/// # Example
///
/// ```rust,ignore
/// use dfiibridge::BridgeServer;
///
/// let mut server = BridgeServer::builder()
///     .registry_root("/tmp/bridge")
///     .hostname("127.0.0.1")
///     .userdata("role", "worker")
///     .build()?;
/// server.listen_async().await?;
/// ```
#[derive(Default)]
pub struct BridgeServerBuilder {
    sessions: Option<Arc<SessionManager>>,
    registry_root: Option<PathBuf>,
    hostname: Option<String>,
    bind_address: Option<String>,
    userdata: BTreeMap<String, String>,
}

impl BridgeServerBuilder {
    /// Use an existing registry. Takes precedence over `registry_root`.
    pub fn session_manager(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Open the registry rooted at `root`.
    ///
    /// Default: `~/.dfiibridge`
    pub fn registry_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.registry_root = Some(root.into());
        self
    }

    /// Host name published in the session.
    ///
    /// Default: the machine's network name
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Address to bind, e.g. `tcp://127.0.0.1:0`.
    ///
    /// Default: `tcp://*:0`
    pub fn bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = Some(address.into());
        self
    }

    /// Add one discovery metadata entry.
    pub fn userdata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.userdata.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<BridgeServer> {
        let sessions = match (self.sessions, self.registry_root) {
            (Some(sessions), _) => sessions,
            (None, Some(root)) => Arc::new(SessionManager::open_at(root)?),
            (None, None) => Arc::new(SessionManager::open()?),
        };

        let mut server = BridgeServer::new(BridgeCore::new(sessions));
        server.hostname = self.hostname;
        if let Some(address) = self.bind_address {
            server.bind_address = address;
        }
        server.userdata = self.userdata;
        Ok(server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::callback::callback_fn;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_server() -> (BridgeServer, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let server = BridgeServer::builder()
            .registry_root(temp_dir.path())
            .hostname("127.0.0.1")
            .bind_address("tcp://127.0.0.1:0")
            .build()
            .unwrap();
        (server, temp_dir)
    }

    #[test]
    fn test_builtin_functions_are_registered() {
        let (server, _temp_dir) = create_test_server();
        assert_eq!(
            server.function_names(),
            vec![
                BridgeConfig::EXIT_FUNCTION.to_string(),
                BridgeConfig::INFO_FUNCTION.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_keeps_first_callback() {
        let (mut server, _temp_dir) = create_test_server();
        let first = callback_fn(|args| Ok(format!("first {}", args.join(" "))));
        let second = callback_fn(|args| Ok(format!("second {}", args.join(" "))));

        assert!(matches!(
            server.register_function("", first.clone()),
            Err(BridgeError::EmptyName)
        ));
        server.register_function("echo", first).unwrap();
        assert!(matches!(
            server.register_function("echo", second.clone()),
            Err(BridgeError::DuplicateName(name)) if name == "echo"
        ));
        assert!(matches!(
            server.register_function(BridgeConfig::EXIT_FUNCTION, second),
            Err(BridgeError::DuplicateName(_))
        ));

        server.listen_async().await.unwrap();
        let mut client = BridgeClient::new(server.core().fork());
        client.connect_to(server.session()).await.unwrap();
        let timeout = Some(Duration::from_secs(2));

        let replies = client
            .execute("echo", &["hi".to_string()], true, timeout)
            .await
            .unwrap();
        assert_eq!(replies, vec!["first hi".to_string()]);

        // The built-in exit callback also survived the collision
        let replies = client
            .execute(BridgeConfig::EXIT_FUNCTION, &[], true, timeout)
            .await
            .unwrap();
        assert_eq!(replies, vec![String::new()]);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_async_publishes_and_stop_unregisters() {
        let (mut server, _temp_dir) = create_test_server();
        assert!(!server.is_running());

        server.listen_async().await.unwrap();
        let session = server.session().clone();
        assert!(session.is_valid());
        assert!(server.is_running());

        let descriptor = server
            .core()
            .sessions()
            .descriptor_path(session.hostname(), session.port());
        assert!(descriptor.exists());

        server.stop().await.unwrap();
        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert!(!descriptor.exists());
    }

    #[tokio::test]
    async fn test_relisten_generates_fresh_key() {
        let (mut server, _temp_dir) = create_test_server();

        server.listen_async().await.unwrap();
        let first = server.session().clone();
        server.listen_async().await.unwrap();
        let second = server.session().clone();

        assert_ne!(first.key(), second.key());
        let stored = server
            .core()
            .sessions()
            .get(second.hostname(), second.port(), false)
            .await
            .unwrap();
        assert_eq!(stored.key(), second.key());

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_handle_ends_blocking_listen() {
        let (mut server, _temp_dir) = create_test_server();
        let handle = server.stop_handle();

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            handle.stop();
        });

        tokio::time::timeout(Duration::from_secs(5), server.listen())
            .await
            .expect("listen should return after stop")
            .unwrap();
        stopper.await.unwrap();

        let session = server.session();
        assert!(!server
            .core()
            .sessions()
            .descriptor_path(session.hostname(), session.port())
            .exists());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_bad_key_and_unknown_function() {
        let (mut server, _temp_dir) = create_test_server();
        server
            .register_function("echo", callback_fn(|args| Ok(args.join(" "))))
            .unwrap();
        server.listen_async().await.unwrap();
        let session = server.session().clone();

        let mut channel = crate::channel::ChannelClient::new();
        channel.set_session(session.clone());
        channel.connect().await.unwrap();
        let timeout = Some(Duration::from_secs(2));

        let wrong_key = CallRequest {
            func: "echo".to_string(),
            key: "not-the-key".to_string(),
            args: vec![],
            request_reply: true,
            origin_hostname: None,
            origin_port: None,
        };
        channel.send(&wrong_key.to_bytes().unwrap(), timeout).await.unwrap();
        let reply = String::from_utf8(channel.recv(timeout).await.unwrap()).unwrap();
        assert_eq!(reply, "failure Invalid key");

        let unknown = CallRequest {
            func: "missing".to_string(),
            key: session.key().to_string(),
            ..wrong_key
        };
        channel.send(&unknown.to_bytes().unwrap(), timeout).await.unwrap();
        let reply = String::from_utf8(channel.recv(timeout).await.unwrap()).unwrap();
        assert_eq!(reply, "failure Unknown function: missing");

        channel.send(b"{ definitely not json", timeout).await.unwrap();
        let reply = String::from_utf8(channel.recv(timeout).await.unwrap()).unwrap();
        assert!(Reply::parse(&reply).is_failure());

        // Still serving after all of the above
        let ok = CallRequest {
            func: "echo".to_string(),
            key: session.key().to_string(),
            args: vec!["still".to_string(), "alive".to_string()],
            request_reply: true,
            origin_hostname: None,
            origin_port: None,
        };
        channel.send(&ok.to_bytes().unwrap(), timeout).await.unwrap();
        let reply = String::from_utf8(channel.recv(timeout).await.unwrap()).unwrap();
        assert_eq!(reply, "still alive");

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_callback_becomes_failure_reply() {
        let (mut server, _temp_dir) = create_test_server();
        server
            .register_function(
                "explode",
                callback_fn(|_| -> Result<String> { panic!("kaboom") }),
            )
            .unwrap();
        server.listen_async().await.unwrap();

        let mut client = BridgeClient::new(server.core().fork());
        client.connect_to(server.session()).await.unwrap();
        let timeout = Some(Duration::from_secs(2));

        let replies = client.execute("explode", &[], true, timeout).await.unwrap();
        assert_eq!(replies, vec!["failure callback explode panicked".to_string()]);

        let replies = client
            .execute(BridgeConfig::INFO_FUNCTION, &[], true, timeout)
            .await
            .unwrap();
        assert_eq!(replies, vec![std::process::id().to_string()]);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_frame_gets_failure_reply() {
        use crate::channel::frame::{read_frame, write_frame};

        let (mut server, _temp_dir) = create_test_server();
        server.listen_async().await.unwrap();

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", server.session().port()))
            .await
            .unwrap();
        write_frame(&mut stream, b"").await.unwrap();
        let reply = read_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(reply, b"failure empty request");

        server.stop().await.unwrap();
    }
}
