//! State shared by bridge clients and servers.
//!
//! A `BridgeCore` ties together the session registry and the set of log
//! observers owned by one bridge instance. Cloning a core shares both;
//! [`fork`](BridgeCore::fork) shares the registry but copies the observer set,
//! which is how a server hands its observers to the short-lived client it
//! builds for a reverse call.

use crate::registry::SessionManager;
use crate::session::Session;
use crate::{BridgeError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// Severity of a bridge log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Receives every log record emitted by a bridge instance.
pub trait LogObserver: Send + Sync {
    fn on_log(&self, level: LogLevel, message: &str);
}

impl<F> LogObserver for F
where
    F: Fn(LogLevel, &str) + Send + Sync,
{
    fn on_log(&self, level: LogLevel, message: &str) {
        self(level, message)
    }
}

type ObserverSet = Arc<RwLock<Vec<Arc<dyn LogObserver>>>>;

/// Registry handle plus log fan-out.
#[derive(Clone)]
pub struct BridgeCore {
    sessions: Arc<SessionManager>,
    observers: ObserverSet,
}

impl BridgeCore {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self {
            sessions,
            observers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Core backed by the registry at the default location.
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(Arc::new(SessionManager::open()?)))
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn add_log_observer(&self, observer: Arc<dyn LogObserver>) -> Result<()> {
        self.observers
            .write()
            .map_err(|_| BridgeError::Other("log observer lock poisoned".to_string()))?
            .push(observer);
        Ok(())
    }

    pub fn log_observers(&self) -> Vec<Arc<dyn LogObserver>> {
        self.observers
            .read()
            .map(|set| set.clone())
            .unwrap_or_default()
    }

    /// A core on the same registry with its own copy of the observer set.
    pub fn fork(&self) -> Self {
        Self {
            sessions: self.sessions.clone(),
            observers: Arc::new(RwLock::new(self.log_observers())),
        }
    }

    /// Emit a record through `tracing` and every registered observer.
    pub fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!("{}", message),
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }

        for observer in self.log_observers() {
            observer.on_log(level, message);
        }
    }

    /// Registered sessions whose userdata contains every `criteria` entry.
    pub async fn find_sessions(
        &self,
        criteria: &BTreeMap<String, String>,
        connection_check: bool,
    ) -> Result<Vec<Session>> {
        self.sessions
            .find_by_metadata(criteria, connection_check)
            .await
    }
}

impl fmt::Debug for BridgeCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeCore")
            .field("root", &self.sessions.root())
            .field("observers", &self.log_observers().len())
            .finish()
    }
}
