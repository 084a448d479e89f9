//! File-backed session registry for cross-process peer discovery.
//!
//! Every known endpoint is one JSON descriptor file under a root directory,
//! named `<hostname>_<port>.json`. There is no lock and no heartbeat:
//!
//! - Writers overwrite whole files atomically (last write wins).
//! - Staleness is detected only by liveness probes; a peer that cannot be
//!   reached, or whose descriptor cannot be parsed, has its file deleted and
//!   the eviction is recorded.
//!
//! # Location
//!
//! The default root is `~/.dfiibridge`; callers may pass any directory.

pub mod atomic;
pub mod session_manager;

pub use session_manager::{Eviction, EvictionReason, SessionManager};
