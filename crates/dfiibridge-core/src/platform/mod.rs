//! Platform abstraction layer.
//!
//! All platform-specific lookups (home directory, host name) live here rather
//! than being scattered through the transport and registry code.

pub mod paths;

pub use paths::{bridge_root_dir, local_hostname};
