//! Centralized configuration for the bridge.
//!
//! This module provides the constants shared by the transport, the session
//! registry and the server receive loop.

use std::time::Duration;

/// Bridge-wide configuration.
pub struct BridgeConfig;

impl BridgeConfig {
    /// Protocol version published in every session descriptor.
    pub const PROTOCOL_VERSION: &'static str = env!("CARGO_PKG_VERSION");

    // Registry layout
    pub const ROOT_DIR_NAME: &'static str = ".dfiibridge";
    pub const DESCRIPTOR_EXTENSION: &'static str = "json";
    pub const LOG_EXTENSION: &'static str = "log";

    // Transport
    pub const SCHEME: &'static str = "tcp";
    pub const WILDCARD_HOST: &'static str = "*";
    pub const DEFAULT_BIND_ADDRESS: &'static str = "tcp://*:0";
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
    pub const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);
    pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);
    pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;
    pub const PROBE_CONNECT_ATTEMPTS: u32 = 1;
    pub const INBOUND_QUEUE_DEPTH: usize = 64;

    // Server receive loop
    pub const SERVER_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const SERVER_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

    // Pre-registered callbacks
    pub const INFO_FUNCTION: &'static str = "dfiibridge_info";
    pub const EXIT_FUNCTION: &'static str = "dfiibridge_exit";

    // Wire replies
    pub const FAILURE_PREFIX: &'static str = "failure ";
}

/// Convert the integer timeout convention (`-1` = forever, `n` = milliseconds)
/// into the optional duration taken by the transport.
pub fn timeout_from_millis(millis: i64) -> Option<Duration> {
    if millis < 0 {
        None
    } else {
        Some(Duration::from_millis(millis as u64))
    }
}

/// Extract the major token of a version string.
///
/// Semver strings yield their parsed major number; anything else falls back
/// to the text before the first `.`.
pub fn major_version(version: &str) -> String {
    match semver::Version::parse(version.trim()) {
        Ok(parsed) => parsed.major.to_string(),
        Err(_) => version.trim().split('.').next().unwrap_or_default().to_string(),
    }
}
