//! Platform-specific path and host utilities.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use std::path::PathBuf;

/// Get the default session registry root.
///
/// # Platform Behavior
/// - **Linux/macOS**: `~/.dfiibridge`
/// - **Windows**: `%USERPROFILE%\.dfiibridge`
pub fn bridge_root_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| BridgeError::Config {
        message: "Could not determine home directory".to_string(),
    })?;
    Ok(home.join(BridgeConfig::ROOT_DIR_NAME))
}

/// Resolve the local machine's network name.
///
/// Asks the OS first and falls back to the `HOSTNAME` / `COMPUTERNAME`
/// environment variables.
pub fn local_hostname() -> Result<String> {
    if let Some(name) = sysinfo::System::host_name().filter(|n| !n.trim().is_empty()) {
        return Ok(name.trim().to_string());
    }

    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
        .ok_or_else(|| {
            BridgeError::HostResolution(
                "neither the OS nor HOSTNAME/COMPUTERNAME provided a host name".to_string(),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_root_dir_ends_with_bridge_dir() {
        // Should not fail on supported platforms
        if let Ok(root) = bridge_root_dir() {
            assert!(root.ends_with(BridgeConfig::ROOT_DIR_NAME));
        }
    }

    #[test]
    fn test_local_hostname_is_not_blank() {
        if let Ok(name) = local_hostname() {
            assert!(!name.is_empty());
            assert_eq!(name, name.trim());
        }
    }
}
