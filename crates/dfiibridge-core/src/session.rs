//! Session descriptors.
//!
//! A [`Session`] identifies one bridge endpoint: where it listens, the access
//! key callers must present, the protocol version it speaks and free-form
//! metadata used for discovery. Sessions persist as JSON descriptor documents
//! named `<hostname>_<port>.json`.

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Address and credential descriptor for one bridge endpoint.
#[derive(Debug, Clone, Default)]
pub struct Session {
    hostname: String,
    port: u16,
    key: String,
    version: String,
    userdata: BTreeMap<String, String>,
    valid: bool,
}

/// On-disk shape of a descriptor. Every field is optional so that missing
/// fields can be reported as a malformed session instead of a parse error.
#[derive(Debug, Serialize, Deserialize)]
struct SessionDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(default)]
    userdata: BTreeMap<String, String>,
}

impl Session {
    /// Create a session from its four identifying fields.
    ///
    /// The session is valid only if every field is non-empty and `port > 0`.
    pub fn new(
        hostname: impl Into<String>,
        port: u16,
        key: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let hostname = hostname.into();
        let key = key.into();
        let version = version.into();
        let valid = !hostname.is_empty() && port > 0 && !key.is_empty() && !version.is_empty();

        Self {
            hostname,
            port,
            key,
            version,
            userdata: BTreeMap::new(),
            valid,
        }
    }

    /// Attach discovery metadata.
    pub fn with_userdata(mut self, userdata: BTreeMap<String, String>) -> Self {
        self.userdata = userdata;
        self
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn userdata(&self) -> &BTreeMap<String, String> {
        &self.userdata
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Transport address of the endpoint, e.g. `tcp://node1:5555`.
    pub fn address(&self) -> String {
        format!("{}://{}:{}", BridgeConfig::SCHEME, self.hostname, self.port)
    }

    /// Descriptor file name for this session.
    pub fn descriptor_file_name(&self) -> String {
        descriptor_file_name(&self.hostname, self.port)
    }

    /// Log file name for this session. The bridge never creates it.
    pub fn log_file_name(&self) -> String {
        format!(
            "{}.{}",
            file_stem(&self.hostname, self.port),
            BridgeConfig::LOG_EXTENSION
        )
    }

    /// True if every `criteria` entry is present in `userdata` with the same value.
    pub fn matches_metadata(&self, criteria: &BTreeMap<String, String>) -> bool {
        criteria
            .iter()
            .all(|(k, v)| self.userdata.get(k).is_some_and(|value| value == v))
    }

    /// Serialize to the descriptor document format.
    pub fn to_json(&self) -> Result<String> {
        let doc = SessionDocument {
            version: Some(self.version.clone()),
            port: Some(self.port),
            hostname: Some(self.hostname.clone()),
            key: Some(self.key.clone()),
            userdata: self.userdata.clone(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Parse a descriptor document.
    ///
    /// Fails with `MalformedSession` if the document is not valid JSON or any
    /// of `hostname`, `port`, `key` or `version` is missing or empty.
    pub fn from_json(text: &str) -> Result<Self> {
        let doc: SessionDocument = serde_json::from_str(text)
            .map_err(|e| BridgeError::MalformedSession(format!("unparseable descriptor: {}", e)))?;

        let missing: Vec<&str> = [
            ("hostname", doc.hostname.as_deref().is_some_and(|s| !s.is_empty())),
            ("port", doc.port.is_some_and(|p| p > 0)),
            ("key", doc.key.as_deref().is_some_and(|s| !s.is_empty())),
            ("version", doc.version.as_deref().is_some_and(|s| !s.is_empty())),
        ]
        .into_iter()
        .filter(|(_, present)| !present)
        .map(|(field, _)| field)
        .collect();

        if !missing.is_empty() {
            return Err(BridgeError::MalformedSession(format!(
                "missing fields: {}",
                missing.join(", ")
            )));
        }

        Ok(Session::new(
            doc.hostname.unwrap_or_default(),
            doc.port.unwrap_or_default(),
            doc.key.unwrap_or_default(),
            doc.version.unwrap_or_default(),
        )
        .with_userdata(doc.userdata))
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.hostname == other.hostname
            && self.port == other.port
            && self.key == other.key
            && self.version == other.version
    }
}

impl Eq for Session {}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

/// Descriptor file name for a host/port pair.
pub fn descriptor_file_name(hostname: &str, port: u16) -> String {
    format!(
        "{}.{}",
        file_stem(hostname, port),
        BridgeConfig::DESCRIPTOR_EXTENSION
    )
}

fn file_stem(hostname: &str, port: u16) -> String {
    let host: String = hostname
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '-',
            c => c,
        })
        .collect();
    format!("{}_{}", host, port)
}
