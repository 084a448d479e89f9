//! Wire documents exchanged by bridge clients and servers.
//!
//! A request is a JSON object:
//!
//! ```text
//! {"func": "echo", "key": "<access key>", "args": ["hi"], "request_reply": true,
//!  "origin_hostname": "node2", "origin_port": 5556}
//! ```
//!
//! The origin fields are present only when the caller advertises a listening
//! session of its own. A reply is a plain string; failures are the same string
//! channel with a `"failure "` prefix.

use crate::config::BridgeConfig;
use crate::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One remote call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRequest {
    pub func: String,
    pub key: String,
    pub args: Vec<String>,
    pub request_reply: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_port: Option<u16>,
}

/// Permissive view of an incoming request, used to report which field is
/// missing instead of failing with a generic parse error.
#[derive(Debug, Deserialize)]
struct RawCallRequest {
    func: Option<String>,
    key: Option<String>,
    args: Option<Vec<String>>,
    request_reply: Option<bool>,
    origin_hostname: Option<String>,
    origin_port: Option<u16>,
}

impl CallRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse and validate an incoming request.
    ///
    /// `func` and `args` are required (`Protocol` error otherwise); a missing
    /// `key` is reported as `InvalidKey`. `request_reply` defaults to `true`.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let raw: RawCallRequest = serde_json::from_slice(payload).map_err(|e| BridgeError::Json {
            message: format!("Failed to parse request: {}", e),
            source: Some(e),
        })?;

        let func = raw
            .func
            .filter(|f| !f.is_empty())
            .ok_or_else(|| BridgeError::Protocol("request is missing 'func'".to_string()))?;
        let key = raw.key.ok_or(BridgeError::InvalidKey)?;
        let args = raw
            .args
            .ok_or_else(|| BridgeError::Protocol("request is missing 'args'".to_string()))?;

        Ok(Self {
            func,
            key,
            args,
            request_reply: raw.request_reply.unwrap_or(true),
            origin_hostname: raw.origin_hostname,
            origin_port: raw.origin_port,
        })
    }

    /// The advertised origin, if both halves are present.
    pub fn origin(&self) -> Option<(&str, u16)> {
        match (&self.origin_hostname, self.origin_port) {
            (Some(host), Some(port)) if !host.is_empty() && port > 0 => Some((host.as_str(), port)),
            _ => None,
        }
    }
}

/// Classified reply payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Success(String),
    Failure(String),
}

impl Reply {
    /// Classify a raw reply by its `"failure "` prefix.
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix(BridgeConfig::FAILURE_PREFIX) {
            Some(message) => Reply::Failure(message.to_string()),
            None => Reply::Success(raw.to_string()),
        }
    }

    /// Render a failure the way the server puts it on the wire.
    pub fn failure_payload(error: impl fmt::Display) -> String {
        format!("{}{}", BridgeConfig::FAILURE_PREFIX, error)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Reply::Failure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CallRequest {
        CallRequest {
            func: "echo".to_string(),
            key: "secret".to_string(),
            args: vec!["hi".to_string()],
            request_reply: true,
            origin_hostname: None,
            origin_port: None,
        }
    }

    #[test]
    fn test_request_without_origin_omits_fields() {
        let json = String::from_utf8(request().to_bytes().unwrap()).unwrap();
        assert!(json.contains("\"func\":\"echo\""));
        assert!(!json.contains("origin_hostname"));
        assert!(!json.contains("origin_port"));

        let parsed = CallRequest::parse(json.as_bytes()).unwrap();
        assert_eq!(parsed, request());
        assert_eq!(parsed.origin(), None);
    }

    #[test]
    fn test_request_with_origin() {
        let mut req = request();
        req.origin_hostname = Some("node2".to_string());
        req.origin_port = Some(5556);

        let parsed = CallRequest::parse(&req.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.origin(), Some(("node2", 5556)));
    }

    #[test]
    fn test_parse_reports_missing_fields() {
        assert!(matches!(
            CallRequest::parse(br#"{"key": "k", "args": []}"#),
            Err(BridgeError::Protocol(_))
        ));
        assert!(matches!(
            CallRequest::parse(br#"{"func": "echo", "args": []}"#),
            Err(BridgeError::InvalidKey)
        ));
        assert!(matches!(
            CallRequest::parse(br#"{"func": "echo", "key": "k"}"#),
            Err(BridgeError::Protocol(_))
        ));
        assert!(matches!(
            CallRequest::parse(b"not json"),
            Err(BridgeError::Json { .. })
        ));
    }

    #[test]
    fn test_request_reply_defaults_to_true() {
        let parsed = CallRequest::parse(br#"{"func": "f", "key": "k", "args": []}"#).unwrap();
        assert!(parsed.request_reply);
    }

    #[test]
    fn test_reply_classification() {
        assert_eq!(Reply::parse("hi"), Reply::Success("hi".to_string()));
        assert_eq!(Reply::parse(""), Reply::Success(String::new()));
        assert_eq!(
            Reply::parse("failure Invalid key"),
            Reply::Failure("Invalid key".to_string())
        );
        assert_eq!(Reply::failure_payload("boom"), "failure boom");
        assert!(Reply::parse(&Reply::failure_payload("x")).is_failure());
    }
}
