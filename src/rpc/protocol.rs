//! The wire shapes spoken over an [`super::RpcAdapter`] websocket
//! connection (spec §4.8): a handshake advertising callable methods,
//! followed by a stream of request/response frames.

use serde::{Deserialize, Serialize};

/// Sent once, immediately after a connection upgrades, advertising every
/// callable method this mount exposes. `init` is never included — it
/// names the ledger's own bootstrap entry, not a guest export, and is
/// withheld even if a guest script happens to define `exports.init`.
#[derive(Debug, Clone, Serialize)]
pub struct Handshake {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub methods: Vec<String>,
    #[serde(rename = "callLogUrl")]
    pub call_log_url: String,
    #[serde(rename = "filesArchiveUrl")]
    pub files_archive_url: String,
}

pub const RESERVED_METHODS: &[&str] = &["init"];

impl Handshake {
    pub fn for_methods(methods: &[String], call_log_url: String, files_archive_url: String) -> Self {
        Handshake {
            kind: "handshake",
            methods: methods
                .iter()
                .filter(|m| !RESERVED_METHODS.contains(&m.as_str()))
                .cloned()
                .collect(),
            call_log_url,
            files_archive_url,
        }
    }
}

/// An incoming call request frame.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(rename = "userId", default)]
    pub user_id: Option<String>,
}

/// JSON-RPC-style error codes this adapter actually produces.
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const CAPACITY_EXCEEDED: i32 = -32001;
pub const INTERNAL_ERROR: i32 = -32000;

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// An outgoing reply frame, matched to its request by `id`.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn ok(id: u64, result: Option<serde_json::Value>) -> Self {
        Response {
            id,
            result: Some(result.unwrap_or(serde_json::Value::Null)),
            error: None,
        }
    }

    pub fn err(id: u64, err: &crate::error::CoreError) -> Self {
        let code = match err {
            crate::error::CoreError::MethodNotSupported(_) => METHOD_NOT_FOUND,
            crate::error::CoreError::Capacity(_) => CAPACITY_EXCEEDED,
            _ => INTERNAL_ERROR,
        };
        Response {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: err.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_excludes_the_init_method_even_if_exported() {
        let handshake = Handshake::for_methods(
            &["init".into(), "greet".into()],
            "log://x".into(),
            "archive://x".into(),
        );
        assert_eq!(handshake.methods, vec!["greet".to_string()]);
    }

    #[test]
    fn handshake_carries_the_log_and_archive_urls() {
        let handshake = Handshake::for_methods(&["greet".into()], "log://x".into(), "archive://y".into());
        assert_eq!(handshake.call_log_url, "log://x");
        assert_eq!(handshake.files_archive_url, "archive://y");
    }

    #[test]
    fn method_not_supported_maps_to_json_rpc_method_not_found() {
        let err = crate::error::CoreError::MethodNotSupported("ghost".into());
        let response = Response::err(1, &err);
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }
}
