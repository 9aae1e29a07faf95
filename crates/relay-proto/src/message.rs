//! Typed, versioned envelopes for every message in the relay protocol.
//!
//! Every message shares a `type` discriminator and a `ts` millisecond
//! timestamp. The enum is internally tagged on `type` so a frame decodes
//! straight into the right variant without a second parse pass, the same
//! pattern the bus-wide `Payload` enum uses elsewhere in this workspace.
//! Unknown `type` values fall through to [`Message::Unknown`] rather than
//! failing deserialization, so ingress can log-and-ignore per the schema's
//! forward-compatibility rule instead of closing the peer.

use crate::error::ErrorInfo;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Current wire protocol version. A `REGISTER` with any other value is
/// rejected with `PROTOCOL_VERSION_MISMATCH`.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Status values an instance reports for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Ready,
    Busy,
    Reloading,
    Disconnected,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One summary row as returned by `LIST_INSTANCES`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: String,
    pub project_name: String,
    pub agent_version: String,
    pub status: InstanceStatus,
    pub is_default: bool,
    pub capabilities: Vec<String>,
    pub queue_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Register {
        ts: i64,
        protocol_version: String,
        instance_id: String,
        project_name: String,
        unity_version: String,
        capabilities: Vec<String>,
    },
    Registered {
        ts: i64,
        success: bool,
        heartbeat_interval_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    Status {
        ts: i64,
        instance_id: String,
        status: InstanceStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    CommandResult {
        ts: i64,
        id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorInfo>,
    },
    Ping {
        ts: i64,
    },
    Pong {
        ts: i64,
        echo_ts: i64,
    },
    Command {
        ts: i64,
        id: String,
        command: String,
        params: Value,
        timeout_ms: u64,
    },
    Request {
        ts: i64,
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        instance: Option<String>,
        command: String,
        #[serde(default = "default_params")]
        params: Value,
        timeout_ms: u64,
    },
    ListInstances {
        ts: i64,
        id: String,
    },
    SetDefault {
        ts: i64,
        id: String,
        instance: String,
    },
    Response {
        ts: i64,
        id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Error {
        ts: i64,
        id: String,
        success: bool,
        error: ErrorInfo,
    },
    Instances {
        ts: i64,
        id: String,
        success: bool,
        data: InstancesData,
    },
    /// Catch-all for any `type` this version doesn't recognize. Ingress logs
    /// and drops these rather than rejecting the frame outright.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstancesData {
    pub instances: Vec<InstanceSummary>,
}

fn default_params() -> Value {
    Value::Object(Default::default())
}

impl Message {
    pub fn error(id: impl Into<String>, error: ErrorInfo) -> Self {
        Message::Error {
            ts: now_ms(),
            id: id.into(),
            success: false,
            error,
        }
    }

    pub fn response_ok(id: impl Into<String>, data: Option<Value>) -> Self {
        Message::Response {
            ts: now_ms(),
            id: id.into(),
            success: true,
            data,
        }
    }

    pub fn registered(success: bool, heartbeat_interval_ms: u64, error: Option<ErrorInfo>) -> Self {
        Message::Registered {
            ts: now_ms(),
            success,
            heartbeat_interval_ms,
            error,
        }
    }

    pub fn ping() -> Self {
        Message::Ping { ts: now_ms() }
    }
}

/// Generates a client-side request id, namespaced by an opaque client
/// identifier. Not used by the relay itself (the relay treats request ids as
/// opaque strings); kept here for client callers that want a collision-safe
/// default the way the original client tooling did.
pub fn generate_request_id(client_id: &str) -> String {
    format!("{client_id}-{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_roundtrips_through_json() {
        let msg = Message::Register {
            ts: 1,
            protocol_version: PROTOCOL_VERSION.to_string(),
            instance_id: "/p/A".into(),
            project_name: "A".into(),
            unity_version: "1.0".into(),
            capabilities: vec!["echo".into()],
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"REGISTER\""));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_type_does_not_fail_deserialization() {
        let json = r#"{"type":"SOMETHING_FUTURE","ts":1}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg, Message::Unknown);
    }

    #[test]
    fn missing_type_is_rejected() {
        let json = r#"{"ts":1}"#;
        assert!(serde_json::from_str::<Message>(json).is_err());
    }

    #[test]
    fn request_defaults_empty_params() {
        let json = r#"{"type":"REQUEST","ts":1,"id":"r1","command":"echo","timeout_ms":1000}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        match msg {
            Message::Request { params, .. } => assert_eq!(params, Value::Object(Default::default())),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
