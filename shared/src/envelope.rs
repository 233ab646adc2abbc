//! WebSocket control envelope and JSON response
//!
//! Requests arrive as text frames:
//! ```text
//! {commID}:{target}:{type}:{command}
//! ```
//! Only the first three colons separate fields; everything after them,
//! colons included, is the command.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::codec::MeshEvent;
use crate::defaults;

/// Errors raised by a malformed control frame
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Expected 4 colon separated fields, got {0}")]
    TooFewSegments(usize),

    #[error("Invalid commID: {0:?}")]
    InvalidCommId(String),

    #[error("Unknown target: {0:?}")]
    UnknownTarget(String),

    #[error("Unknown request type: {0:?}")]
    UnknownType(String),
}

/// Who a request is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    /// The gateway itself
    Module,
    /// Other front-end peers
    Client,
    /// The UDP device
    Tello,
    /// The Remote Sensors Protocol mesh
    Mesh,
}

impl FromStr for Target {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "module" => Ok(Target::Module),
            "client" => Ok(Target::Client),
            "tello" => Ok(Target::Tello),
            "mesh" => Ok(Target::Mesh),
            other => Err(EnvelopeError::UnknownTarget(other.to_string())),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Target::Module => "module",
            Target::Client => "client",
            Target::Tello => "tello",
            Target::Mesh => "mesh",
        })
    }
}

/// How a request is scheduled and answered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Sync,
    Async,
    Status,
    Notify,
    Broadcast,
}

impl RequestType {
    /// Async and broadcast requests never wait behind the sync queue
    pub fn bypasses_queue(&self) -> bool {
        matches!(self, RequestType::Async | RequestType::Broadcast)
    }
}

impl FromStr for RequestType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(RequestType::Sync),
            "async" => Ok(RequestType::Async),
            "status" => Ok(RequestType::Status),
            "notify" => Ok(RequestType::Notify),
            "broadcast" => Ok(RequestType::Broadcast),
            other => Err(EnvelopeError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestType::Sync => "sync",
            RequestType::Async => "async",
            RequestType::Status => "status",
            RequestType::Notify => "notify",
            RequestType::Broadcast => "broadcast",
        })
    }
}

/// A decoded control frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEnvelope {
    pub comm_id: i64,
    pub target: Target,
    pub kind: RequestType,
    pub command: String,
}

impl ControlEnvelope {
    /// Decode a `{commID}:{target}:{type}:{command}` frame
    pub fn parse(text: &str) -> Result<Self, EnvelopeError> {
        let segments: Vec<&str> = text.splitn(4, ':').collect();
        if segments.len() < 4 {
            return Err(EnvelopeError::TooFewSegments(segments.len()));
        }

        let comm_id = segments[0]
            .trim()
            .parse::<i64>()
            .map_err(|_| EnvelopeError::InvalidCommId(segments[0].to_string()))?;
        let target = segments[1].trim().parse()?;
        let kind = segments[2].trim().parse()?;
        let command = segments[3].trim_end_matches(&['\r', '\n'][..]).to_string();

        Ok(Self {
            comm_id,
            target,
            kind,
            command,
        })
    }
}

impl fmt::Display for ControlEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.comm_id, self.target, self.kind, self.command)
    }
}

/// Key/value carried by mesh notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeshPayload {
    pub key: String,
    pub value: Option<String>,
}

/// JSON response written back to a WebSocket peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Response {
    #[serde(rename = "commID")]
    pub comm_id: i64,
    pub result: bool,
    pub message: String,
    #[serde(flatten)]
    pub mesh: Option<MeshPayload>,
}

impl Response {
    pub fn new(comm_id: i64, result: bool, message: impl Into<String>) -> Self {
        Self {
            comm_id,
            result,
            message: message.into(),
            mesh: None,
        }
    }

    /// Notification relayed from the mesh
    pub fn mesh(event: &MeshEvent) -> Self {
        Self {
            comm_id: defaults::MESH_COMM_ID,
            result: true,
            message: event.message_type.as_str().to_string(),
            mesh: Some(MeshPayload {
                key: event.key.clone(),
                value: event.value.clone(),
            }),
        }
    }

    /// Response for a request drained from the queue without running
    pub fn rejected(comm_id: i64) -> Self {
        Self::new(comm_id, false, defaults::REJECTED_MESSAGE)
    }

    /// Serialize to the JSON text sent over the socket
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MeshMessageType;

    #[test]
    fn test_parse_basic_frame() {
        let env = ControlEnvelope::parse("7:tello:sync:battery?").unwrap();
        assert_eq!(env.comm_id, 7);
        assert_eq!(env.target, Target::Tello);
        assert_eq!(env.kind, RequestType::Sync);
        assert_eq!(env.command, "battery?");
    }

    #[test]
    fn test_command_keeps_extra_colons() {
        let env = ControlEnvelope::parse(r#"3:module:sync:addDevice {"name":"a","ip":"10.0.0.1"}"#)
            .unwrap();
        assert_eq!(env.command, r#"addDevice {"name":"a","ip":"10.0.0.1"}"#);
        assert_eq!(env.to_string(), r#"3:module:sync:addDevice {"name":"a","ip":"10.0.0.1"}"#);
    }

    #[test]
    fn test_empty_command_is_allowed() {
        let env = ControlEnvelope::parse("1:module:sync:").unwrap();
        assert_eq!(env.command, "");
    }

    #[test]
    fn test_too_few_segments() {
        assert_eq!(
            ControlEnvelope::parse("1:tello:sync"),
            Err(EnvelopeError::TooFewSegments(3))
        );
    }

    #[test]
    fn test_unknown_fields() {
        assert!(matches!(
            ControlEnvelope::parse("1:robot:sync:go"),
            Err(EnvelopeError::UnknownTarget(_))
        ));
        assert!(matches!(
            ControlEnvelope::parse("1:tello:later:go"),
            Err(EnvelopeError::UnknownType(_))
        ));
        assert!(matches!(
            ControlEnvelope::parse("x:tello:sync:go"),
            Err(EnvelopeError::InvalidCommId(_))
        ));
    }

    #[test]
    fn test_bypass_classes() {
        assert!(RequestType::Async.bypasses_queue());
        assert!(RequestType::Broadcast.bypasses_queue());
        assert!(!RequestType::Sync.bypasses_queue());
        assert!(!RequestType::Status.bypasses_queue());
    }

    #[test]
    fn test_response_json() {
        let json = Response::new(7, true, "ok").to_json().unwrap();
        assert_eq!(json, r#"{"commID":7,"result":true,"message":"ok"}"#);
    }

    #[test]
    fn test_mesh_response_json() {
        let event = MeshEvent::new(2, MeshMessageType::Broadcast, "go", None);
        let value: serde_json::Value =
            serde_json::from_str(&Response::mesh(&event).to_json().unwrap()).unwrap();
        assert_eq!(value["commID"], -1);
        assert_eq!(value["message"], "broadcast");
        assert_eq!(value["key"], "go");
        assert!(value["value"].is_null());
    }
}
