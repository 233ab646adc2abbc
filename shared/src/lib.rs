//! Drone Gateway Shared Protocol Types
//!
//! This crate provides the wire codecs and the link state machine used by
//! both the command repeater and the mesh broadcast server.

pub mod codec;
pub mod envelope;
pub mod state_machine;

pub use codec::{CodecError, FrameDecoder, MeshEvent, MeshMessageType};
pub use envelope::{ControlEnvelope, EnvelopeError, MeshPayload, RequestType, Response, Target};
pub use state_machine::{LinkEvent, LinkState, LinkStateMachine, TransitionResult};

/// Well-known ports and timing parameters of the device and mesh protocols
pub mod defaults {
    /// WebSocket control port the front end connects to
    pub const WEBSOCKET_PORT: u16 = 5963;

    /// Remote Sensors Protocol TCP port
    pub const MESH_PORT: u16 = 42001;

    /// Device UDP command port
    pub const DEVICE_COMMAND_PORT: u16 = 8889;

    /// Device UDP status (telemetry) port
    pub const DEVICE_TELEMETRY_PORT: u16 = 8890;

    /// Default device address when the device hosts its own access point
    pub const DEVICE_IP: &str = "192.168.10.1";

    /// Correlated response timeout in milliseconds
    pub const RESPONSE_TIMEOUT_MS: u64 = 10000;

    /// Socket bind timeout in milliseconds
    pub const BIND_TIMEOUT_MS: u64 = 5000;

    /// Handshake resends tolerated while the device drains a stale stream
    pub const HANDSHAKE_RETRIES: u32 = 5;

    /// Command that opens the device SDK session
    pub const HANDSHAKE_COMMAND: &str = "command";

    /// Literal acknowledgement of the handshake
    pub const HANDSHAKE_ACK: &str = "ok";

    /// commID carried by mesh-originated notifications
    pub const MESH_COMM_ID: i64 = -1;

    /// commID carried by client-targeted notify pushes
    pub const NOTIFY_COMM_ID: i64 = 0;

    /// Message returned to every request drained from the queue
    pub const REJECTED_MESSAGE: &str = "command rejected";
}
