//! A control request in flight through the gateway

use crate::connection::PeerHandle;
use gateway_shared::{defaults, ControlEnvelope, RequestType, Response, Target};

/// One accepted control frame and the outcome written back to its origin
#[derive(Debug, Clone)]
pub struct Request {
    /// Gateway-assigned, monotonic
    pub msg_id: u64,
    /// Client-assigned, echoed verbatim
    pub comm_id: i64,
    pub target: Target,
    pub kind: RequestType,
    pub command: String,
    pub result: bool,
    pub message: String,
    pub origin: PeerHandle,
    answered: bool,
}

impl Request {
    pub fn new(msg_id: u64, envelope: ControlEnvelope, origin: PeerHandle) -> Self {
        Self {
            msg_id,
            comm_id: envelope.comm_id,
            target: envelope.target,
            kind: envelope.kind,
            command: envelope.command,
            result: false,
            message: String::new(),
            origin,
            answered: false,
        }
    }

    /// Client pushes and async types skip the sync queue
    pub fn bypasses_queue(&self) -> bool {
        self.kind.bypasses_queue() || self.target == Target::Client
    }

    /// First word of the command and the trimmed remainder, if any
    pub fn split_command(&self) -> (&str, Option<&str>) {
        let command = self.command.trim();
        match command.split_once(char::is_whitespace) {
            Some((verb, rest)) => {
                let rest = rest.trim();
                (verb, (!rest.is_empty()).then_some(rest))
            }
            None => (command, None),
        }
    }

    pub fn response(&self) -> Response {
        Response::new(self.comm_id, self.result, self.message.clone())
    }

    pub fn reject(&mut self) {
        self.result = false;
        self.message = defaults::REJECTED_MESSAGE.to_string();
    }

    /// Record that the origin already got its one response
    pub fn mark_answered(&mut self) {
        self.answered = true;
    }

    /// Write the response to the origin, at most once
    ///
    /// Returns false when already answered or the origin is gone.
    pub fn respond(&mut self) -> bool {
        if self.answered {
            return false;
        }
        self.answered = true;
        self.origin.send(self.response())
    }
}
