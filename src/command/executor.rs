//! Command executor - dispatches requests to their handlers

use super::handlers::{self, HandlerContext};
use super::{Request, NOT_UNDERSTOOD};
use gateway_shared::{RequestType, Target};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Result of command execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResult {
    /// Command completed successfully
    Completed { message: String },
    /// Command ran but the device or bridge reported a failure
    Failed { message: String },
    /// Command not understood for its target
    Rejected { message: String },
    /// Completed, and the queued requests behind it must be dropped
    Reset { message: String },
    /// The handler already wrote the origin's response
    Answered,
}

/// What the sequencer must do after a request finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowUp {
    None,
    DrainQueue,
}

/// A handled request and its queue follow-up
#[derive(Debug)]
pub struct Dispatched {
    pub request: Request,
    pub follow_up: FollowUp,
}

/// Runs requests against the device, the mesh bridge and the peers
#[derive(Clone)]
pub struct CommandExecutor {
    ctx: Arc<HandlerContext>,
}

impl CommandExecutor {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &HandlerContext {
        &self.ctx
    }

    /// Execute a request and fill in its outcome
    ///
    /// The response is not written here; the caller answers the origin.
    pub async fn execute(&self, mut request: Request) -> Dispatched {
        let started = Instant::now();
        let ctx = self.ctx.as_ref();

        debug!(
            "[CMD] Executing msg={} comm={} {}:{}:{}",
            request.msg_id, request.comm_id, request.target, request.kind, request.command
        );

        let result = match (request.target, request.kind) {
            (Target::Client, _) => handlers::handle_client_notify(ctx, &request).await,
            (Target::Tello, RequestType::Async | RequestType::Broadcast) => {
                handlers::handle_device_async(ctx, &request).await
            }
            (Target::Tello, RequestType::Status) => handlers::handle_device_status(ctx, &request).await,
            (Target::Tello, RequestType::Sync) => handlers::handle_device_sync(ctx, &request).await,
            (Target::Tello, RequestType::Notify) => CommandResult::Rejected {
                message: NOT_UNDERSTOOD.into(),
            },
            (Target::Mesh, _) => handlers::handle_mesh(ctx, &request).await,
            (Target::Module, _) => handlers::handle_module(ctx, &request).await,
        };

        let elapsed = started.elapsed().as_millis();
        let mut follow_up = FollowUp::None;

        match result {
            CommandResult::Completed { message } => {
                debug!("[CMD] comm={} completed in {}ms: {}", request.comm_id, elapsed, message);
                request.result = true;
                request.message = message;
            }
            CommandResult::Failed { message } => {
                warn!("[CMD] comm={} failed after {}ms: {}", request.comm_id, elapsed, message);
                request.result = false;
                request.message = message;
            }
            CommandResult::Rejected { message } => {
                info!("[CMD] comm={} rejected: {}", request.comm_id, request.command);
                request.result = false;
                request.message = message;
            }
            CommandResult::Reset { message } => {
                request.result = true;
                request.message = message;
                follow_up = FollowUp::DrainQueue;
            }
            CommandResult::Answered => {
                request.result = true;
                request.message = request.command.clone();
                request.mark_answered();
            }
        }

        Dispatched { request, follow_up }
    }
}
