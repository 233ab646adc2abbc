//! Device command handlers

use super::HandlerContext;
use crate::command::{CommandResult, Request};
use gateway_shared::RequestType;

/// Send and wait for the correlated reply
pub async fn handle_device_sync(ctx: &HandlerContext, request: &Request) -> CommandResult {
    let interrupt = ctx.interrupt_for(request);
    match ctx.device.exchange(&request.command, &interrupt).await {
        Ok(reply) => CommandResult::Completed { message: reply },
        Err(e) => CommandResult::Failed {
            message: e.to_string(),
        },
    }
}

/// Fire and forget
pub async fn handle_device_async(ctx: &HandlerContext, request: &Request) -> CommandResult {
    match ctx.device.send_async(&request.command).await {
        Ok(()) => CommandResult::Completed {
            message: match request.kind {
                RequestType::Broadcast => "broadcast as async".into(),
                _ => "send as async".into(),
            },
        },
        Err(e) => CommandResult::Failed {
            message: e.to_string(),
        },
    }
}

/// Answer a read command from the telemetry cache
pub async fn handle_device_status(ctx: &HandlerContext, request: &Request) -> CommandResult {
    let key = request.command.trim().trim_end_matches('?').trim();

    match ctx.device.telemetry(key).await {
        Some(value) => CommandResult::Completed {
            message: value.to_string(),
        },
        None => CommandResult::Failed {
            message: format!("no telemetry for {}", key),
        },
    }
}
