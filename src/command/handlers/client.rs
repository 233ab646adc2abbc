//! Client-targeted notifications

use super::HandlerContext;
use crate::command::{CommandResult, Request};
use gateway_shared::{defaults, Response};
use tracing::debug;

/// Push the command text to every live peer as a notify
///
/// The origin's copy doubles as its response.
pub async fn handle_client_notify(ctx: &HandlerContext, request: &Request) -> CommandResult {
    let notice = Response::new(defaults::NOTIFY_COMM_ID, true, request.command.clone());

    let others = ctx
        .peers
        .broadcast_except(Some(request.origin.id), &notice)
        .await;
    request.origin.send(notice);

    debug!("[CMD] Client notify from peer {} reached {} others", request.origin.id, others);
    CommandResult::Answered
}
