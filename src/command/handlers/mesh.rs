//! Mesh bridge commands
//!
//! `start [port]`, `restart [port]`, `connect [host:port]` and `terminate`
//! control the bridge; any other text is broadcast to the mesh.

use super::HandlerContext;
use crate::command::{CommandResult, Request};
use tracing::info;

pub async fn handle_mesh(ctx: &HandlerContext, request: &Request) -> CommandResult {
    let (verb, arg) = request.split_command();

    match verb {
        "start" | "restart" => {
            let port = match arg.map(str::parse::<u16>).transpose() {
                Ok(port) => port,
                Err(_) => {
                    return CommandResult::Failed {
                        message: format!("invalid port {:?}", arg.unwrap_or_default()),
                    }
                }
            };

            match ctx.mesh.start(port, verb == "restart").await {
                Ok(addr) => {
                    info!("[MESH] Serving on {}", addr);
                    CommandResult::Completed {
                        message: format!("mesh listening on {}", addr),
                    }
                }
                Err(e) => CommandResult::Failed {
                    message: format!("{:#}", e),
                },
            }
        }
        "connect" => match ctx.mesh.connect(arg).await {
            Ok(remote) => CommandResult::Completed {
                message: format!("mesh connected to {}", remote),
            },
            Err(e) => CommandResult::Failed {
                message: format!("{:#}", e),
            },
        },
        "terminate" => {
            ctx.mesh.terminate().await;
            CommandResult::Completed {
                message: "OK".into(),
            }
        }
        _ => match ctx.mesh.broadcast(&request.command).await {
            Ok(()) => CommandResult::Completed {
                message: "ok".into(),
            },
            Err(e) => CommandResult::Failed {
                message: e.to_string(),
            },
        },
    }
}
