//! Gateway self-commands

use super::HandlerContext;
use crate::command::{CommandResult, Request, NOT_UNDERSTOOD};
use crate::device::{DeviceError, DeviceRecord};
use std::time::Duration;
use tracing::info;

/// Handle `connect`, `disconnect`, `isAlive`, `reset`, `addDevice`,
/// `popResponse` and `terminate`
pub async fn handle_module(ctx: &HandlerContext, request: &Request) -> CommandResult {
    let (verb, arg) = request.split_command();

    match verb {
        "connect" => match ctx.device.connect(arg).await {
            Ok(message) => CommandResult::Completed { message },
            Err(e) => CommandResult::Failed {
                message: e.to_string(),
            },
        },

        "disconnect" => {
            ctx.device.disconnect().await;
            CommandResult::Completed {
                message: "ok".into(),
            }
        }

        "isAlive" => CommandResult::Completed {
            message: ctx.device.state().await.to_string(),
        },

        "reset" => {
            info!("[CMD] Reset requested by peer {}", request.origin.id);
            CommandResult::Reset {
                message: "ok".into(),
            }
        }

        "addDevice" => add_device(ctx, arg).await,

        "popResponse" => {
            let wait = match arg {
                Some(ms) => match ms.parse::<u64>() {
                    Ok(ms) => Duration::from_millis(ms),
                    Err(_) => {
                        return CommandResult::Failed {
                            message: format!("invalid timeout {:?}", ms),
                        }
                    }
                },
                None => ctx.device.request_timeout(),
            };

            let interrupt = ctx.interrupt_for(request);
            match ctx.device.pop_response(wait, &interrupt).await {
                Some(reply) => CommandResult::Completed { message: reply },
                None => CommandResult::Failed {
                    message: DeviceError::ResponseTimeout.to_string(),
                },
            }
        }

        "terminate" => {
            info!("[CMD] Terminate requested by peer {}", request.origin.id);
            ctx.shutdown.notify_one();
            CommandResult::Completed {
                message: "OK".into(),
            }
        }

        _ => CommandResult::Rejected {
            message: NOT_UNDERSTOOD.into(),
        },
    }
}

async fn add_device(ctx: &HandlerContext, arg: Option<&str>) -> CommandResult {
    let Some(json) = arg else {
        return CommandResult::Failed {
            message: "addDevice needs a device record".into(),
        };
    };

    match serde_json::from_str::<DeviceRecord>(json) {
        Ok(record) => {
            let name = record.name.clone();
            let replaced = ctx.device.add_device(record).await;
            CommandResult::Completed {
                message: format!("device {} {}", name, if replaced { "replaced" } else { "added" }),
            }
        }
        Err(e) => CommandResult::Failed {
            message: format!("invalid device record: {}", e),
        },
    }
}
