//! Control request handling
//!
//! This module handles:
//! - Turning decoded control frames into requests
//! - Sequencing them (one queued request in flight, async ones alongside)
//! - Dispatching to the per-target handlers
//! - Writing exactly one response back to the origin

mod executor;
pub mod handlers;
mod request;
mod sequencer;

pub use executor::{CommandExecutor, CommandResult};
pub use handlers::HandlerContext;
pub use request::Request;
pub use sequencer::{spawn as spawn_sequencer, SequencerHandle};

/// Reply to commands a target does not know
pub const NOT_UNDERSTOOD: &str = "not understand";
