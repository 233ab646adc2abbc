//! Mesh broadcast server speaking the Remote Sensors Protocol
//!
//! Used standalone through the `mesh-server` binary, and embedded by the
//! gateway when the `mesh:sync:start` command is issued.

mod server;
pub mod session;

pub use server::MeshServer;
pub use session::{MeshSession, PeerHandle, PeerManager};
