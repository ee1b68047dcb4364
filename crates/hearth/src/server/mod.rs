//! WebSocket Server
//!
//! Client channel: intent submission, state snapshots and the live event
//! stream over one WebSocket per client.

mod handler;
mod protocol;
mod router;
mod state;

pub use handler::*;
pub use protocol::*;
pub use router::*;
pub use state::*;
