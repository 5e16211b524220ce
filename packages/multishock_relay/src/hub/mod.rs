//! The local broker: downstream WebSocket connections, the identity
//! registry, and envelope routing between consumers and the feed
//! supervisor.

mod handler;
mod registry;


pub use handler::ws_handler;
pub use registry::{ConnectionId, Hub};

/// Identity label the Twitch-facing consumer registers under. Credential
/// updates are routed to whichever connection holds this label.
pub const TWITCH_LABEL: &str = "Twitch";
