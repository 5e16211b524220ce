//! The out-of-core Twitch HTTP surface: credential validation, channel
//! resolution, and EventSub subscription creation.

mod api;

pub use api::{Channel, HelixClient, TokenStatus};
