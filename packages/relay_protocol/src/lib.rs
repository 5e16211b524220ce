//! Wire types shared by the MultiShock relay hub and its upstream feeds.
//!
//! Every boundary in the system exchanges the same JSON envelope
//! `{"cmd": <string>, "value": <any>}`. This crate owns that envelope and
//! its codec, the recognized command names, and the Twitch EventSub message
//! shapes the event feed consumes.

mod envelope;
mod eventsub;

pub use envelope::{Envelope, ProtocolError, commands};
pub use eventsub::{EventSubMessage, MessageType, SUBSCRIPTION_KINDS};
