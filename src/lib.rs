//! Client-side bridge to a Pixel Streaming renderer.
//!
//! Negotiates a receive-only WebRTC session through a signaling server, relays
//! the incoming video and audio to registered [`Subsystem`]s, and carries user
//! input and JSON requests back over the data channel.
//!
//! [`Subsystem`]: subsystem::Subsystem

pub mod bridge;
pub mod codec;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod model;
pub mod relay;
pub mod router;
pub mod signaling;
pub mod subsystem;
pub mod util;

pub use bridge::{spawn_on_thread, BridgeHandle, SessionBridge};
pub use config::BridgeConfig;
pub use engine::RtcSession;
pub use error::{BridgeError, Result};
