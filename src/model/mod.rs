//! Data models for a remote rendering session
//!
//! This module contains the core data structures used throughout the crate
//! for the peer session, media tracks, data channel requests and responses,
//! and the events the relay propagates.

pub mod inbound;
pub mod payload;
pub mod propagated;
pub mod request;
pub mod session;
pub mod tracks;
