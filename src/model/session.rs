//! Peer session state and the seam to the media engine.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{BridgeError, Result};
use crate::model::tracks::{MediaKind, MediaStream};

/// Handshake state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Idle,
    SignalingOpen,
    OfferSent,
    Answered,
    DataChannelOpen,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An offer or answer as exchanged over signaling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

const CANDIDATE_PREFIX: &str = "candidate:";
const CANDIDATE_FIELDS: usize = 8;

/// A remote ICE candidate, parsed positionally from its `candidate:` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    pub component: u16,
    pub protocol: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub kind: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Parses a whitespace-delimited candidate line.
    ///
    /// Fields: foundation (after `candidate:`), component, protocol, priority,
    /// ip, port, `typ`, type. Trailing extension fields are ignored.
    pub fn parse(
        line: &str,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    ) -> Result<Self> {
        let err = |reason: String| BridgeError::Candidate {
            line: line.to_string(),
            reason,
        };

        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < CANDIDATE_FIELDS {
            return Err(err(format!(
                "expected at least {} fields, found {}",
                CANDIDATE_FIELDS,
                parts.len()
            )));
        }

        let first = parts[0].strip_prefix("a=").unwrap_or(parts[0]);
        let foundation = first
            .strip_prefix(CANDIDATE_PREFIX)
            .ok_or_else(|| err(format!("missing '{}' prefix", CANDIDATE_PREFIX)))?;

        let component = parts[1]
            .parse()
            .map_err(|e| err(format!("component: {}", e)))?;
        let priority = parts[3]
            .parse()
            .map_err(|e| err(format!("priority: {}", e)))?;
        let port = parts[5]
            .parse()
            .map_err(|e| err(format!("port: {}", e)))?;

        Ok(IceCandidate {
            foundation: foundation.to_string(),
            component,
            protocol: parts[2].to_string(),
            priority,
            ip: parts[4].to_string(),
            port,
            kind: parts[7].to_string(),
            sdp_mid,
            sdp_mline_index,
        })
    }

    /// Renders the candidate back into a canonical SDP attribute value.
    pub fn to_sdp_line(&self) -> String {
        format!(
            "{}{} {} {} {} {} {} typ {}",
            CANDIDATE_PREFIX,
            self.foundation,
            self.component,
            self.protocol,
            self.priority,
            self.ip,
            self.port,
            self.kind
        )
    }
}

/// Events the media engine raises towards the bridge.
#[derive(Debug)]
pub enum TransportEvent {
    /// The data channel finished opening.
    ChannelOpen { label: String },
    /// A payload arrived on the data channel.
    ChannelData(Vec<u8>),
    /// The data channel closed.
    ChannelClosed,
    /// A remote media track became available.
    Track(MediaStream),
    /// The transport is gone.
    Disconnected(String),
}

/// The media engine as seen by the bridge.
///
/// Implementations own ICE, DTLS/SRTP and RTP. The bridge feeds them
/// descriptions and candidates and reads [`TransportEvent`]s back.
#[async_trait]
pub trait PeerSession: Send {
    /// Hands over the transport event stream. Returns `None` once taken.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    /// Adds receive-only transceivers for `media`, creates the data channel
    /// and returns the local offer.
    async fn create_offer(
        &mut self,
        media: &[MediaKind],
        channel_label: &str,
    ) -> Result<SessionDescription>;

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()>;

    /// Writes one binary message on the data channel.
    fn send_data(&mut self, data: &[u8]) -> Result<()>;

    async fn close_data_channel(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// A peer session handle plus the data channel bookkeeping around it.
pub struct Session<P> {
    pub peer: P,
    pub data_channel: Option<String>,
    pub data_channel_open: bool,
}

impl<P: PeerSession> Session<P> {
    pub fn new(peer: P) -> Self {
        Session {
            peer,
            data_channel: None,
            data_channel_open: false,
        }
    }
}
