//! Error types for the bridge.
//!
//! Fatal variants end the session: transport loss, and a handshake the media
//! engine cannot complete. Bad candidates, undecodable payloads and sends
//! while disconnected are recovered where they happen, logged, and counted in
//! [`Diagnostics`](crate::diagnostics::Diagnostics).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur while bridging to the remote renderer.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The signaling endpoint could not be reached
    #[error("could not connect to signaling server at {address}: {source}")]
    Connection {
        address: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    /// The signaling socket closed or failed after it was established
    #[error("signaling channel closed: {0}")]
    SignalingClosed(String),

    /// Error writing to the signaling socket
    #[error("signaling send failed: {0}")]
    SignalingSend(#[from] tokio_tungstenite::tungstenite::Error),

    /// The media engine lost its transport
    #[error("transport lost: {0}")]
    TransportLost(String),

    /// Error reported by the media engine
    #[error("peer session error: {0}")]
    Session(String),

    /// The remote description was rejected
    #[error("invalid session description: {0}")]
    Sdp(String),

    /// A remote ICE candidate line could not be parsed
    #[error("invalid ICE candidate '{line}': {reason}")]
    Candidate { line: String, reason: String },

    /// A data channel payload could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// The data channel did not open before the configured deadline
    #[error("data channel did not open within {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// The operation needs an open data channel
    #[error("not connected")]
    NotConnected,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// True for errors that end the whole session.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::Connection { .. }
                | BridgeError::SignalingClosed(_)
                | BridgeError::SignalingSend(_)
                | BridgeError::TransportLost(_)
                | BridgeError::Session(_)
                | BridgeError::Sdp(_)
                | BridgeError::ConnectTimeout(_)
                | BridgeError::Json(_)
                | BridgeError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_failures_are_fatal() {
        assert!(BridgeError::Sdp("bad answer".into()).is_fatal());
        assert!(BridgeError::Session("media engine stopped".into()).is_fatal());
        assert!(BridgeError::TransportLost("ice".into()).is_fatal());
    }

    #[test]
    fn recoverable_errors_are_not_fatal() {
        let candidate = BridgeError::Candidate {
            line: "candidate:1".into(),
            reason: "too few fields".into(),
        };
        assert!(!candidate.is_fatal());
        assert!(!BridgeError::Decode("garbage".into()).is_fatal());
        assert!(!BridgeError::NotConnected.is_fatal());
    }
}
