//! WebSocket signaling client.
//!
//! Carries JSON envelopes between the bridge and the signaling server that
//! fronts the remote renderer.

use std::sync::Arc;

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::diagnostics::Diagnostics;
use crate::error::{BridgeError, Result};
use crate::model::session::{SdpType, SessionDescription};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The candidate object nested inside an `iceCandidate` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

/// Signaling message, tagged by its `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalEnvelope {
    #[serde(rename = "config")]
    Config {
        #[serde(
            rename = "peerConnectionOptions",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        peer_connection_options: Option<serde_json::Value>,
    },
    #[serde(rename = "playerCount")]
    PlayerCount {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        count: Option<u64>,
    },
    #[serde(rename = "offer")]
    Offer { sdp: String },
    #[serde(rename = "answer")]
    Answer { sdp: String },
    #[serde(rename = "iceCandidate")]
    IceCandidate { candidate: CandidateInit },
    /// Any other `type`; ignored by the handshake
    #[serde(other)]
    Unknown,
}

impl From<SessionDescription> for SignalEnvelope {
    fn from(desc: SessionDescription) -> Self {
        match desc.sdp_type {
            SdpType::Offer => SignalEnvelope::Offer { sdp: desc.sdp },
            SdpType::Answer => SignalEnvelope::Answer { sdp: desc.sdp },
        }
    }
}

/// Normalises a signaling address to a WebSocket URL.
pub fn signaling_url(address: &str) -> String {
    if address.starts_with("ws://") || address.starts_with("wss://") {
        address.to_string()
    } else {
        format!("ws://{}", address)
    }
}

/// One persistent full-duplex connection to the signaling server.
pub struct SignalingClient {
    url: String,
    sink: SplitSink<WsStream, Message>,
    stream: SplitStream<WsStream>,
    diagnostics: Arc<Diagnostics>,
}

impl SignalingClient {
    /// Opens the socket. An unreachable endpoint is a connection error.
    pub async fn connect(address: &str, diagnostics: Arc<Diagnostics>) -> Result<Self> {
        let url = signaling_url(address);
        info!("Connecting to signaling server: {}", url);

        let (ws, _) = connect_async(url.as_str())
            .await
            .map_err(|source| BridgeError::Connection {
                address: url.clone(),
                source,
            })?;
        let (sink, stream) = ws.split();
        info!("Connected to signaling server");

        Ok(SignalingClient {
            url,
            sink,
            stream,
            diagnostics,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn send(&mut self, envelope: &SignalEnvelope) -> Result<()> {
        let text = serde_json::to_string(envelope)?;
        debug!("Signaling out: {}", text);
        self.sink.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Waits for the next well-formed envelope.
    ///
    /// Malformed payloads are logged and skipped. An error means the socket
    /// is gone and the session with it. Cancel safe.
    pub async fn recv(&mut self) -> Result<SignalEnvelope> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(BridgeError::SignalingClosed(e.to_string())),
                None => return Err(BridgeError::SignalingClosed("stream ended".into())),
            };

            let text = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping non-UTF-8 signaling message: {}", e);
                        self.diagnostics.malformed_signaling();
                        continue;
                    }
                },
                Message::Close(frame) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "closed by peer".into());
                    return Err(BridgeError::SignalingClosed(reason));
                }
                _ => continue,
            };

            match serde_json::from_str::<SignalEnvelope>(&text) {
                Ok(envelope) => {
                    debug!("Signaling in: {}", text);
                    return Ok(envelope);
                }
                Err(e) => {
                    warn!("Failed to parse signaling message: {} ({})", e, text);
                    self.diagnostics.malformed_signaling();
                }
            }
        }
    }

    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await?;
        Ok(())
    }
}
