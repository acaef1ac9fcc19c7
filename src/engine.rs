//! str0m backed media engine.
//!
//! [`RtcSession`] owns a sans-IO [`Rtc`] instance and a UDP socket, and runs
//! them on a driver task. The bridge talks to the driver through a command
//! queue and hears back through [`TransportEvent`]s.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use str0m::{
    change::{SdpAnswer, SdpPendingOffer},
    channel::ChannelId,
    media::{Direction, KeyframeRequestKind, MediaData, Mid},
    net::{Protocol, Receive},
    Candidate, Event, IceConnectionState, Input, Output, Rtc,
};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};
use crate::model::session::{
    IceCandidate, PeerSession, SdpType, SessionDescription, TransportEvent,
};
use crate::model::tracks::{FrameSender, MediaFrame, MediaKind, MediaStream};
use crate::util::select_host_address;

/// Minimum spacing between keyframe requests for one track.
const KEYFRAME_REQUEST_INTERVAL: Duration = Duration::from_secs(1);

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    CreateOffer {
        media: Vec<MediaKind>,
        label: String,
        reply: Reply<SessionDescription>,
    },
    SetAnswer {
        sdp: String,
        reply: Reply<()>,
    },
    AddCandidate {
        line: String,
        reply: Reply<()>,
    },
    Send(Vec<u8>),
    CloseChannel {
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// A [`PeerSession`] on top of str0m.
pub struct RtcSession {
    local_addr: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    driver: JoinHandle<()>,
}

impl RtcSession {
    /// Binds on the first routable host interface.
    pub async fn bind() -> Result<Self> {
        let host = select_host_address()?;
        Self::bind_to(host).await
    }

    /// Binds a random UDP port on `host` and starts the driver task.
    pub async fn bind_to(host: IpAddr) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(host, 0)).await?;
        let local_addr = socket.local_addr()?;
        info!("Bound UDP port: {}", local_addr);

        let mut rtc = Rtc::builder().build();
        let candidate = Candidate::host(local_addr, "udp").map_err(|e| BridgeError::Candidate {
            line: local_addr.to_string(),
            reason: e.to_string(),
        })?;
        rtc.add_local_candidate(candidate);

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();

        let driver = Driver {
            rtc,
            socket,
            local_addr,
            events: event_tx,
            channel: None,
            pending: None,
            tracks: HashMap::new(),
            failed: false,
        };

        Ok(RtcSession {
            local_addr,
            commands,
            events: Some(events),
            driver: tokio::spawn(driver.run(command_rx)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for RtcSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

fn engine_stopped() -> BridgeError {
    BridgeError::Session("media engine stopped".into())
}

async fn call<T>(
    commands: &mpsc::UnboundedSender<Command>,
    make: impl FnOnce(Reply<T>) -> Command,
) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    commands.send(make(tx)).map_err(|_| engine_stopped())?;
    rx.await.map_err(|_| engine_stopped())?
}

#[async_trait]
impl PeerSession for RtcSession {
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events.take()
    }

    async fn create_offer(
        &mut self,
        media: &[MediaKind],
        channel_label: &str,
    ) -> Result<SessionDescription> {
        let media = media.to_vec();
        let label = channel_label.to_string();
        call(&self.commands, |reply| Command::CreateOffer {
            media,
            label,
            reply,
        })
        .await
    }

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<()> {
        if desc.sdp_type != SdpType::Answer {
            return Err(BridgeError::Sdp("expected an answer".into()));
        }
        call(&self.commands, |reply| Command::SetAnswer {
            sdp: desc.sdp,
            reply,
        })
        .await
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()> {
        let line = candidate.to_sdp_line();
        call(&self.commands, |reply| Command::AddCandidate { line, reply }).await
    }

    fn send_data(&mut self, data: &[u8]) -> Result<()> {
        self.commands
            .send(Command::Send(data.to_vec()))
            .map_err(|_| engine_stopped())
    }

    async fn close_data_channel(&mut self) -> Result<()> {
        call(&self.commands, |reply| Command::CloseChannel { reply }).await
    }

    async fn close(&mut self) -> Result<()> {
        if self.driver.is_finished() {
            return Ok(());
        }
        match call(&self.commands, |reply| Command::Close { reply }).await {
            Err(BridgeError::Session(_)) => Ok(()),
            other => other,
        }
    }
}

struct TrackIn {
    frames: FrameSender,
    kind: MediaKind,
    last_keyframe_request: Option<Instant>,
}

struct Driver {
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    events: mpsc::UnboundedSender<TransportEvent>,
    channel: Option<ChannelId>,
    pending: Option<SdpPendingOffer>,
    tracks: HashMap<Mid, TrackIn>,
    failed: bool,
}

impl Driver {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut buf = vec![0; 2000];

        loop {
            let Some(timeout) = self.poll_until_timeout() else {
                break;
            };
            let sleep = tokio::time::sleep_until(tokio::time::Instant::from_std(timeout));

            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("Session handle dropped, stopping driver");
                        self.rtc.disconnect();
                        break;
                    };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, source)) => self.handle_datagram(&buf[..n], source),
                        Err(e) => {
                            self.fail(format!("UDP socket read failed: {}", e));
                            break;
                        }
                    }
                }
                _ = sleep => self.handle_input(Input::Timeout(Instant::now())),
            }
        }

        debug!("Media engine driver stopped");
    }

    fn handle_datagram(&mut self, data: &[u8], source: SocketAddr) {
        // Parses the datagram far enough to demultiplex STUN, DTLS and RTP.
        let Ok(contents) = data.try_into() else {
            debug!("Ignoring unrecognised datagram from {}", source);
            return;
        };

        self.handle_input(Input::Receive(
            Instant::now(),
            Receive {
                proto: Protocol::Udp,
                source,
                destination: self.local_addr,
                contents,
            },
        ));
    }

    fn handle_input(&mut self, input: Input) {
        if !self.rtc.is_alive() {
            return;
        }

        if let Err(e) = self.rtc.handle_input(input) {
            warn!("Media engine rejected input: {:?}", e);
            self.rtc.disconnect();
            self.fail(e.to_string());
        }
    }

    /// Drains output until str0m asks to be woken at a deadline. `None` once
    /// the session is dead.
    fn poll_until_timeout(&mut self) -> Option<Instant> {
        loop {
            if !self.rtc.is_alive() {
                self.fail("peer connection closed".into());
                return None;
            }

            match self.rtc.poll_output() {
                Ok(Output::Timeout(t)) => return Some(t),
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = self
                        .socket
                        .try_send_to(&transmit.contents, transmit.destination)
                    {
                        debug!("Dropped datagram to {}: {}", transmit.destination, e);
                    }
                }
                Ok(Output::Event(event)) => self.handle_event(event),
                Err(e) => {
                    warn!("poll_output failed: {:?}", e);
                    self.rtc.disconnect();
                    self.fail(e.to_string());
                    return None;
                }
            }
        }
    }

    /// Reports the transport as lost, once.
    fn fail(&mut self, reason: String) {
        if !self.failed {
            self.failed = true;
            let _ = self.events.send(TransportEvent::Disconnected(reason));
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!("ICE state: {:?}", state);
                if state == IceConnectionState::Disconnected {
                    self.rtc.disconnect();
                    self.fail("ICE disconnected".into());
                }
            }
            Event::ChannelOpen(id, label) => {
                if Some(id) == self.channel {
                    let _ = self.events.send(TransportEvent::ChannelOpen { label });
                } else {
                    debug!("Ignoring channel '{}' ({:?})", label, id);
                }
            }
            Event::ChannelData(data) => {
                if Some(data.id) == self.channel {
                    let _ = self.events.send(TransportEvent::ChannelData(data.data));
                }
            }
            Event::ChannelClose(id) => {
                if Some(id) == self.channel {
                    self.channel = None;
                    let _ = self.events.send(TransportEvent::ChannelClosed);
                }
            }
            Event::MediaAdded(added) => {
                let kind = MediaKind::from(added.kind);
                let (frames, stream) = MediaStream::channel(added.mid.to_string(), kind);
                self.tracks.insert(
                    added.mid,
                    TrackIn {
                        frames,
                        kind,
                        last_keyframe_request: None,
                    },
                );
                let _ = self.events.send(TransportEvent::Track(stream));
            }
            Event::MediaData(data) => self.handle_media_data(data),
            _ => {}
        }
    }

    fn handle_media_data(&mut self, data: MediaData) {
        if !data.contiguous {
            self.request_keyframe_throttled(data.mid);
        }

        let Some(track) = self.tracks.get(&data.mid) else {
            return;
        };

        let frame = MediaFrame {
            kind: track.kind,
            stream_id: data.mid.to_string(),
            media_time: data.time.numer(),
            data: data.data,
        };

        match track.frames.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Consumer behind on track {}, dropping frame", data.mid);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Track {} no longer consumed", data.mid);
                self.tracks.remove(&data.mid);
            }
        }
    }

    fn request_keyframe_throttled(&mut self, mid: Mid) {
        let Some(track) = self.tracks.get_mut(&mid) else {
            return;
        };
        if track.kind != MediaKind::Video {
            return;
        }
        if track
            .last_keyframe_request
            .is_some_and(|t| t.elapsed() < KEYFRAME_REQUEST_INTERVAL)
        {
            return;
        }

        let Some(mut writer) = self.rtc.writer(mid) else {
            return;
        };
        _ = writer.request_keyframe(None, KeyframeRequestKind::Fir);
        track.last_keyframe_request = Some(Instant::now());
    }

    /// Returns false once the driver should stop.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::CreateOffer {
                media,
                label,
                reply,
            } => {
                let _ = reply.send(self.create_offer(&media, label));
            }
            Command::SetAnswer { sdp, reply } => {
                let _ = reply.send(self.accept_answer(&sdp));
            }
            Command::AddCandidate { line, reply } => {
                let _ = reply.send(self.add_candidate(line));
            }
            Command::Send(data) => self.write_channel(&data),
            Command::CloseChannel { reply } => {
                if let Some(id) = self.channel.take() {
                    self.rtc.direct_api().close_data_channel(id);
                }
                let _ = reply.send(Ok(()));
            }
            Command::Close { reply } => {
                self.rtc.disconnect();
                self.failed = true;
                let _ = reply.send(Ok(()));
                return false;
            }
        }
        true
    }

    fn create_offer(&mut self, media: &[MediaKind], label: String) -> Result<SessionDescription> {
        let mut change = self.rtc.sdp_api();
        for kind in media {
            change.add_media((*kind).into(), Direction::RecvOnly, None, None, None);
        }
        let id = change.add_channel(label);

        let (offer, pending) = change
            .apply()
            .ok_or_else(|| BridgeError::Session("nothing to offer".into()))?;

        self.channel = Some(id);
        self.pending = Some(pending);

        Ok(SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: offer.to_sdp_string(),
        })
    }

    fn accept_answer(&mut self, sdp: &str) -> Result<()> {
        let answer = SdpAnswer::from_sdp_string(sdp).map_err(|e| BridgeError::Sdp(e.to_string()))?;
        let pending = self
            .pending
            .take()
            .ok_or_else(|| BridgeError::Sdp("no offer is pending".into()))?;

        self.rtc
            .sdp_api()
            .accept_answer(pending, answer)
            .map_err(|e| BridgeError::Sdp(e.to_string()))
    }

    fn add_candidate(&mut self, line: String) -> Result<()> {
        let candidate = Candidate::from_sdp_string(&line).map_err(|e| BridgeError::Candidate {
            reason: e.to_string(),
            line,
        })?;
        self.rtc.add_remote_candidate(candidate);
        Ok(())
    }

    fn write_channel(&mut self, data: &[u8]) {
        let Some(mut channel) = self.channel.and_then(|id| self.rtc.channel(id)) else {
            debug!("No open data channel, dropping {} bytes", data.len());
            return;
        };
        if let Err(e) = channel.write(true, data) {
            warn!("Data channel write failed: {:?}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    async fn local_session() -> RtcSession {
        RtcSession::bind_to(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn offer_has_recvonly_media_and_data_channel() {
        let mut session = local_session().await;
        let offer = session
            .create_offer(&[MediaKind::Audio, MediaKind::Video], "cirrus")
            .await
            .unwrap();

        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("m=application"));
        assert!(offer.sdp.contains("a=recvonly"));

        assert!(session.take_events().is_some());
        assert!(session.take_events().is_none());
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_answer_is_rejected_and_offer_kept() {
        let mut session = local_session().await;
        session.create_offer(&[MediaKind::Video], "cirrus").await.unwrap();

        let err = session
            .set_remote_description(SessionDescription {
                sdp_type: SdpType::Answer,
                sdp: "not sdp".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Sdp(_)));

        let err = session
            .set_remote_description(SessionDescription {
                sdp_type: SdpType::Offer,
                sdp: "v=0".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Sdp(_)));
    }

    #[tokio::test]
    async fn remote_candidates_are_accepted() {
        let mut session = local_session().await;
        session.create_offer(&[MediaKind::Video], "cirrus").await.unwrap();

        let candidate = IceCandidate::parse(
            "candidate:1 1 udp 2122260223 127.0.0.1 40000 typ host",
            Some("0".into()),
            Some(0),
        )
        .unwrap();
        session.add_ice_candidate(&candidate).await.unwrap();
    }

    #[tokio::test]
    async fn closed_session_refuses_data() {
        let mut session = local_session().await;
        session.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(session.send_data(&[60, 65, 0]).is_err());
        session.close().await.unwrap();
    }
}
