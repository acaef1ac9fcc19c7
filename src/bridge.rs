//! The session bridge.
//!
//! Drives the whole lifecycle of one remote rendering session: signaling
//! handshake, media engine events, frame fan-out and the two outbound queues
//! (input events and data requests). Everything runs on one loop so the
//! router and the subsystems are never touched concurrently. Other threads
//! talk to it through a [`BridgeHandle`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::codec::{self, InputEvent, MouseButton};
use crate::config::BridgeConfig;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::error::{BridgeError, Result};
use crate::model::{
    inbound::{DecoderRegistry, InboundMessage},
    propagated::Propagated,
    request::OutboundRequest,
    session::{
        IceCandidate, PeerSession, SdpType, Session, SessionDescription, SessionState,
        TransportEvent,
    },
};
use crate::relay::FrameRelay;
use crate::router::{MessageRouter, ResponseCallback};
use crate::signaling::{CandidateInit, SignalEnvelope, SignalingClient};
use crate::subsystem::{Subsystem, SubsystemRegistry};

/// Upper bound on each best-effort close step during shutdown.
const SHUTDOWN_STEP_TIMEOUT: Duration = Duration::from_secs(2);

/// A data request waiting in the outbound queue.
struct DataRequest {
    request: OutboundRequest,
    callback: Option<ResponseCallback>,
}

/// State shared between the bridge loop and its handles.
struct Shared {
    connected: AtomicBool,
    stopped: AtomicBool,
    wake: Notify,
    poll_interval: Duration,
    diagnostics: Arc<Diagnostics>,
}

/// Cheap, cloneable access to a running bridge from any thread.
#[derive(Clone)]
pub struct BridgeHandle {
    shared: Arc<Shared>,
    input_tx: mpsc::UnboundedSender<InputEvent>,
    data_tx: mpsc::UnboundedSender<DataRequest>,
}

impl BridgeHandle {
    /// True while the data channel is open.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Queues a key press or release by key name. Unknown names are dropped.
    pub fn send_key(&self, key: &str, down: bool) {
        match codec::key_code(key) {
            Some(code) => self.send_input(InputEvent::Key { code, down }),
            None => {
                debug!("Unknown key '{}', dropping", key);
                self.shared.diagnostics.unknown_input();
            }
        }
    }

    /// Queues a mouse button event at `(x, y)`, in viewport percent.
    pub fn send_mouse_button(&self, button: &str, down: bool, x: f64, y: f64) {
        match MouseButton::from_name(button) {
            Some(button) => self.send_input(InputEvent::MouseButton { button, x, y, down }),
            None => {
                debug!("Unknown mouse button '{}', dropping", button);
                self.shared.diagnostics.unknown_input();
            }
        }
    }

    /// Queues a mouse move. Positions and deltas are in viewport percent.
    pub fn send_mouse_move(&self, x: f64, dx: f64, y: f64, dy: f64) {
        self.send_input(InputEvent::MouseMove { x, y, dx, dy });
    }

    pub fn send_input(&self, event: InputEvent) {
        if !self.is_connected() {
            debug!("Not connected, dropping input {:?}", event);
            return;
        }
        if self.input_tx.send(event).is_ok() {
            self.shared.wake.notify_one();
        }
    }

    /// Queues a data request. The callback, if any, runs on the bridge loop
    /// with the decoded response.
    pub fn send_data(&self, request: OutboundRequest, callback: Option<ResponseCallback>) {
        if !self.is_connected() {
            debug!("Not connected, dropping {} request", request.data_type());
            return;
        }
        if self.data_tx.send(DataRequest { request, callback }).is_ok() {
            self.shared.wake.notify_one();
        }
    }

    /// [`send_data`](Self::send_data) with a closure callback.
    pub fn request<F>(&self, request: OutboundRequest, callback: F)
    where
        F: FnOnce(InboundMessage) + Send + 'static,
    {
        self.send_data(request, Some(Box::new(callback)));
    }

    /// Waits until the data channel opens.
    ///
    /// Fails with [`BridgeError::ConnectTimeout`] once `timeout` elapses, or
    /// with [`BridgeError::NotConnected`] if the bridge stops first.
    pub async fn wait_connected(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.is_connected() {
                return Ok(());
            }
            if self.is_stopped() {
                return Err(BridgeError::NotConnected);
            }
            if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
                if Instant::now() >= deadline {
                    return Err(BridgeError::ConnectTimeout(timeout));
                }
            }
            tokio::time::sleep(self.shared.poll_interval).await;
        }
    }

    /// Blocking form of [`wait_connected`](Self::wait_connected) for callers
    /// outside any runtime.
    pub fn wait_connected_blocking(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| std::time::Instant::now() + t);
        loop {
            if self.is_connected() {
                return Ok(());
            }
            if self.is_stopped() {
                return Err(BridgeError::NotConnected);
            }
            if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
                if std::time::Instant::now() >= deadline {
                    return Err(BridgeError::ConnectTimeout(timeout));
                }
            }
            thread::sleep(self.shared.poll_interval);
        }
    }

    /// Asks the bridge to shut down. Idempotent.
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::SeqCst) {
            info!("Stop requested");
        }
        self.shared.wake.notify_one();
    }

    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }
}

/// One session with a remote renderer over peer session `P`.
pub struct SessionBridge<P: PeerSession> {
    config: BridgeConfig,
    state: SessionState,
    session: Session<P>,
    router: MessageRouter,
    relay: FrameRelay,
    relay_rx: mpsc::Receiver<Propagated>,
    subsystems: SubsystemRegistry,
    handle: BridgeHandle,
    input_rx: mpsc::UnboundedReceiver<InputEvent>,
    data_rx: mpsc::UnboundedReceiver<DataRequest>,
    transport_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    /// Label of a data channel that opened before the answer was applied.
    early_open: Option<String>,
}

impl<P: PeerSession> SessionBridge<P> {
    pub fn new(config: BridgeConfig, peer: P) -> Self {
        Self::with_decoders(config, peer, DecoderRegistry::default())
    }

    pub fn with_decoders(config: BridgeConfig, peer: P, decoders: DecoderRegistry) -> Self {
        let diagnostics = Arc::new(Diagnostics::default());
        let (relay, relay_rx) = FrameRelay::new(diagnostics.clone());
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
            poll_interval: config.connect_poll_interval,
            diagnostics: diagnostics.clone(),
        });

        SessionBridge {
            config,
            state: SessionState::Idle,
            session: Session::new(peer),
            router: MessageRouter::new(decoders, diagnostics),
            relay,
            relay_rx,
            subsystems: SubsystemRegistry::new(),
            handle: BridgeHandle {
                shared,
                input_tx,
                data_tx,
            },
            input_rx,
            data_rx,
            transport_rx: None,
            early_open: None,
        }
    }

    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Initializes a subsystem with a handle to this bridge and registers it.
    pub fn add_subsystem(&mut self, mut subsystem: Box<dyn Subsystem>) {
        subsystem.initialize(self.handle());
        self.subsystems.register(subsystem);
    }

    pub fn add_subsystems(&mut self, subsystems: impl IntoIterator<Item = Box<dyn Subsystem>>) {
        for s in subsystems {
            self.add_subsystem(s);
        }
    }

    /// Connects to the signaling server and runs the session until it is
    /// stopped or a transport-fatal error occurs.
    pub async fn run(&mut self) -> Result<()> {
        let diagnostics = self.handle.shared.diagnostics.clone();
        match SignalingClient::connect(&self.config.address, diagnostics).await {
            Ok(signaling) => self.run_with(signaling).await,
            Err(e) => {
                error!("{}", e);
                self.shutdown(None).await;
                Err(e)
            }
        }
    }

    /// Runs the session over an already connected signaling client.
    pub async fn run_with(&mut self, mut signaling: SignalingClient) -> Result<()> {
        self.state = SessionState::SignalingOpen;
        info!("Signaling open on {}", signaling.url());

        let result = self.drive(&mut signaling).await;
        if let Err(e) = &result {
            error!("Session ended: {}", e);
        }

        self.shutdown(Some(&mut signaling)).await;
        result
    }

    async fn drive(&mut self, signaling: &mut SignalingClient) -> Result<()> {
        let deadline = self.config.connect_timeout.map(|t| (Instant::now() + t, t));

        loop {
            if self.handle.is_stopped() {
                return Ok(());
            }

            let open = self.state == SessionState::DataChannelOpen;
            if open {
                self.drain_outbound().await;
            }
            let outbound_pending = open && (!self.input_rx.is_empty() || !self.data_rx.is_empty());
            let connect_deadline = deadline.filter(|_| !open);

            tokio::select! {
                biased;

                envelope = signaling.recv() => {
                    let envelope = envelope?;
                    self.on_envelope(envelope, signaling).await?;
                }
                event = next_event(&mut self.transport_rx) => {
                    match event {
                        Some(event) => self.on_transport(event)?,
                        None => {
                            self.transport_rx = None;
                            return Err(BridgeError::TransportLost("media engine stopped".into()));
                        }
                    }
                }
                Some(propagated) = self.relay_rx.recv() => self.on_propagated(propagated),
                _ = expire(connect_deadline.map(|(at, _)| at)) => {
                    let timeout = connect_deadline.map(|(_, t)| t).unwrap_or_default();
                    return Err(BridgeError::ConnectTimeout(timeout));
                }
                _ = self.handle.shared.wake.notified() => {}
                _ = std::future::ready(()), if outbound_pending => {}
            }
        }
    }

    /// Sends at most one input event and one data request, yielding after
    /// each so neither queue starves the other or the rest of the runtime.
    async fn drain_outbound(&mut self) {
        if let Ok(event) = self.input_rx.try_recv() {
            self.send_input(&event);
        }
        tokio::task::yield_now().await;

        if let Ok(DataRequest { request, callback }) = self.data_rx.try_recv() {
            self.send_request(&request, callback);
        }
        tokio::task::yield_now().await;
    }

    fn send_input(&mut self, event: &InputEvent) {
        if event.saturates() {
            debug!("Mouse delta out of range, clamping: {:?}", event);
            self.handle.shared.diagnostics.saturated_delta();
        }
        let frame = codec::encode_input(event);
        if let Err(e) = self.session.peer.send_data(&frame) {
            warn!("Failed to send input: {}", e);
        }
    }

    fn send_request(&mut self, request: &OutboundRequest, callback: Option<ResponseCallback>) {
        let (id, text) = match self.router.send(request, callback) {
            Ok(sent) => sent,
            Err(e) => {
                warn!("Failed to serialize {} request: {}", request.data_type(), e);
                return;
            }
        };

        let frame = match codec::encode_ui_interaction(&text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping request {}: {}", id, e);
                self.router.cancel(id);
                return;
            }
        };

        if let Err(e) = self.session.peer.send_data(&frame) {
            warn!("Failed to send request {}: {}", id, e);
            self.router.cancel(id);
        }
    }

    async fn on_envelope(
        &mut self,
        envelope: SignalEnvelope,
        signaling: &mut SignalingClient,
    ) -> Result<()> {
        match envelope {
            SignalEnvelope::Config { .. } => debug!("Received peer connection config"),
            SignalEnvelope::PlayerCount { count } => {
                if self.state == SessionState::SignalingOpen {
                    info!("Player count {:?}, sending offer", count);
                    self.send_offer(signaling).await?;
                } else {
                    debug!("Player count {:?} in state {}, ignoring", count, self.state);
                }
            }
            SignalEnvelope::Answer { sdp } => {
                if self.state == SessionState::OfferSent {
                    self.accept_answer(sdp).await?;
                } else {
                    warn!("Answer in state {}, ignoring", self.state);
                }
            }
            SignalEnvelope::IceCandidate { candidate } => {
                self.add_remote_candidate(candidate).await
            }
            SignalEnvelope::Offer { .. } => {
                warn!("Unexpected offer from signaling server, ignoring")
            }
            SignalEnvelope::Unknown => debug!("Ignoring unknown signaling message"),
        }
        Ok(())
    }

    async fn send_offer(&mut self, signaling: &mut SignalingClient) -> Result<()> {
        if self.transport_rx.is_none() {
            self.transport_rx = self.session.peer.take_events();
        }

        let media = self.config.media_kinds();
        let offer = self
            .session
            .peer
            .create_offer(&media, &self.config.channel_label)
            .await?;
        self.session.data_channel = Some(self.config.channel_label.clone());

        signaling.send(&SignalEnvelope::from(offer)).await?;
        self.state = SessionState::OfferSent;
        info!("Offer sent with media {:?}", media);
        Ok(())
    }

    async fn accept_answer(&mut self, sdp: String) -> Result<()> {
        let answer = SessionDescription {
            sdp_type: SdpType::Answer,
            sdp,
        };
        self.session.peer.set_remote_description(answer).await?;
        self.state = SessionState::Answered;
        info!("Answer accepted");

        self.relay.start();
        if let Some(label) = self.early_open.take() {
            self.open_channel(label);
        }
        Ok(())
    }

    async fn add_remote_candidate(&mut self, init: CandidateInit) {
        let candidate =
            match IceCandidate::parse(&init.candidate, init.sdp_mid, init.sdp_mline_index) {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!("Skipping remote candidate: {}", e);
                    self.handle.shared.diagnostics.candidate_error();
                    return;
                }
            };

        if let Err(e) = self.session.peer.add_ice_candidate(&candidate).await {
            warn!("Media engine rejected candidate {}: {}", candidate.to_sdp_line(), e);
            self.handle.shared.diagnostics.candidate_error();
            return;
        }
        debug!("Added remote candidate {}:{}", candidate.ip, candidate.port);
    }

    fn on_transport(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::ChannelOpen { label } => {
                if self.state < SessionState::Answered {
                    debug!("Data channel '{}' open before the answer, deferring", label);
                    self.early_open = Some(label);
                } else {
                    self.open_channel(label);
                }
            }
            TransportEvent::ChannelData(payload) => {
                self.router.on_payload(&payload, &mut self.subsystems);
            }
            TransportEvent::ChannelClosed => self.close_channel(),
            TransportEvent::Track(stream) => {
                self.relay.add_stream(stream);
                if matches!(
                    self.state,
                    SessionState::Answered | SessionState::DataChannelOpen
                ) {
                    self.relay.start();
                }
            }
            TransportEvent::Disconnected(reason) => {
                return Err(BridgeError::TransportLost(reason));
            }
        }
        Ok(())
    }

    fn open_channel(&mut self, label: String) {
        info!("Data channel '{}' open", label);
        self.state = SessionState::DataChannelOpen;
        self.session.data_channel_open = true;
        self.handle.shared.connected.store(true, Ordering::SeqCst);

        if self.config.enable_video {
            let (width, height) = self.config.resolution;
            self.send_request(&OutboundRequest::Resolution { width, height }, None);
        }
    }

    /// Falls back to `Answered` so nothing more is drained onto the closed
    /// channel. Whatever is still queued is discarded.
    fn close_channel(&mut self) {
        info!("Data channel closed");
        self.early_open = None;
        self.session.data_channel_open = false;
        self.handle.shared.connected.store(false, Ordering::SeqCst);
        if self.state == SessionState::DataChannelOpen {
            self.state = SessionState::Answered;
        }

        let mut discarded = 0;
        while self.input_rx.try_recv().is_ok() {
            discarded += 1;
        }
        while self.data_rx.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!("Discarded {} queued sends", discarded);
        }
    }

    fn on_propagated(&mut self, propagated: Propagated) {
        match propagated {
            Propagated::Video(frame) => self.subsystems.dispatch_video(&frame),
            Propagated::Audio(frame) => self.subsystems.dispatch_audio(&frame),
            Propagated::StreamEnded(id) => debug!("Stream {} removed from relay", id),
        }
    }

    /// Best-effort teardown. Every step runs even if an earlier one fails.
    async fn shutdown(&mut self, signaling: Option<&mut SignalingClient>) {
        info!("Shutting down session");
        self.handle.shared.connected.store(false, Ordering::SeqCst);
        self.handle.shared.stopped.store(true, Ordering::SeqCst);

        self.relay.stop();

        if self.session.data_channel.take().is_some() {
            self.session.data_channel_open = false;
            let close = self.session.peer.close_data_channel();
            match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, close).await {
                Ok(Err(e)) => warn!("Failed to close data channel: {}", e),
                Err(_) => warn!("Timed out closing data channel"),
                Ok(Ok(())) => {}
            }
        }

        match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, self.session.peer.close()).await {
            Ok(Err(e)) => warn!("Failed to close peer session: {}", e),
            Err(_) => warn!("Timed out closing peer session"),
            Ok(Ok(())) => {}
        }

        if let Some(signaling) = signaling {
            match tokio::time::timeout(SHUTDOWN_STEP_TIMEOUT, signaling.close()).await {
                Ok(Err(e)) => debug!("Signaling close: {}", e),
                Err(_) => warn!("Timed out closing signaling socket"),
                Ok(Ok(())) => {}
            }
        }

        self.subsystems.deinitialize_all();
        self.state = SessionState::Closed;
        info!("Session closed");
    }
}

async fn next_event(
    rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn expire(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Runs a bridge on a dedicated OS thread with its own runtime.
///
/// `make_peer` runs on that runtime, so an engine that spawns tasks or binds
/// sockets lives as long as the bridge does. Blocks until the bridge is built
/// and returns its handle together with the thread's join handle, which
/// yields the session result. Fails if the runtime or the peer cannot be
/// created.
pub fn spawn_on_thread<P, F, Fut>(
    config: BridgeConfig,
    subsystems: Vec<Box<dyn Subsystem>>,
    make_peer: F,
) -> Result<(BridgeHandle, thread::JoinHandle<Result<()>>)>
where
    P: PeerSession + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<P>>,
{
    let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

    let join = thread::Builder::new()
        .name("pixel-bridge".into())
        .spawn(move || -> Result<()> {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            runtime.block_on(async move {
                let peer = make_peer().await?;
                let mut bridge = SessionBridge::new(config, peer);
                bridge.add_subsystems(subsystems);
                let _ = ready_tx.send(bridge.handle());
                bridge.run().await
            })
        })?;

    match ready_rx.recv() {
        Ok(handle) => Ok((handle, join)),
        Err(_) => match join.join() {
            Ok(Err(e)) => Err(e),
            Ok(Ok(())) | Err(_) => Err(BridgeError::Session(
                "bridge thread exited before starting".into(),
            )),
        },
    }
}
