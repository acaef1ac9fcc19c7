//! Republishes inbound media frames.
//!
//! One pump task per stream awaits the next frame and forwards it to the
//! bridge loop, which fans it out to the subsystems. The output queue is
//! bounded: a slow loop parks the pumps, the per-stream buffers fill, and the
//! engine starts dropping frames.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::diagnostics::Diagnostics;
use crate::model::{
    payload::StampedFrame,
    propagated::Propagated,
    tracks::{MediaKind, MediaStream, STREAM_BUFFER},
};

struct StreamEntry {
    id: String,
    stream: Option<MediaStream>,
    pump: Option<JoinHandle<()>>,
}

pub struct FrameRelay {
    streams: Vec<StreamEntry>,
    out: mpsc::Sender<Propagated>,
    diagnostics: Arc<Diagnostics>,
}

impl FrameRelay {
    /// Creates a relay and the receiver its pumps publish on.
    pub fn new(diagnostics: Arc<Diagnostics>) -> (FrameRelay, mpsc::Receiver<Propagated>) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let relay = FrameRelay {
            streams: vec![],
            out: tx,
            diagnostics,
        };
        (relay, rx)
    }

    /// Registers a stream. It is not pumped until [`FrameRelay::start`].
    pub fn add_stream(&mut self, stream: MediaStream) {
        if self.streams.iter().any(|s| s.id == stream.id) {
            warn!("Stream {} already registered, ignoring duplicate", stream.id);
            return;
        }
        info!("Track added: {} ({:?})", stream.id, stream.kind);
        self.streams.push(StreamEntry {
            id: stream.id.clone(),
            stream: Some(stream),
            pump: None,
        });
    }

    /// Spawns a pump for every registered stream that has none yet.
    pub fn start(&mut self) {
        for entry in self.streams.iter_mut() {
            if let Some(stream) = entry.stream.take() {
                debug!("Starting frame pump for stream {}", entry.id);
                entry.pump = Some(tokio::spawn(pump(
                    stream,
                    self.out.clone(),
                    self.diagnostics.clone(),
                )));
            }
        }
    }

    /// Number of pumps that have been started and not yet finished.
    pub fn running(&self) -> usize {
        self.streams
            .iter()
            .filter(|s| s.pump.as_ref().is_some_and(|p| !p.is_finished()))
            .count()
    }

    /// Cancels every pump and forgets all streams.
    ///
    /// Cancellation takes effect at each pump's next suspension point.
    pub fn stop(&mut self) {
        for entry in self.streams.drain(..) {
            if let Some(pump) = entry.pump {
                pump.abort();
            }
        }
    }
}

impl Drop for FrameRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn pump(
    mut stream: MediaStream,
    out: mpsc::Sender<Propagated>,
    diagnostics: Arc<Diagnostics>,
) {
    let id = stream.id.clone();
    loop {
        let Some(frame) = stream.next_frame().await else {
            warn!("Stream {} ended", id);
            diagnostics.stream_ended();
            let _ = out.send(Propagated::StreamEnded(id)).await;
            return;
        };

        let event = match frame.kind {
            MediaKind::Video => Propagated::Video(StampedFrame::new(frame)),
            MediaKind::Audio => Propagated::Audio(frame),
        };

        if out.send(event).await.is_err() {
            debug!("Relay output closed, stopping pump for {}", id);
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc::error::TrySendError;

    use super::*;
    use crate::model::tracks::MediaFrame;

    fn frame(kind: MediaKind, id: &str, n: u8) -> MediaFrame {
        MediaFrame {
            kind,
            stream_id: id.into(),
            data: vec![n],
            media_time: n as u64,
        }
    }

    #[tokio::test]
    async fn video_is_stamped_and_audio_passes_through() {
        let diagnostics = Arc::new(Diagnostics::default());
        let (mut relay, mut rx) = FrameRelay::new(diagnostics);

        let (vtx, vstream) = MediaStream::channel("v", MediaKind::Video);
        let (atx, astream) = MediaStream::channel("a", MediaKind::Audio);
        relay.add_stream(vstream);
        relay.add_stream(astream);
        relay.start();

        vtx.send(frame(MediaKind::Video, "v", 1)).await.unwrap();
        match rx.recv().await.unwrap() {
            Propagated::Video(s) => {
                assert_eq!(s.frame.data, vec![1]);
                assert!(s.timestamp > 0);
            }
            other => panic!("unexpected {:?}", other),
        }

        let audio = frame(MediaKind::Audio, "a", 2);
        atx.send(audio.clone()).await.unwrap();
        match rx.recv().await.unwrap() {
            Propagated::Audio(f) => assert_eq!(f, audio),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn ended_stream_stops_only_its_pump() {
        let diagnostics = Arc::new(Diagnostics::default());
        let (mut relay, mut rx) = FrameRelay::new(diagnostics.clone());

        let (vtx, vstream) = MediaStream::channel("v", MediaKind::Video);
        let (atx, astream) = MediaStream::channel("a", MediaKind::Audio);
        relay.add_stream(vstream);
        relay.add_stream(astream);
        relay.start();

        drop(vtx);
        match rx.recv().await.unwrap() {
            Propagated::StreamEnded(id) => assert_eq!(id, "v"),
            other => panic!("unexpected {:?}", other),
        }

        atx.send(frame(MediaKind::Audio, "a", 7)).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), Propagated::Audio(_)));
        assert_eq!(diagnostics.snapshot().streams_ended, 1);
    }

    #[tokio::test]
    async fn stop_cancels_waiting_pumps() {
        let (mut relay, _rx) = FrameRelay::new(Arc::new(Diagnostics::default()));
        let (vtx, vstream) = MediaStream::channel("v", MediaKind::Video);
        relay.add_stream(vstream);
        relay.start();
        assert_eq!(relay.running(), 1);

        relay.stop();
        assert_eq!(relay.running(), 0);

        // The aborted pump drops the stream's receiving half.
        let closed = tokio::time::timeout(Duration::from_secs(1), vtx.closed()).await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn duplicate_streams_are_ignored() {
        let (mut relay, _rx) = FrameRelay::new(Arc::new(Diagnostics::default()));
        let (_a, s1) = MediaStream::channel("0", MediaKind::Video);
        let (_b, s2) = MediaStream::channel("0", MediaKind::Video);
        relay.add_stream(s1);
        relay.add_stream(s2);
        relay.start();
        assert_eq!(relay.running(), 1);
    }

    #[tokio::test]
    async fn undrained_output_pushes_back_on_the_stream() {
        let (mut relay, rx) = FrameRelay::new(Arc::new(Diagnostics::default()));
        let (vtx, vstream) = MediaStream::channel("v", MediaKind::Video);
        relay.add_stream(vstream);
        relay.start();

        let mut accepted = 0;
        let mut full = false;
        for n in 0..10_000u32 {
            match vtx.try_send(frame(MediaKind::Video, "v", n as u8)) {
                Ok(()) => accepted += 1,
                Err(TrySendError::Full(_)) => {
                    full = true;
                    break;
                }
                Err(TrySendError::Closed(_)) => panic!("pump stopped"),
            }
            tokio::task::yield_now().await;
        }

        assert!(full);
        // Both queues full plus the one frame held by the parked pump.
        assert!(accepted <= 2 * STREAM_BUFFER + 1, "accepted {}", accepted);
        assert!(!rx.is_empty() && rx.len() <= STREAM_BUFFER);
    }
}
