//! Media track management
//!
//! Inbound media arrives from the media engine as one [`MediaStream`] per
//! negotiated media line. Each stream is a handle that yields frames until
//! the engine drops its sending half.

use tokio::sync::mpsc;

/// How many frames a stream buffers before the engine starts dropping.
pub const STREAM_BUFFER: usize = 64;

/// The kind of media (audio or video)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl From<str0m::media::MediaKind> for MediaKind {
    fn from(kind: str0m::media::MediaKind) -> Self {
        match kind {
            str0m::media::MediaKind::Audio => MediaKind::Audio,
            str0m::media::MediaKind::Video => MediaKind::Video,
        }
    }
}

impl From<MediaKind> for str0m::media::MediaKind {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => str0m::media::MediaKind::Audio,
            MediaKind::Video => str0m::media::MediaKind::Video,
        }
    }
}

/// One frame handed over by the media engine.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaFrame {
    /// The kind of media carried
    pub kind: MediaKind,
    /// Id of the stream the frame arrived on
    pub stream_id: String,
    /// Frame contents as delivered by the engine
    pub data: Vec<u8>,
    /// Media clock time of the frame, in the stream's clock rate
    pub media_time: u64,
}

/// Receiving half of an inbound media track.
#[derive(Debug)]
pub struct MediaStream {
    /// The media id assigned to this track
    pub(crate) id: String,
    /// The kind of media (audio or video)
    pub(crate) kind: MediaKind,
    frames: mpsc::Receiver<MediaFrame>,
}

/// Sending half of an inbound media track, held by the media engine.
pub type FrameSender = mpsc::Sender<MediaFrame>;

impl MediaStream {
    /// Creates a stream and the sender the engine feeds it through.
    pub fn channel(id: impl Into<String>, kind: MediaKind) -> (FrameSender, MediaStream) {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let stream = MediaStream {
            id: id.into(),
            kind,
            frames: rx,
        };
        (tx, stream)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Waits for the next frame. `None` means the stream has ended.
    pub async fn next_frame(&mut self) -> Option<MediaFrame> {
        self.frames.recv().await
    }
}
