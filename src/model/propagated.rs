//! Events propagated from the frame pumps to the bridge loop.

use crate::model::{payload::StampedFrame, tracks::MediaFrame};

/// Media events handed from a frame pump to the subsystem fan-out.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub enum Propagated {
    /// A video frame with its capture timestamp.
    Video(StampedFrame),

    /// An audio frame, passed through unmodified.
    Audio(MediaFrame),

    /// The stream with this id has ended and its pump stopped.
    StreamEnded(String),
}

impl Propagated {
    /// The id of the stream the event came from.
    pub fn stream_id(&self) -> &str {
        match self {
            Propagated::Video(s) => &s.frame.stream_id,
            Propagated::Audio(f) => &f.stream_id,
            Propagated::StreamEnded(id) => id,
        }
    }
}
