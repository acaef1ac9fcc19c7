use chrono::{DateTime, TimeZone, Utc};

use crate::model::tracks::MediaFrame;

/// A video frame stamped with the wall-clock time it was received.
#[derive(Debug, Clone, PartialEq)]
pub struct StampedFrame {
    pub frame: MediaFrame,
    /// Capture time in nanoseconds since the Unix epoch
    pub timestamp: i64,
}

impl StampedFrame {
    pub fn new(frame: MediaFrame) -> StampedFrame {
        Self {
            frame,
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or(0),
        }
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.timestamp)
    }

    /// Capture time as seconds since the Unix epoch.
    pub fn seconds(&self) -> f64 {
        self.timestamp as f64 / 1e9
    }

    pub fn timestamp(&self) -> String {
        self.captured_at().to_rfc3339()
    }

    pub fn latency(&self) -> String {
        (Utc::now() - self.captured_at()).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::tracks::MediaKind;

    #[test]
    fn stamps_with_current_time() {
        let before = Utc::now();
        let stamped = StampedFrame::new(MediaFrame {
            kind: MediaKind::Video,
            stream_id: "0".into(),
            data: vec![1, 2, 3],
            media_time: 0,
        });
        let after = Utc::now();

        assert!(stamped.captured_at() >= before);
        assert!(stamped.captured_at() <= after);
        assert!(stamped.seconds() > 0.0);
    }
}
