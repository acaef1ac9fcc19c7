//! Counters for events the bridge drops instead of failing on.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared, lock-free counters. One instance lives for the whole bridge and is
/// reachable from every [`BridgeHandle`](crate::bridge::BridgeHandle).
#[derive(Debug, Default)]
pub struct Diagnostics {
    malformed_signaling: AtomicU64,
    candidate_errors: AtomicU64,
    decode_errors: AtomicU64,
    unknown_inputs: AtomicU64,
    streams_ended: AtomicU64,
    saturated_deltas: AtomicU64,
    unmatched_responses: AtomicU64,
}

/// Point-in-time copy of [`Diagnostics`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub malformed_signaling: u64,
    pub candidate_errors: u64,
    pub decode_errors: u64,
    pub unknown_inputs: u64,
    pub streams_ended: u64,
    pub saturated_deltas: u64,
    pub unmatched_responses: u64,
}

impl Diagnostics {
    pub fn malformed_signaling(&self) {
        self.malformed_signaling.fetch_add(1, Ordering::Relaxed);
    }

    pub fn candidate_error(&self) {
        self.candidate_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_input(&self) {
        self.unknown_inputs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_ended(&self) {
        self.streams_ended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn saturated_delta(&self) {
        self.saturated_deltas.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unmatched_response(&self) {
        self.unmatched_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            malformed_signaling: self.malformed_signaling.load(Ordering::Relaxed),
            candidate_errors: self.candidate_errors.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            unknown_inputs: self.unknown_inputs.load(Ordering::Relaxed),
            streams_ended: self.streams_ended.load(Ordering::Relaxed),
            saturated_deltas: self.saturated_deltas.load(Ordering::Relaxed),
            unmatched_responses: self.unmatched_responses.load(Ordering::Relaxed),
        }
    }
}
