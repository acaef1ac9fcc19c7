//! Pluggable consumers of frames and data messages.

use tracing::debug;

use crate::bridge::BridgeHandle;
use crate::model::{inbound::InboundMessage, payload::StampedFrame, tracks::MediaFrame};

/// A consumer of decoded session events.
///
/// Dispatch is synchronous on the bridge loop: a slow consumer holds up every
/// consumer registered after it and the event source itself.
pub trait Subsystem: Send {
    /// Called once when the subsystem is registered.
    fn initialize(&mut self, _handle: BridgeHandle) {}

    /// Called once while the bridge shuts down.
    fn deinitialize(&mut self) {}

    fn on_video(&mut self, frame: &StampedFrame);

    fn on_audio(&mut self, _frame: &MediaFrame) {}

    /// Receives every data message that did not match a pending callback.
    fn on_data(&mut self, message: &InboundMessage);
}

/// Consumers in registration order.
#[derive(Default)]
pub struct SubsystemRegistry {
    subsystems: Vec<Box<dyn Subsystem>>,
}

impl SubsystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, subsystem: Box<dyn Subsystem>) {
        self.subsystems.push(subsystem);
        debug!("Registered subsystem #{}", self.subsystems.len());
    }

    pub fn len(&self) -> usize {
        self.subsystems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subsystems.is_empty()
    }

    pub fn dispatch_video(&mut self, frame: &StampedFrame) {
        for s in self.subsystems.iter_mut() {
            s.on_video(frame);
        }
    }

    pub fn dispatch_audio(&mut self, frame: &MediaFrame) {
        for s in self.subsystems.iter_mut() {
            s.on_audio(frame);
        }
    }

    pub fn dispatch_data(&mut self, message: &InboundMessage) {
        for s in self.subsystems.iter_mut() {
            s.on_data(message);
        }
    }

    pub(crate) fn deinitialize_all(&mut self) {
        for s in self.subsystems.iter_mut() {
            s.deinitialize();
        }
    }
}
