//! Request/response correlation over the data channel.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::codec;
use crate::diagnostics::Diagnostics;
use crate::error::{BridgeError, Result};
use crate::model::inbound::{id_from_value, DecoderRegistry, InboundMessage};
use crate::model::request::OutboundRequest;
use crate::subsystem::SubsystemRegistry;

/// Invoked at most once with the decoded response to a request.
pub type ResponseCallback = Box<dyn FnOnce(InboundMessage) + Send>;

/// What happened to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Delivered to the callback pending on this message id
    Callback(u64),
    /// Broadcast to every subsystem
    FannedOut,
    /// Could not be decoded and was dropped
    Dropped,
}

/// Assigns message ids and matches responses back to their callbacks.
///
/// Owned by the bridge loop. Callers on other threads reach it through the
/// bridge's data request queue, never directly.
pub struct MessageRouter {
    next_id: u64,
    pending: HashMap<u64, ResponseCallback>,
    decoders: DecoderRegistry,
    diagnostics: Arc<Diagnostics>,
}

impl MessageRouter {
    pub fn new(decoders: DecoderRegistry, diagnostics: Arc<Diagnostics>) -> Self {
        MessageRouter {
            next_id: 0,
            pending: HashMap::new(),
            decoders,
            diagnostics,
        }
    }

    /// Number of callbacks still waiting for a response.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Assigns the next message id, records the callback and returns the id
    /// together with the serialized envelope.
    pub fn send(
        &mut self,
        request: &OutboundRequest,
        callback: Option<ResponseCallback>,
    ) -> Result<(u64, String)> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let has_callback = callback.is_some();
        let text = serde_json::to_string(&request.envelope(id, has_callback))?;

        if let Some(cb) = callback {
            if self.pending.insert(id, cb).is_some() {
                warn!("Message id {} was still pending, replaced its callback", id);
            }
        }

        debug!("Queued {} request with id {}", request.data_type(), id);
        Ok((id, text))
    }

    /// Forgets the callback pending on `id`, if any.
    pub fn cancel(&mut self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Routes a raw data channel payload.
    pub fn on_payload(&mut self, payload: &[u8], subsystems: &mut SubsystemRegistry) -> Routed {
        match codec::decode_inbound(payload) {
            Ok(value) => self.on_inbound(value, subsystems),
            Err(e) => {
                warn!("Dropping data channel message: {}", e);
                self.diagnostics.decode_error();
                Routed::Dropped
            }
        }
    }

    /// Routes a decoded payload to its pending callback, or to every
    /// subsystem when nothing is waiting for it.
    pub fn on_inbound(&mut self, value: Value, subsystems: &mut SubsystemRegistry) -> Routed {
        match self.route(value, subsystems) {
            Ok(routed) => routed,
            Err(e) => {
                warn!("Dropping data channel message: {}", e);
                self.diagnostics.decode_error();
                Routed::Dropped
            }
        }
    }

    fn route(&mut self, value: Value, subsystems: &mut SubsystemRegistry) -> Result<Routed> {
        let object = match value {
            Value::Object(object) => object,
            other => {
                return Err(BridgeError::Decode(format!(
                    "expected a JSON object, got {}",
                    other
                )))
            }
        };

        let id = object.get("messageId").and_then(id_from_value);
        let callback = id.and_then(|id| self.pending.remove(&id));

        let message = self.decoders.decode(object)?;

        match (id, callback) {
            (Some(id), Some(cb)) => {
                debug!("Response {} delivered to its callback", id);
                cb(message);
                Ok(Routed::Callback(id))
            }
            (id, _) => {
                if id.is_some() {
                    self.diagnostics.unmatched_response();
                }
                subsystems.dispatch_data(&message);
                Ok(Routed::FannedOut)
            }
        }
    }
}
