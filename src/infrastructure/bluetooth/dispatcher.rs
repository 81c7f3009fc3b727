//! Response Dispatcher
//!
//! Turns complete JSON objects and binary control frames from the device into
//! repository updates, session events and follow-up protocol actions.

use crate::domain::models::{Effect, Segment, SessionEvent, Status};
use crate::domain::repository::{EffectsRepository, SegmentsRepository};
use crate::error::ProtocolError;
use crate::infrastructure::bluetooth::protocol::ControlFrame;
use crate::infrastructure::bluetooth::transfer::PullSequence;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A decoded device message
///
/// The wire format carries no type tag; each shape is recognized by the keys
/// it must contain, checked in this order.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    /// `effect` + `params`
    Effect(Effect),
    /// `segments` + `available_effects`
    Status(Status),
    /// `id` + `startLed` + `endLed`
    Segment(Segment),
}

impl DeviceMessage {
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(object) = value else {
            return Err(ProtocolError::UnknownMessage(text.to_string()));
        };

        let has = |keys: &[&str]| keys.iter().all(|k| object.contains_key(*k));
        let is_effect = has(&["effect", "params"]);
        let is_status = has(&["segments", "available_effects"]);
        let is_segment = has(&["id", "startLed", "endLed"]);

        if is_effect {
            serde_json::from_value(Value::Object(object))
                .map(Self::Effect)
                .map_err(|_| ProtocolError::InvalidField("effect"))
        } else if is_status {
            Ok(Self::Status(decode_status(object)?))
        } else if is_segment {
            Segment::from_value(Value::Object(object))
                .map(Self::Segment)
                .map_err(|_| ProtocolError::InvalidField("segment"))
        } else {
            Err(ProtocolError::UnknownMessage(text.to_string()))
        }
    }
}

// One bad segment does not sink the whole snapshot.
fn decode_status(mut object: Map<String, Value>) -> Result<Status, ProtocolError> {
    let Some(Value::Array(names)) = object.remove("available_effects") else {
        return Err(ProtocolError::InvalidField("available_effects"));
    };
    let Some(Value::Array(entries)) = object.remove("segments") else {
        return Err(ProtocolError::InvalidField("segments"));
    };

    let effect_names = names
        .into_iter()
        .filter_map(|name| match name {
            Value::String(name) => Some(name),
            other => {
                warn!("Ignoring non-string effect name: {}", other);
                None
            }
        })
        .collect();

    let segments = entries
        .into_iter()
        .filter_map(|entry| match Segment::from_value(entry) {
            Ok(segment) => Some(segment),
            Err(e) => {
                warn!("Dropping segment from status: {}", e);
                None
            }
        })
        .collect();

    Ok(Status {
        effect_names,
        segments,
    })
}

/// Follow-up the session must perform after a message was dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchAction {
    Nothing,
    /// Pull the next item of a batch
    SendAck,
    /// Start the effect-parameter pull
    RequestAllEffects,
    /// Feed an ACK to the configuration transfer
    AdvanceTransfer,
}

pub struct ResponseDispatcher {
    effects: EffectsRepository,
    segments: SegmentsRepository,
    effect_pull: PullSequence,
    segment_pull: PullSequence,
    event_sender: mpsc::UnboundedSender<SessionEvent>,
}

impl ResponseDispatcher {
    pub fn new(event_sender: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            effects: EffectsRepository::new(),
            segments: SegmentsRepository::new(),
            effect_pull: PullSequence::default(),
            segment_pull: PullSequence::default(),
            event_sender,
        }
    }

    pub fn effects(&self) -> &EffectsRepository {
        &self.effects
    }

    pub fn segments(&self) -> &SegmentsRepository {
        &self.segments
    }

    pub fn effect_pull(&self) -> PullSequence {
        self.effect_pull
    }

    pub fn begin_effect_pull(&mut self) {
        self.effect_pull.request();
    }

    pub fn begin_segment_pull(&mut self) {
        self.segment_pull.request();
    }

    /// Forget any batch in progress; repository contents are kept
    pub fn reset(&mut self) {
        self.effect_pull.reset();
        self.segment_pull.reset();
    }

    /// Classify one complete JSON object and apply it
    pub fn classify(&mut self, json: &str) -> DispatchAction {
        let message = match DeviceMessage::decode(json) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping device message: {}", e);
                return DispatchAction::Nothing;
            }
        };

        match message {
            DeviceMessage::Effect(effect) => {
                debug!(
                    "Effect '{}' with {} parameters",
                    effect.name,
                    effect.parameters.len()
                );
                let name = effect.name.clone();
                self.effects.upsert(effect);
                self.emit(SessionEvent::EffectUpdated(name));
                ack_if(self.effect_pull.on_item())
            }
            DeviceMessage::Status(status) => {
                info!(
                    "Status: {} effects, {} segments",
                    status.effect_names.len(),
                    status.segments.len()
                );
                let counts = (status.effect_names.len(), status.segments.len());
                self.effects.replace(
                    status
                        .effect_names
                        .into_iter()
                        .map(Effect::named)
                        .collect(),
                );
                self.segments.replace(status.segments);
                self.emit(SessionEvent::StatusReceived {
                    effects: counts.0,
                    segments: counts.1,
                });
                DispatchAction::RequestAllEffects
            }
            DeviceMessage::Segment(segment) => {
                debug!("Segment {} '{}'", segment.id, segment.name);
                let id = segment.id;
                self.segments.upsert(segment);
                self.emit(SessionEvent::SegmentUpdated(id));
                ack_if(self.segment_pull.on_item())
            }
        }
    }

    /// Apply a binary control frame
    pub fn handle_control(&mut self, frame: ControlFrame) -> DispatchAction {
        match frame {
            ControlFrame::Ack => DispatchAction::AdvanceTransfer,
            ControlFrame::EffectCount(count) => {
                info!("Device reports {} effects", count);
                ack_if(self.effect_pull.on_count(count))
            }
            ControlFrame::SegmentCount(count) => {
                info!("Device reports {} segments", count);
                ack_if(self.segment_pull.on_count(count))
            }
            ControlFrame::LedCount(count) => {
                debug!("LED count: {}", count);
                self.emit(SessionEvent::LedCount(count));
                DispatchAction::Nothing
            }
            ControlFrame::Heartbeat => DispatchAction::Nothing,
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_sender.send(event);
    }
}

fn ack_if(ack: bool) -> DispatchAction {
    if ack {
        DispatchAction::SendAck
    } else {
        DispatchAction::Nothing
    }
}
