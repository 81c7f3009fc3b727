//! Simulated Controller
//!
//! An in-memory [`Transport`] that behaves like the LED controller firmware.
//! Every write is answered synchronously by pushing notifications, fragmented
//! at the payload limit, into the inbound channel.

use crate::domain::models::{OverrideValue, ParamType, Segment};
use crate::domain::settings::{DEFAULT_MAX_FRAME_LEN, DEFAULT_MAX_PAYLOAD};
use crate::error::TransportError;
use crate::infrastructure::bluetooth::framer::ResponseFramer;
use crate::infrastructure::bluetooth::protocol::{cmd, ControlFrame};
use crate::infrastructure::bluetooth::transport::{Transport, TransportEvent};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// An effect as the firmware describes it
#[derive(Debug, Clone)]
pub struct SimulatedEffect {
    pub name: String,
    /// Parameter objects in wire form (`name`, `type`, `value`, ...)
    pub params: Vec<Value>,
}

impl SimulatedEffect {
    fn to_json(&self) -> Value {
        json!({ "effect": self.name, "params": self.params })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Idle,
    SendingEffects { next: usize },
    SendingSegments { next: usize },
    AwaitingSegmentCount,
    ReceivingSegments { expected: usize },
    ReceivingSingleSegment,
}

struct DeviceState {
    led_count: u16,
    effects: Vec<SimulatedEffect>,
    segments: Vec<Segment>,
    incoming: Vec<Segment>,
    mode: Mode,
    framer: ResponseFramer,
    save_count: u32,
    fail_writes: u32,
    writes: Vec<Vec<u8>>,
}

pub struct SimulatedController {
    state: Mutex<DeviceState>,
    notifications: mpsc::UnboundedSender<TransportEvent>,
    max_payload: usize,
}

impl SimulatedController {
    /// A controller with a 60 LED strip, one segment and three effects
    pub fn new(notifications: mpsc::UnboundedSender<TransportEvent>) -> Self {
        Self::with_state(
            notifications,
            60,
            default_effects(),
            vec![Segment::new(1, "All LEDs", 0, 59)],
        )
    }

    pub fn with_state(
        notifications: mpsc::UnboundedSender<TransportEvent>,
        led_count: u16,
        effects: Vec<SimulatedEffect>,
        segments: Vec<Segment>,
    ) -> Self {
        Self {
            state: Mutex::new(DeviceState {
                led_count,
                effects,
                segments,
                incoming: Vec::new(),
                mode: Mode::Idle,
                framer: ResponseFramer::new(DEFAULT_MAX_FRAME_LEN),
                save_count: 0,
                fail_writes: 0,
                writes: Vec::new(),
            }),
            notifications,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }

    /// Announce the link as up
    pub fn connect(&self) {
        let _ = self.notifications.send(TransportEvent::Connected);
    }

    /// Drop the link from the device side
    pub fn disconnect(&self) {
        let _ = self.notifications.send(TransportEvent::Disconnected);
    }

    /// Make the next `count` writes fail before reaching the device
    pub fn fail_next_writes(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.fail_writes = count;
        }
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.state
            .lock()
            .map(|s| s.segments.clone())
            .unwrap_or_default()
    }

    pub fn led_count(&self) -> u16 {
        self.state.lock().map(|s| s.led_count).unwrap_or_default()
    }

    pub fn save_count(&self) -> u32 {
        self.state.lock().map(|s| s.save_count).unwrap_or_default()
    }

    /// Every write the device accepted, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .map(|s| s.writes.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, DeviceState>, TransportError> {
        self.state
            .lock()
            .map_err(|_| TransportError::WriteFailed("device state poisoned".into()))
    }

    fn notify(&self, bytes: &[u8]) {
        for chunk in bytes.chunks(self.max_payload) {
            let _ = self
                .notifications
                .send(TransportEvent::Notification(chunk.to_vec()));
        }
    }
}

#[async_trait]
impl Transport for SimulatedController {
    async fn send(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if bytes.len() > self.max_payload {
            return Err(TransportError::PayloadTooLarge {
                len: bytes.len(),
                max: self.max_payload,
            });
        }

        let replies = {
            let mut state = self.lock()?;
            if state.fail_writes > 0 {
                state.fail_writes -= 1;
                return Err(TransportError::WriteFailed("simulated failure".into()));
            }
            state.writes.push(bytes.to_vec());
            state.handle_write(bytes)
        };

        for reply in replies {
            self.notify(&reply);
        }
        Ok(())
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }
}

impl DeviceState {
    fn handle_write(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let is_ack = bytes == [cmd::ACK];
        match self.mode {
            Mode::SendingEffects { next } if is_ack => {
                let reply = self.effect_json(next);
                self.mode = if next + 1 < self.effects.len() {
                    Mode::SendingEffects { next: next + 1 }
                } else {
                    Mode::Idle
                };
                reply.into_iter().collect()
            }
            Mode::SendingSegments { next } if is_ack => {
                let reply = self.segment_json(next);
                self.mode = if next + 1 < self.segments.len() {
                    Mode::SendingSegments { next: next + 1 }
                } else {
                    Mode::Idle
                };
                reply.into_iter().collect()
            }
            Mode::AwaitingSegmentCount => match bytes {
                [hi, lo] => {
                    let expected = u16::from_be_bytes([*hi, *lo]) as usize;
                    debug!("Simulated device expecting {} segments", expected);
                    self.incoming.clear();
                    self.framer.reset();
                    self.mode = Mode::ReceivingSegments { expected };
                    self.finish_push_if_complete();
                    vec![ControlFrame::Ack.encode()]
                }
                _ => {
                    warn!("Simulated device expected a segment count, got {:02X?}", bytes);
                    self.mode = Mode::Idle;
                    Vec::new()
                }
            },
            Mode::ReceivingSegments { .. } => {
                for object in self.framer.feed(bytes) {
                    match serde_json::from_str::<Segment>(&object) {
                        Ok(segment) => self.incoming.push(segment),
                        Err(e) => warn!("Simulated device rejected segment: {}", e),
                    }
                }
                self.finish_push_if_complete();
                vec![ControlFrame::Ack.encode()]
            }
            Mode::ReceivingSingleSegment => {
                self.receive_single_segment(bytes);
                Vec::new()
            }
            _ => {
                self.mode = Mode::Idle;
                self.handle_command(bytes)
            }
        }
    }

    fn handle_command(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let Some((&opcode, args)) = bytes.split_first() else {
            return Vec::new();
        };

        match opcode {
            cmd::GET_STATUS => vec![self.status_json()],
            cmd::GET_LED_COUNT => vec![ControlFrame::LedCount(self.led_count).encode()],
            cmd::SET_LED_COUNT => {
                if let [hi, lo] = args {
                    self.led_count = u16::from_be_bytes([*hi, *lo]);
                    info!("Simulated device LED count set to {}", self.led_count);
                }
                Vec::new()
            }
            cmd::GET_ALL_EFFECTS => {
                let count = self.effects.len();
                if count > 0 {
                    self.mode = Mode::SendingEffects { next: 0 };
                }
                vec![ControlFrame::EffectCount(count as u16).encode()]
            }
            cmd::GET_ALL_SEGMENT_CONFIGS => {
                let count = self.segments.len();
                if count > 0 {
                    self.mode = Mode::SendingSegments { next: 0 };
                }
                vec![ControlFrame::SegmentCount(count as u16).encode()]
            }
            cmd::GET_EFFECT_INFO => match args {
                [_, index] => self.effect_json(*index as usize).into_iter().collect(),
                _ => Vec::new(),
            },
            cmd::SET_ALL_SEGMENT_CONFIGS => {
                self.mode = Mode::AwaitingSegmentCount;
                vec![ControlFrame::Ack.encode()]
            }
            cmd::SET_SINGLE_SEGMENT => {
                self.framer.reset();
                self.mode = Mode::ReceivingSingleSegment;
                self.receive_single_segment(args);
                Vec::new()
            }
            cmd::SET_EFFECT_PARAMETER => {
                self.apply_parameter(args);
                Vec::new()
            }
            cmd::SAVE_CONFIG => {
                self.save_count += 1;
                Vec::new()
            }
            cmd::ACK => Vec::new(),
            other => {
                warn!("Simulated device ignoring opcode 0x{:02X}", other);
                Vec::new()
            }
        }
    }

    fn finish_push_if_complete(&mut self) {
        if let Mode::ReceivingSegments { expected } = self.mode {
            if self.incoming.len() >= expected {
                info!("Simulated device stored {} segments", self.incoming.len());
                self.segments = std::mem::take(&mut self.incoming);
                self.mode = Mode::Idle;
            }
        }
    }

    fn receive_single_segment(&mut self, bytes: &[u8]) {
        let Some(object) = self.framer.feed(bytes).into_iter().next() else {
            return;
        };
        self.mode = Mode::Idle;
        match serde_json::from_str::<Segment>(&object) {
            Ok(segment) => match self.segments.iter_mut().find(|s| s.id == segment.id) {
                Some(existing) => *existing = segment,
                None => self.segments.push(segment),
            },
            Err(e) => warn!("Simulated device rejected segment: {}", e),
        }
    }

    fn apply_parameter(&mut self, args: &[u8]) {
        let [index, tag, name_len, rest @ ..] = args else {
            return;
        };
        let name_len = *name_len as usize;
        if rest.len() < name_len {
            return;
        }
        let (name, value) = rest.split_at(name_len);
        let name = String::from_utf8_lossy(name).into_owned();

        let value = match (*tag, value) {
            (t, [a, b, c, d]) if t == ParamType::Integer.tag() => {
                OverrideValue::Number(i32::from_be_bytes([*a, *b, *c, *d]) as f64)
            }
            (t, [a, b, c, d]) if t == ParamType::Float.tag() => {
                OverrideValue::Number(f32::from_le_bytes([*a, *b, *c, *d]) as f64)
            }
            (t, [r, g, b]) if t == ParamType::Color.tag() => {
                OverrideValue::Number(((*r as u32) << 16 | (*g as u32) << 8 | *b as u32) as f64)
            }
            (t, [v]) if t == ParamType::Boolean.tag() => OverrideValue::Bool(*v != 0),
            _ => {
                warn!("Simulated device got malformed value for '{}'", name);
                return;
            }
        };

        match self.segments.get_mut(*index as usize) {
            Some(segment) => {
                segment.parameters.insert(name, value);
            }
            None => warn!("Simulated device has no segment at index {}", index),
        }
    }

    fn status_json(&self) -> Vec<u8> {
        let names: Vec<&str> = self.effects.iter().map(|e| e.name.as_str()).collect();
        json!({ "segments": self.segments, "available_effects": names })
            .to_string()
            .into_bytes()
    }

    fn effect_json(&self, index: usize) -> Option<Vec<u8>> {
        self.effects
            .get(index)
            .map(|e| e.to_json().to_string().into_bytes())
    }

    fn segment_json(&self, index: usize) -> Option<Vec<u8>> {
        self.segments
            .get(index)
            .and_then(|s| s.to_wire_json().ok())
            .map(String::into_bytes)
    }
}

fn default_effects() -> Vec<SimulatedEffect> {
    vec![
        SimulatedEffect {
            name: "SolidColor".into(),
            params: vec![json!({"name": "color", "type": "color", "value": 0xFF0000})],
        },
        SimulatedEffect {
            name: "Rainbow".into(),
            params: vec![
                json!({"name": "speed", "type": "integer", "value": 10, "min_val": 1, "max_val": 100}),
                json!({"name": "saturation", "type": "float", "value": 1.0, "min_val": 0.0, "max_val": 1.0}),
            ],
        },
        SimulatedEffect {
            name: "Fire".into(),
            params: vec![
                json!({"name": "cooling", "type": "integer", "value": 55}),
                json!({"name": "sparking", "type": "integer", "value": 120}),
                json!({"name": "reverse", "type": "boolean", "value": false}),
            ],
        },
    ]
}
