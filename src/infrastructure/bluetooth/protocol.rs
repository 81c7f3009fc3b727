//! LED Controller Protocol
//!
//! Opcodes, outbound command construction and inbound control frames for
//! the controller firmware. Everything outbound is a [`Command`]: one
//! transport write of at most `max_payload` bytes.

use crate::domain::models::{ParamValue, Segment};
use crate::error::ProtocolError;
use std::fmt;

/// Command opcodes (leading byte of each write)
pub mod cmd {
    pub const GET_STATUS: u8 = 0x08;
    pub const SET_EFFECT_PARAMETER: u8 = 0x0A;
    pub const GET_EFFECT_INFO: u8 = 0x0B;
    pub const SET_LED_COUNT: u8 = 0x0C;
    pub const GET_LED_COUNT: u8 = 0x0D;
    pub const GET_ALL_SEGMENT_CONFIGS: u8 = 0x0E;
    pub const SET_ALL_SEGMENT_CONFIGS: u8 = 0x0F;
    pub const GET_ALL_EFFECTS: u8 = 0x10;
    pub const SET_SINGLE_SEGMENT: u8 = 0x11;
    pub const SAVE_CONFIG: u8 = 0x12;
    /// Flow-control pull, used in both directions
    pub const ACK: u8 = 0xA0;
    /// Firmware keep-alive byte
    pub const HEARTBEAT: u8 = 0x00;
}

/// One outbound transport write
#[derive(Clone, PartialEq, Eq)]
pub struct Command(Vec<u8>);

impl Command {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn ack() -> Self {
        Self(vec![cmd::ACK])
    }

    pub fn get_status() -> Self {
        Self(vec![cmd::GET_STATUS])
    }

    pub fn get_led_count() -> Self {
        Self(vec![cmd::GET_LED_COUNT])
    }

    pub fn set_led_count(count: u16) -> Self {
        let [hi, lo] = count.to_be_bytes();
        Self(vec![cmd::SET_LED_COUNT, hi, lo])
    }

    pub fn get_all_effects() -> Self {
        Self(vec![cmd::GET_ALL_EFFECTS])
    }

    pub fn get_all_segment_configs() -> Self {
        Self(vec![cmd::GET_ALL_SEGMENT_CONFIGS])
    }

    /// Opens the full configuration push
    pub fn begin_segment_push() -> Self {
        Self(vec![cmd::SET_ALL_SEGMENT_CONFIGS])
    }

    /// Segment count, 2 bytes big-endian, no opcode
    pub fn segment_count(count: u16) -> Self {
        Self(count.to_be_bytes().to_vec())
    }

    /// Parameter info for one effect; the firmware expects a zero segment byte first
    pub fn get_effect_info(effect_index: u8) -> Self {
        Self(vec![cmd::GET_EFFECT_INFO, 0x00, effect_index])
    }

    pub fn save_config() -> Self {
        Self(vec![cmd::SAVE_CONFIG])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({:02X?})", self.0)
    }
}

impl From<Vec<u8>> for Command {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// Number of `max_payload`-sized chunks needed for `len` bytes
pub fn chunk_count(len: usize, max_payload: usize) -> usize {
    len.div_ceil(max_payload.max(1))
}

/// Split a payload into writes of at most `max_payload` bytes
pub fn chunk_payload(payload: &[u8], max_payload: usize) -> Vec<Command> {
    payload
        .chunks(max_payload.max(1))
        .map(|chunk| Command::new(chunk.to_vec()))
        .collect()
}

/// Encode a single effect parameter update
///
/// # Layout
///
/// ```text
/// [0]      : SET_EFFECT_PARAMETER opcode
/// [1]      : Segment index (position in the device's segment list)
/// [2]      : Type tag (0 integer, 1 float, 2 color, 3 boolean)
/// [3]      : Name length N
/// [4..4+N] : Name bytes (UTF-8)
/// [4+N..]  : Value
///              integer -> i32 big-endian
///              float   -> f32 little-endian (firmware reads floats natively)
///              color   -> R, G, B
///              boolean -> 0 / 1
/// ```
pub fn encode_parameter_update(
    segment_index: u8,
    name: &str,
    value: &ParamValue,
    max_payload: usize,
) -> Result<Command, ProtocolError> {
    let name_bytes = name.as_bytes();
    let name_len = u8::try_from(name_bytes.len())
        .map_err(|_| ProtocolError::NameTooLong(name_bytes.len()))?;

    let mut bytes = Vec::with_capacity(4 + name_bytes.len() + 4);
    bytes.push(cmd::SET_EFFECT_PARAMETER);
    bytes.push(segment_index);
    bytes.push(value.param_type().tag());
    bytes.push(name_len);
    bytes.extend_from_slice(name_bytes);

    match *value {
        ParamValue::Integer(v) => bytes.extend_from_slice(&v.to_be_bytes()),
        ParamValue::Float(v) => bytes.extend_from_slice(&v.to_le_bytes()),
        ParamValue::Color(c) => bytes.extend_from_slice(&[c.r, c.g, c.b]),
        ParamValue::Boolean(v) => bytes.push(v as u8),
    }

    // The firmware decodes this command from a single write
    if bytes.len() > max_payload {
        return Err(ProtocolError::CommandTooLarge {
            len: bytes.len(),
            max: max_payload,
        });
    }

    Ok(Command(bytes))
}

/// Encode a one-shot segment update, chunked when it exceeds the payload limit
pub fn encode_single_segment(
    segment: &Segment,
    max_payload: usize,
) -> Result<Vec<Command>, ProtocolError> {
    let mut payload = vec![cmd::SET_SINGLE_SEGMENT];
    payload.extend_from_slice(segment.to_wire_json()?.as_bytes());
    Ok(chunk_payload(&payload, max_payload))
}

/// Binary frames the firmware sends outside of JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    Ack,
    EffectCount(u16),
    SegmentCount(u16),
    LedCount(u16),
    Heartbeat,
}

impl ControlFrame {
    /// Recognize a control frame from a whole notification
    ///
    /// Count frames must be exactly three bytes so that a JSON fragment that
    /// happens to start with a control character is left to the framer.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (&opcode, rest) = bytes.split_first()?;
        let count = || match rest {
            [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
            _ => None,
        };

        match opcode {
            cmd::ACK => Some(Self::Ack),
            cmd::HEARTBEAT if rest.is_empty() => Some(Self::Heartbeat),
            cmd::GET_ALL_EFFECTS => count().map(Self::EffectCount),
            cmd::GET_ALL_SEGMENT_CONFIGS => count().map(Self::SegmentCount),
            cmd::GET_LED_COUNT => count().map(Self::LedCount),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let with_count = |opcode: u8, n: u16| {
            let [hi, lo] = n.to_be_bytes();
            vec![opcode, hi, lo]
        };
        match *self {
            Self::Ack => vec![cmd::ACK],
            Self::Heartbeat => vec![cmd::HEARTBEAT],
            Self::EffectCount(n) => with_count(cmd::GET_ALL_EFFECTS, n),
            Self::SegmentCount(n) => with_count(cmd::GET_ALL_SEGMENT_CONFIGS, n),
            Self::LedCount(n) => with_count(cmd::GET_LED_COUNT, n),
        }
    }
}
