use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Kind of an effect parameter, as named by the firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Integer,
    Float,
    Color,
    Boolean,
}

impl ParamType {
    /// Type tag used in the binary parameter update command
    pub fn tag(self) -> u8 {
        match self {
            Self::Integer => 0,
            Self::Float => 1,
            Self::Color => 2,
            Self::Boolean => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Unpack a `0xRRGGBB` integer (any alpha byte is ignored)
    pub fn from_packed(value: u32) -> Self {
        Self {
            r: (value >> 16) as u8,
            g: (value >> 8) as u8,
            b: value as u8,
        }
    }

    pub fn packed(self) -> u32 {
        (self.r as u32) << 16 | (self.g as u32) << 8 | self.b as u32
    }
}

/// Current value of an effect parameter, tagged by its type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamValue {
    Integer(i32),
    Float(f32),
    Color(Rgb),
    Boolean(bool),
}

impl ParamValue {
    pub fn param_type(&self) -> ParamType {
        match self {
            Self::Integer(_) => ParamType::Integer,
            Self::Float(_) => ParamType::Float,
            Self::Color(_) => ParamType::Color,
            Self::Boolean(_) => ParamType::Boolean,
        }
    }

    /// Interpret a JSON literal according to the declared parameter type
    pub fn from_json(kind: ParamType, value: &Value) -> Option<Self> {
        match kind {
            ParamType::Integer => value
                .as_i64()
                .or_else(|| value.as_f64().map(|f| f as i64))
                .and_then(|v| i32::try_from(v).ok())
                .map(Self::Integer),
            ParamType::Float => value.as_f64().map(|f| Self::Float(f as f32)),
            ParamType::Color => match value {
                Value::Array(parts) if parts.len() == 3 => {
                    let mut rgb = [0u8; 3];
                    for (slot, part) in rgb.iter_mut().zip(parts) {
                        *slot = u8::try_from(part.as_u64()?).ok()?;
                    }
                    Some(Self::Color(Rgb::new(rgb[0], rgb[1], rgb[2])))
                }
                _ => value
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .map(|v| Self::Color(Rgb::from_packed(v))),
            },
            ParamType::Boolean => value
                .as_bool()
                .or_else(|| value.as_i64().map(|v| v != 0))
                .map(Self::Boolean),
        }
    }
}

/// Parameter as it appears on the wire
#[derive(Debug, Deserialize)]
struct RawEffectParameter {
    name: String,
    #[serde(rename = "type")]
    kind: ParamType,
    value: Value,
    #[serde(default)]
    min_val: Option<f32>,
    #[serde(default)]
    max_val: Option<f32>,
}

/// A single tunable parameter of an effect
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawEffectParameter")]
pub struct EffectParameter {
    pub name: String,
    pub value: ParamValue,
    pub min: Option<f32>,
    pub max: Option<f32>,
}

impl EffectParameter {
    pub fn param_type(&self) -> ParamType {
        self.value.param_type()
    }
}

impl TryFrom<RawEffectParameter> for EffectParameter {
    type Error = String;

    fn try_from(raw: RawEffectParameter) -> Result<Self, Self::Error> {
        let value = ParamValue::from_json(raw.kind, &raw.value).ok_or_else(|| {
            format!(
                "value {} does not fit parameter '{}' of type {:?}",
                raw.value, raw.name, raw.kind
            )
        })?;
        Ok(Self {
            name: raw.name,
            value,
            min: raw.min_val,
            max: raw.max_val,
        })
    }
}

/// An effect known to the device, keyed by name
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Effect {
    #[serde(rename = "effect")]
    pub name: String,
    #[serde(rename = "params", default, deserialize_with = "lenient_params")]
    pub parameters: Vec<EffectParameter>,
}

impl Effect {
    /// An effect whose parameters have not been fetched yet
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: Vec::new(),
        }
    }
}

// A bad parameter costs only that parameter, not the whole effect.
fn lenient_params<'de, D>(deserializer: D) -> Result<Vec<EffectParameter>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<Value>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .filter_map(
            |value| match serde_json::from_value::<EffectParameter>(value) {
                Ok(param) => Some(param),
                Err(e) => {
                    warn!("Skipping effect parameter: {}", e);
                    None
                }
            },
        )
        .collect())
}

/// Per-segment parameter override; numbers are normalized to `f64`
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OverrideValue {
    Bool(bool),
    Number(f64),
}

impl OverrideValue {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_f64().map(Self::Number),
            _ => None,
        }
    }
}

impl Serialize for OverrideValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Self::Bool(b) => serializer.serialize_bool(b),
            // The firmware parses integral values with its integer reader
            Self::Number(n) if n.fract() == 0.0 && n.abs() < i64::MAX as f64 => {
                serializer.serialize_i64(n as i64)
            }
            Self::Number(n) => serializer.serialize_f64(n),
        }
    }
}

impl<'de> Deserialize<'de> for OverrideValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_json(&value).ok_or_else(|| {
            serde::de::Error::custom(format!("expected boolean or number, got {}", value))
        })
    }
}

fn lenient_overrides<'de, D>(deserializer: D) -> Result<BTreeMap<String, OverrideValue>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .filter_map(|(name, value)| match OverrideValue::from_json(&value) {
            Some(v) => Some((name, v)),
            None => {
                warn!("Skipping parameter override '{}': {}", name, value);
                None
            }
        })
        .collect())
}

/// A contiguous run of LEDs driven by one effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: u32,
    #[serde(default = "default_segment_name")]
    pub name: String,
    pub start_led: u16,
    /// Inclusive
    pub end_led: u16,
    #[serde(default = "default_effect")]
    pub effect: String,
    #[serde(default = "default_brightness")]
    pub brightness: u8,
    #[serde(default, deserialize_with = "lenient_overrides")]
    pub parameters: BTreeMap<String, OverrideValue>,
}

fn default_segment_name() -> String {
    "Unnamed Segment".to_string()
}
fn default_effect() -> String {
    "SolidColor".to_string()
}
fn default_brightness() -> u8 {
    128
}

impl Segment {
    pub fn new(id: u32, name: impl Into<String>, start_led: u16, end_led: u16) -> Self {
        Self {
            id,
            name: name.into(),
            start_led,
            end_led,
            effect: default_effect(),
            brightness: default_brightness(),
            parameters: BTreeMap::new(),
        }
    }

    /// Decode a segment object, rejecting missing required fields and inverted ranges
    pub fn from_value(value: Value) -> Result<Self, String> {
        let segment: Segment = serde_json::from_value(value).map_err(|e| e.to_string())?;
        if segment.end_led < segment.start_led {
            return Err(format!(
                "segment {} ends ({}) before it starts ({})",
                segment.id, segment.end_led, segment.start_led
            ));
        }
        Ok(segment)
    }

    /// JSON text sent to the device during a configuration push
    pub fn to_wire_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn led_count(&self) -> u32 {
        self.end_led.saturating_sub(self.start_led) as u32 + 1
    }
}

/// Full device snapshot: segments plus the names of the effects it offers
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub effect_names: Vec<String>,
    pub segments: Vec<Segment>,
}

/// Saved configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaveConfiguration {
    pub segments: Vec<Segment>,
    #[serde(default)]
    pub effects: Vec<String>,
}

impl RaveConfiguration {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Events published by a device session
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionStatus(ConnectionStatus),
    LedCount(u16),
    StatusReceived { effects: usize, segments: usize },
    EffectUpdated(String),
    SegmentUpdated(u32),
    TransferCompleted { segments: usize },
    TransferAborted,
    LogMessage(StatusMessage),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}
