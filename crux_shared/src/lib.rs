use serde::{Deserialize, Serialize};

pub mod config;
pub mod descriptor;
pub mod error;

pub use config::BridgeConfig;
pub use descriptor::{NodeClass, NodeDescriptor, PortDescriptor, PortKind, RawMode, ResourceKind};
pub use error::{BridgeError, LoadError};

/// A single control value as it travels between the controlling thread and the
/// audio thread. Every variant is `Copy` so a control hand-off never allocates
/// or frees on either side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ControlValue {
    Float(f32),
    Int(i32),
    Bool(bool),
    Vec2([f32; 2]),
    Vec3([f32; 3]),
}

impl Default for ControlValue {
    fn default() -> Self {
        ControlValue::Float(0.0)
    }
}

impl ControlValue {
    /// Numeric view of the value. Vectors report their first component.
    pub fn as_f32(&self) -> f32 {
        match *self {
            ControlValue::Float(v) => v,
            ControlValue::Int(v) => v as f32,
            ControlValue::Bool(v) => if v { 1.0 } else { 0.0 },
            ControlValue::Vec2(v) => v[0],
            ControlValue::Vec3(v) => v[0],
        }
    }

    pub fn as_i32(&self) -> i32 {
        match *self {
            ControlValue::Int(v) => v,
            other => other.as_f32().round() as i32,
        }
    }

    pub fn as_bool(&self) -> bool {
        match *self {
            ControlValue::Bool(v) => v,
            other => other.as_f32() != 0.0,
        }
    }

    /// Clamp scalar values into `[min, max]`, keeping the variant.
    pub fn clamped(self, min: f32, max: f32) -> Self {
        match self {
            ControlValue::Float(v) => ControlValue::Float(v.clamp(min, max)),
            ControlValue::Int(v) => ControlValue::Int(v.clamp(min.ceil() as i32, max.floor() as i32)),
            ControlValue::Vec2(v) => ControlValue::Vec2(v.map(|c| c.clamp(min, max))),
            ControlValue::Vec3(v) => ControlValue::Vec3(v.map(|c| c.clamp(min, max))),
            other => other,
        }
    }
}

impl From<f32> for ControlValue {
    fn from(value: f32) -> Self {
        ControlValue::Float(value)
    }
}

impl From<i32> for ControlValue {
    fn from(value: i32) -> Self {
        ControlValue::Int(value)
    }
}

impl From<bool> for ControlValue {
    fn from(value: bool) -> Self {
        ControlValue::Bool(value)
    }
}

/// Audio configuration the bridge sizes nodes and decodes resources against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionState {
    pub sample_rate: f64,
    pub buffer_size: usize,
    pub channels: usize,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            channels: CHANNEL_COUNT,
        }
    }
}

pub const DEFAULT_SAMPLE_RATE: f64 = 48_000.0;
pub const DEFAULT_BUFFER_SIZE: usize = 512;
pub const CHANNEL_COUNT: usize = 2;
