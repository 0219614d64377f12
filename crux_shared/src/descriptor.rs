use serde::{Deserialize, Serialize};

use crate::ControlValue;

/// Whether a node runs inside the audio graph or on the rendering side.
/// Fixed per node type; the executor branches on it exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeClass {
    Cpu,
    Gpu,
}

/// How a raw file port wants its payload read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMode {
    /// Normalise line endings to `\n`.
    pub text: bool,
    /// Map the file instead of reading it.
    pub mmap: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Sound,
    Midi,
    Raw(RawMode),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PortKind {
    Audio { channels: usize },
    Control {
        init: ControlValue,
        /// Inclusive range the node clamps incoming values into.
        #[serde(default)]
        range: Option<(f32, f32)>,
    },
    Resource(ResourceKind),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub name: String,
    pub kind: PortKind,
}

impl PortDescriptor {
    pub fn audio(name: &str, channels: usize) -> Self {
        Self { name: name.to_string(), kind: PortKind::Audio { channels } }
    }

    pub fn control(name: &str, init: impl Into<ControlValue>) -> Self {
        Self {
            name: name.to_string(),
            kind: PortKind::Control { init: init.into(), range: None },
        }
    }

    pub fn ranged(name: &str, init: impl Into<ControlValue>, min: f32, max: f32) -> Self {
        Self {
            name: name.to_string(),
            kind: PortKind::Control { init: init.into(), range: Some((min, max)) },
        }
    }

    pub fn resource(name: &str, kind: ResourceKind) -> Self {
        Self { name: name.to_string(), kind: PortKind::Resource(kind) }
    }

    pub fn is_control(&self) -> bool {
        matches!(self.kind, PortKind::Control { .. })
    }
}

/// Static description of a node type: its ports and which optional bridge
/// services it wants wired up.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub name: String,
    pub class: NodeClass,
    pub inputs: Vec<PortDescriptor>,
    pub outputs: Vec<PortDescriptor>,
    #[serde(default)]
    pub worker: bool,
    #[serde(default)]
    pub message_bus: bool,
}

impl NodeDescriptor {
    pub fn new(name: &str, class: NodeClass) -> Self {
        Self {
            name: name.to_string(),
            class,
            inputs: Vec::new(),
            outputs: Vec::new(),
            worker: false,
            message_bus: false,
        }
    }

    pub fn input(mut self, port: PortDescriptor) -> Self {
        self.inputs.push(port);
        self
    }

    pub fn output(mut self, port: PortDescriptor) -> Self {
        self.outputs.push(port);
        self
    }

    pub fn with_worker(mut self) -> Self {
        self.worker = true;
        self
    }

    pub fn with_message_bus(mut self) -> Self {
        self.message_bus = true;
        self
    }

    /// Number of control inputs. Nodes address controls by their ordinal
    /// among control ports, not by field index.
    pub fn control_input_count(&self) -> usize {
        self.inputs.iter().filter(|p| p.is_control()).count()
    }

    pub fn control_output_count(&self) -> usize {
        self.outputs.iter().filter(|p| p.is_control()).count()
    }

    /// Initial value and range of each control input, in ordinal order.
    pub fn control_inputs(&self) -> impl Iterator<Item = (ControlValue, Option<(f32, f32)>)> + '_ {
        self.inputs.iter().filter_map(|p| match p.kind {
            PortKind::Control { init, range } => Some((init, range)),
            _ => None,
        })
    }
}
