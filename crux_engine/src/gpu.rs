use crux_shared::ControlValue;

use crate::coalesce::{SlotReader, SlotWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GpuNodeId(pub u32);

/// A node that runs inside the render graph rather than the audio graph.
pub trait GpuNode: Send {
    /// Called once per rendered frame with the latest control values. The
    /// node writes its control outputs into `outputs`, which holds the
    /// previous frame's values on entry.
    fn update(&mut self, controls: &[ControlValue], outputs: &mut [ControlValue]);
}

/// What the render graph receives for one node: the node, the read ends of
/// its control input slots and the write ends of its control output slots.
pub struct GpuNodeBinding {
    node: Box<dyn GpuNode>,
    controls: Vec<SlotReader<ControlValue>>,
    values: Vec<ControlValue>,
    outputs: Vec<SlotWriter<ControlValue>>,
    output_values: Vec<ControlValue>,
    previous_outputs: Vec<ControlValue>,
}

impl GpuNodeBinding {
    pub fn new(node: Box<dyn GpuNode>, controls: Vec<SlotReader<ControlValue>>, initial: Vec<ControlValue>) -> Self {
        Self {
            node,
            controls,
            values: initial,
            outputs: Vec::new(),
            output_values: Vec::new(),
            previous_outputs: Vec::new(),
        }
    }

    pub fn with_outputs(mut self, outputs: Vec<SlotWriter<ControlValue>>, initial: Vec<ControlValue>) -> Self {
        self.previous_outputs = initial.clone();
        self.output_values = initial;
        self.outputs = outputs;
        self
    }

    /// Drain the control slots, hand the values to the node and publish the
    /// outputs it changed. Returns whether any input changed since the last
    /// frame.
    pub fn render_frame(&mut self) -> bool {
        let mut changed = false;
        for (value, reader) in self.values.iter_mut().zip(self.controls.iter_mut()) {
            if let Some(v) = reader.read_latest() {
                *value = v;
                changed = true;
            }
        }
        self.previous_outputs.copy_from_slice(&self.output_values);
        self.node.update(&self.values, &mut self.output_values);
        for ((writer, now), before) in self.outputs.iter_mut().zip(&self.output_values).zip(&self.previous_outputs) {
            if now != before {
                writer.write(*now);
            }
        }
        changed
    }

    pub fn values(&self) -> &[ControlValue] {
        &self.values
    }

    pub fn outputs(&self) -> &[ControlValue] {
        &self.output_values
    }
}

/// The render side's node table.
pub trait GpuRegistry: Send + Sync {
    fn register_node(&self, binding: GpuNodeBinding) -> GpuNodeId;
    fn unregister_node(&self, id: GpuNodeId);
}
