use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError, TryLockError};

use crux_shared::{ControlValue, ExecutionState, NodeDescriptor};

use crate::exec_queue::ExecTask;
use crate::gpu::GpuNode;
use crate::loaders::{RawFile, Resource};
use crate::message_bus::ProcessorBus;
use crate::worker::WorkerHandle;

pub trait ProcessNode: Send {
    /// Called before the first tick and whenever the audio configuration
    /// changes.
    fn prepare(&mut self, _state: &ExecutionState) {}

    /// Process one block in place. `audio` is interleaved,
    /// `ctx.frames * ctx.channels` samples long.
    fn process(&mut self, audio: &mut [f32], ctx: &mut TickContext<'_>);

    /// A resource port (by input field index) received a new payload.
    /// Return whatever the node let go of so it is released off the audio
    /// thread; the default declines the payload.
    fn resource_loaded(&mut self, _port: usize, resource: Resource) -> Option<Resource> {
        Some(resource)
    }

    fn connect_worker(&mut self, _worker: WorkerHandle) {}

    fn connect_message_bus(&mut self, _bus: ProcessorBus) {}

    /// Opaque message from the node's own UI.
    fn process_message(&mut self, _message: &[u8]) {}

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// What a factory hands the executor. Decided once per node type.
pub enum NodeInstance {
    Cpu(Box<dyn ProcessNode>),
    Gpu(Box<dyn GpuNode>),
}

/// Work a raw-file port does on the controlling thread each time a file is
/// loaded. The returned task runs right after the node receives the file, in
/// the same tick.
pub type RawPreprocessor = Arc<dyn Fn(&RawFile) -> Option<ExecTask> + Send + Sync>;

pub trait NodeFactory {
    fn descriptor(&self) -> NodeDescriptor;

    /// Allocate a node sized for `state`.
    fn create(&self, state: &ExecutionState) -> NodeInstance;

    /// Preprocessing for the raw-file port at input field `port`, if it has any.
    fn raw_preprocessor(&self, _port: usize) -> Option<RawPreprocessor> {
        None
    }
}

/// Outcome of a non-blocking attempt to reach the node.
#[derive(Debug, PartialEq, Eq)]
pub enum NodeAccess<R> {
    Ran(R),
    /// Someone else holds the node right now.
    Busy,
    /// A panic unwound while the node was held; its state is not trusted.
    Poisoned,
}

/// Shared home of a live node. The executor and the audio-side handle hold
/// strong references; background closures only ever hold `Weak<NodeCell>`.
pub struct NodeCell {
    node: Mutex<Box<dyn ProcessNode>>,
}

impl NodeCell {
    pub fn new(node: Box<dyn ProcessNode>) -> Arc<Self> {
        Arc::new(Self { node: Mutex::new(node) })
    }

    /// Never blocks.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut dyn ProcessNode) -> R) -> NodeAccess<R> {
        match self.node.try_lock() {
            Ok(mut guard) => NodeAccess::Ran(f(guard.as_mut())),
            Err(TryLockError::WouldBlock) => NodeAccess::Busy,
            Err(TryLockError::Poisoned(_)) => NodeAccess::Poisoned,
        }
    }

    /// Setup-time access from the controlling thread, before the audio side
    /// exists.
    pub(crate) fn with_setup<R>(&self, f: impl FnOnce(&mut dyn ProcessNode) -> R) -> R {
        let mut guard = self.node.lock().unwrap_or_else(PoisonError::into_inner);
        f(guard.as_mut())
    }
}

/// Per-tick view of the node's control ports. Storage is allocated once when
/// the bridge is built and only overwritten afterwards.
pub struct ControlFrame {
    inputs: Vec<ControlValue>,
    input_changed: Vec<bool>,
    feedback: Vec<bool>,
    outputs: Vec<ControlValue>,
    output_changed: Vec<bool>,
}

impl ControlFrame {
    pub fn new(inputs: Vec<ControlValue>, outputs: Vec<ControlValue>) -> Self {
        let n_in = inputs.len();
        let n_out = outputs.len();
        Self {
            inputs,
            input_changed: vec![false; n_in],
            feedback: vec![false; n_in],
            outputs,
            output_changed: vec![false; n_out],
        }
    }

    pub(crate) fn begin_tick(&mut self) {
        self.input_changed.fill(false);
        self.feedback.fill(false);
        self.output_changed.fill(false);
    }

    pub(crate) fn receive(&mut self, index: usize, value: ControlValue) {
        self.inputs[index] = value;
        self.input_changed[index] = true;
    }

    pub fn input(&self, index: usize) -> ControlValue {
        self.inputs[index]
    }

    pub fn output(&self, index: usize) -> ControlValue {
        self.outputs[index]
    }

    pub(crate) fn changed_outputs(&self) -> impl Iterator<Item = (usize, ControlValue)> + '_ {
        self.output_changed
            .iter()
            .enumerate()
            .filter(|(_, c)| **c)
            .map(|(i, _)| (i, self.outputs[i]))
    }

    pub(crate) fn feedback_inputs(&self) -> impl Iterator<Item = (usize, ControlValue)> + '_ {
        self.feedback
            .iter()
            .enumerate()
            .filter(|(_, c)| **c)
            .map(|(i, _)| (i, self.inputs[i]))
    }
}

pub struct TickContext<'a> {
    pub frames: usize,
    pub channels: usize,
    pub sample_rate: f64,
    controls: &'a mut ControlFrame,
}

impl<'a> TickContext<'a> {
    pub fn new(frames: usize, channels: usize, sample_rate: f64, controls: &'a mut ControlFrame) -> Self {
        Self { frames, channels, sample_rate, controls }
    }

    /// Current value of the `index`-th control input.
    pub fn control(&self, index: usize) -> ControlValue {
        self.controls.inputs[index]
    }

    /// Whether the `index`-th control input received an edit for this tick.
    pub fn control_changed(&self, index: usize) -> bool {
        self.controls.input_changed[index]
    }

    /// Replace an input with a value the node derived from it (clamped,
    /// quantised...). The controlling side is shown the replacement.
    pub fn correct_control(&mut self, index: usize, value: ControlValue) {
        if self.controls.inputs[index] != value {
            self.controls.inputs[index] = value;
            self.controls.feedback[index] = true;
        }
    }

    pub fn set_output(&mut self, index: usize, value: ControlValue) {
        self.controls.outputs[index] = value;
        self.controls.output_changed[index] = true;
    }
}
