//! Binds one node to its document element.
//!
//! The `Executor` lives on the controlling thread and owns every connection
//! between the element's ports and the node. The `ProcessHandle` it hands out
//! is the only thing the audio thread touches.

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use crux_shared::{BridgeConfig, BridgeError, ControlValue, ExecutionState, NodeDescriptor, ResourceKind};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::coalesce::{SlotReader, SlotWriter, slot};
use crate::event_loop::{EventLoop, TimerConnection};
use crate::exec_queue::{ExecReceiver, ExecSender, ExecTask, Garbage, GarbageCollector, execution_queue};
use crate::gpu::{GpuNode, GpuNodeBinding, GpuNodeId, GpuRegistry};
use crate::loaders::{Resource, load_resource, load_soundfile, resolve_path};
use crate::message_bus::{GuiToProcessor, ProcessorMessages, processor_bus};
use crate::node::{ControlFrame, NodeAccess, NodeCell, NodeFactory, NodeInstance, ProcessNode, RawPreprocessor, TickContext};
use crate::ports::{ControlInlet, ControlOutlet, ListenerId, ProcessElement, ResourceInlet};
use crate::task_pool::TaskPool;
use crate::ui_pool::UiThreadPool;
use crate::worker::{WorkerHandle, WorkerStats};

/// Everything an executor needs from its surroundings.
#[derive(Clone)]
pub struct ExecutionContext {
    pub config: BridgeConfig,
    pub event_loop: Rc<EventLoop>,
    pub tasks: Arc<TaskPool>,
    pub ui_threads: Arc<UiThreadPool>,
    pub state: Arc<ArcSwap<ExecutionState>>,
    pub document_dir: Option<PathBuf>,
    pub gpu: Option<Arc<dyn GpuRegistry>>,
}

impl ExecutionContext {
    pub fn new(config: BridgeConfig, event_loop: Rc<EventLoop>, tasks: Arc<TaskPool>, ui_threads: Arc<UiThreadPool>) -> Self {
        let state = Arc::new(ArcSwap::from_pointee(config.audio));
        Self {
            config,
            event_loop,
            tasks,
            ui_threads,
            state,
            document_dir: None,
            gpu: None,
        }
    }

    pub fn with_document_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.document_dir = Some(dir.into());
        self
    }

    pub fn with_gpu(mut self, registry: Arc<dyn GpuRegistry>) -> Self {
        self.gpu = Some(registry);
        self
    }

    pub fn current_state(&self) -> ExecutionState {
        **self.state.load()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Uninitialized,
    Initializing,
    Running,
    TearingDown,
    Destroyed,
}

enum Binding {
    Cpu {
        node: Option<Arc<NodeCell>>,
        queue: Option<Arc<ExecSender>>,
    },
    Gpu {
        registry: Arc<dyn GpuRegistry>,
        id: Option<GpuNodeId>,
    },
}

enum Subscription {
    Control(Rc<ControlInlet>, ListenerId),
    Resource(Rc<ResourceInlet>, ListenerId),
}

impl Subscription {
    fn detach(self) {
        match self {
            Subscription::Control(inlet, id) => {
                inlet.disconnect(id);
            }
            Subscription::Resource(inlet, id) => {
                inlet.disconnect(id);
            }
        }
    }
}

/// Controlling-thread half of the periodic refresh.
struct Refresh {
    element: Rc<ProcessElement>,
    outputs: Vec<(SlotReader<ControlValue>, Rc<ControlOutlet>)>,
    feedback: Vec<(SlotReader<ControlValue>, Rc<ControlInlet>)>,
    messages: Option<ProcessorMessages>,
    garbage: Option<GarbageCollector>,
    realtime_frees: Option<Arc<AtomicU64>>,
    reported_frees: u64,
}

impl Refresh {
    fn new(element: Rc<ProcessElement>) -> Self {
        Self {
            element,
            outputs: Vec::new(),
            feedback: Vec::new(),
            messages: None,
            garbage: None,
            realtime_frees: None,
            reported_frees: 0,
        }
    }

    fn run(&mut self) {
        for (reader, outlet) in &mut self.outputs {
            if let Some(v) = reader.read_latest() {
                outlet.set_value(v);
            }
        }
        for (reader, inlet) in &mut self.feedback {
            if let Some(v) = reader.read_latest() {
                inlet.set_execution_value(v);
            }
        }
        if let Some(messages) = &mut self.messages {
            let element = &self.element;
            messages.drain(|m| element.deliver_to_ui(m));
        }
        self.collect_garbage();
    }

    fn collect_garbage(&mut self) {
        if let Some(gc) = &self.garbage {
            gc.collect();
        }
        if let Some(frees) = &self.realtime_frees {
            let now = frees.load(Ordering::Relaxed);
            if now > self.reported_frees {
                warn!(count = now - self.reported_frees, "garbage channel full, audio thread freed memory");
                self.reported_frees = now;
            }
        }
    }
}

pub struct Executor {
    id: Uuid,
    name: String,
    state: ExecutorState,
    element: Rc<ProcessElement>,
    ctx: ExecutionContext,
    binding: Binding,
    subscriptions: Vec<Subscription>,
    timer: Option<TimerConnection>,
    refresh: Rc<RefCell<Refresh>>,
    process_handle: Option<ProcessHandle>,
    worker_stats: Arc<WorkerStats>,
}

impl Executor {
    pub fn new(element: Rc<ProcessElement>, factory: &dyn NodeFactory, ctx: ExecutionContext) -> Result<Self, BridgeError> {
        let descriptor = factory.descriptor();
        if descriptor.inputs.len() != element.inlets().len() {
            return Err(BridgeError::PortMismatch {
                node: descriptor.name.clone(),
                expected: descriptor.inputs.len(),
                found: element.inlets().len(),
            });
        }

        let mut executor = Self {
            id: Uuid::new_v4(),
            name: descriptor.name.clone(),
            state: ExecutorState::Uninitialized,
            refresh: Rc::new(RefCell::new(Refresh::new(element.clone()))),
            element,
            ctx,
            binding: Binding::Cpu { node: None, queue: None },
            subscriptions: Vec::new(),
            timer: None,
            process_handle: None,
            worker_stats: Arc::new(WorkerStats::default()),
        };
        executor.transition(ExecutorState::Initializing);

        let exec_state = executor.ctx.current_state();
        match factory.create(&exec_state) {
            NodeInstance::Cpu(node) => executor.init_cpu(node, factory, &descriptor, exec_state)?,
            NodeInstance::Gpu(node) => executor.init_gpu(node)?,
        }

        let refresh = executor.refresh.clone();
        executor.timer = Some(executor.ctx.event_loop.connect_timer(move || {
            if let Ok(mut r) = refresh.try_borrow_mut() {
                r.run();
            }
        }));

        executor.transition(ExecutorState::Running);
        info!(node = %executor.name, id = %executor.id, "executor running");
        Ok(executor)
    }

    fn init_cpu(
        &mut self,
        node: Box<dyn ProcessNode>,
        factory: &dyn NodeFactory,
        descriptor: &NodeDescriptor,
        exec_state: ExecutionState,
    ) -> Result<(), BridgeError> {
        let config = &self.ctx.config;
        let (exec_tx, exec_rx, garbage) = execution_queue(config.exec_queue_capacity, config.garbage_capacity);
        let queue = Arc::new(exec_tx);
        let cell = NodeCell::new(node);
        let mut refresh = self.refresh.borrow_mut();

        if descriptor.message_bus {
            let (bus, messages) = processor_bus(config.message_bus_capacity);
            cell.with_setup(|n| n.connect_message_bus(bus));
            refresh.messages = Some(messages);
        }

        if descriptor.worker {
            let worker = WorkerHandle::new(
                self.ctx.tasks.clone(),
                Arc::downgrade(&cell),
                Arc::downgrade(&queue),
                self.ctx.event_loop.dispatcher(),
                self.worker_stats.clone(),
            );
            cell.with_setup(|n| n.connect_worker(worker));
        }

        // Controls: seed each slot with the current value so the first tick sees it.
        let mut inputs = Vec::new();
        let mut feedback_writers = Vec::new();
        let mut initial = Vec::new();
        for inlet in self.element.control_inlets() {
            let value = inlet.value();
            initial.push(value);

            let (mut writer, reader) = slot(value);
            writer.write(value);
            inputs.push(reader);
            let writer = RefCell::new(writer);
            let id = inlet.on_value_changed(move |v| writer.borrow_mut().write(*v));
            self.subscriptions.push(Subscription::Control(inlet.clone(), id));

            let (fb_writer, fb_reader) = slot(value);
            feedback_writers.push(fb_writer);
            refresh.feedback.push((fb_reader, inlet.clone()));
        }

        let mut outputs = Vec::new();
        let mut initial_outputs = Vec::new();
        for outlet in self.element.control_outlets() {
            let (writer, reader) = slot(outlet.value());
            initial_outputs.push(outlet.value());
            outputs.push(writer);
            refresh.outputs.push((reader, outlet.clone()));
        }

        // Resources: nothing runs yet, so the first payload goes straight in.
        for (port, inlet) in self.element.resource_inlets() {
            let route = ResourceRoute {
                port,
                kind: inlet.kind(),
                name: inlet.name().to_owned(),
                preprocessor: factory.raw_preprocessor(port).filter(|_| matches!(inlet.kind(), ResourceKind::Raw(_))),
            };
            if let Some(resource) = load_port(inlet, self.ctx.document_dir.as_deref(), exec_state.sample_rate) {
                let mut task = route.delivery(resource);
                cell.with_setup(|n| task(n));
            }
            let id = inlet.on_value_changed(resource_listener(
                route,
                Arc::downgrade(&cell),
                Arc::downgrade(&queue),
                self.ctx.state.clone(),
                self.ctx.document_dir.clone(),
            ));
            self.subscriptions.push(Subscription::Resource(inlet.clone(), id));
        }

        cell.with_setup(|n| n.prepare(&exec_state));

        refresh.realtime_frees = Some(exec_rx.realtime_frees());
        refresh.garbage = Some(garbage);
        drop(refresh);

        self.process_handle = Some(ProcessHandle {
            node: Some(cell.clone()),
            exec: Box::new(exec_rx),
            tick: Box::new(TickState {
                inputs,
                outputs,
                feedback: feedback_writers,
                frame: ControlFrame::new(initial, initial_outputs),
                state: self.ctx.state.clone(),
                faulted: Arc::new(AtomicBool::new(false)),
            }),
        });
        self.binding = Binding::Cpu {
            node: Some(cell),
            queue: Some(queue),
        };
        Ok(())
    }

    fn init_gpu(&mut self, node: Box<dyn GpuNode>) -> Result<(), BridgeError> {
        let Some(registry) = self.ctx.gpu.clone() else {
            return Err(BridgeError::NoGpuRegistry(self.name.clone()));
        };

        let mut readers = Vec::new();
        let mut initial = Vec::new();
        for inlet in self.element.control_inlets() {
            let value = inlet.value();
            initial.push(value);
            let (writer, reader) = slot(value);
            readers.push(reader);
            let writer = RefCell::new(writer);
            let id = inlet.on_value_changed(move |v| writer.borrow_mut().write(*v));
            self.subscriptions.push(Subscription::Control(inlet.clone(), id));
        }

        let mut writers = Vec::new();
        let mut initial_outputs = Vec::new();
        let mut refresh = self.refresh.borrow_mut();
        for outlet in self.element.control_outlets() {
            let (writer, reader) = slot(outlet.value());
            initial_outputs.push(outlet.value());
            writers.push(writer);
            refresh.outputs.push((reader, outlet.clone()));
        }
        drop(refresh);

        let binding = GpuNodeBinding::new(node, readers, initial).with_outputs(writers, initial_outputs);
        let id = registry.register_node(binding);
        debug!(node = %self.name, gpu_id = id.0, "registered gpu node");
        self.binding = Binding::Gpu { registry, id: Some(id) };
        Ok(())
    }

    fn transition(&mut self, to: ExecutorState) {
        debug!(node = %self.name, from = ?self.state, to = ?to, "executor state");
        self.state = to;
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn element(&self) -> &Rc<ProcessElement> {
        &self.element
    }

    /// The audio-side handle. Handed out once; `None` for GPU nodes.
    pub fn take_process_handle(&mut self) -> Option<ProcessHandle> {
        self.process_handle.take()
    }

    /// UI-side message sender, if the node is CPU-class and alive.
    pub fn gui_sender(&self) -> Option<GuiToProcessor> {
        match &self.binding {
            Binding::Cpu { queue: Some(queue), .. } => Some(GuiToProcessor::new(Arc::downgrade(queue))),
            _ => None,
        }
    }

    pub fn outstanding_requests(&self) -> usize {
        self.worker_stats.outstanding()
    }

    pub fn worker_stats(&self) -> &WorkerStats {
        &self.worker_stats
    }

    pub fn gpu_id(&self) -> Option<GpuNodeId> {
        match &self.binding {
            Binding::Gpu { id, .. } => *id,
            Binding::Cpu { .. } => None,
        }
    }

    /// Run the refresh now instead of waiting for the timer.
    pub fn refresh(&self) {
        if let Ok(mut r) = self.refresh.try_borrow_mut() {
            r.run();
        }
    }

    /// New sample rate or block size. The node is re-prepared at its next
    /// tick, and sound files are decoded again at the new rate off the
    /// controlling thread.
    pub fn audio_configuration_changed(&mut self, state: ExecutionState) -> Result<(), BridgeError> {
        self.ctx.state.store(Arc::new(state));
        let Binding::Cpu {
            node: Some(cell),
            queue: Some(queue),
        } = &self.binding
        else {
            return Ok(());
        };
        info!(node = %self.name, sample_rate = state.sample_rate, buffer_size = state.buffer_size, "audio configuration changed");

        if queue.enqueue(Box::new(move |n: &mut dyn ProcessNode| n.prepare(&state))).is_err() {
            warn!(node = %self.name, "execution queue full, prepare dropped");
        }

        for (port, inlet) in self.element.resource_inlets() {
            if inlet.kind() != ResourceKind::Sound {
                continue;
            }
            let Some(path) = resolve_path(&inlet.path(), self.ctx.document_dir.as_deref()) else {
                continue;
            };
            let handle = self.ctx.ui_threads.acquire()?;
            let node = Arc::downgrade(cell);
            let queue = Arc::downgrade(queue);
            let dispatcher = self.ctx.event_loop.dispatcher();
            let name = inlet.name().to_owned();
            handle.execute_and_release(Box::new(move || {
                if node.strong_count() == 0 {
                    return;
                }
                match load_soundfile(&path, state.sample_rate) {
                    Ok(sound) => {
                        dispatcher.run_async(move || {
                            if node.strong_count() == 0 {
                                return;
                            }
                            if let Some(queue) = queue.upgrade() {
                                if queue.enqueue(deliver_resource(port, Resource::Sound(sound), None)).is_err() {
                                    warn!(port = %name, "execution queue full, reloaded sound dropped");
                                }
                            }
                        });
                    }
                    Err(e) => warn!(port = %name, error = %e, "sound reload failed"),
                }
            }));
        }
        Ok(())
    }

    /// Disconnect everything. Safe to call more than once.
    pub fn cleanup(&mut self) {
        if matches!(self.state, ExecutorState::TearingDown | ExecutorState::Destroyed) {
            return;
        }
        self.transition(ExecutorState::TearingDown);

        for sub in self.subscriptions.drain(..) {
            sub.detach();
        }
        if let Some(timer) = self.timer.take() {
            self.ctx.event_loop.disconnect(timer);
        }

        match &mut self.binding {
            Binding::Cpu { node, queue } => {
                queue.take();
                node.take();
            }
            Binding::Gpu { registry, id } => {
                if let Some(id) = id.take() {
                    registry.unregister_node(id);
                    debug!(node = %self.name, gpu_id = id.0, "unregistered gpu node");
                }
            }
        }
        self.element.reset_to_ui();
        self.process_handle.take();
        self.refresh.borrow_mut().collect_garbage();

        self.transition(ExecutorState::Destroyed);
        info!(node = %self.name, id = %self.id, "executor destroyed");
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn load_port(inlet: &ResourceInlet, document_dir: Option<&std::path::Path>, sample_rate: f64) -> Option<Resource> {
    let path = resolve_path(&inlet.path(), document_dir)?;
    match load_resource(inlet.kind(), &path, sample_rate) {
        Ok(resource) => Some(resource),
        Err(e) => {
            warn!(port = %inlet.name(), error = %e, "resource load failed");
            None
        }
    }
}

/// Hands `resource` to the node, then runs `then` against it in the same
/// task. The payload the node lets go of stays owned by the task, so it is
/// freed with the spent task on the controlling thread.
fn deliver_resource(port: usize, resource: Resource, mut then: Option<ExecTask>) -> ExecTask {
    let mut incoming = Some(resource);
    let mut _released: Option<Resource> = None;
    Box::new(move |node: &mut dyn ProcessNode| {
        if let Some(resource) = incoming.take() {
            _released = node.resource_loaded(port, resource);
            if let Some(task) = then.as_mut() {
                task(&mut *node);
            }
        }
    })
}

/// One resource inlet as seen by the loader.
struct ResourceRoute {
    port: usize,
    kind: ResourceKind,
    name: String,
    preprocessor: Option<RawPreprocessor>,
}

impl ResourceRoute {
    /// Runs the port's preprocessing, if any, here on the controlling thread
    /// and packs its result with the payload.
    fn delivery(&self, resource: Resource) -> ExecTask {
        let then = match (&self.preprocessor, &resource) {
            (Some(preprocess), Resource::Raw(raw)) => preprocess(raw.as_ref()),
            _ => None,
        };
        deliver_resource(self.port, resource, then)
    }
}

fn resource_listener(
    route: ResourceRoute,
    node: Weak<NodeCell>,
    queue: Weak<ExecSender>,
    state: Arc<ArcSwap<ExecutionState>>,
    document_dir: Option<PathBuf>,
) -> impl Fn(&String) + 'static {
    move |value: &String| {
        if node.strong_count() == 0 {
            return;
        }
        let Some(path) = resolve_path(value, document_dir.as_deref()) else {
            return;
        };
        let sample_rate = state.load().sample_rate;
        match load_resource(route.kind, &path, sample_rate) {
            Ok(resource) => match queue.upgrade() {
                Some(queue) => {
                    if queue.enqueue(route.delivery(resource)).is_err() {
                        warn!(port = %route.name, "execution queue full, resource dropped");
                    }
                }
                None => trace!(port = %route.name, "node gone, resource dropped"),
            },
            Err(e) => warn!(port = %route.name, error = %e, "resource load failed"),
        }
    }
}

/// Per-tick audio-side state, boxed so `retire` can move it whole.
struct TickState {
    inputs: Vec<SlotReader<ControlValue>>,
    outputs: Vec<SlotWriter<ControlValue>>,
    feedback: Vec<SlotWriter<ControlValue>>,
    frame: ControlFrame,
    state: Arc<ArcSwap<ExecutionState>>,
    faulted: Arc<AtomicBool>,
}

/// Audio-thread half of a bridge. Owns a strong node reference until retired.
pub struct ProcessHandle {
    node: Option<Arc<NodeCell>>,
    exec: Box<ExecReceiver>,
    tick: Box<TickState>,
}

impl ProcessHandle {
    /// One tick: queued tasks, then control edits, then the node itself,
    /// then outputs. `audio` is interleaved and `frames` long per channel.
    /// Returns false when the node did not run and the block was silenced.
    pub fn process(&mut self, audio: &mut [f32], frames: usize) -> bool {
        if self.tick.faulted.load(Ordering::Relaxed) {
            audio.fill(0.0);
            return false;
        }
        let Some(cell) = self.node.as_ref() else {
            audio.fill(0.0);
            return false;
        };

        let sample_rate = self.tick.state.load().sample_rate;
        let channels = if frames == 0 { 0 } else { audio.len() / frames };
        let exec = &mut self.exec;
        let tick = &mut *self.tick;

        // Queued tasks run node code too, so they share the fault boundary.
        let ran = cell.try_with(|node| {
            panic::catch_unwind(AssertUnwindSafe(|| {
                exec.run_all(&mut *node);
                tick.frame.begin_tick();
                for (i, reader) in tick.inputs.iter_mut().enumerate() {
                    if let Some(v) = reader.read_latest() {
                        tick.frame.receive(i, v);
                    }
                }
                let mut ctx = TickContext::new(frames, channels, sample_rate, &mut tick.frame);
                node.process(audio, &mut ctx);
            }))
            .is_ok()
        });

        match ran {
            NodeAccess::Ran(true) => {
                for (i, v) in tick.frame.changed_outputs() {
                    tick.outputs[i].write(v);
                }
                for (i, v) in tick.frame.feedback_inputs() {
                    tick.feedback[i].write(v);
                }
                true
            }
            NodeAccess::Ran(false) | NodeAccess::Poisoned => {
                tick.faulted.store(true, Ordering::Relaxed);
                audio.fill(0.0);
                false
            }
            NodeAccess::Busy => {
                audio.fill(0.0);
                false
            }
        }
    }

    /// Set once node code panicked; the node is not run again.
    pub fn is_faulted(&self) -> bool {
        self.tick.faulted.load(Ordering::Relaxed)
    }

    pub fn fault_flag(&self) -> Arc<AtomicBool> {
        self.tick.faulted.clone()
    }

    /// Hand the node reference, the execution queue with any tasks that never
    /// ran, and the per-tick buffers to the controlling thread for release.
    /// Nothing is freed on the calling thread.
    pub fn retire(self) {
        let ProcessHandle { node, exec, tick } = self;
        if let Some(node) = node {
            exec.dispose(Garbage::Node(node));
        }
        exec.dispose(Garbage::Other(tick));
        exec.retire();
    }
}
