#[cfg(test)]
mod tests {
    use crate::executor::{ExecutionContext, Executor, ExecutorState, ProcessHandle};
    use crate::exec_queue::for_node;
    use crate::gpu::testing::RecordingRegistry;
    use crate::gpu::GpuNode;
    use crate::loaders::{RawFile, Resource};
    use crate::message_bus::decode;
    use crate::node::{NodeFactory, NodeInstance, ProcessNode, RawPreprocessor, TickContext};
    use crate::nodes::{GainFactory, PlayerCommand, PlayerStatus, SamplePlayerFactory};
    use crate::ports::ProcessElement;
    use crate::task_pool::TaskPool;
    use crate::ui_pool::UiThreadPool;
    use crate::event_loop::EventLoop;
    use crate::worker::WorkerHandle;
    use crossbeam_channel::{Receiver, bounded};
    use crux_shared::{
        BridgeConfig, BridgeError, ControlValue, ExecutionState, NodeClass, NodeDescriptor, PortDescriptor, RawMode, ResourceKind,
    };
    use std::any::Any;
    use std::cell::RefCell;
    use std::path::Path;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::{self, ThreadId};
    use std::time::{Duration, Instant};

    fn context(document_dir: Option<&Path>) -> ExecutionContext {
        let config = BridgeConfig::default();
        let tasks = Arc::new(TaskPool::new(2, 64, Duration::from_millis(5)).unwrap());
        let ctx = ExecutionContext::new(
            config,
            EventLoop::new(Duration::from_millis(5)),
            tasks,
            Arc::new(UiThreadPool::with_size(2)),
        );
        match document_dir {
            Some(dir) => ctx.with_document_dir(dir),
            None => ctx,
        }
    }

    /// Tick the audio side and refresh the controlling side until `done`.
    fn pump(el: &EventLoop, handle: &mut ProcessHandle, mut done: impl FnMut() -> bool) -> bool {
        let mut audio = vec![0.0f32; 128];
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            handle.process(&mut audio, 64);
            el.tick();
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn write_wav(path: &Path, rate: u32, frames: usize, value: f32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..frames {
            writer.write_sample(value).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn capture_statuses(element: &ProcessElement) -> Rc<RefCell<Vec<PlayerStatus>>> {
        let statuses = Rc::new(RefCell::new(Vec::new()));
        element.set_to_ui({
            let statuses = statuses.clone();
            move |m| {
                if let Some(s) = decode::<PlayerStatus>(m) {
                    statuses.borrow_mut().push(s);
                }
            }
        });
        statuses
    }

    /// Echoes its control input to its control output whenever it changes,
    /// and asks the worker for a result when a gate is provided.
    struct Echo {
        gate: Option<Receiver<()>>,
        applied: Arc<AtomicBool>,
        worker: Option<WorkerHandle>,
    }

    impl ProcessNode for Echo {
        fn process(&mut self, _audio: &mut [f32], ctx: &mut TickContext<'_>) {
            if ctx.control_changed(0) {
                let v = ctx.control(0);
                ctx.set_output(0, v);
                if let (Some(worker), Some(gate)) = (&self.worker, &self.gate) {
                    let gate = gate.clone();
                    worker.request(move || {
                        let _ = gate.recv_timeout(Duration::from_secs(5));
                        Some(for_node::<Echo, _>(|p| p.applied.store(true, Ordering::SeqCst)))
                    });
                }
            }
        }

        fn connect_worker(&mut self, worker: WorkerHandle) {
            self.worker = Some(worker);
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct EchoFactory {
        gate: Option<Receiver<()>>,
        applied: Arc<AtomicBool>,
    }

    impl EchoFactory {
        fn new(gate: Option<Receiver<()>>) -> Self {
            Self {
                gate,
                applied: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl NodeFactory for EchoFactory {
        fn descriptor(&self) -> NodeDescriptor {
            let d = NodeDescriptor::new("echo", NodeClass::Cpu)
                .input(PortDescriptor::control("x", 10i32))
                .output(PortDescriptor::control("echo", 0i32));
            if self.gate.is_some() { d.with_worker() } else { d }
        }

        fn create(&self, _state: &ExecutionState) -> NodeInstance {
            NodeInstance::Cpu(Box::new(Echo {
                gate: self.gate.clone(),
                applied: self.applied.clone(),
                worker: None,
            }))
        }
    }

    #[test]
    fn test_edits_between_ticks_coalesce() {
        let factory = EchoFactory::new(None);
        let element = ProcessElement::from_descriptor(&factory.descriptor());
        let ctx = context(None);
        let el = ctx.event_loop.clone();
        let mut exec = Executor::new(element.clone(), &factory, ctx).unwrap();
        let mut handle = exec.take_process_handle().unwrap();

        let echoed = Rc::new(RefCell::new(Vec::new()));
        element.control_outlet("echo").unwrap().on_value_changed({
            let echoed = echoed.clone();
            move |v| echoed.borrow_mut().push(*v)
        });

        // The initial value reaches the node on the first tick.
        let mut audio = vec![0.0f32; 16];
        handle.process(&mut audio, 8);
        el.tick();
        assert_eq!(*echoed.borrow(), vec![ControlValue::Int(10)]);

        let inlet = element.control_inlet("x").unwrap();
        inlet.set_value(ControlValue::Int(20));
        inlet.set_value(ControlValue::Int(45));
        inlet.set_value(ControlValue::Int(63));
        handle.process(&mut audio, 8);
        handle.process(&mut audio, 8);
        el.tick();
        println!("[Test] echoed: {:?}", echoed.borrow());
        assert_eq!(*echoed.borrow(), vec![ControlValue::Int(10), ControlValue::Int(63)]);
    }

    #[test]
    fn test_random_edit_bursts_keep_the_last_value() {
        let factory = EchoFactory::new(None);
        let element = ProcessElement::from_descriptor(&factory.descriptor());
        let ctx = context(None);
        let el = ctx.event_loop.clone();
        let mut exec = Executor::new(element.clone(), &factory, ctx).unwrap();
        let mut handle = exec.take_process_handle().unwrap();
        let inlet = element.control_inlet("x").unwrap();
        let outlet = element.control_outlet("echo").unwrap();
        let mut audio = vec![0.0f32; 16];

        let mut rng = fastrand::Rng::with_seed(7);
        for _ in 0..200 {
            let mut last = 0;
            for _ in 0..rng.usize(1..6) {
                last = rng.i32(-1000..1000);
                inlet.set_value(ControlValue::Int(last));
            }
            handle.process(&mut audio, 8);
            el.tick();
            assert_eq!(outlet.value(), ControlValue::Int(last));
        }
    }

    #[test]
    fn test_clamped_input_is_mirrored_back() {
        let element = ProcessElement::from_descriptor(&GainFactory.descriptor());
        let ctx = context(None);
        let el = ctx.event_loop.clone();
        let mut exec = Executor::new(element.clone(), &GainFactory, ctx).unwrap();
        let mut handle = exec.take_process_handle().unwrap();

        let gain = element.control_inlet("gain").unwrap();
        gain.set_value(ControlValue::Float(10.0));
        let mut audio = vec![0.25f32; 16];
        handle.process(&mut audio, 8);
        el.tick();

        assert_eq!(gain.value(), ControlValue::Float(10.0));
        assert_eq!(gain.execution_value(), ControlValue::Float(2.0));
        assert_eq!(element.control_outlet("peak").unwrap().value(), ControlValue::Float(0.5));
    }

    #[test]
    fn test_worker_result_dropped_after_teardown() {
        let (gate_tx, gate_rx) = bounded::<()>(1);
        let factory = EchoFactory::new(Some(gate_rx));
        let applied = factory.applied.clone();
        let element = ProcessElement::from_descriptor(&factory.descriptor());
        let ctx = context(None);
        let el = ctx.event_loop.clone();
        let mut exec = Executor::new(element.clone(), &factory, ctx).unwrap();
        let mut handle = exec.take_process_handle().unwrap();

        let mut audio = vec![0.0f32; 16];
        handle.process(&mut audio, 8);
        assert_eq!(exec.outstanding_requests(), 1);

        exec.cleanup();
        handle.retire();
        gate_tx.send(()).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while exec.outstanding_requests() > 0 && Instant::now() < deadline {
            el.process_events();
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(exec.outstanding_requests(), 0);
        assert_eq!(exec.worker_stats().discarded(), 1);
        assert_eq!(exec.worker_stats().applied(), 0);
        assert!(!applied.load(Ordering::SeqCst));
        assert_eq!(exec.state(), ExecutorState::Destroyed);
    }

    #[test]
    fn test_worker_result_applied_at_a_later_tick() {
        let (gate_tx, gate_rx) = bounded::<()>(1);
        let factory = EchoFactory::new(Some(gate_rx));
        let applied = factory.applied.clone();
        let element = ProcessElement::from_descriptor(&factory.descriptor());
        let ctx = context(None);
        let el = ctx.event_loop.clone();
        let mut exec = Executor::new(element, &factory, ctx).unwrap();
        let mut handle = exec.take_process_handle().unwrap();

        gate_tx.send(()).unwrap();
        assert!(pump(&el, &mut handle, || applied.load(Ordering::SeqCst)));
        assert_eq!(exec.worker_stats().applied(), 1);
    }

    #[test]
    fn test_sound_is_delivered_at_tick_start() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("tone.wav"), 48_000, 480, 0.5);

        let element = ProcessElement::from_descriptor(&SamplePlayerFactory.descriptor());
        let statuses = capture_statuses(&element);
        let ctx = context(Some(dir.path()));
        let el = ctx.event_loop.clone();
        let mut exec = Executor::new(element.clone(), &SamplePlayerFactory, ctx).unwrap();
        let mut handle = exec.take_process_handle().unwrap();

        element.resource_inlet("sample").unwrap().set_path("tone.wav");
        el.tick();
        assert!(statuses.borrow().is_empty(), "delivered before any tick ran");

        let mut audio = vec![0.0f32; 128];
        handle.process(&mut audio, 64);
        assert!(audio.iter().all(|s| (*s - 0.5).abs() < 1e-6));
        el.tick();
        assert_eq!(
            statuses.borrow().first(),
            Some(&PlayerStatus::Loaded {
                frames: 480,
                channels: 1,
                sample_rate: 48_000.0
            })
        );

        // Normalisation comes back from the worker pool.
        assert!(pump(&el, &mut handle, || statuses
            .borrow()
            .iter()
            .any(|s| *s == PlayerStatus::Normalized { gain: 2.0 })));
    }

    #[test]
    fn test_same_path_twice_reloads_twice() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("a.wav"), 48_000, 64, 0.25);

        let element = ProcessElement::from_descriptor(&SamplePlayerFactory.descriptor());
        let statuses = capture_statuses(&element);
        let ctx = context(Some(dir.path()));
        let el = ctx.event_loop.clone();
        let mut exec = Executor::new(element.clone(), &SamplePlayerFactory, ctx).unwrap();
        let mut handle = exec.take_process_handle().unwrap();

        let port = element.resource_inlet("sample").unwrap();
        port.set_path("a.wav");
        port.set_path("a.wav");
        let loaded = || {
            statuses
                .borrow()
                .iter()
                .filter(|s| matches!(s, PlayerStatus::Loaded { .. }))
                .count()
        };
        assert!(pump(&el, &mut handle, || loaded() == 2));
    }

    #[test]
    fn test_redelivering_the_same_sound_keeps_the_output_level() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("a.wav"), 48_000, 4800, 0.5);

        let element = ProcessElement::from_descriptor(&SamplePlayerFactory.descriptor());
        let port = element.resource_inlet("sample").unwrap().clone();
        port.set_path("a.wav");
        element.control_inlet("loop").unwrap().set_value(ControlValue::Bool(true));
        let statuses = capture_statuses(&element);
        let ctx = context(Some(dir.path()));
        let el = ctx.event_loop.clone();
        let mut exec = Executor::new(element.clone(), &SamplePlayerFactory, ctx).unwrap();
        let mut handle = exec.take_process_handle().unwrap();

        assert!(pump(&el, &mut handle, || statuses
            .borrow()
            .contains(&PlayerStatus::Normalized { gain: 2.0 })));
        let mut audio = vec![0.0f32; 128];
        handle.process(&mut audio, 64);
        let before = audio.clone();
        assert!(before.iter().all(|s| (*s - 1.0).abs() < 1e-6));

        port.set_path("a.wav");
        handle.process(&mut audio, 64);
        el.tick();
        let loaded = statuses
            .borrow()
            .iter()
            .filter(|s| matches!(s, PlayerStatus::Loaded { .. }))
            .count();
        assert_eq!(loaded, 2);
        assert_eq!(audio, before);
    }

    #[test]
    fn test_failed_load_keeps_current_sound() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("good.wav"), 48_000, 4096, 0.5);
        std::fs::write(dir.path().join("bad.wav"), b"not a wave file").unwrap();

        let element = ProcessElement::from_descriptor(&SamplePlayerFactory.descriptor());
        let port = element.resource_inlet("sample").unwrap().clone();
        port.set_path("good.wav");
        let statuses = capture_statuses(&element);
        let ctx = context(Some(dir.path()));
        let el = ctx.event_loop.clone();
        let mut exec = Executor::new(element.clone(), &SamplePlayerFactory, ctx).unwrap();
        let mut handle = exec.take_process_handle().unwrap();

        // Loaded synchronously during setup.
        el.tick();
        assert_eq!(statuses.borrow().len(), 1);

        port.set_path("bad.wav");
        port.set_path("missing.wav");
        let mut audio = vec![0.0f32; 128];
        handle.process(&mut audio, 64);
        el.tick();
        assert!(audio.iter().any(|s| *s != 0.0));
        assert!(!statuses.borrow().iter().skip(1).any(|s| matches!(s, PlayerStatus::Loaded { .. })));
    }

    #[test]
    fn test_gui_message_reaches_the_node() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("short.wav"), 48_000, 32, 0.5);

        let element = ProcessElement::from_descriptor(&SamplePlayerFactory.descriptor());
        element.resource_inlet("sample").unwrap().set_path("short.wav");
        let statuses = capture_statuses(&element);
        let ctx = context(Some(dir.path()));
        let el = ctx.event_loop.clone();
        let mut exec = Executor::new(element.clone(), &SamplePlayerFactory, ctx).unwrap();
        let mut handle = exec.take_process_handle().unwrap();
        let gui = exec.gui_sender().unwrap();

        let mut audio = vec![0.0f32; 128];
        handle.process(&mut audio, 64);
        el.tick();
        let finished = |s: &Vec<PlayerStatus>| s.iter().filter(|s| **s == PlayerStatus::Finished).count();
        assert_eq!(finished(&statuses.borrow()), 1);

        assert!(gui.send_typed(&PlayerCommand::Restart));
        handle.process(&mut audio, 64);
        el.tick();
        assert_eq!(finished(&statuses.borrow()), 2);

        exec.cleanup();
        assert!(!gui.send_typed(&PlayerCommand::Restart));
        assert!(!element.has_to_ui());
    }

    #[test]
    fn test_rate_change_redecodes_sounds() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("tone.wav"), 48_000, 4800, 0.5);

        let element = ProcessElement::from_descriptor(&SamplePlayerFactory.descriptor());
        element.resource_inlet("sample").unwrap().set_path("tone.wav");
        let statuses = capture_statuses(&element);
        let ctx = context(Some(dir.path()));
        let el = ctx.event_loop.clone();
        let mut exec = Executor::new(element.clone(), &SamplePlayerFactory, ctx).unwrap();
        let mut handle = exec.take_process_handle().unwrap();

        let new_state = ExecutionState {
            sample_rate: 24_000.0,
            ..ExecutionState::default()
        };
        exec.audio_configuration_changed(new_state).unwrap();
        let expected = PlayerStatus::Loaded {
            frames: 2400,
            channels: 1,
            sample_rate: 24_000.0,
        };
        assert!(pump(&el, &mut handle, || statuses.borrow().contains(&expected)));
    }

    struct Shader {
        seen: Arc<Mutex<Vec<ControlValue>>>,
    }

    impl GpuNode for Shader {
        fn update(&mut self, controls: &[ControlValue], outputs: &mut [ControlValue]) {
            *self.seen.lock().unwrap() = controls.to_vec();
            outputs[0] = ControlValue::Float(controls[0].as_f32() * 2.0);
        }
    }

    struct ShaderFactory {
        seen: Arc<Mutex<Vec<ControlValue>>>,
    }

    impl NodeFactory for ShaderFactory {
        fn descriptor(&self) -> NodeDescriptor {
            NodeDescriptor::new("shader", NodeClass::Gpu)
                .input(PortDescriptor::control("brightness", 0.5f32))
                .output(PortDescriptor::control("glow", 0.0f32))
        }

        fn create(&self, _state: &ExecutionState) -> NodeInstance {
            NodeInstance::Gpu(Box::new(Shader { seen: self.seen.clone() }))
        }
    }

    #[test]
    fn test_gpu_node_registers_and_unregisters_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let factory = ShaderFactory { seen: seen.clone() };
        let registry = Arc::new(RecordingRegistry::default());
        let element = ProcessElement::from_descriptor(&factory.descriptor());
        let ctx = context(None).with_gpu(registry.clone());
        let mut exec = Executor::new(element.clone(), &factory, ctx).unwrap();

        let id = exec.gpu_id().unwrap();
        assert!(exec.take_process_handle().is_none());
        assert!(exec.gui_sender().is_none());
        assert_eq!(*registry.registered.lock().unwrap(), vec![id]);

        element.control_inlet("brightness").unwrap().set_value(ControlValue::Float(0.9));
        registry.nodes.lock().unwrap().get_mut(&id).unwrap().render_frame();
        assert_eq!(*seen.lock().unwrap(), vec![ControlValue::Float(0.9)]);
        exec.refresh();
        assert_eq!(element.control_outlet("glow").unwrap().value(), ControlValue::Float(1.8));

        exec.cleanup();
        drop(exec);
        assert_eq!(*registry.unregistered.lock().unwrap(), vec![id]);
        assert!(registry.nodes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_gpu_node_without_registry_fails() {
        let factory = ShaderFactory {
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let element = ProcessElement::from_descriptor(&factory.descriptor());
        let result = Executor::new(element, &factory, context(None));
        assert!(matches!(result, Err(BridgeError::NoGpuRegistry(name)) if name == "shader"));
    }

    /// Passes audio through and panics on any message from its UI.
    struct Fragile;

    impl ProcessNode for Fragile {
        fn process(&mut self, _audio: &mut [f32], _ctx: &mut TickContext<'_>) {}

        fn process_message(&mut self, _message: &[u8]) {
            panic!("bad message");
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct FragileFactory;

    impl NodeFactory for FragileFactory {
        fn descriptor(&self) -> NodeDescriptor {
            NodeDescriptor::new("fragile", NodeClass::Cpu)
        }

        fn create(&self, _state: &ExecutionState) -> NodeInstance {
            NodeInstance::Cpu(Box::new(Fragile))
        }
    }

    #[test]
    fn test_panic_in_queued_task_faults_the_node() {
        let element = ProcessElement::from_descriptor(&FragileFactory.descriptor());
        let mut exec = Executor::new(element, &FragileFactory, context(None)).unwrap();
        let mut handle = exec.take_process_handle().unwrap();
        let gui = exec.gui_sender().unwrap();

        let mut audio = vec![0.5f32; 16];
        assert!(handle.process(&mut audio, 8));
        assert!(!handle.is_faulted());

        assert!(gui.send(vec![1, 2, 3]));
        assert!(!handle.process(&mut audio, 8));
        assert!(handle.is_faulted());
        assert!(audio.iter().all(|s| *s == 0.0));

        audio.fill(0.5);
        assert!(!handle.process(&mut audio, 8));
        assert!(audio.iter().all(|s| *s == 0.0));
    }

    /// Holds a text file and the line count its port worked out at load time.
    struct Lexicon {
        text: Option<Arc<RawFile>>,
        lines: usize,
        seen: Arc<Mutex<Vec<(usize, usize)>>>,
    }

    impl ProcessNode for Lexicon {
        fn process(&mut self, _audio: &mut [f32], _ctx: &mut TickContext<'_>) {
            if let Some(text) = &self.text {
                self.seen.lock().unwrap().push((text.bytes().len(), self.lines));
            }
        }

        fn resource_loaded(&mut self, _port: usize, resource: Resource) -> Option<Resource> {
            let Resource::Raw(raw) = resource else {
                return Some(resource);
            };
            self.lines = 0;
            self.text.replace(raw).map(Resource::Raw)
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[derive(Default)]
    struct LexiconFactory {
        seen: Arc<Mutex<Vec<(usize, usize)>>>,
        counted_on: Arc<Mutex<Vec<ThreadId>>>,
    }

    impl NodeFactory for LexiconFactory {
        fn descriptor(&self) -> NodeDescriptor {
            let text = RawMode { text: true, mmap: false };
            NodeDescriptor::new("lexicon", NodeClass::Cpu).input(PortDescriptor::resource("words", ResourceKind::Raw(text)))
        }

        fn create(&self, _state: &ExecutionState) -> NodeInstance {
            NodeInstance::Cpu(Box::new(Lexicon {
                text: None,
                lines: 0,
                seen: self.seen.clone(),
            }))
        }

        fn raw_preprocessor(&self, port: usize) -> Option<RawPreprocessor> {
            if port != 0 {
                return None;
            }
            let counted_on = self.counted_on.clone();
            Some(Arc::new(move |raw: &RawFile| {
                counted_on.lock().unwrap().push(thread::current().id());
                let lines = raw.bytes().iter().filter(|b| **b == b'\n').count();
                Some(for_node::<Lexicon, _>(move |node| node.lines = lines))
            }))
        }
    }

    #[test]
    fn test_raw_preprocessing_lands_with_the_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("words.txt"), b"a\r\nb\r\nc\r\n").unwrap();
        std::fs::write(dir.path().join("more.txt"), b"x\ny\n").unwrap();

        let factory = LexiconFactory::default();
        let element = ProcessElement::from_descriptor(&factory.descriptor());
        let port = element.resource_inlet("words").unwrap().clone();
        port.set_path("words.txt");
        let mut exec = Executor::new(element, &factory, context(Some(dir.path()))).unwrap();
        let mut handle = exec.take_process_handle().unwrap();

        let mut audio = vec![0.0f32; 16];
        handle.process(&mut audio, 8);
        assert_eq!(factory.seen.lock().unwrap().last(), Some(&(6, 3)));

        port.set_path("more.txt");
        handle.process(&mut audio, 8);
        assert_eq!(factory.seen.lock().unwrap().last(), Some(&(4, 2)));

        let here = thread::current().id();
        let counted_on = factory.counted_on.lock().unwrap();
        assert_eq!(counted_on.len(), 2);
        assert!(counted_on.iter().all(|id| *id == here));
    }
}
