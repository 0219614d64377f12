use std::any::Any;
use std::sync::Arc;

use crux_shared::{ControlValue, ExecutionState, NodeClass, NodeDescriptor, PortDescriptor, ResourceKind};
use serde::{Deserialize, Serialize};

use crate::exec_queue::for_node;
use crate::loaders::{Resource, SoundFile};
use crate::message_bus::{ProcessorBus, decode};
use crate::node::{NodeFactory, NodeInstance, ProcessNode, TickContext};
use crate::worker::WorkerHandle;

pub const GAIN_MAX: f32 = 2.0;

/// Scales the block by `gain` and reports the block peak.
pub struct GainNode {
    gain: f32,
}

impl GainNode {
    pub fn new(gain: f32) -> Self {
        Self { gain }
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl ProcessNode for GainNode {
    fn process(&mut self, audio: &mut [f32], ctx: &mut TickContext<'_>) {
        if ctx.control_changed(0) {
            let clamped = ctx.control(0).clamped(0.0, GAIN_MAX);
            ctx.correct_control(0, clamped);
            self.gain = clamped.as_f32();
        }

        let mut peak = 0.0f32;
        for sample in audio.iter_mut() {
            *sample *= self.gain;
            peak = peak.max(sample.abs());
        }
        ctx.set_output(0, ControlValue::Float(peak));
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct GainFactory;

impl NodeFactory for GainFactory {
    fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor::new("gain", NodeClass::Cpu)
            .input(PortDescriptor::audio("in", 2))
            .input(PortDescriptor::ranged("gain", 1.0f32, 0.0, GAIN_MAX))
            .output(PortDescriptor::audio("out", 2))
            .output(PortDescriptor::control("peak", 0.0f32))
    }

    fn create(&self, _state: &ExecutionState) -> NodeInstance {
        NodeInstance::Cpu(Box::new(GainNode::new(1.0)))
    }
}

pub struct SineNode {
    phase: f32,
    frequency: f32,
    amplitude: f32,
}

impl SineNode {
    pub fn new(frequency: f32) -> Self {
        Self {
            phase: 0.0,
            frequency,
            amplitude: 0.5,
        }
    }
}

impl ProcessNode for SineNode {
    fn process(&mut self, audio: &mut [f32], ctx: &mut TickContext<'_>) {
        if ctx.control_changed(0) {
            let f = ctx.control(0).clamped(20.0, 20_000.0);
            ctx.correct_control(0, f);
            self.frequency = f.as_f32();
        }
        if ctx.control_changed(1) {
            self.amplitude = ctx.control(1).as_f32();
        }

        let channels = ctx.channels.max(1);
        let step = self.frequency / ctx.sample_rate as f32;
        for frame in audio.chunks_mut(channels) {
            let s = (self.phase * 2.0 * std::f32::consts::PI).sin() * self.amplitude;
            frame.fill(s);
            self.phase = (self.phase + step) % 1.0;
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct SineFactory;

impl NodeFactory for SineFactory {
    fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor::new("sine", NodeClass::Cpu)
            .input(PortDescriptor::ranged("frequency", 440.0f32, 20.0, 20_000.0))
            .input(PortDescriptor::ranged("amplitude", 0.5f32, 0.0, 1.0))
            .output(PortDescriptor::audio("out", 2))
    }

    fn create(&self, _state: &ExecutionState) -> NodeInstance {
        NodeInstance::Cpu(Box::new(SineNode::new(440.0)))
    }
}

/// What the player tells its UI.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PlayerStatus {
    Loaded { frames: u64, channels: u32, sample_rate: f64 },
    Normalized { gain: f32 },
    Finished,
}

/// What the UI can tell the player.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PlayerCommand {
    Restart,
    Stop,
}

/// Plays the sound on its `sample` port. Normalisation gain is computed on
/// the worker pool whenever a new sound arrives.
pub struct SamplePlayer {
    sound: Option<Arc<SoundFile>>,
    generation: u64,
    position: usize,
    playing: bool,
    level: f32,
    looping: bool,
    norm_gain: f32,
    worker: Option<WorkerHandle>,
    bus: Option<ProcessorBus>,
    finished_sent: bool,
}

impl SamplePlayer {
    pub fn new() -> Self {
        Self {
            sound: None,
            generation: 0,
            position: 0,
            playing: true,
            level: 1.0,
            looping: false,
            norm_gain: 1.0,
            worker: None,
            bus: None,
            finished_sent: false,
        }
    }

    pub fn sound(&self) -> Option<&Arc<SoundFile>> {
        self.sound.as_ref()
    }

    pub fn norm_gain(&self) -> f32 {
        self.norm_gain
    }

    pub fn position(&self) -> usize {
        self.position
    }

    fn notify(&mut self, status: PlayerStatus) {
        if let Some(bus) = &mut self.bus {
            bus.send_typed(&status);
        }
    }

    fn request_normalisation(&mut self, sound: Arc<SoundFile>) {
        let Some(worker) = &self.worker else {
            return;
        };
        let generation = self.generation;
        worker.request(move || {
            let peak = sound
                .channels
                .iter()
                .flat_map(|c| c.iter())
                .fold(0.0f32, |m, s| m.max(s.abs()));
            if peak <= f32::EPSILON {
                return None;
            }
            let gain = 1.0 / peak;
            Some(for_node::<SamplePlayer, _>(move |player| {
                if player.generation == generation {
                    player.norm_gain = gain;
                    player.notify(PlayerStatus::Normalized { gain });
                }
            }))
        });
    }
}

fn same_sound(a: &SoundFile, b: &SoundFile) -> bool {
    a.path == b.path && a.sample_rate == b.sample_rate && a.frames() == b.frames() && a.channel_count() == b.channel_count()
}

impl Default for SamplePlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessNode for SamplePlayer {
    fn process(&mut self, audio: &mut [f32], ctx: &mut TickContext<'_>) {
        if ctx.control_changed(0) {
            let level = ctx.control(0).clamped(0.0, GAIN_MAX);
            ctx.correct_control(0, level);
            self.level = level.as_f32();
        }
        if ctx.control_changed(1) {
            self.looping = ctx.control(1).as_bool();
        }

        audio.fill(0.0);
        let Some(sound) = self.sound.as_ref() else {
            return;
        };
        let frames = sound.frames();
        let source_channels = sound.channel_count();
        if frames == 0 || source_channels == 0 || !self.playing {
            return;
        }

        let channels = ctx.channels.max(1);
        let gain = self.level * self.norm_gain;
        for frame in audio.chunks_mut(channels) {
            if self.position >= frames {
                if !self.looping {
                    break;
                }
                self.position = 0;
            }
            for (c, out) in frame.iter_mut().enumerate() {
                *out = sound.channels[c % source_channels][self.position] * gain;
            }
            self.position += 1;
        }
        ctx.set_output(0, ControlValue::Float(self.position as f32 / frames as f32));

        if self.position >= frames && !self.looping && !self.finished_sent {
            self.finished_sent = true;
            self.notify(PlayerStatus::Finished);
        }
    }

    fn resource_loaded(&mut self, _port: usize, resource: Resource) -> Option<Resource> {
        let Resource::Sound(sound) = resource else {
            return Some(resource);
        };
        self.notify(PlayerStatus::Loaded {
            frames: sound.frames() as u64,
            channels: sound.channel_count() as u32,
            sample_rate: sound.sample_rate,
        });
        // The same file again: keep playing where we are, at the same level.
        let unchanged = self.sound.as_ref().is_some_and(|current| same_sound(current, &sound));
        if !unchanged {
            self.generation += 1;
            self.position = 0;
            self.norm_gain = 1.0;
            self.finished_sent = false;
            self.request_normalisation(sound.clone());
        }
        self.sound.replace(sound).map(Resource::Sound)
    }

    fn connect_worker(&mut self, worker: WorkerHandle) {
        self.worker = Some(worker);
    }

    fn connect_message_bus(&mut self, bus: ProcessorBus) {
        self.bus = Some(bus);
    }

    fn process_message(&mut self, message: &[u8]) {
        match decode::<PlayerCommand>(message) {
            Some(PlayerCommand::Restart) => {
                self.position = 0;
                self.playing = true;
                self.finished_sent = false;
            }
            Some(PlayerCommand::Stop) => self.playing = false,
            None => {}
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

pub struct SamplePlayerFactory;

impl NodeFactory for SamplePlayerFactory {
    fn descriptor(&self) -> NodeDescriptor {
        NodeDescriptor::new("sample player", NodeClass::Cpu)
            .input(PortDescriptor::resource("sample", ResourceKind::Sound))
            .input(PortDescriptor::ranged("level", 1.0f32, 0.0, GAIN_MAX))
            .input(PortDescriptor::control("loop", false))
            .output(PortDescriptor::audio("out", 2))
            .output(PortDescriptor::control("progress", 0.0f32))
            .with_worker()
            .with_message_bus()
    }

    fn create(&self, _state: &ExecutionState) -> NodeInstance {
        NodeInstance::Cpu(Box::new(SamplePlayer::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ControlFrame;
    use std::path::PathBuf;

    fn tick(node: &mut dyn ProcessNode, frame: &mut ControlFrame, audio: &mut [f32]) {
        frame.begin_tick();
        let frames = audio.len() / 2;
        let mut ctx = TickContext::new(frames, 2, 48_000.0, frame);
        node.process(audio, &mut ctx);
    }

    #[test]
    fn gain_clamps_and_reports_peak() {
        let mut node = GainNode::new(1.0);
        let mut frame = ControlFrame::new(vec![ControlValue::Float(1.0)], vec![ControlValue::Float(0.0)]);
        frame.begin_tick();
        frame.receive(0, ControlValue::Float(5.0));
        let mut audio = vec![0.25f32, -0.5, 0.1, 0.0];
        {
            let mut ctx = TickContext::new(2, 2, 48_000.0, &mut frame);
            node.process(&mut audio, &mut ctx);
        }
        assert_eq!(node.gain(), GAIN_MAX);
        assert_eq!(audio, vec![0.5, -1.0, 0.2, 0.0]);
        assert_eq!(frame.output(0), ControlValue::Float(1.0));
        assert_eq!(frame.input(0), ControlValue::Float(GAIN_MAX));
    }

    #[test]
    fn sine_fills_every_channel_alike() {
        let mut node = SineNode::new(1000.0);
        let mut frame = ControlFrame::new(vec![ControlValue::Float(1000.0), ControlValue::Float(0.5)], Vec::new());
        let mut audio = vec![0.0f32; 128];
        tick(&mut node, &mut frame, &mut audio);
        for pair in audio.chunks(2) {
            assert_eq!(pair[0], pair[1]);
        }
        assert!(audio.iter().any(|s| *s != 0.0));
        assert!(audio.iter().all(|s| s.abs() <= 0.5 + 1e-6));
    }

    #[test]
    fn player_plays_once_then_stays_silent() {
        let mut node = SamplePlayer::new();
        let sound = Arc::new(SoundFile {
            path: PathBuf::from("x.wav"),
            sample_rate: 48_000.0,
            channels: vec![vec![0.5; 3]],
        });
        assert!(node.resource_loaded(0, Resource::Sound(sound)).is_none());

        let mut frame = ControlFrame::new(
            vec![ControlValue::Float(1.0), ControlValue::Bool(false)],
            vec![ControlValue::Float(0.0)],
        );
        let mut audio = vec![0.0f32; 8];
        tick(&mut node, &mut frame, &mut audio);
        assert_eq!(audio, vec![0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.0, 0.0]);
        assert_eq!(frame.output(0), ControlValue::Float(1.0));

        tick(&mut node, &mut frame, &mut audio);
        assert!(audio.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn player_hands_back_the_previous_sound() {
        let mut node = SamplePlayer::new();
        let first = Arc::new(SoundFile {
            path: PathBuf::from("a.wav"),
            sample_rate: 48_000.0,
            channels: vec![vec![0.0; 4]],
        });
        let second = Arc::new(SoundFile {
            path: PathBuf::from("b.wav"),
            sample_rate: 48_000.0,
            channels: vec![vec![0.0; 4]],
        });
        node.resource_loaded(0, Resource::Sound(first.clone()));
        let released = node.resource_loaded(0, Resource::Sound(second));
        assert!(matches!(released, Some(Resource::Sound(s)) if Arc::ptr_eq(&s, &first)));
    }

    #[test]
    fn restart_command_rewinds() {
        let mut node = SamplePlayer::new();
        node.position = 10;
        node.playing = false;
        node.process_message(&bincode::serialize(&PlayerCommand::Restart).unwrap());
        assert_eq!(node.position(), 0);
        assert!(node.playing);
        node.process_message(b"\xff\xff\xff\xff\xff");
        assert_eq!(node.position(), 0);
    }

    #[test]
    fn same_sound_again_keeps_position_and_gain() {
        let mut node = SamplePlayer::new();
        let sound = |path: &str| {
            Arc::new(SoundFile {
                path: PathBuf::from(path),
                sample_rate: 48_000.0,
                channels: vec![vec![0.5; 16]],
            })
        };
        node.resource_loaded(0, Resource::Sound(sound("a.wav")));
        node.norm_gain = 2.0;
        node.position = 5;

        let released = node.resource_loaded(0, Resource::Sound(sound("a.wav")));
        assert!(released.is_some());
        assert_eq!(node.norm_gain(), 2.0);
        assert_eq!(node.position(), 5);

        node.resource_loaded(0, Resource::Sound(sound("b.wav")));
        assert_eq!(node.norm_gain(), 1.0);
        assert_eq!(node.position(), 0);
    }
}
