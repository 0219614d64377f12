use std::cell::Cell;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crux_engine::event_loop::EventLoop;
use crux_engine::executor::{ExecutionContext, Executor, ProcessHandle};
use crux_engine::nodes::{GainFactory, SamplePlayerFactory, SineFactory};
use crux_engine::ports::ProcessElement;
use crux_engine::task_pool::TaskPool;
use crux_engine::ui_pool::UiThreadPool;
use crux_engine::NodeFactory;
use crux_shared::{BridgeConfig, ControlValue, ExecutionState};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Runs demo nodes through the control bridge without a UI")]
struct Cli {
    /// JSON bridge configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// How long to run.
    #[arg(long, default_value_t = 5.0)]
    seconds: f64,

    /// Drive the nodes from a simulated audio thread instead of a device.
    #[arg(long)]
    offline: bool,

    /// Play this file instead of the sine sweep.
    #[arg(long)]
    sample: Option<PathBuf>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();
}

enum Driver {
    Device(cpal::Stream),
    Simulated {
        stop: Arc<AtomicBool>,
        thread: thread::JoinHandle<Vec<ProcessHandle>>,
    },
}

fn main() -> Result<(), anyhow::Error> {
    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => BridgeConfig::from_json_file(path)?,
        None => BridgeConfig::default(),
    };
    config.validate()?;
    info!(config = %serde_json::to_string(&config)?, "bridge configuration");

    let event_loop = EventLoop::new(config.ui_refresh_interval());
    let tasks = Arc::new(TaskPool::from_config(&config)?);
    let ctx = ExecutionContext::new(config.clone(), event_loop.clone(), tasks.clone(), UiThreadPool::instance());

    // The device decides the real rate and channel count.
    let device = if cli.offline { None } else { open_device() };
    if let Some((_, stream_config)) = &device {
        let state = ExecutionState {
            sample_rate: stream_config.sample_rate as f64,
            channels: stream_config.channels as usize,
            ..config.audio
        };
        ctx.state.store(Arc::new(state));
    }

    let mut executors = Vec::new();
    if let Some(sample) = &cli.sample {
        let element = ProcessElement::from_descriptor(&SamplePlayerFactory.descriptor());
        if let Some(port) = element.resource_inlet("sample") {
            port.set_path(sample.to_string_lossy());
        }
        executors.push(Executor::new(element, &SamplePlayerFactory, ctx.clone())?);
    } else {
        let sine = ProcessElement::from_descriptor(&SineFactory.descriptor());
        let started = Instant::now();
        if let Some(freq) = sine.control_inlet("frequency").cloned() {
            event_loop.connect_timer(move || {
                let t = started.elapsed().as_secs_f32();
                freq.set_value(ControlValue::Float(220.0 + (t * 110.0) % 660.0));
            });
        }
        executors.push(Executor::new(sine, &SineFactory, ctx.clone())?);
    }
    let gain = ProcessElement::from_descriptor(&GainFactory.descriptor());
    if let Some(peak) = gain.control_outlet("peak") {
        let last_report = Cell::new(Instant::now());
        peak.on_value_changed(move |v| {
            if last_report.get().elapsed() >= Duration::from_secs(1) {
                info!(peak = v.as_f32(), "output level");
                last_report.set(Instant::now());
            }
        });
    }
    executors.push(Executor::new(gain, &GainFactory, ctx.clone())?);

    let handles: Vec<ProcessHandle> = executors.iter_mut().filter_map(|e| e.take_process_handle()).collect();
    let driver = match device {
        Some((device, stream_config)) => Driver::Device(start_device(&device, &stream_config, handles)?),
        None => {
            let stop = Arc::new(AtomicBool::new(false));
            let state = ctx.current_state();
            let thread = thread::Builder::new().name("crux audio".into()).spawn({
                let stop = stop.clone();
                move || simulate(handles, state, stop)
            })?;
            Driver::Simulated { stop, thread }
        }
    };

    info!(seconds = cli.seconds, offline = device_less(&driver), "running");
    event_loop.run_for(Duration::from_secs_f64(cli.seconds.max(0.0)));

    match driver {
        Driver::Device(stream) => drop(stream),
        Driver::Simulated { stop, thread } => {
            stop.store(true, Ordering::Release);
            match thread.join() {
                Ok(handles) => handles.into_iter().for_each(ProcessHandle::retire),
                Err(_) => warn!("audio thread panicked"),
            }
        }
    }
    event_loop.tick();
    for mut executor in executors {
        executor.cleanup();
    }
    tasks.shutdown();
    info!(completed = tasks.completed(), "done");
    Ok(())
}

fn device_less(driver: &Driver) -> bool {
    matches!(driver, Driver::Simulated { .. })
}

fn open_device() -> Option<(cpal::Device, cpal::StreamConfig)> {
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        warn!("no output device, falling back to a simulated audio thread");
        return None;
    };
    let config = match device.default_output_config() {
        Ok(c) if c.sample_format() == cpal::SampleFormat::F32 => c,
        Ok(c) => {
            warn!(format = ?c.sample_format(), "unsupported sample format, falling back to a simulated audio thread");
            return None;
        }
        Err(e) => {
            warn!(error = %e, "no usable output config, falling back to a simulated audio thread");
            return None;
        }
    };
    let stream_config: cpal::StreamConfig = config.into();
    info!(?stream_config, "using output device");
    Some((device, stream_config))
}

fn start_device(
    device: &cpal::Device,
    stream_config: &cpal::StreamConfig,
    mut handles: Vec<ProcessHandle>,
) -> Result<cpal::Stream, anyhow::Error> {
    let channels = (stream_config.channels as usize).max(1);
    let err_fn = |err: cpal::StreamError| {
        let s = err.to_string();
        if !s.contains("underrun") && !s.contains("overrun") {
            eprintln!("an error occurred on stream: {}", s);
        }
    };
    let stream = device.build_output_stream(
        stream_config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let frames = data.len() / channels;
            for handle in handles.iter_mut() {
                handle.process(data, frames);
            }
        },
        err_fn,
        None,
    )?;
    stream.play()?;
    Ok(stream)
}

/// Stand-in audio thread: one block per buffer period until stopped.
fn simulate(mut handles: Vec<ProcessHandle>, state: ExecutionState, stop: Arc<AtomicBool>) -> Vec<ProcessHandle> {
    let frames = state.buffer_size.max(1);
    let period = Duration::from_secs_f64(frames as f64 / state.sample_rate);
    let mut buffer = vec![0.0f32; frames * state.channels.max(1)];
    let mut next = Instant::now();
    while !stop.load(Ordering::Acquire) {
        for handle in handles.iter_mut() {
            handle.process(&mut buffer, frames);
        }
        next += period;
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }
    handles
}
