//! Synchronous resource loaders.
//!
//! Each loader turns a path into an immutable payload behind an `Arc`, or a
//! [`LoadError`]. They never touch audio-thread state and are safe to call
//! concurrently for different paths.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crux_shared::{LoadError, RawMode, ResourceKind};
use midly::{MetaMessage, MidiMessage, Smf, Timing, TrackEventKind};

use crate::resampler::RateConverter;

/// Decoded audio, one buffer per channel, at the rate it was requested at.
#[derive(Debug)]
pub struct SoundFile {
    pub path: PathBuf,
    pub sample_rate: f64,
    pub channels: Vec<Vec<f32>>,
}

impl SoundFile {
    pub fn frames(&self) -> usize {
        self.channels.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MidiEvent {
    /// Absolute position in ticks from the start of the track.
    pub tick: u64,
    pub bytes: [u8; 3],
    pub len: u8,
}

impl MidiEvent {
    pub fn message(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

#[derive(Debug)]
pub struct MidiFile {
    pub path: PathBuf,
    /// `None` for SMPTE-timed files.
    pub ticks_per_beat: Option<u16>,
    pub tracks: Vec<Vec<MidiEvent>>,
    /// `(tick, microseconds per beat)` in file order.
    pub tempo_changes: Vec<(u64, u32)>,
}

#[derive(Debug)]
pub enum RawData {
    Owned(Vec<u8>),
    Mapped(memmap2::Mmap),
}

#[derive(Debug)]
pub struct RawFile {
    pub path: PathBuf,
    pub data: RawData,
}

impl RawFile {
    pub fn bytes(&self) -> &[u8] {
        match &self.data {
            RawData::Owned(v) => v,
            RawData::Mapped(m) => m,
        }
    }
}

/// A loaded payload as delivered to a node.
#[derive(Debug, Clone)]
pub enum Resource {
    Sound(Arc<SoundFile>),
    Midi(Arc<MidiFile>),
    Raw(Arc<RawFile>),
}

impl Resource {
    pub fn path(&self) -> &Path {
        match self {
            Resource::Sound(s) => &s.path,
            Resource::Midi(m) => &m.path,
            Resource::Raw(r) => &r.path,
        }
    }

    pub fn as_sound(&self) -> Option<&Arc<SoundFile>> {
        match self {
            Resource::Sound(s) => Some(s),
            _ => None,
        }
    }
}

/// Turn a port's textual value into a file path. Blank values name nothing;
/// relative paths are looked up next to the document.
pub fn resolve_path(value: &str, document_dir: Option<&Path>) -> Option<PathBuf> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    let path = PathBuf::from(trimmed);
    match document_dir {
        Some(dir) if path.is_relative() => Some(dir.join(path)),
        _ => Some(path),
    }
}

pub fn load_resource(kind: ResourceKind, path: &Path, sample_rate: f64) -> Result<Resource, LoadError> {
    match kind {
        ResourceKind::Sound => load_soundfile(path, sample_rate).map(Resource::Sound),
        ResourceKind::Midi => load_midifile(path).map(Resource::Midi),
        ResourceKind::Raw(mode) => load_rawfile(path, mode).map(Resource::Raw),
    }
}

pub fn load_soundfile(path: &Path, sample_rate: f64) -> Result<Arc<SoundFile>, LoadError> {
    if !path.exists() {
        return Err(LoadError::Missing(path.to_path_buf()));
    }
    let reader = hound::WavReader::open(path).map_err(|e| LoadError::decode(path, e))?;
    let spec = reader.spec();
    let channel_count = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LoadError::decode(path, e))?,
        hound::SampleFormat::Int => {
            let max_val = 2.0_f32.powi(spec.bits_per_sample as i32 - 1);
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|x| x as f32 / max_val))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| LoadError::decode(path, e))?
        }
    };

    let mut channels = vec![Vec::with_capacity(interleaved.len() / channel_count); channel_count];
    for frame in interleaved.chunks_exact(channel_count) {
        for (dst, &s) in channels.iter_mut().zip(frame) {
            dst.push(s);
        }
    }

    let file_rate = spec.sample_rate as f64;
    let channels = if (file_rate - sample_rate).abs() > f64::EPSILON {
        RateConverter::convert(&channels, file_rate, sample_rate).map_err(|e| LoadError::decode(path, e))?
    } else {
        channels
    };

    tracing::debug!(path = %path.display(), channels = channel_count, file_rate, sample_rate, "decoded soundfile");
    Ok(Arc::new(SoundFile { path: path.to_path_buf(), sample_rate, channels }))
}

pub fn load_midifile(path: &Path) -> Result<Arc<MidiFile>, LoadError> {
    let bytes = std::fs::read(path).map_err(|e| LoadError::io(path, e))?;
    let smf = Smf::parse(&bytes).map_err(|e| LoadError::decode(path, e))?;

    let ticks_per_beat = match smf.header.timing {
        Timing::Metrical(t) => Some(t.as_int()),
        Timing::Timecode(..) => None,
    };

    let mut tempo_changes = Vec::new();
    let tracks = smf
        .tracks
        .iter()
        .map(|track| {
            let mut tick = 0u64;
            let mut events = Vec::with_capacity(track.len());
            for event in track {
                tick += event.delta.as_int() as u64;
                match event.kind {
                    TrackEventKind::Midi { channel, message } => {
                        events.push(encode_midi(tick, channel.as_int(), message));
                    }
                    TrackEventKind::Meta(MetaMessage::Tempo(t)) => tempo_changes.push((tick, t.as_int())),
                    _ => {}
                }
            }
            events
        })
        .collect();

    Ok(Arc::new(MidiFile { path: path.to_path_buf(), ticks_per_beat, tracks, tempo_changes }))
}

fn encode_midi(tick: u64, channel: u8, message: MidiMessage) -> MidiEvent {
    let (status, d1, d2, len) = match message {
        MidiMessage::NoteOff { key, vel } => (0x80, key.as_int(), vel.as_int(), 3),
        MidiMessage::NoteOn { key, vel } => (0x90, key.as_int(), vel.as_int(), 3),
        MidiMessage::Aftertouch { key, vel } => (0xA0, key.as_int(), vel.as_int(), 3),
        MidiMessage::Controller { controller, value } => (0xB0, controller.as_int(), value.as_int(), 3),
        MidiMessage::ProgramChange { program } => (0xC0, program.as_int(), 0, 2),
        MidiMessage::ChannelAftertouch { vel } => (0xD0, vel.as_int(), 0, 2),
        MidiMessage::PitchBend { bend } => {
            let raw = bend.0.as_int();
            (0xE0, (raw & 0x7F) as u8, (raw >> 7) as u8, 3)
        }
    };
    MidiEvent { tick, bytes: [status | (channel & 0x0F), d1, d2], len }
}

pub fn load_rawfile(path: &Path, mode: RawMode) -> Result<Arc<RawFile>, LoadError> {
    let mut file = File::open(path).map_err(|e| LoadError::io(path, e))?;
    let len = file.metadata().map_err(|e| LoadError::io(path, e))?.len();

    let data = if mode.mmap && len > 0 {
        // The mapping is read-only and lives as long as the payload.
        let map = unsafe { memmap2::Mmap::map(&file) }.map_err(|e| LoadError::io(path, e))?;
        RawData::Mapped(map)
    } else {
        let mut bytes = Vec::with_capacity(len as usize);
        file.read_to_end(&mut bytes).map_err(|e| LoadError::io(path, e))?;
        if mode.text {
            bytes = normalize_newlines(bytes);
        }
        RawData::Owned(bytes)
    };

    Ok(Arc::new(RawFile { path: path.to_path_buf(), data }))
}

fn normalize_newlines(bytes: Vec<u8>) -> Vec<u8> {
    if !bytes.contains(&b'\r') {
        return bytes;
    }
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(b);
    }
    out
}
