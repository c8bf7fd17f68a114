//! Metering stream on the default microphone
//!
//! Uses cpal for cross-platform capture. The cpal stream lives in a dedicated
//! thread and is driven through a command channel. The input callback only
//! computes one peak per channel per hardware buffer and pushes it into a
//! ring buffer that the meter drains on demand.

use super::capture::{AudioConfig, CaptureBackend, CaptureError, CaptureStream};
use super::level::{amplitude_to_db, METER_FLOOR_DB};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    Device, FromSample, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
    SupportedStreamConfig,
};
use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

/// Number of buffer peaks kept per channel between two meter updates
const PEAK_HISTORY: usize = 4096;

type Reply = mpsc::Sender<Result<(), CaptureError>>;

/// Commands to control the capture thread
enum StreamCommand {
    Play(Reply),
    Pause(Reply),
    Release,
}

/// Sent back by the capture thread once the device is open
struct OpenedStream {
    peaks: HeapCons<f32>,
    channels: usize,
}

/// Opens metering streams on the system default input device
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CaptureBackend for CpalBackend {
    type Stream = MicrophoneStream;

    fn open(&self, config: &AudioConfig) -> Result<MicrophoneStream, CaptureError> {
        MicrophoneStream::open(config)
    }
}

/// Handle to an open microphone stream
pub struct MicrophoneStream {
    command_tx: mpsc::Sender<StreamCommand>,
    thread_handle: Option<JoinHandle<()>>,
    peaks: HeapCons<f32>,
    latest: Vec<f32>,
    recording: bool,
}

impl MicrophoneStream {
    /// Opens the stream in a dedicated thread and waits until the device is ready.
    ///
    /// `config` is a preference: the device default is used when it is not supported.
    pub fn open(config: &AudioConfig) -> Result<Self, CaptureError> {
        let (command_tx, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let preferred = config.clone();
        let thread_handle = thread::Builder::new()
            .name("dbmeter-capture".to_string())
            .spawn(move || run_capture_thread(preferred, ready_tx, command_rx))
            .map_err(|e| CaptureError::StreamError(e.to_string()))?;

        let opened = match ready_rx.recv().unwrap_or(Err(CaptureError::Released)) {
            Ok(opened) => opened,
            Err(e) => {
                let _ = thread_handle.join();
                return Err(e);
            }
        };

        Ok(Self {
            command_tx,
            thread_handle: Some(thread_handle),
            peaks: opened.peaks,
            latest: vec![0.0; opened.channels],
            recording: false,
        })
    }

    fn request(&self, command: fn(Reply) -> StreamCommand) -> Result<(), CaptureError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.command_tx
            .send(command(reply_tx))
            .map_err(|_| CaptureError::Released)?;
        reply_rx.recv().map_err(|_| CaptureError::Released)?
    }
}

impl CaptureStream for MicrophoneStream {
    fn record(&mut self) -> Result<(), CaptureError> {
        // Peaks captured before the pause are stale
        reset_peaks(&mut self.peaks, &mut self.latest);
        self.request(StreamCommand::Play)?;
        self.recording = true;
        tracing::info!("Audio capture started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        self.request(StreamCommand::Pause)?;
        self.recording = false;
        tracing::info!("Audio capture stopped");
        Ok(())
    }

    fn is_recording(&self) -> bool {
        self.recording
    }

    fn update_meters(&mut self) {
        refresh_peaks(&mut self.peaks, &mut self.latest);
    }

    fn peak_power(&self, channel: usize) -> f32 {
        peak_db(&self.latest, channel)
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        let _ = self.command_tx.send(StreamCommand::Release);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

/// List available input devices
pub fn list_input_devices() -> Vec<String> {
    let host = cpal::default_host();
    host.input_devices()
        .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
        .unwrap_or_default()
}

/// Absolute peak of each channel in an interleaved buffer, as f32 amplitude
fn channel_peaks<T>(samples: &[T], channels: usize) -> Vec<f32>
where
    T: Sample,
    f32: FromSample<T>,
{
    let mut peaks = vec![0.0f32; channels];
    for frame in samples.chunks(channels) {
        for (peak, &sample) in peaks.iter_mut().zip(frame) {
            *peak = peak.max(f32::from_sample(sample).abs());
        }
    }
    peaks
}

/// Keeps the most recent whole frame of buffered peaks in `latest`.
/// An empty ring reads as silence.
fn refresh_peaks(peaks: &mut HeapCons<f32>, latest: &mut [f32]) {
    let channels = latest.len();
    let mut updated = false;

    while channels > 0 && peaks.occupied_len() >= channels {
        for slot in latest.iter_mut() {
            if let Some(peak) = peaks.try_pop() {
                *slot = peak;
            }
        }
        updated = true;
    }

    if !updated {
        latest.iter_mut().for_each(|peak| *peak = 0.0);
    }
}

fn reset_peaks(peaks: &mut HeapCons<f32>, latest: &mut [f32]) {
    peaks.clear();
    latest.iter_mut().for_each(|peak| *peak = 0.0);
}

fn peak_db(latest: &[f32], channel: usize) -> f32 {
    latest
        .get(channel)
        .map(|&peak| amplitude_to_db(peak))
        .unwrap_or(METER_FLOOR_DB)
}

/// Candidate configs in order: the preferred one when the device supports it,
/// then the device default
fn candidate_configs(device: &Device, preferred: &AudioConfig) -> Vec<SupportedStreamConfig> {
    let rate = SampleRate(preferred.sample_rate);
    let mut candidates = Vec::with_capacity(2);

    if let Ok(mut ranges) = device.supported_input_configs() {
        let matching = ranges.find(|range| {
            range.channels() == preferred.channels
                && range.min_sample_rate() <= rate
                && rate <= range.max_sample_rate()
        });
        if let Some(range) = matching {
            candidates.push(range.with_sample_rate(rate));
        }
    }

    match device.default_input_config() {
        Ok(default) => candidates.push(default),
        Err(e) => tracing::warn!("No default input config: {}", e),
    }

    candidates
}

fn build_metering_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut producer: HeapProd<f32>,
) -> Result<Stream, CaptureError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let peaks = channel_peaks(data, channels);
                // Whole frames only, so channels never drift apart
                if producer.vacant_len() >= peaks.len() {
                    producer.push_slice(&peaks);
                }
            },
            |err| {
                tracing::error!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| CaptureError::ConfigError(e.to_string()))
}

fn build_with_config(
    device: &Device,
    supported: &SupportedStreamConfig,
) -> Result<(Stream, OpenedStream), CaptureError> {
    let channels = usize::from(supported.channels().max(1));
    let (producer, consumer) = HeapRb::<f32>::new(PEAK_HISTORY * channels).split();
    let stream_config: StreamConfig = supported.config();

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_metering_stream::<f32>(device, &stream_config, producer),
        SampleFormat::F64 => build_metering_stream::<f64>(device, &stream_config, producer),
        SampleFormat::I8 => build_metering_stream::<i8>(device, &stream_config, producer),
        SampleFormat::I16 => build_metering_stream::<i16>(device, &stream_config, producer),
        SampleFormat::I32 => build_metering_stream::<i32>(device, &stream_config, producer),
        SampleFormat::U8 => build_metering_stream::<u8>(device, &stream_config, producer),
        SampleFormat::U16 => build_metering_stream::<u16>(device, &stream_config, producer),
        SampleFormat::U32 => build_metering_stream::<u32>(device, &stream_config, producer),
        other => Err(CaptureError::ConfigError(format!(
            "Unsupported sample format: {:?}",
            other
        ))),
    }?;

    Ok((
        stream,
        OpenedStream {
            peaks: consumer,
            channels,
        },
    ))
}

fn build_stream(preferred: &AudioConfig) -> Result<(Stream, OpenedStream), CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(CaptureError::NoDevice)?;

    tracing::info!("Audio device: {:?}", device.name());

    let mut last_error = CaptureError::ConfigError("No usable input config".to_string());
    for supported in candidate_configs(&device, preferred) {
        match build_with_config(&device, &supported) {
            Ok((stream, opened)) => {
                tracing::info!(
                    "Audio config: {}Hz {}ch {:?}",
                    supported.sample_rate().0,
                    supported.channels(),
                    supported.sample_format()
                );

                // Some hosts start streams as soon as they are built
                if let Err(e) = stream.pause() {
                    tracing::debug!("Initial pause not supported: {}", e);
                }
                return Ok((stream, opened));
            }
            Err(e) => {
                tracing::warn!("Input config {:?} rejected: {}", supported, e);
                last_error = e;
            }
        }
    }

    Err(last_error)
}

/// Owns the cpal stream (in a dedicated thread) until released
fn run_capture_thread(
    preferred: AudioConfig,
    ready_tx: mpsc::Sender<Result<OpenedStream, CaptureError>>,
    command_rx: mpsc::Receiver<StreamCommand>,
) {
    let stream = match build_stream(&preferred) {
        Ok((stream, opened)) => {
            let _ = ready_tx.send(Ok(opened));
            stream
        }
        Err(e) => {
            tracing::error!("Failed to open audio capture: {}", e);
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    while let Ok(command) = command_rx.recv() {
        match command {
            StreamCommand::Play(reply) => {
                let result = stream
                    .play()
                    .map_err(|e| CaptureError::StreamError(e.to_string()));
                let _ = reply.send(result);
            }
            StreamCommand::Pause(reply) => {
                let result = stream
                    .pause()
                    .map_err(|e| CaptureError::StreamError(e.to_string()));
                let _ = reply.send(result);
            }
            StreamCommand::Release => break,
        }
    }

    drop(stream);
    tracing::info!("Audio capture released");
}
