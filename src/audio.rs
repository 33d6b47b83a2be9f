use crate::error::SinkError;
use crate::sink::{AudioSink, SinkFactory, SinkRelease, StreamSpec};
use crate::synth::decode_block;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, FromSample, SampleFormat, SizedSample, Stream, StreamConfig, SupportedBufferSize};
use log::{debug, error};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Block size used when the device does not report a buffer range.
/// Matches the usual minimum for 44.1 kHz mono 16-bit streaming.
pub const DEFAULT_BLOCK_BYTES: usize = 3528;
pub const MIN_BLOCK_BYTES: usize = 512;

/// How long a write waits on a full queue before re-checking device health.
const WRITE_POLL: Duration = Duration::from_millis(50);

#[derive(Default)]
struct QueueState {
    samples: VecDeque<i16>,
    capacity: usize,
    device_error: Option<String>,
    closed: bool,
}

/// Bounded hand-off between `write` and the device callback.
#[derive(Default)]
struct SampleQueue {
    state: Mutex<QueueState>,
    space: Condvar,
}

impl SampleQueue {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                samples: VecDeque::with_capacity(capacity),
                capacity,
                ..Default::default()
            }),
            space: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cuts the stream off from its writer; the callback plays silence until
/// the writer thread drops the stream.
impl SinkRelease for SampleQueue {
    fn release(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.samples.clear();
        drop(state);
        self.space.notify_all();
    }
}

/// Opens cpal output streams on the default host's default output device.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalSinkFactory;

impl CpalSinkFactory {
    pub fn new() -> Self {
        Self
    }

    fn default_device() -> Result<Device, SinkError> {
        cpal::default_host()
            .default_output_device()
            .ok_or_else(|| SinkError::Open("No output device found".into()))
    }
}

impl SinkFactory for CpalSinkFactory {
    fn open(&self, spec: StreamSpec) -> Result<Box<dyn AudioSink>, SinkError> {
        let device = Self::default_device()?;
        let supported = device
            .default_output_config()
            .map_err(|e| SinkError::Open(e.to_string()))?;

        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: cpal::SampleRate(spec.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let block_samples = self.min_buffer_size(spec) / spec.bytes_per_frame();
        let queue = Arc::new(SampleQueue::with_capacity(block_samples * 2));

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, Arc::clone(&queue)),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, Arc::clone(&queue)),
            SampleFormat::U16 => build_stream::<u16>(&device, &config, Arc::clone(&queue)),
            other => Err(SinkError::Open(format!("Unsupported sample format: {:?}", other))),
        }?;

        stream
            .play()
            .map_err(|e| SinkError::Open(e.to_string()))?;

        debug!(
            "Opened output stream: {} Hz, {} device channel(s), queue of {} samples",
            spec.sample_rate, config.channels, block_samples * 2
        );

        Ok(Box::new(CpalSink {
            stream: Some(stream),
            queue,
        }))
    }

    fn min_buffer_size(&self, spec: StreamSpec) -> usize {
        let frames = Self::default_device()
            .ok()
            .and_then(|device| device.default_output_config().ok())
            .and_then(|config| match config.buffer_size() {
                SupportedBufferSize::Range { min, .. } => Some(*min as usize),
                SupportedBufferSize::Unknown => None,
            });

        match frames {
            Some(frames) => (frames * spec.bytes_per_frame()).max(MIN_BLOCK_BYTES),
            None => DEFAULT_BLOCK_BYTES,
        }
    }
}

fn build_stream<S>(
    device: &Device,
    config: &StreamConfig,
    queue: Arc<SampleQueue>,
) -> Result<Stream, SinkError>
where
    S: SizedSample + FromSample<i16>,
{
    let channels = config.channels as usize;
    let error_queue = Arc::clone(&queue);

    device
        .build_output_stream(
            config,
            move |data: &mut [S], _: &cpal::OutputCallbackInfo| {
                let mut state = queue.lock();
                for frame in data.chunks_mut(channels) {
                    // Underrun plays silence.
                    let value = S::from_sample(state.samples.pop_front().unwrap_or(0));
                    for out in frame.iter_mut() {
                        *out = value;
                    }
                }
                drop(state);
                queue.space.notify_one();
            },
            move |err| {
                error!("Audio output error: {}", err);
                error_queue.lock().device_error = Some(err.to_string());
                error_queue.space.notify_all();
            },
            None,
        )
        .map_err(|e| SinkError::Open(e.to_string()))
}

struct CpalSink {
    stream: Option<Stream>,
    queue: Arc<SampleQueue>,
}

impl AudioSink for CpalSink {
    fn write(&mut self, bytes: &[u8]) -> Result<usize, SinkError> {
        let samples = decode_block(bytes);
        let mut pending = samples.as_slice();
        let mut state = self.queue.lock();

        while !pending.is_empty() {
            if state.closed {
                return Err(SinkError::Write("stream closed".into()));
            }
            if let Some(err) = state.device_error.take() {
                return Err(SinkError::Write(err));
            }

            let room = state.capacity.saturating_sub(state.samples.len());
            if room == 0 {
                state = self
                    .queue
                    .space
                    .wait_timeout(state, WRITE_POLL)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
                continue;
            }

            let take = room.min(pending.len());
            state.samples.extend(&pending[..take]);
            pending = &pending[take..];
        }

        Ok(bytes.len())
    }

    fn close(&mut self) {
        self.queue.release();
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!("Pausing output stream failed: {}", e);
            }
            drop(stream);
        }
    }

    fn release_handle(&self) -> Option<Arc<dyn SinkRelease>> {
        Some(self.queue.clone())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Names of the output devices on the default host; the default device
/// is marked with a trailing `(default)`.
pub fn list_audio_devices() -> Vec<String> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let Ok(output_devices) = host.output_devices() else {
        return Vec::new();
    };

    output_devices
        .filter_map(|device| device.name().ok())
        .map(|name| {
            if default_name.as_deref() == Some(name.as_str()) {
                format!("{} (default)", name)
            } else {
                name
            }
        })
        .collect()
}
