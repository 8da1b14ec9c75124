//! Microphone capture.
//!
//! The cpal stream is not `Send`, so it is built and kept on a dedicated
//! capture thread. Samples are downmixed to mono, resampled to 16 kHz and
//! handed to the reader through a lock-free ring buffer.

use crate::error::{AssistantError, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Rate every recognizer in the crate expects.
pub const SAMPLE_RATE: u32 = 16_000;

/// Ring buffer size: eight seconds of 16 kHz audio.
const RING_CAPACITY: usize = SAMPLE_RATE as usize * 8;

/// How often the capture thread checks whether it should exit.
const CAPTURE_POLL: Duration = Duration::from_millis(50);

/// Streaming nearest-sample resampler that keeps its phase across callbacks.
struct Resampler {
    step: f64,
    phase: f64,
}

impl Resampler {
    fn new(src_rate: u32, dst_rate: u32) -> Self {
        Self {
            step: src_rate as f64 / dst_rate as f64,
            phase: 0.0,
        }
    }

    fn process(&mut self, mono: &[f32], out: &mut Vec<f32>) {
        for &sample in mono {
            self.phase += 1.0;
            while self.phase >= self.step {
                out.push(sample);
                self.phase -= self.step;
            }
        }
    }
}

fn to_mono(data: &[f32], channels: u16, out: &mut Vec<f32>) {
    let ch = channels.max(1) as usize;
    out.extend(
        data.chunks_exact(ch)
            .map(|frame| frame.iter().sum::<f32>() / ch as f32),
    );
}

/// Default input device, capturing until dropped.
pub struct Microphone {
    consumer: HeapCons<f32>,
    running: Arc<AtomicBool>,
    device_name: String,
}

impl Microphone {
    /// Acquire the default input device. Fails if there is no device or the
    /// stream cannot be started.
    pub fn open() -> Result<Self> {
        let (producer, consumer) = HeapRb::<f32>::new(RING_CAPACITY).split();
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<String>>(1);

        let flag = running.clone();
        thread::Builder::new()
            .name("deskvox-capture".to_string())
            .spawn(move || capture_thread(producer, flag, ready_tx))?;

        let device_name = ready_rx
            .recv()
            .map_err(|_| AssistantError::Audio("capture thread exited during setup".into()))??;

        Ok(Self {
            consumer,
            running,
            device_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Discard everything captured so far.
    pub fn clear(&mut self) {
        let stale = self.consumer.occupied_len();
        self.consumer.skip(stale);
    }

    /// Read exactly `n` 16 kHz samples, waiting at most `timeout`.
    pub fn read_chunk(&mut self, n: usize, timeout: Duration) -> Result<Vec<i16>> {
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0f32; n];
        let mut filled = 0;

        while filled < n {
            if !self.running.load(Ordering::SeqCst) {
                return Err(AssistantError::Audio("capture stream stopped".into()));
            }
            filled += self.consumer.pop_slice(&mut buf[filled..]);
            if filled < n {
                if Instant::now() >= deadline {
                    return Err(AssistantError::Audio(format!(
                        "timed out waiting for audio ({filled}/{n} samples)"
                    )));
                }
                thread::sleep(Duration::from_millis(5));
            }
        }

        Ok(buf.iter().map(|&s| to_i16(s)).collect())
    }
}

impl Drop for Microphone {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn capture_thread(
    mut producer: ringbuf::HeapProd<f32>,
    running: Arc<AtomicBool>,
    ready: mpsc::SyncSender<Result<String>>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_input_device() else {
        running.store(false, Ordering::SeqCst);
        let _ = ready.send(Err(AssistantError::Audio("no default input device".into())));
        return;
    };

    let device_name = device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into());

    let default_config = match device.default_input_config() {
        Ok(c) => c,
        Err(e) => {
            running.store(false, Ordering::SeqCst);
            let _ = ready.send(Err(AssistantError::Audio(format!(
                "no default input config: {e}"
            ))));
            return;
        }
    };

    let native_rate = default_config.sample_rate();
    let channels = default_config.channels();
    let stream_config = StreamConfig {
        channels,
        sample_rate: native_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    let mut resampler = Resampler::new(native_rate, SAMPLE_RATE);
    let mut mono = Vec::new();
    let mut resampled = Vec::new();
    let err_flag = running.clone();

    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _info: &cpal::InputCallbackInfo| {
            mono.clear();
            resampled.clear();
            to_mono(data, channels, &mut mono);
            resampler.process(&mono, &mut resampled);
            let pushed = producer.push_slice(&resampled);
            if pushed < resampled.len() {
                debug!(dropped = resampled.len() - pushed, "capture ring full");
            }
        },
        move |err| {
            error!("audio input stream error: {err}");
            err_flag.store(false, Ordering::SeqCst);
        },
        None,
    );

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            running.store(false, Ordering::SeqCst);
            let _ = ready.send(Err(AssistantError::Audio(format!(
                "failed to build input stream: {e}"
            ))));
            return;
        }
    };

    if let Err(e) = stream.play() {
        running.store(false, Ordering::SeqCst);
        let _ = ready.send(Err(AssistantError::Audio(format!(
            "failed to start input stream: {e}"
        ))));
        return;
    }

    info!(
        device = %device_name,
        native_rate,
        channels,
        "audio capture started"
    );
    let _ = ready.send(Ok(device_name));

    // Hold the stream alive until the microphone is dropped.
    while running.load(Ordering::SeqCst) {
        thread::sleep(CAPTURE_POLL);
    }

    drop(stream);
    info!("audio capture stopped");
}

/// Root-mean-square energy of a chunk, in sample units.
pub fn rms(samples: &[i16]) -> i16 {
    if samples.is_empty() {
        return 0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    let value = (sum / samples.len() as f64).sqrt();
    if value > i16::MAX as f64 {
        warn!(value, "rms out of range");
        i16::MAX
    } else {
        value as i16
    }
}
