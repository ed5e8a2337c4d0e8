//! Audio capture from microphone
//!
//! A [`CaptureBuffer`] owns the input device for one recording span. Devices
//! deliver PCM chunks on a fixed interval and acknowledge a stop request with
//! [`InputEvent::Stopped`]; the buffer turns the gathered chunks into one WAV
//! blob and releases the device on every exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, SampleRate, StreamConfig};
use tokio::sync::{mpsc, oneshot};

use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// MIME type of assembled captures
pub const CAPTURE_MIME: &str = "audio/wav";

/// Processing requested from the input device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,

    /// How often buffered samples are flushed as a chunk
    pub chunk_interval: Duration,
}

impl CaptureConstraints {
    /// Speech capture with all input processing enabled
    #[must_use]
    pub const fn speech(chunk_interval: Duration) -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            chunk_interval,
        }
    }
}

/// Event delivered by an open input device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// Mono 16-bit PCM at [`SAMPLE_RATE`]
    Chunk(Vec<i16>),
    /// Stop acknowledgement; no chunks follow
    Stopped,
}

/// Control side of an open input device
pub trait InputDevice: Send {
    /// Ask the device to flush and stop; completion arrives as [`InputEvent::Stopped`]
    fn request_stop(&mut self);

    /// Stop all underlying tracks immediately
    fn release(&mut self);
}

/// Input device opened for one capture
pub struct OpenedInput {
    pub events: mpsc::UnboundedReceiver<InputEvent>,
    pub device: Box<dyn InputDevice>,
}

/// Source of microphone audio
#[async_trait]
pub trait AudioInput: Send + Sync {
    /// Acquire the input device exclusively and start delivering chunks
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` if access is refused and
    /// `DeviceUnavailable` if no device or supported encoding exists.
    async fn open(&self, constraints: CaptureConstraints) -> Result<OpenedInput>;
}

/// Fires-once flag shared by every path that may finish a capture
#[derive(Debug, Clone, Default)]
pub struct CompletionLatch(Arc<AtomicBool>);

impl CompletionLatch {
    /// Claim the capture; only the first caller gets `true`
    #[must_use]
    pub fn claim(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether some path already claimed the capture
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Releases the device when dropped
struct DeviceGuard(Option<Box<dyn InputDevice>>);

impl DeviceGuard {
    fn request_stop(&mut self) {
        if let Some(device) = self.0.as_mut() {
            device.request_stop();
        }
    }

    fn release(&mut self) {
        if let Some(mut device) = self.0.take() {
            device.release();
        }
    }
}

impl Drop for DeviceGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Finished recording
#[derive(Debug, Clone)]
pub struct CapturedAudio {
    /// WAV bytes
    pub bytes: Vec<u8>,
    pub mime: &'static str,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

/// One recording span
///
/// At most one exists per call session; dropping it releases the device.
pub struct CaptureBuffer {
    chunks: Vec<Vec<i16>>,
    started_at: DateTime<Utc>,
    events: mpsc::UnboundedReceiver<InputEvent>,
    device: DeviceGuard,
    latch: CompletionLatch,
    acknowledged: bool,
}

impl CaptureBuffer {
    /// Open the input device and begin gathering chunks
    ///
    /// # Errors
    ///
    /// Propagates the device's `PermissionDenied` or `DeviceUnavailable`.
    pub async fn start(input: &dyn AudioInput, constraints: CaptureConstraints) -> Result<Self> {
        let opened = input.open(constraints).await?;

        tracing::debug!(
            chunk_interval_ms = constraints.chunk_interval.as_millis(),
            "capture started"
        );

        Ok(Self {
            chunks: Vec::new(),
            started_at: Utc::now(),
            events: opened.events,
            device: DeviceGuard(Some(opened.device)),
            latch: CompletionLatch::default(),
            acknowledged: false,
        })
    }

    /// When recording began
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Latch guarding against processing this capture twice
    #[must_use]
    pub fn latch(&self) -> CompletionLatch {
        self.latch.clone()
    }

    /// Move chunks already delivered by the device into the buffer
    ///
    /// Returns the number of chunks held afterwards.
    pub fn collect_pending(&mut self) -> usize {
        while let Ok(event) = self.events.try_recv() {
            self.accept(event);
        }
        self.chunks.len()
    }

    fn accept(&mut self, event: InputEvent) {
        match event {
            InputEvent::Chunk(chunk) if !chunk.is_empty() => self.chunks.push(chunk),
            InputEvent::Chunk(_) => {}
            InputEvent::Stopped => self.acknowledged = true,
        }
    }

    async fn await_acknowledgement(&mut self) {
        while !self.acknowledged {
            match self.events.recv().await {
                Some(event) => self.accept(event),
                // Device went away, nothing more will arrive
                None => self.acknowledged = true,
            }
        }
    }

    /// Stop recording and assemble the capture
    ///
    /// Waits up to `ack_timeout` for the device's stop acknowledgement. If it
    /// doesn't arrive, the chunks gathered so far are assembled anyway. The
    /// device is released on every path.
    ///
    /// # Errors
    ///
    /// Returns `EmptyCapture` when no chunks were gathered and
    /// `DuplicateRequest` when another path already finished this capture.
    pub async fn stop(mut self, ack_timeout: Duration) -> Result<CapturedAudio> {
        self.device.request_stop();

        if tokio::time::timeout(ack_timeout, self.await_acknowledgement())
            .await
            .is_err()
        {
            let chunks = self.collect_pending();
            tracing::warn!(
                chunks,
                timeout_ms = ack_timeout.as_millis(),
                "stop acknowledgement timed out, using buffered chunks"
            );
        }

        self.device.release();

        if !self.latch.claim() {
            return Err(Error::DuplicateRequest(
                "capture already processed".to_string(),
            ));
        }

        if self.chunks.is_empty() {
            tracing::debug!("capture stopped with no audio");
            return Err(Error::EmptyCapture);
        }

        let samples: Vec<i16> = self.chunks.concat();
        let bytes = pcm_to_wav(&samples, SAMPLE_RATE)?;
        let duration = Duration::from_micros(
            samples.len() as u64 * 1_000_000 / u64::from(SAMPLE_RATE),
        );

        tracing::debug!(
            chunks = self.chunks.len(),
            bytes = bytes.len(),
            duration_ms = duration.as_millis(),
            "capture assembled"
        );

        Ok(CapturedAudio {
            bytes,
            mime: CAPTURE_MIME,
            started_at: self.started_at,
            duration,
        })
    }

    /// Abandon the capture without producing audio
    pub fn discard(mut self) {
        let _ = self.latch.claim();
        self.device.release();
        tracing::debug!("capture discarded");
    }
}

/// Encode mono 16-bit PCM samples as WAV bytes
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn pcm_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}

/// Convert an f32 sample in [-1.0, 1.0] to i16
#[allow(clippy::cast_possible_truncation)]
fn to_pcm16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

enum InputCommand {
    Stop,
    Release,
}

/// Microphone input through the default `cpal` host
///
/// `cpal` streams aren't `Send`, so each capture runs on its own thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalInput;

struct CpalInputDevice {
    control: std::sync::mpsc::Sender<InputCommand>,
}

impl InputDevice for CpalInputDevice {
    fn request_stop(&mut self) {
        let _ = self.control.send(InputCommand::Stop);
    }

    fn release(&mut self) {
        let _ = self.control.send(InputCommand::Release);
    }
}

#[async_trait]
impl AudioInput for CpalInput {
    async fn open(&self, constraints: CaptureConstraints) -> Result<OpenedInput> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (control_tx, control_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name("persona-call-capture".to_string())
            .spawn(move || run_capture(constraints, &event_tx, ready_tx, &control_rx))?;

        ready_rx
            .await
            .map_err(|_| Error::Audio("capture thread exited".to_string()))??;

        Ok(OpenedInput {
            events: event_rx,
            device: Box::new(CpalInputDevice {
                control: control_tx,
            }),
        })
    }
}

fn input_config() -> Result<(cpal::Device, StreamConfig)> {
    let host = cpal::default_host();

    let device = host
        .default_input_device()
        .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

    let supported_config = device
        .supported_input_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .find(|c| {
            c.channels() == 1
                && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
        })
        .ok_or_else(|| Error::DeviceUnavailable("no supported 16kHz mono encoding".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(SAMPLE_RATE))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels = config.channels,
        "audio capture initialized"
    );

    Ok((device, config))
}

fn map_build_error(err: &BuildStreamError) -> Error {
    match err {
        BuildStreamError::DeviceNotAvailable | BuildStreamError::StreamConfigNotSupported => {
            Error::DeviceUnavailable(err.to_string())
        }
        BuildStreamError::BackendSpecific { err: backend }
            if is_permission_error(&backend.description) =>
        {
            Error::PermissionDenied(backend.description.clone())
        }
        _ => Error::Audio(err.to_string()),
    }
}

// Backends report refused microphone access only through their message
fn is_permission_error(description: &str) -> bool {
    let description = description.to_lowercase();
    description.contains("permission") || description.contains("denied")
}

fn build_input_stream(pending: &Arc<std::sync::Mutex<Vec<i16>>>) -> Result<cpal::Stream> {
    let (device, config) = input_config()?;
    let buffer = Arc::clone(pending);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend(data.iter().copied().map(to_pcm16));
                }
            },
            |err| {
                tracing::error!(error = %err, "audio capture error");
            },
            None,
        )
        .map_err(|e| map_build_error(&e))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

fn run_capture(
    constraints: CaptureConstraints,
    events: &mpsc::UnboundedSender<InputEvent>,
    ready: oneshot::Sender<Result<()>>,
    control: &std::sync::mpsc::Receiver<InputCommand>,
) {
    let pending: Arc<std::sync::Mutex<Vec<i16>>> = Arc::default();

    let stream = match build_input_stream(&pending) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    tracing::debug!(
        echo_cancellation = constraints.echo_cancellation,
        noise_suppression = constraints.noise_suppression,
        auto_gain_control = constraints.auto_gain_control,
        "input processing left to the platform"
    );
    let _ = ready.send(Ok(()));

    let flush = || {
        let chunk = pending
            .lock()
            .map(|mut buf| std::mem::take(&mut *buf))
            .unwrap_or_default();
        if !chunk.is_empty() {
            let _ = events.send(InputEvent::Chunk(chunk));
        }
    };

    loop {
        match control.recv_timeout(constraints.chunk_interval) {
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => flush(),
            Ok(InputCommand::Stop) => {
                drop(stream);
                flush();
                let _ = events.send(InputEvent::Stopped);
                tracing::debug!("audio capture stopped");
                return;
            }
            Ok(InputCommand::Release) | Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                drop(stream);
                tracing::debug!("audio capture released");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scripted device: chunks are pushed by the test, stop is acknowledged
    /// only when `ack` is set
    struct ScriptedInput {
        chunks: Vec<Vec<i16>>,
        ack: bool,
        released: Arc<AtomicBool>,
    }

    struct ScriptedDevice {
        events: Option<mpsc::UnboundedSender<InputEvent>>,
        ack: bool,
        released: Arc<AtomicBool>,
    }

    impl InputDevice for ScriptedDevice {
        fn request_stop(&mut self) {
            if self.ack
                && let Some(tx) = self.events.take()
            {
                let _ = tx.send(InputEvent::Stopped);
            }
        }

        fn release(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AudioInput for ScriptedInput {
        async fn open(&self, _constraints: CaptureConstraints) -> Result<OpenedInput> {
            let (tx, rx) = mpsc::unbounded_channel();
            for chunk in &self.chunks {
                tx.send(InputEvent::Chunk(chunk.clone())).unwrap();
            }
            Ok(OpenedInput {
                events: rx,
                device: Box::new(ScriptedDevice {
                    events: Some(tx),
                    ack: self.ack,
                    released: Arc::clone(&self.released),
                }),
            })
        }
    }

    fn constraints() -> CaptureConstraints {
        CaptureConstraints::speech(Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_assembles_wav() {
        let released = Arc::new(AtomicBool::new(false));
        let input = ScriptedInput {
            chunks: vec![vec![1; 1600], vec![2; 1600]],
            ack: true,
            released: Arc::clone(&released),
        };

        let buffer = CaptureBuffer::start(&input, constraints()).await.unwrap();
        let audio = buffer.stop(Duration::from_secs(1)).await.unwrap();

        assert_eq!(audio.mime, "audio/wav");
        assert_eq!(audio.duration, Duration::from_millis(200));
        assert_eq!(&audio.bytes[..4], b"RIFF");
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_capture() {
        let released = Arc::new(AtomicBool::new(false));
        let input = ScriptedInput {
            chunks: vec![],
            ack: true,
            released: Arc::clone(&released),
        };

        let buffer = CaptureBuffer::start(&input, constraints()).await.unwrap();
        let err = buffer.stop(Duration::from_secs(1)).await.unwrap_err();

        assert!(matches!(err, Error::EmptyCapture));
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_ack_falls_back_to_buffered_chunks() {
        let input = ScriptedInput {
            chunks: vec![vec![5; 800]],
            ack: false,
            released: Arc::default(),
        };

        let buffer = CaptureBuffer::start(&input, constraints()).await.unwrap();
        let latch = buffer.latch();

        let started = tokio::time::Instant::now();
        let audio = buffer.stop(Duration::from_secs(1)).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(audio.duration, Duration::from_millis(50));
        // Fallback claimed the capture, nothing else may process it
        assert!(latch.is_claimed());
        assert!(!latch.claim());
    }

    #[tokio::test]
    async fn test_claimed_capture_is_not_processed_again() {
        let input = ScriptedInput {
            chunks: vec![vec![5; 800]],
            ack: true,
            released: Arc::default(),
        };

        let buffer = CaptureBuffer::start(&input, constraints()).await.unwrap();
        assert!(buffer.latch().claim());

        let err = buffer.stop(Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_silent());
    }

    #[tokio::test]
    async fn test_drop_releases_device() {
        let released = Arc::new(AtomicBool::new(false));
        let input = ScriptedInput {
            chunks: vec![vec![1; 10]],
            ack: true,
            released: Arc::clone(&released),
        };

        let mut buffer = CaptureBuffer::start(&input, constraints()).await.unwrap();
        assert_eq!(buffer.collect_pending(), 1);
        drop(buffer);

        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_pcm_to_wav_roundtrip_header() {
        let wav = pcm_to_wav(&[0, 100, -100], SAMPLE_RATE).unwrap();
        let reader = hound::WavReader::new(std::io::Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
        assert_eq!(reader.len(), 3);
    }

    #[test]
    fn test_to_pcm16_clamps() {
        assert_eq!(to_pcm16(2.0), 32767);
        assert_eq!(to_pcm16(-2.0), -32768);
        assert_eq!(to_pcm16(0.0), 0);
    }

    fn assert_send<T: Send>() {}

    #[test]
    fn test_capture_buffer_is_send() {
        assert_send::<CaptureBuffer>();
    }
}
