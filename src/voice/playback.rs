//! Audio playback to speakers
//!
//! [`PlaybackController`] owns the output device for one response at a time.
//! Natural end and [`PlaybackController::interrupt`] both produce a
//! [`PlaybackEnd`], so callers handle them through a single path.

use std::io::Cursor;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tokio::sync::oneshot;

use crate::{Error, Result};

/// Sample rate for playback (matches common TTS output)
const PLAYBACK_SAMPLE_RATE: u32 = 24000;

/// Polling interval of the playback thread
const PLAYBACK_POLL: Duration = Duration::from_millis(20);

/// Control side of an active playback
pub trait OutputDevice: Send {
    /// Silence the output and release it
    fn stop(&mut self);
}

/// Output device playing one response
pub struct OpenedOutput {
    /// Resolves when the audio has played to the end
    pub finished: oneshot::Receiver<()>,
    pub device: Box<dyn OutputDevice>,
}

/// Sink for response audio
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Acquire the output device and start playing `audio` (MP3 or WAV bytes)
    ///
    /// # Errors
    ///
    /// Returns error if the audio can't be decoded or the device can't be opened
    async fn open(&self, audio: Vec<u8>) -> Result<OpenedOutput>;
}

/// How a playback ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    Finished { id: u64 },
    Interrupted { id: u64 },
}

impl PlaybackEnd {
    /// Id of the playback that ended
    #[must_use]
    pub const fn id(self) -> u64 {
        match self {
            Self::Finished { id } | Self::Interrupted { id } => id,
        }
    }

    #[must_use]
    pub const fn is_interrupted(self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

/// Started playback
#[derive(Debug)]
pub struct Playback {
    pub id: u64,
    /// Resolves on natural end; dropped without a value on interrupt
    pub finished: oneshot::Receiver<()>,
}

struct ActivePlayback {
    id: u64,
    device: Box<dyn OutputDevice>,
}

/// Exclusive owner of the audio output
pub struct PlaybackController {
    output: Arc<dyn AudioOutput>,
    active: Option<ActivePlayback>,
    next_id: u64,
}

impl PlaybackController {
    #[must_use]
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            active: None,
            next_id: 1,
        }
    }

    /// Start playing a response
    ///
    /// # Errors
    ///
    /// Returns error if a playback is already active or the device fails
    pub async fn play(&mut self, audio: Vec<u8>) -> Result<Playback> {
        if self.active.is_some() {
            return Err(Error::Audio("playback already active".to_string()));
        }

        let bytes = audio.len();
        let opened = self.output.open(audio).await?;

        let id = self.next_id;
        self.next_id += 1;
        self.active = Some(ActivePlayback {
            id,
            device: opened.device,
        });

        tracing::debug!(id, bytes, "playback started");
        Ok(Playback {
            id,
            finished: opened.finished,
        })
    }

    /// Stop the active playback immediately
    ///
    /// Returns `None` when nothing is playing.
    pub fn interrupt(&mut self) -> Option<PlaybackEnd> {
        let mut active = self.active.take()?;
        active.device.stop();

        tracing::debug!(id = active.id, "playback interrupted");
        Some(PlaybackEnd::Interrupted { id: active.id })
    }

    /// Record that playback `id` reached its end
    ///
    /// Returns `None` for a playback that was already interrupted or replaced.
    pub fn complete(&mut self, id: u64) -> Option<PlaybackEnd> {
        if self.active.as_ref().is_none_or(|a| a.id != id) {
            return None;
        }

        if let Some(mut active) = self.active.take() {
            active.device.stop();
        }

        tracing::debug!(id, "playback complete");
        Some(PlaybackEnd::Finished { id })
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.device.stop();
        }
    }
}

/// Decoded mono audio
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

/// Decode MP3 or WAV bytes to mono f32 samples
///
/// # Errors
///
/// Returns error if the bytes are neither valid WAV nor MP3
pub fn decode_audio(data: &[u8]) -> Result<DecodedAudio> {
    if data.starts_with(b"RIFF") {
        decode_wav(data)
    } else {
        decode_mp3(data)
    }
}

/// Decode MP3 bytes to f32 samples
fn decode_mp3(mp3_data: &[u8]) -> Result<DecodedAudio> {
    let mut decoder = minimp3::Decoder::new(Cursor::new(mp3_data));
    let mut samples = Vec::new();
    let mut sample_rate = PLAYBACK_SAMPLE_RATE;

    loop {
        match decoder.next_frame() {
            Ok(frame) => {
                sample_rate = u32::try_from(frame.sample_rate).unwrap_or(PLAYBACK_SAMPLE_RATE);
                samples.extend(downmix(&frame.data, frame.channels));
            }
            Err(minimp3::Error::SkippedData) => {}
            Err(minimp3::Error::Eof) => break,
            Err(e) => return Err(Error::Audio(format!("MP3 decode error: {e}"))),
        }
    }

    if samples.is_empty() {
        return Err(Error::Audio("no MP3 frames found".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
    })
}

#[allow(clippy::cast_possible_truncation)]
fn decode_wav(wav_data: &[u8]) -> Result<DecodedAudio> {
    let reader = hound::WavReader::new(Cursor::new(wav_data))
        .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?;
    let spec = reader.spec();

    let interleaved: Vec<i16> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .into_samples::<i16>()
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?,
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .map(|s| s.map(|v| (v * 32767.0).clamp(-32768.0, 32767.0) as i16))
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| Error::Audio(format!("WAV decode error: {e}")))?,
    };

    Ok(DecodedAudio {
        samples: downmix(&interleaved, usize::from(spec.channels)),
        sample_rate: spec.sample_rate,
    })
}

/// Convert interleaved i16 samples to mono f32
fn downmix(data: &[i16], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.iter().map(|&s| f32::from(s) / 32768.0).collect();
    }

    #[allow(clippy::cast_precision_loss)]
    let divisor = channels as f32;
    data.chunks(channels)
        .map(|frame| frame.iter().map(|&s| f32::from(s) / 32768.0).sum::<f32>() / divisor)
        .collect()
}

enum OutputCommand {
    Stop,
}

/// Speaker output through the default `cpal` host
///
/// Each playback runs on its own thread since `cpal` streams aren't `Send`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalOutput;

struct CpalOutputDevice {
    control: std::sync::mpsc::Sender<OutputCommand>,
}

impl OutputDevice for CpalOutputDevice {
    fn stop(&mut self) {
        let _ = self.control.send(OutputCommand::Stop);
    }
}

#[async_trait]
impl AudioOutput for CpalOutput {
    async fn open(&self, audio: Vec<u8>) -> Result<OpenedOutput> {
        let decoded = tokio::task::spawn_blocking(move || decode_audio(&audio))
            .await
            .map_err(|e| Error::Audio(e.to_string()))??;

        let (finished_tx, finished_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (control_tx, control_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name("persona-call-playback".to_string())
            .spawn(move || run_playback(decoded, ready_tx, finished_tx, &control_rx))?;

        ready_rx
            .await
            .map_err(|_| Error::Audio("playback thread exited".to_string()))??;

        Ok(OpenedOutput {
            finished: finished_rx,
            device: Box::new(CpalOutputDevice {
                control: control_tx,
            }),
        })
    }
}

fn output_config(sample_rate: u32) -> Result<(cpal::Device, StreamConfig)> {
    let host = cpal::default_host();

    let device = host
        .default_output_device()
        .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

    let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels
            && c.min_sample_rate() <= SampleRate(sample_rate)
            && c.max_sample_rate() >= SampleRate(sample_rate)
    };

    let supported_config = device
        .supported_output_configs()
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
        .find(|c| supports(c, 1))
        .or_else(|| {
            // Fallback: try stereo
            device
                .supported_output_configs()
                .ok()?
                .find(|c| supports(c, 2))
        })
        .ok_or_else(|| Error::DeviceUnavailable("no suitable output config found".to_string()))?;

    let config = supported_config
        .with_sample_rate(SampleRate(sample_rate))
        .config();

    tracing::debug!(
        device = device.name().unwrap_or_default(),
        sample_rate,
        channels = config.channels,
        "audio playback initialized"
    );

    Ok((device, config))
}

fn build_output_stream(
    samples: Arc<Vec<f32>>,
    position: Arc<AtomicUsize>,
    sample_rate: u32,
) -> Result<cpal::Stream> {
    let (device, config) = output_config(sample_rate)?;
    let channels = usize::from(config.channels);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let pos = position.load(Ordering::Relaxed);
                    let sample = samples.get(pos).copied().unwrap_or(0.0);
                    frame.fill(sample);
                    if pos < samples.len() {
                        position.store(pos + 1, Ordering::Relaxed);
                    }
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;
    Ok(stream)
}

fn run_playback(
    decoded: DecodedAudio,
    ready: oneshot::Sender<Result<()>>,
    finished: oneshot::Sender<()>,
    control: &std::sync::mpsc::Receiver<OutputCommand>,
) {
    let total = decoded.samples.len();
    let samples = Arc::new(decoded.samples);
    let position = Arc::new(AtomicUsize::new(0));
    let mut stopped = false;

    let stream = match build_output_stream(samples, Arc::clone(&position), decoded.sample_rate) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    while position.load(Ordering::Relaxed) < total {
        match control.recv_timeout(PLAYBACK_POLL) {
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Ok(OutputCommand::Stop) | Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                stopped = true;
                break;
            }
        }
    }

    if !stopped {
        // Let the device drain its last buffer
        std::thread::sleep(Duration::from_millis(100));
    }
    drop(stream);

    if stopped {
        tracing::debug!(
            played = position.load(Ordering::Relaxed),
            total,
            "playback stopped"
        );
    } else {
        let _ = finished.send(());
        tracing::debug!(samples = total, "playback complete");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Output that never finishes by itself unless told to
    #[derive(Default)]
    struct MockOutput {
        stops: Arc<AtomicUsize>,
        senders: Mutex<Vec<oneshot::Sender<()>>>,
    }

    struct MockDevice {
        stops: Arc<AtomicUsize>,
    }

    impl OutputDevice for MockDevice {
        fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AudioOutput for MockOutput {
        async fn open(&self, _audio: Vec<u8>) -> Result<OpenedOutput> {
            let (tx, rx) = oneshot::channel();
            self.senders.lock().unwrap().push(tx);
            Ok(OpenedOutput {
                finished: rx,
                device: Box::new(MockDevice {
                    stops: Arc::clone(&self.stops),
                }),
            })
        }
    }

    #[tokio::test]
    async fn test_second_play_while_active_is_error() {
        let output = Arc::new(MockOutput::default());
        let mut controller = PlaybackController::new(output);

        controller.play(vec![1, 2, 3]).await.unwrap();
        assert!(controller.play(vec![4]).await.is_err());
    }

    #[tokio::test]
    async fn test_natural_end_and_interrupt_share_shape() {
        let output = Arc::new(MockOutput::default());
        let stops = Arc::clone(&output.stops);
        let mut controller = PlaybackController::new(output.clone());

        let playback = controller.play(vec![1]).await.unwrap();
        output.senders.lock().unwrap().pop().unwrap().send(()).unwrap();
        playback.finished.await.unwrap();

        let end = controller.complete(playback.id).unwrap();
        assert_eq!(end, PlaybackEnd::Finished { id: playback.id });
        assert!(!controller.is_active());

        let second = controller.play(vec![2]).await.unwrap();
        let end = controller.interrupt().unwrap();
        assert!(end.is_interrupted());
        assert_eq!(end.id(), second.id);
        assert_eq!(stops.load(Ordering::SeqCst), 2);

        // Late completion of the interrupted playback is ignored
        assert!(controller.complete(second.id).is_none());
        assert!(controller.interrupt().is_none());
    }

    #[tokio::test]
    async fn test_drop_stops_active_playback() {
        let output = Arc::new(MockOutput::default());
        let stops = Arc::clone(&output.stops);

        let mut controller = PlaybackController::new(output);
        controller.play(vec![1]).await.unwrap();
        drop(controller);

        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_decode_wav() {
        let wav = crate::voice::pcm_to_wav(&[0, 16384, -16384, 0], 16000).unwrap();
        let decoded = decode_audio(&wav).unwrap();

        assert_eq!(decoded.sample_rate, 16000);
        assert_eq!(decoded.samples.len(), 4);
        assert!((decoded.samples[1] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_downmix_stereo() {
        let mono = downmix(&[16384, 0, -16384, -16384], 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.25).abs() < 1e-3);
        assert!((mono[1] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_audio(b"not audio at all").is_err());
    }
}
