//! Voice processing module
//!
//! Handles microphone capture, speaker playback, and the transcription and
//! synthesis providers used by the turn endpoint.

mod capture;
mod playback;
mod stt;
mod tts;

pub use capture::{
    AudioInput, CAPTURE_MIME, CaptureBuffer, CaptureConstraints, CapturedAudio, CompletionLatch,
    CpalInput, InputDevice, InputEvent, OpenedInput, SAMPLE_RATE, pcm_to_wav,
};
pub use playback::{
    AudioOutput, CpalOutput, DecodedAudio, OpenedOutput, OutputDevice, Playback, PlaybackController,
    PlaybackEnd, decode_audio,
};
pub use stt::{SpeechToText, Transcriber, normalize_transcript};
pub use tts::{Synthesizer, TextToSpeech};
