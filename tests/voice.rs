//! Voice pipeline integration tests
//!
//! Tests voice components without requiring audio hardware

use std::time::Duration;

use persona_call::dedup::Fingerprint;
use persona_call::voice::{
    CAPTURE_MIME, CaptureBuffer, CaptureConstraints, SAMPLE_RATE, decode_audio,
    normalize_transcript, pcm_to_wav,
};

mod common;
use common::MockInput;

/// Generate sine wave audio samples
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn generate_sine_samples(frequency: f32, duration_secs: f32, amplitude: f32) -> Vec<i16> {
    let num_samples = (SAMPLE_RATE as f32 * duration_secs) as usize;
    (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            (amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin() * f32::from(i16::MAX))
                as i16
        })
        .collect()
}

fn constraints() -> CaptureConstraints {
    CaptureConstraints::speech(Duration::from_millis(100))
}

#[test]
fn test_tone_survives_wav_encoding() {
    let samples = generate_sine_samples(440.0, 0.5, 0.5);
    let wav = pcm_to_wav(&samples, SAMPLE_RATE).unwrap();

    let decoded = decode_audio(&wav).unwrap();
    assert_eq!(decoded.sample_rate, SAMPLE_RATE);
    assert_eq!(decoded.samples.len(), samples.len());

    let peak = decoded.samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    assert!((peak - 0.5).abs() < 0.01, "peak {peak}");
}

#[test]
fn test_speaker_rate_tone_decodes() {
    let samples: Vec<i16> = vec![1000; 24000];
    let wav = pcm_to_wav(&samples, 24000).unwrap();

    let decoded = decode_audio(&wav).unwrap();
    assert_eq!(decoded.sample_rate, 24000);
    assert_eq!(decoded.samples.len(), 24000);
}

#[tokio::test(start_paused = true)]
async fn test_capture_produces_decodable_wav() {
    let input = MockInput {
        chunks: vec![
            generate_sine_samples(220.0, 0.1, 0.3),
            generate_sine_samples(220.0, 0.1, 0.3),
            generate_sine_samples(220.0, 0.1, 0.3),
        ],
        ..MockInput::default()
    };

    let capture = CaptureBuffer::start(&input, constraints()).await.unwrap();
    let audio = capture.stop(Duration::from_secs(1)).await.unwrap();

    assert_eq!(audio.mime, CAPTURE_MIME);
    assert_eq!(audio.duration, Duration::from_millis(300));
    assert_eq!(input.released(), 1);

    let decoded = decode_audio(&audio.bytes).unwrap();
    assert_eq!(decoded.sample_rate, SAMPLE_RATE);
    assert_eq!(decoded.samples.len(), 4800);
}

#[tokio::test(start_paused = true)]
async fn test_successive_captures_fingerprint_apart() {
    let input = MockInput::speaking();
    let window = Duration::from_secs(3);

    let first = CaptureBuffer::start(&input, constraints())
        .await
        .unwrap()
        .stop(Duration::from_secs(1))
        .await
        .unwrap();
    let second = CaptureBuffer::start(&input, constraints())
        .await
        .unwrap()
        .stop(Duration::from_secs(1))
        .await
        .unwrap();

    let at = first.started_at;
    assert_eq!(
        Fingerprint::compute("P1", &first.bytes, at, window),
        Fingerprint::compute("P1", &first.bytes, at, window)
    );
    assert_ne!(
        Fingerprint::compute("P1", &first.bytes, at, window),
        Fingerprint::compute("P1", &second.bytes, at, window)
    );
    assert_eq!(input.released(), 2);
}

#[test]
fn test_transcript_normalization() {
    assert_eq!(normalize_transcript("  hello there \n").unwrap(), "hello there");
    assert!(normalize_transcript("   ").is_err());
}
