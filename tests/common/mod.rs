//! Shared test utilities
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::Request;
use base64::Engine as _;
use tokio::sync::{Notify, mpsc, oneshot};

use persona_call::api::turn::TurnResponse;
use persona_call::api::{ApiServer, ApiServerBuilder};
use persona_call::call::{TurnClient, TurnReply, TurnSubmission};
use persona_call::config::TimingConfig;
use persona_call::db::{self, SqliteStore};
use persona_call::llm::{GenerationRequest, ReplyGenerator};
use persona_call::turn::{TurnProcessor, TurnSettings};
use persona_call::voice::{
    AudioInput, AudioOutput, CaptureConstraints, InputDevice, InputEvent, OpenedInput,
    OpenedOutput, OutputDevice, Synthesizer, Transcriber,
};
use persona_call::{DbPool, Error, Persona, PersonaCatalog, Result};

pub const BOUNDARY: &str = "persona-call-test-boundary";

/// Set up an in-memory test database
#[must_use]
pub fn setup_test_db() -> DbPool {
    db::init_memory().expect("failed to init test db")
}

/// Transcriber returning a fixed text, optionally waiting for a release first
pub struct MockTranscriber {
    pub text: String,
    pub gate: Option<Arc<Notify>>,
    pub calls: AtomicUsize,
}

impl MockTranscriber {
    pub fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn gated(text: &str, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(text)
        }
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, _audio: &[u8], _language: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(self.text.clone())
    }
}

/// Generator with a fixed reply; `None` fails every call
pub struct MockGenerator {
    pub reply: Option<String>,
    pub gate: Option<Arc<Notify>>,
    pub requests: Mutex<Vec<GenerationRequest>>,
}

impl MockGenerator {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: Some(reply.to_string()),
            gate: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            gate: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replies only after `gate` is notified
    pub fn gated(reply: &str, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::replying(reply)
        }
    }
}

#[async_trait]
impl ReplyGenerator for MockGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.reply
            .clone()
            .ok_or_else(|| Error::Generation("service unavailable".into()))
    }
}

/// Synthesizer producing a short fake MP3, or failing
pub struct MockSynthesizer {
    pub ok: bool,
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str, _voice: &str) -> Result<Vec<u8>> {
        if self.ok {
            let mut audio = vec![0xFF, 0xFB, 0x90, 0x00];
            audio.extend_from_slice(text.as_bytes());
            Ok(audio)
        } else {
            Err(Error::Tts("quota exceeded".into()))
        }
    }
}

/// Persona catalog with a test persona "P1"
pub fn test_personas() -> PersonaCatalog {
    let mut catalog = PersonaCatalog::builtin();
    catalog.insert(Persona {
        id: "P1".to_string(),
        name: "Test Persona".to_string(),
        instructions: "You are a friendly test persona.".to_string(),
        voice: Some("alloy".to_string()),
        language: None,
        heightened_modifiers: Some("Be outrageous.".to_string()),
    });
    catalog
}

fn settings() -> TurnSettings {
    TurnSettings {
        language: "en".to_string(),
        default_voice: "alloy".to_string(),
        max_tokens: 150,
        temperature: 0.8,
        heightened_temperature: 0.95,
        history_turns: 5,
    }
}

/// API server wired to mocks
pub struct TestServer {
    pub server: ApiServer,
    pub store: SqliteStore,
    pub generator: Arc<MockGenerator>,
}

pub fn test_server(
    transcriber: Arc<MockTranscriber>,
    generator: Arc<MockGenerator>,
    synthesizer: MockSynthesizer,
    api_key: Option<&str>,
) -> TestServer {
    test_server_with(transcriber, generator, synthesizer, |builder| {
        builder.api_key(api_key.map(String::from))
    })
}

/// Like [`test_server`], with extra builder settings
pub fn test_server_with(
    transcriber: Arc<MockTranscriber>,
    generator: Arc<MockGenerator>,
    synthesizer: MockSynthesizer,
    configure: impl FnOnce(ApiServerBuilder) -> ApiServerBuilder,
) -> TestServer {
    let pool = setup_test_db();
    let store = SqliteStore::new(pool.clone());

    let processor = TurnProcessor::new(
        transcriber,
        generator.clone(),
        Arc::new(synthesizer),
        Arc::new(store.clone()),
        Arc::new(test_personas()),
        settings(),
    );

    let builder =
        ApiServerBuilder::new(Arc::new(processor), pool).timing(&TimingConfig::default());
    let server = configure(builder).build();

    TestServer {
        server,
        store,
        generator,
    }
}

/// Hand-built multipart turn submission
pub fn turn_request(audio: &[u8], persona_id: &str, unhinged: &str) -> Request<Body> {
    turn_request_builder()
        .body(Body::from(multipart_body(audio, persona_id, unhinged)))
        .unwrap()
}

pub fn turn_request_builder() -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri("/api/voice/turn")
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
}

pub fn multipart_body(audio: &[u8], persona_id: &str, unhinged: &str) -> Vec<u8> {
    let mut body = Vec::new();

    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(
        b"Content-Disposition: form-data; name=\"audio_file\"; filename=\"capture.wav\"\r\n",
    );
    body.extend_from_slice(b"Content-Type: audio/wav\r\n\r\n");
    body.extend_from_slice(audio);
    body.extend_from_slice(b"\r\n");

    for (name, value) in [("character_id", persona_id), ("is_unhinged", unhinged)] {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n")
                .as_bytes(),
        );
    }

    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

/// Deterministic fake capture bytes
pub fn fake_audio(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

// --- Call session mocks ---

/// Microphone delivering fixed chunks as soon as it opens
#[derive(Default)]
pub struct MockInput {
    pub chunks: Vec<Vec<i16>>,
    /// Withhold the stop acknowledgement
    pub silent_stop: bool,
    pub fail_with_permission: bool,
    pub opened: AtomicUsize,
    pub released: Arc<AtomicUsize>,
}

impl MockInput {
    pub fn speaking() -> Self {
        Self {
            chunks: vec![vec![100; 1600], vec![-100; 1600]],
            ..Self::default()
        }
    }

    pub fn silent() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

struct MockInputDevice {
    events: Option<mpsc::UnboundedSender<InputEvent>>,
    ack: bool,
    released: Arc<AtomicUsize>,
    done: bool,
}

impl InputDevice for MockInputDevice {
    fn request_stop(&mut self) {
        if self.ack
            && let Some(tx) = &self.events
        {
            let _ = tx.send(InputEvent::Stopped);
        }
    }

    fn release(&mut self) {
        if !self.done {
            self.done = true;
            self.events = None;
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl AudioInput for MockInput {
    async fn open(&self, _constraints: CaptureConstraints) -> Result<OpenedInput> {
        if self.fail_with_permission {
            return Err(Error::PermissionDenied("user refused".into()));
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst);

        // Every capture differs so consecutive turns fingerprint apart
        let offset = i16::try_from(n).unwrap_or(i16::MAX);
        let (tx, rx) = mpsc::unbounded_channel();
        for chunk in &self.chunks {
            let samples = chunk.iter().map(|s| s.saturating_add(offset)).collect();
            let _ = tx.send(InputEvent::Chunk(samples));
        }

        Ok(OpenedInput {
            events: rx,
            device: Box::new(MockInputDevice {
                events: Some(tx),
                ack: !self.silent_stop,
                released: Arc::clone(&self.released),
                done: false,
            }),
        })
    }
}

/// Speaker that plays until told to finish
#[derive(Default)]
pub struct MockOutput {
    pub opened: AtomicUsize,
    pub stops: Arc<AtomicUsize>,
    finishers: Mutex<Vec<oneshot::Sender<()>>>,
}

impl MockOutput {
    /// Let every open playback reach its natural end
    pub fn finish_all(&self) {
        for tx in self.finishers.lock().unwrap().drain(..) {
            let _ = tx.send(());
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

struct MockOutputDevice {
    stops: Arc<AtomicUsize>,
}

impl OutputDevice for MockOutputDevice {
    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl AudioOutput for MockOutput {
    async fn open(&self, _audio: Vec<u8>) -> Result<OpenedOutput> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.finishers.lock().unwrap().push(tx);
        Ok(OpenedOutput {
            finished: rx,
            device: Box::new(MockOutputDevice {
                stops: Arc::clone(&self.stops),
            }),
        })
    }
}

/// Turn client answering from a script; defaults to a completed turn with audio
#[derive(Default)]
pub struct MockTurnClient {
    pub replies: Mutex<VecDeque<Result<TurnReply>>>,
    pub submissions: Mutex<Vec<TurnSubmission>>,
    pub latency: Option<Duration>,
}

impl MockTurnClient {
    pub fn with_replies(replies: Vec<Result<TurnReply>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn submitted(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }
}

pub fn completed_reply(with_audio: bool) -> TurnReply {
    let audio_data =
        with_audio.then(|| base64::engine::general_purpose::STANDARD.encode([0xFF, 0xFB, 0x90]));
    TurnReply::Completed(Box::new(TurnResponse {
        status: "success".to_string(),
        user_text: "hello".to_string(),
        ai_text: "Hi! How are you?".to_string(),
        has_audio: audio_data.is_some(),
        audio_data,
        conversation_id: "c1".to_string(),
        user_message_id: "m1".to_string(),
        ai_message_id: "m2".to_string(),
        updated_at: None,
    }))
}

#[async_trait]
impl TurnClient for MockTurnClient {
    async fn submit(&self, submission: TurnSubmission) -> Result<TurnReply> {
        self.submissions.lock().unwrap().push(submission);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(completed_reply(true)))
    }
}
