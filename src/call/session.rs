//! Call session actor
//!
//! A [`CallSession`] owns the capture buffer, the playback controller and the
//! submission guard of one call. It runs as a single task: commands from a
//! [`CallHandle`] and completions of its own background work (capture stop,
//! turn submission, playback end, timers) are handled one at a time, and
//! only transition handlers touch the audio devices. Every background event
//! carries the id of the turn that started it, so work that outlives a
//! cancelled turn is ignored when it reports back.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::client::{TurnClient, TurnReply, TurnSubmission};
use super::state::{CallFlags, CallSnapshot, TurnState, TurnSummary};
use crate::config::TimingConfig;
use crate::dedup::{Debounce, Fingerprint, SubmissionGuard};
use crate::persona::PersonaMode;
use crate::voice::{
    AudioInput, AudioOutput, CaptureBuffer, CaptureConstraints, CapturedAudio, PlaybackController,
    PlaybackEnd,
};
use crate::{Error, Result};

/// Settings for one call
#[derive(Debug, Clone)]
pub struct CallOptions {
    pub persona_id: String,
    pub mode: PersonaMode,

    /// Hands-free call: replies may re-open the microphone
    pub call_active: bool,
    pub auto_listen: bool,
    pub timing: TimingConfig,
}

/// Commands accepted by a running session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    StartRecording,
    StopRecording,
    Interrupt,
    SetMuted(bool),
    SetAutoListen(bool),
    EndCall,
}

/// Completions of background work
#[derive(Debug)]
enum SessionEvent {
    RecordingTimeout { turn: u64 },
    CaptureReady { turn: u64, result: Result<CapturedAudio> },
    TurnFinished { turn: u64, result: Result<TurnReply> },
    PlaybackFinished { turn: u64, id: u64 },
    ResumeListening { turn: u64 },
}

/// Command interface to a running [`CallSession`]
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<CallCommand>,
    snapshot: watch::Receiver<CallSnapshot>,
}

impl CallHandle {
    fn send(&self, command: CallCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| Error::SessionEnded)
    }

    /// Open the microphone
    ///
    /// # Errors
    ///
    /// Returns `SessionEnded` once the call is over
    pub fn start_recording(&self) -> Result<()> {
        self.send(CallCommand::StartRecording)
    }

    /// Finish the capture and submit it
    ///
    /// # Errors
    ///
    /// Returns `SessionEnded` once the call is over
    pub fn stop_recording(&self) -> Result<()> {
        self.send(CallCommand::StopRecording)
    }

    /// Cut the reply short
    ///
    /// # Errors
    ///
    /// Returns `SessionEnded` once the call is over
    pub fn interrupt(&self) -> Result<()> {
        self.send(CallCommand::Interrupt)
    }

    /// Mute or unmute; muting stops an open capture
    ///
    /// # Errors
    ///
    /// Returns `SessionEnded` once the call is over
    pub fn set_muted(&self, muted: bool) -> Result<()> {
        self.send(CallCommand::SetMuted(muted))
    }

    /// Enable or disable auto-listen
    ///
    /// # Errors
    ///
    /// Returns `SessionEnded` once the call is over
    pub fn set_auto_listen(&self, enabled: bool) -> Result<()> {
        self.send(CallCommand::SetAutoListen(enabled))
    }

    /// End the call and release every resource
    ///
    /// # Errors
    ///
    /// Returns `SessionEnded` if the call already ended
    pub fn end_call(&self) -> Result<()> {
        self.send(CallCommand::EndCall)
    }

    /// Current session state
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver notified on every state change
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot.clone()
    }

    /// Wait until the session reaches `state`
    ///
    /// # Errors
    ///
    /// Returns `SessionEnded` if the session stops first
    pub async fn wait_for(&self, state: TurnState) -> Result<CallSnapshot> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|s| s.state == state)
            .await
            .map_err(|_| Error::SessionEnded)?;
        Ok(snapshot.clone())
    }
}

/// Background task that is aborted when replaced or dropped
#[derive(Default)]
struct TaskSlot(Option<JoinHandle<()>>);

impl TaskSlot {
    fn set(&mut self, handle: JoinHandle<()>) {
        self.cancel();
        self.0 = Some(handle);
    }

    fn cancel(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

impl Drop for TaskSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Turn state machine for one call
pub struct CallSession {
    options: CallOptions,
    state: TurnState,
    flags: CallFlags,
    snapshot: CallSnapshot,
    turn: u64,

    input: Arc<dyn AudioInput>,
    capture: Option<CaptureBuffer>,
    playback: PlaybackController,
    client: Arc<dyn TurnClient>,
    guard: SubmissionGuard,
    /// Shared by stop and interrupt so a double click acts once
    stop_debounce: Debounce,

    /// Capture stop, then submission
    work: TaskSlot,
    recording_timer: TaskSlot,
    resume_timer: TaskSlot,
    playback_watch: TaskSlot,

    events: mpsc::UnboundedSender<SessionEvent>,
    publisher: watch::Sender<CallSnapshot>,
}

impl CallSession {
    /// Start a session task and return its handle
    #[must_use]
    pub fn spawn(
        options: CallOptions,
        input: Arc<dyn AudioInput>,
        output: Arc<dyn AudioOutput>,
        client: Arc<dyn TurnClient>,
    ) -> (CallHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let flags = CallFlags {
            muted: false,
            call_active: options.call_active,
            auto_listen: options.auto_listen,
        };
        let snapshot = CallSnapshot::new(flags);
        let (publisher, snapshot_rx) = watch::channel(snapshot.clone());

        let timing = options.timing;
        let session = Self {
            options,
            state: TurnState::Idle,
            flags,
            snapshot,
            turn: 0,
            input,
            capture: None,
            playback: PlaybackController::new(output),
            client,
            guard: SubmissionGuard::new(timing.client_dedup_window),
            stop_debounce: Debounce::new(timing.stop_debounce),
            work: TaskSlot::default(),
            recording_timer: TaskSlot::default(),
            resume_timer: TaskSlot::default(),
            playback_watch: TaskSlot::default(),
            events: event_tx,
            publisher,
        };

        let task = tokio::spawn(session.run(command_rx, event_rx));

        (
            CallHandle {
                commands: command_tx,
                snapshot: snapshot_rx,
            },
            task,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<CallCommand>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        tracing::info!(
            persona_id = %self.options.persona_id,
            mode = self.options.mode.as_flag(),
            call_active = self.flags.call_active,
            auto_listen = self.flags.auto_listen,
            "call started"
        );

        while self.state != TurnState::CallEnded {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // Every handle dropped
                    None => self.end_call(),
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
            self.publish();
        }

        tracing::info!(persona_id = %self.options.persona_id, "call ended");
    }

    async fn handle_command(&mut self, command: CallCommand) {
        tracing::debug!(?command, state = %self.state, "call command");

        match command {
            CallCommand::StartRecording => {
                if self.state != TurnState::Idle {
                    tracing::debug!(state = %self.state, "already busy");
                    return;
                }
                self.resume_timer.cancel();
                self.start_recording().await;
            }
            CallCommand::StopRecording => {
                if self.state != TurnState::Recording {
                    return;
                }
                if !self.stop_debounce.try_fire() {
                    tracing::debug!("stop ignored, debounced");
                    return;
                }
                self.stop_recording();
            }
            CallCommand::Interrupt => {
                if self.state != TurnState::Responding {
                    return;
                }
                if !self.stop_debounce.try_fire() {
                    tracing::debug!("interrupt ignored, debounced");
                    return;
                }
                if let Some(end) = self.playback.interrupt() {
                    self.playback_watch.cancel();
                    self.response_ended(end).await;
                }
            }
            CallCommand::SetMuted(muted) => {
                self.flags.muted = muted;
                if muted {
                    self.resume_timer.cancel();
                    // An open capture can't continue unobserved
                    if self.state == TurnState::Recording {
                        self.stop_debounce.mark();
                        self.stop_recording();
                    }
                }
            }
            CallCommand::SetAutoListen(enabled) => {
                self.flags.auto_listen = enabled;
                if !enabled {
                    self.resume_timer.cancel();
                }
            }
            CallCommand::EndCall => self.end_call(),
        }
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::RecordingTimeout { turn } => {
                if turn == self.turn && self.state == TurnState::Recording {
                    tracing::info!(
                        max_recording_ms = self.options.timing.max_recording.as_millis(),
                        "recording limit reached"
                    );
                    if self.stop_debounce.try_fire() {
                        self.stop_recording();
                    }
                }
            }
            SessionEvent::CaptureReady { turn, result } => {
                if turn == self.turn && self.state == TurnState::Processing {
                    self.capture_ready(result);
                }
            }
            SessionEvent::TurnFinished { turn, result } => {
                if turn == self.turn && self.state == TurnState::Processing {
                    self.guard.finish();
                    self.turn_finished(result).await;
                }
            }
            SessionEvent::PlaybackFinished { turn, id } => {
                if turn == self.turn
                    && self.state == TurnState::Responding
                    && let Some(end) = self.playback.complete(id)
                {
                    self.response_ended(end).await;
                }
            }
            SessionEvent::ResumeListening { turn } => {
                if turn == self.turn
                    && self.state == TurnState::Idle
                    && self.flags.should_auto_listen()
                {
                    self.start_recording().await;
                }
            }
        }
    }

    fn transition(&mut self, to: TurnState) -> bool {
        if !self.state.can_transition(to) {
            tracing::warn!(from = %self.state, to = %to, "invalid transition ignored");
            return false;
        }
        tracing::debug!(from = %self.state, to = %to, "transition");
        self.state = to;
        true
    }

    /// Open a capture from `Idle`, or from `Responding` once playback stopped
    async fn start_recording(&mut self) {
        if !self.state.can_transition(TurnState::Recording) || self.playback.is_active() {
            return;
        }
        if !self.flags.may_record() {
            tracing::debug!("muted, not recording");
            return;
        }

        let constraints = CaptureConstraints::speech(self.options.timing.chunk_interval);
        match CaptureBuffer::start(self.input.as_ref(), constraints).await {
            Ok(capture) => {
                self.turn += 1;
                self.capture = Some(capture);
                self.snapshot.last_error = None;
                self.snapshot.notice = None;
                self.transition(TurnState::Recording);

                let events = self.events.clone();
                let turn = self.turn;
                let limit = self.options.timing.max_recording;
                self.recording_timer.set(tokio::spawn(async move {
                    tokio::time::sleep(limit).await;
                    let _ = events.send(SessionEvent::RecordingTimeout { turn });
                }));
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to open microphone");
                self.fail(&e);
                if self.state == TurnState::Responding {
                    self.transition(TurnState::Idle);
                }
            }
        }
    }

    fn stop_recording(&mut self) {
        let Some(capture) = self.capture.take() else {
            return;
        };
        self.recording_timer.cancel();
        self.transition(TurnState::Processing);

        let events = self.events.clone();
        let turn = self.turn;
        let ack_timeout = self.options.timing.stop_ack_timeout;
        self.work.set(tokio::spawn(async move {
            let result = capture.stop(ack_timeout).await;
            let _ = events.send(SessionEvent::CaptureReady { turn, result });
        }));
    }

    fn capture_ready(&mut self, result: Result<CapturedAudio>) {
        let audio = match result {
            Ok(audio) => audio,
            Err(Error::EmptyCapture) => {
                self.snapshot.notice = Some("no audio captured".to_string());
                self.transition(TurnState::Idle);
                return;
            }
            Err(e) if e.is_silent() => {
                tracing::debug!(error = %e, "capture already handled");
                self.transition(TurnState::Idle);
                return;
            }
            Err(e) => {
                tracing::error!(error = %e, "capture failed");
                self.fail(&e);
                self.transition(TurnState::Idle);
                return;
            }
        };

        let fingerprint = Fingerprint::compute(
            &self.options.persona_id,
            &audio.bytes,
            audio.started_at,
            self.options.timing.client_dedup_window,
        );
        if let Err(rejection) = self.guard.try_begin(fingerprint) {
            tracing::info!(reason = %rejection, "submission suppressed");
            self.transition(TurnState::Idle);
            return;
        }

        self.snapshot.submissions += 1;
        tracing::info!(
            persona_id = %self.options.persona_id,
            bytes = audio.bytes.len(),
            duration_ms = audio.duration.as_millis(),
            "turn submitted"
        );

        let submission = TurnSubmission {
            persona_id: self.options.persona_id.clone(),
            mode: self.options.mode,
            audio: audio.bytes,
            mime: audio.mime,
        };
        let client = Arc::clone(&self.client);
        let events = self.events.clone();
        let turn = self.turn;
        self.work.set(tokio::spawn(async move {
            let result = client.submit(submission).await;
            let _ = events.send(SessionEvent::TurnFinished { turn, result });
        }));
    }

    async fn turn_finished(&mut self, result: Result<TurnReply>) {
        let response = match result {
            Ok(TurnReply::Completed(response)) => response,
            Ok(TurnReply::Duplicate(message)) => {
                tracing::info!(%message, "server reported duplicate");
                self.snapshot.notice = Some(message);
                self.transition(TurnState::Idle);
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, retryable = e.is_retryable(), "turn failed");
                self.fail(&e);
                self.transition(TurnState::Idle);
                return;
            }
        };

        let audio = response.audio_bytes();
        self.snapshot.last_turn = Some(TurnSummary {
            user_text: response.user_text,
            ai_text: response.ai_text,
            has_audio: audio.is_some(),
            conversation_id: response.conversation_id,
        });

        let Some(audio) = audio else {
            tracing::info!("reply has no audio");
            self.transition(TurnState::Idle);
            return;
        };

        match self.playback.play(audio).await {
            Ok(playback) => {
                self.transition(TurnState::Responding);

                let events = self.events.clone();
                let turn = self.turn;
                let id = playback.id;
                self.playback_watch.set(tokio::spawn(async move {
                    // Sender dropped without a value means the playback was stopped
                    if playback.finished.await.is_ok() {
                        let _ = events.send(SessionEvent::PlaybackFinished { turn, id });
                    }
                }));
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to play reply");
                self.fail(&e);
                self.transition(TurnState::Idle);
            }
        }
    }

    /// Natural end and interrupt are the same signal; only the grace delay differs
    async fn response_ended(&mut self, end: PlaybackEnd) {
        self.playback_watch.cancel();

        if !self.flags.should_auto_listen() {
            self.transition(TurnState::Idle);
            return;
        }

        if end.is_interrupted() {
            self.start_recording().await;
            if self.state == TurnState::Responding {
                self.transition(TurnState::Idle);
            }
            return;
        }

        self.transition(TurnState::Idle);

        let events = self.events.clone();
        let turn = self.turn;
        let grace = self.options.timing.auto_listen_grace;
        self.resume_timer.set(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(SessionEvent::ResumeListening { turn });
        }));
    }

    fn end_call(&mut self) {
        self.work.cancel();
        self.recording_timer.cancel();
        self.resume_timer.cancel();
        self.playback_watch.cancel();

        if let Some(capture) = self.capture.take() {
            capture.discard();
        }
        self.playback.interrupt();
        self.guard.reset();

        self.flags.call_active = false;
        self.transition(TurnState::CallEnded);
    }

    fn fail(&mut self, err: &Error) {
        self.snapshot.last_error = Some(err.to_string());
        self.snapshot.retryable = err.is_retryable();
    }

    fn publish(&mut self) {
        self.snapshot.state = self.state;
        self.snapshot.flags = self.flags;
        self.publisher.send_replace(self.snapshot.clone());
    }
}
