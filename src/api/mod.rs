//! HTTP API server for voice turns

pub mod auth;
pub mod health;
pub mod rate_limit;
pub mod turn;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::config::{SttBackend, TimingConfig, TtsBackend, VoiceConfig};
use crate::db::DbPool;
use crate::dedup::{DedupLedger, LedgerSweeper};
use crate::turn::TurnProcessor;

/// Largest accepted multipart upload
pub const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

/// Shared state for API handlers
pub struct ApiState {
    /// Turn orchestration
    pub processor: Arc<TurnProcessor>,

    /// Recent submissions, shared by every turn request
    pub ledger: Arc<DedupLedger>,

    pub db: DbPool,

    /// Bearer token required on `/api/voice` routes, if set
    pub api_key: Option<String>,

    pub rate_limiter: Option<rate_limit::SharedLimiter>,

    pub stt_backend: SttBackend,
    pub tts_backend: TtsBackend,
}

/// API server builder
pub struct ApiServerBuilder {
    processor: Arc<TurnProcessor>,
    db: DbPool,
    port: u16,
    api_key: Option<String>,
    rate_limit_per_minute: Option<u32>,
    server_dedup_window: Duration,
    ledger_sweep_interval: Duration,
    stt_backend: SttBackend,
    tts_backend: TtsBackend,
}

impl ApiServerBuilder {
    /// Create a new builder
    #[must_use]
    pub fn new(processor: Arc<TurnProcessor>, db: DbPool) -> Self {
        let timing = TimingConfig::default();
        Self {
            processor,
            db,
            port: 18790,
            api_key: None,
            rate_limit_per_minute: None,
            server_dedup_window: timing.server_dedup_window,
            ledger_sweep_interval: timing.ledger_sweep_interval,
            stt_backend: SttBackend::Whisper,
            tts_backend: TtsBackend::OpenAI,
        }
    }

    /// Set the port
    #[must_use]
    pub const fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Require a bearer token
    #[must_use]
    pub fn api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    /// Enable rate limiting
    #[must_use]
    pub const fn rate_limit(mut self, per_minute: Option<u32>) -> Self {
        self.rate_limit_per_minute = per_minute;
        self
    }

    /// Set the dedup window and sweep interval
    #[must_use]
    pub const fn timing(mut self, timing: &TimingConfig) -> Self {
        self.server_dedup_window = timing.server_dedup_window;
        self.ledger_sweep_interval = timing.ledger_sweep_interval;
        self
    }

    /// Report the configured providers
    #[must_use]
    pub const fn voice(mut self, voice: &VoiceConfig) -> Self {
        self.stt_backend = voice.stt_backend;
        self.tts_backend = voice.tts_backend;
        self
    }

    /// Build the API server
    ///
    /// Starts the ledger sweep task, so this must run inside a Tokio runtime.
    #[must_use]
    pub fn build(self) -> ApiServer {
        let ledger = Arc::new(DedupLedger::new(self.server_dedup_window));
        let sweeper = ledger.spawn_sweeper(self.ledger_sweep_interval);

        let rate_limiter = self.rate_limit_per_minute.map(rate_limit::create_limiter);

        let state = Arc::new(ApiState {
            processor: self.processor,
            ledger,
            db: self.db,
            api_key: self.api_key,
            rate_limiter,
            stt_backend: self.stt_backend,
            tts_backend: self.tts_backend,
        });

        ApiServer {
            state,
            port: self.port,
            _sweeper: sweeper,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
    _sweeper: LedgerSweeper,
}

impl ApiServer {
    /// Shared handler state
    #[must_use]
    pub fn state(&self) -> Arc<ApiState> {
        self.state.clone()
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let voice = turn::router(self.state.clone())
            .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
            .layer(axum::middleware::from_fn_with_state(
                self.state.clone(),
                auth::require_bearer,
            ));

        let router = Router::new()
            .nest("/api/voice", voice)
            .merge(health::router())
            .merge(health::ready_router(self.state.clone()));

        let router = router.layer(axum::middleware::from_fn_with_state(
            self.state.clone(),
            rate_limit::enforce_rate_limit,
        ));

        // Browser clients submit turns cross-origin
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        if self.state.api_key.is_none() {
            tracing::warn!("no API key configured, turn endpoint is unauthenticated");
        }

        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(
            port = self.port,
            personas = self.state.processor.personas().len(),
            dedup_window_ms = self.state.ledger.window().as_millis(),
            "API server listening"
        );

        axum::serve(listener, self.router())
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}
