//! Pending-request ledgers for duplicate suppression

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::Fingerprint;

/// Maximum ledger entries before the oldest are evicted early
const LEDGER_MAX_ENTRIES: usize = 2000;

/// One submission seen by a ledger
#[derive(Debug, Clone)]
pub struct PendingRequestRecord {
    pub fingerprint: Fingerprint,
    pub timestamp: Instant,
    pub in_flight: bool,
}

/// Why a submission was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Same fingerprint was accepted less than one window ago
    RecentDuplicate,
    /// Another submission for the session is still being processed
    InFlight,
}

impl Rejection {
    /// User-facing explanation
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::RecentDuplicate => "This recording was already submitted",
            Self::InFlight => "A previous turn is still being processed",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl From<Rejection> for crate::Error {
    fn from(rejection: Rejection) -> Self {
        Self::DuplicateRequest(rejection.message().to_string())
    }
}

#[derive(Debug, Default)]
struct LedgerInner {
    records: HashMap<Fingerprint, PendingRequestRecord>,
    /// Session key -> fingerprint currently being processed
    in_flight: HashMap<String, Fingerprint>,
}

/// Server-side ledger of recent turn submissions
///
/// Shared by all request handlers. Entries outlive their request for one
/// dedup window so a client retry arriving after the first attempt finished
/// is still recognised. A [`LedgerSweeper`] evicts expired entries.
#[derive(Debug)]
pub struct DedupLedger {
    window: Duration,
    max_entries: usize,
    inner: Mutex<LedgerInner>,
}

impl DedupLedger {
    /// Create an empty ledger with the given dedup window
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            max_entries: LEDGER_MAX_ENTRIES,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    /// Dedup window of this ledger
    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a submission or reject it as a duplicate
    ///
    /// On success the returned [`Admission`] keeps the session marked as in
    /// flight until it is dropped.
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] reason when the session already has a request
    /// in flight or the fingerprint was seen within the window.
    pub fn try_admit(
        self: &Arc<Self>,
        fingerprint: Fingerprint,
        session_key: &str,
    ) -> Result<Admission, Rejection> {
        self.try_admit_with(fingerprint, &[], session_key)
    }

    /// Like [`DedupLedger::try_admit`], also treating a recent record of any
    /// of `aliases` as a duplicate
    ///
    /// # Errors
    ///
    /// Returns the [`Rejection`] reason when the session already has a request
    /// in flight or one of the fingerprints was seen within the window.
    pub fn try_admit_with(
        self: &Arc<Self>,
        fingerprint: Fingerprint,
        aliases: &[Fingerprint],
        session_key: &str,
    ) -> Result<Admission, Rejection> {
        let now = Instant::now();
        let mut inner = self.lock();

        if inner.in_flight.contains_key(session_key) {
            return Err(Rejection::InFlight);
        }

        let seen = std::iter::once(&fingerprint).chain(aliases).any(|fp| {
            inner
                .records
                .get(fp)
                .is_some_and(|r| r.in_flight || now.duration_since(r.timestamp) < self.window)
        });
        if seen {
            return Err(Rejection::RecentDuplicate);
        }

        if inner.records.len() >= self.max_entries {
            let window = self.window;
            inner
                .records
                .retain(|_, r| r.in_flight || now.duration_since(r.timestamp) < window);
        }

        // If still at capacity after eviction, remove oldest settled entry
        if inner.records.len() >= self.max_entries
            && let Some(oldest) = inner
                .records
                .values()
                .filter(|r| !r.in_flight)
                .min_by_key(|r| r.timestamp)
                .map(|r| r.fingerprint.clone())
        {
            inner.records.remove(&oldest);
        }

        inner.records.insert(
            fingerprint.clone(),
            PendingRequestRecord {
                fingerprint: fingerprint.clone(),
                timestamp: now,
                in_flight: true,
            },
        );
        inner
            .in_flight
            .insert(session_key.to_string(), fingerprint.clone());
        drop(inner);

        Ok(Admission {
            ledger: Arc::clone(self),
            fingerprint,
            session_key: session_key.to_string(),
        })
    }

    fn complete(&self, fingerprint: &Fingerprint, session_key: &str) {
        let mut inner = self.lock();

        if let Some(record) = inner.records.get_mut(fingerprint) {
            record.in_flight = false;
        }

        if inner.in_flight.get(session_key) == Some(fingerprint) {
            inner.in_flight.remove(session_key);
        }
    }

    /// Evict settled entries older than the window
    ///
    /// Returns the number of evicted entries.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let window = self.window;
        let mut inner = self.lock();

        let before = inner.records.len();
        inner
            .records
            .retain(|_, r| r.in_flight || now.duration_since(r.timestamp) < window);
        before - inner.records.len()
    }

    /// Number of records currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether the ledger holds no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a request is being processed for the session
    #[must_use]
    pub fn is_in_flight(&self, session_key: &str) -> bool {
        self.lock().in_flight.contains_key(session_key)
    }

    /// Start the periodic sweep task
    ///
    /// The task stops when the returned handle or the ledger is dropped.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> LedgerSweeper {
        let ledger = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(ledger) = ledger.upgrade() else {
                    break;
                };
                let evicted = ledger.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, remaining = ledger.len(), "swept dedup ledger");
                }
            }
        });

        LedgerSweeper { handle }
    }
}

/// Accepted submission; clears the in-flight mark when dropped
#[derive(Debug)]
pub struct Admission {
    ledger: Arc<DedupLedger>,
    fingerprint: Fingerprint,
    session_key: String,
}

impl Admission {
    /// Fingerprint of the admitted submission
    #[must_use]
    pub const fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.ledger.complete(&self.fingerprint, &self.session_key);
    }
}

/// Handle to the ledger sweep task; aborts the task when dropped
#[derive(Debug)]
pub struct LedgerSweeper {
    handle: JoinHandle<()>,
}

impl Drop for LedgerSweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Client-side record of the last submission of one call session
///
/// Holds a single record that each new submission replaces.
#[derive(Debug)]
pub struct SubmissionGuard {
    window: Duration,
    last: Option<PendingRequestRecord>,
}

impl SubmissionGuard {
    /// Create a guard with the given dedup window
    #[must_use]
    pub const fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Record a new submission, or reject it
    ///
    /// # Errors
    ///
    /// Returns [`Rejection::InFlight`] while the previous submission is still
    /// pending and [`Rejection::RecentDuplicate`] for a repeated fingerprint
    /// inside the window.
    pub fn try_begin(&mut self, fingerprint: Fingerprint) -> Result<(), Rejection> {
        let now = Instant::now();

        if let Some(last) = &self.last {
            if last.in_flight {
                return Err(Rejection::InFlight);
            }
            if last.fingerprint == fingerprint && now.duration_since(last.timestamp) < self.window
            {
                return Err(Rejection::RecentDuplicate);
            }
        }

        self.last = Some(PendingRequestRecord {
            fingerprint,
            timestamp: now,
            in_flight: true,
        });
        Ok(())
    }

    /// Mark the current submission as settled
    pub fn finish(&mut self) {
        if let Some(last) = &mut self.last {
            last.in_flight = false;
        }
    }

    /// Whether a submission is pending
    #[must_use]
    pub fn in_flight(&self) -> bool {
        self.last.as_ref().is_some_and(|r| r.in_flight)
    }

    /// Drop the recorded submission
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;

    const WINDOW: Duration = Duration::from_secs(3);

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn fp(tag: &str) -> Fingerprint {
        Fingerprint::compute(tag, b"audio", at(1_000_000), WINDOW)
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_window_rejected() {
        let ledger = Arc::new(DedupLedger::new(WINDOW));

        let first = ledger.try_admit(fp("a"), "user:P1").unwrap();
        drop(first);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(
            ledger.try_admit(fp("a"), "user:P1").unwrap_err(),
            Rejection::RecentDuplicate
        );

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(ledger.try_admit(fp("a"), "user:P1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_across_bucket_boundary_rejected() {
        let ledger = Arc::new(DedupLedger::new(WINDOW));
        let audio = vec![9u8; 4_096];

        let first = Fingerprint::compute("P1", &audio, at(2_950), WINDOW);
        drop(ledger.try_admit(first, "user:P1").unwrap());

        tokio::time::advance(Duration::from_millis(100)).await;
        let retry_at = at(3_050);
        assert_eq!(
            ledger
                .try_admit_with(
                    Fingerprint::compute("P1", &audio, retry_at, WINDOW),
                    &[Fingerprint::compute_previous("P1", &audio, retry_at, WINDOW)],
                    "user:P1",
                )
                .unwrap_err(),
            Rejection::RecentDuplicate
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_session_rejects_any_fingerprint() {
        let ledger = Arc::new(DedupLedger::new(WINDOW));

        let admission = ledger.try_admit(fp("a"), "user:P1").unwrap();
        assert!(ledger.is_in_flight("user:P1"));
        assert_eq!(
            ledger.try_admit(fp("b"), "user:P1").unwrap_err(),
            Rejection::InFlight
        );

        // Other sessions are unaffected
        assert!(ledger.try_admit(fp("c"), "user:P2").is_ok());

        drop(admission);
        assert!(!ledger.is_in_flight("user:P1"));
        assert!(ledger.try_admit(fp("b"), "user:P1").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_only_expired_settled_entries() {
        let ledger = Arc::new(DedupLedger::new(WINDOW));

        drop(ledger.try_admit(fp("old"), "s1").unwrap());
        let _held = ledger.try_admit(fp("held"), "s2").unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        drop(ledger.try_admit(fp("fresh"), "s3").unwrap());

        assert_eq!(ledger.sweep(), 1);
        assert_eq!(ledger.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_runs_on_interval() {
        let ledger = Arc::new(DedupLedger::new(WINDOW));
        let _sweeper = ledger.spawn_sweeper(Duration::from_secs(10));

        drop(ledger.try_admit(fp("a"), "s1").unwrap());
        assert_eq!(ledger.len(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(ledger.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_guard() {
        let mut guard = SubmissionGuard::new(WINDOW);

        guard.try_begin(fp("a")).unwrap();
        assert!(guard.in_flight());
        assert_eq!(guard.try_begin(fp("b")).unwrap_err(), Rejection::InFlight);

        guard.finish();
        assert_eq!(
            guard.try_begin(fp("a")).unwrap_err(),
            Rejection::RecentDuplicate
        );
        assert!(guard.try_begin(fp("b")).is_ok());

        guard.finish();
        tokio::time::advance(Duration::from_secs(4)).await;
        guard.reset();
        assert!(guard.try_begin(fp("b")).is_ok());
    }

    #[test]
    fn test_rejection_maps_to_duplicate_error() {
        let err: crate::Error = Rejection::InFlight.into();
        assert!(err.is_silent());
    }
}
