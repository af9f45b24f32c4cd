//! Batch delivery to the ingestion endpoint: transport seam, circuit
//! breaker, exponential backoff, and the flush state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CollectorConfig;
use crate::entry::now_rfc3339;
use crate::store::LogStore;
use crate::INTERNAL_TARGET;

/// Consecutive failures before the circuit opens.
pub const FAILURE_THRESHOLD: u32 = 5;
/// How long an open circuit suppresses flushes before probing again.
pub const CIRCUIT_RESET: Duration = Duration::from_secs(60);
/// Beacon payloads above this size fall back to a regular POST.
pub const BEACON_MAX_BYTES: usize = 60 * 1024;

const SEND_TIMEOUT: Duration = Duration::from_secs(30);
const BEACON_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_JITTER_MS: u64 = 100;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("endpoint returned HTTP {status}")]
    Status { status: u16 },
    #[error("request failed: {0}")]
    Request(String),
}

/// One serialized batch on its way out.
pub struct BatchRequest<'a> {
    pub url: &'a str,
    pub api_key: Option<&'a str>,
    pub body: &'a [u8],
    /// Unload sends run against a short deadline.
    pub keepalive: bool,
}

/// Transport seam; production uses [`HttpTransport`], tests inject mocks.
pub trait Transport: Send + Sync {
    fn post_batch(&self, request: &BatchRequest<'_>) -> Result<(), TransportError>;

    /// Best-effort fire-and-forget send for the unload path. Returns whether
    /// the payload was handed off; a refusal falls back to a regular POST.
    fn send_beacon(&self, request: &BatchRequest<'_>) -> bool;
}

pub struct HttpTransport {
    client: reqwest::blocking::Client,
    beacon: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        let beacon = reqwest::blocking::Client::builder()
            .timeout(BEACON_TIMEOUT)
            .build()
            .map_err(|err| TransportError::Request(err.to_string()))?;
        Ok(Self { client, beacon })
    }

    fn request(
        client: &reqwest::blocking::Client,
        request: &BatchRequest<'_>,
    ) -> reqwest::blocking::RequestBuilder {
        let mut builder = client
            .post(request.url)
            .header("Content-Type", "application/json")
            .header("X-Request-Timestamp", now_rfc3339())
            .body(request.body.to_vec());
        if let Some(api_key) = request.api_key {
            builder = builder.header("X-Api-Key", api_key);
        }
        if request.keepalive {
            builder = builder.timeout(BEACON_TIMEOUT);
        }
        builder
    }
}

impl Transport for HttpTransport {
    fn post_batch(&self, request: &BatchRequest<'_>) -> Result<(), TransportError> {
        let response = Self::request(&self.client, request)
            .send()
            .map_err(|err| TransportError::Request(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(TransportError::Status {
                status: status.as_u16(),
            })
        }
    }

    fn send_beacon(&self, request: &BatchRequest<'_>) -> bool {
        Self::request(&self.beacon, request).send().is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// closed → (threshold consecutive failures) → open → (reset timeout) →
/// half-open → success closes, failure re-opens.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    threshold: u32,
    reset_after: Duration,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            threshold,
            reset_after,
            opened_at: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether a flush may proceed right now. An expired open interval
    /// transitions to half-open and admits the single probe flush.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = self
                    .opened_at
                    .map(|at| now.duration_since(at) >= self.reset_after)
                    .unwrap_or(true);
                if expired {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    /// Returns the state after accounting for the failure.
    pub fn record_failure(&mut self, now: Instant) -> CircuitState {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.state == CircuitState::HalfOpen || self.consecutive_failures >= self.threshold {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
        }
        self.state
    }
}

/// Exponential backoff with jitter: `base · 2^retries + uniform(0,100) ms`.
pub fn backoff_delay(base: Duration, retries: u32) -> Duration {
    let base_ms = base.as_millis() as u64;
    let factor = 1u64 << retries.min(16);
    let jitter = rand::thread_rng().gen_range(0..MAX_JITTER_MS);
    Duration::from_millis(base_ms.saturating_mul(factor).saturating_add(jitter))
}

enum Attempt {
    /// Nothing to do: circuit open, no batch, or the store is unreadable.
    Idle,
    /// Batch acknowledged, more records pending.
    SentMore,
    /// Batch acknowledged, store drained.
    SentDone,
    Failed { circuit_opened: bool },
}

struct SendingGuard<'a>(&'a AtomicBool);

impl Drop for SendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The cooperative sender. The `sending` flag is the sole serialization
/// point: a flush requested while one is in progress is a no-op.
pub struct DeliveryEngine {
    transport: Box<dyn Transport>,
    breaker: Mutex<CircuitBreaker>,
    sending: AtomicBool,
}

impl DeliveryEngine {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            breaker: Mutex::new(CircuitBreaker::new(FAILURE_THRESHOLD, CIRCUIT_RESET)),
            sending: AtomicBool::new(false),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker
            .lock()
            .expect("breaker lock should not be poisoned")
            .state()
    }

    /// Drains batches until the store is empty, a failure exhausts the retry
    /// budget, or the circuit opens. Retries sleep between attempts with the
    /// send flag released so an unload flush is never blocked by one.
    pub fn run_flush<S: LogStore>(
        &self,
        store: &Mutex<S>,
        cfg: &CollectorConfig,
        mut retries: u32,
        is_unload: bool,
    ) {
        if cfg.dsn.is_none() {
            return;
        }

        loop {
            if self
                .sending
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return;
            }
            let guard = SendingGuard(&self.sending);
            let attempt = self.flush_attempt(store, cfg, is_unload);
            drop(guard);

            match attempt {
                Attempt::Idle | Attempt::SentDone => return,
                Attempt::SentMore => {
                    retries = 0;
                }
                Attempt::Failed { circuit_opened } => {
                    if circuit_opened || is_unload || retries >= cfg.max_retries {
                        return;
                    }
                    std::thread::sleep(backoff_delay(cfg.retry_delay, retries));
                    retries += 1;
                }
            }
        }
    }

    fn flush_attempt<S: LogStore>(
        &self,
        store: &Mutex<S>,
        cfg: &CollectorConfig,
        is_unload: bool,
    ) -> Attempt {
        let dsn = cfg.dsn.as_deref().expect("dsn checked by run_flush");

        {
            let mut breaker = self
                .breaker
                .lock()
                .expect("breaker lock should not be poisoned");
            if !breaker.allow(Instant::now()) {
                debug!(
                    target: INTERNAL_TARGET,
                    component = "delivery",
                    event = "delivery.circuit.skipped"
                );
                return Attempt::Idle;
            }
        }

        let batch = {
            let mut store = store.lock().expect("store lock should not be poisoned");
            match store.read_oldest(cfg.batch_size) {
                Ok(batch) => batch,
                Err(err) => {
                    warn!(
                        target: INTERNAL_TARGET,
                        component = "delivery",
                        event = "delivery.batch.read_failed",
                        error = %err
                    );
                    return Attempt::Idle;
                }
            }
        };
        if batch.is_empty() {
            return Attempt::Idle;
        }

        let ids: Vec<String> = batch.iter().filter_map(|entry| entry.id.clone()).collect();
        let body = match serde_json::to_vec(&batch) {
            Ok(body) => body,
            Err(err) => {
                warn!(
                    target: INTERNAL_TARGET,
                    component = "delivery",
                    event = "delivery.batch.serialize_failed",
                    error = %err
                );
                return Attempt::Idle;
            }
        };
        let request = BatchRequest {
            url: dsn,
            api_key: cfg.api_key.as_deref(),
            body: &body,
            keepalive: is_unload,
        };

        let outcome = if is_unload
            && body.len() < BEACON_MAX_BYTES
            && self.transport.send_beacon(&request)
        {
            Ok(())
        } else {
            self.transport.post_batch(&request)
        };

        match outcome {
            Ok(()) => {
                self.breaker
                    .lock()
                    .expect("breaker lock should not be poisoned")
                    .record_success();
                if let Some(hook) = &cfg.hooks.on_send_success {
                    hook(&batch);
                }

                let mut store = store.lock().expect("store lock should not be poisoned");
                if let Err(err) = store.delete_by_ids(&ids) {
                    warn!(
                        target: INTERNAL_TARGET,
                        component = "delivery",
                        event = "delivery.ack.delete_failed",
                        error = %err
                    );
                }
                debug!(
                    target: INTERNAL_TARGET,
                    component = "delivery",
                    event = "delivery.batch.sent",
                    records = batch.len()
                );
                if store.len().unwrap_or(0) > 0 {
                    Attempt::SentMore
                } else {
                    Attempt::SentDone
                }
            }
            Err(err) => {
                let state = self
                    .breaker
                    .lock()
                    .expect("breaker lock should not be poisoned")
                    .record_failure(Instant::now());
                warn!(
                    target: INTERNAL_TARGET,
                    component = "delivery",
                    event = "delivery.send.failed",
                    error = %err,
                    circuit = ?state
                );
                if let Some(hook) = &cfg.hooks.on_send_failure {
                    hook(&err, &batch);
                }
                Attempt::Failed {
                    circuit_opened: state == CircuitState::Open,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectorConfig;
    use crate::entry::{Level, LogEntry};
    use crate::store::MemoryStore;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn entry(message: &str) -> LogEntry {
        let mut entry = LogEntry::new(Level::Info, message, "svc");
        entry.ensure_id();
        entry
    }

    fn delivery_config(batch_size: usize, max_retries: u32) -> CollectorConfig {
        let mut cfg = CollectorConfig::default();
        cfg.dsn = Some("http://127.0.0.1:9/ingest".to_string());
        cfg.batch_size = batch_size;
        cfg.max_retries = max_retries;
        cfg.retry_delay = Duration::from_millis(5);
        cfg
    }

    struct ScriptedTransport {
        calls: AtomicUsize,
        beacon_calls: AtomicUsize,
        // Statuses returned per call; exhausted script keeps failing.
        script: Vec<u16>,
        beacon_accepts: bool,
    }

    impl ScriptedTransport {
        fn new(script: Vec<u16>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                beacon_calls: AtomicUsize::new(0),
                script,
                beacon_accepts: false,
            })
        }

        fn with_beacon(script: Vec<u16>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                beacon_calls: AtomicUsize::new(0),
                script,
                beacon_accepts: true,
            })
        }

        fn posts(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Transport for Arc<ScriptedTransport> {
        fn post_batch(&self, _request: &BatchRequest<'_>) -> Result<(), TransportError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.get(call).copied().unwrap_or(500) {
                status if (200..300).contains(&status) => Ok(()),
                status => Err(TransportError::Status { status }),
            }
        }

        fn send_beacon(&self, _request: &BatchRequest<'_>) -> bool {
            self.beacon_calls.fetch_add(1, Ordering::SeqCst);
            self.beacon_accepts
        }
    }

    #[test]
    fn breaker_opens_after_threshold_and_half_opens_after_reset() {
        let mut breaker = CircuitBreaker::new(5, Duration::from_millis(10));
        let start = Instant::now();

        for _ in 0..4 {
            assert_eq!(breaker.record_failure(start), CircuitState::Closed);
        }
        assert_eq!(breaker.record_failure(start), CircuitState::Open);
        assert!(!breaker.allow(start));

        // Probe is admitted once the reset interval elapses.
        assert!(breaker.allow(start + Duration::from_millis(10)));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        // A half-open failure re-opens immediately.
        assert_eq!(
            breaker.record_failure(start + Duration::from_millis(11)),
            CircuitState::Open
        );

        // A half-open success closes and clears the failure count.
        assert!(breaker.allow(start + Duration::from_millis(25)));
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        for retries in 0..4u32 {
            let delay = backoff_delay(Duration::from_millis(100), retries).as_millis() as u64;
            let floor = 100 * (1 << retries);
            assert!(delay >= floor, "delay {delay} below floor {floor}");
            assert!(delay < floor + MAX_JITTER_MS);
        }
    }

    #[test]
    fn flush_drains_the_store_batch_by_batch() {
        let transport = ScriptedTransport::new(vec![200, 200, 200]);
        let engine = DeliveryEngine::new(Box::new(Arc::clone(&transport)));
        let store = Mutex::new(MemoryStore::new());
        store
            .lock()
            .unwrap()
            .append(vec![entry("a"), entry("b"), entry("c")])
            .unwrap();

        engine.run_flush(&store, &delivery_config(2, 0), 0, false);

        assert_eq!(transport.posts(), 2);
        assert_eq!(store.lock().unwrap().len().unwrap(), 0);
        assert_eq!(engine.circuit_state(), CircuitState::Closed);
    }

    #[test]
    fn failed_batch_stays_in_the_store() {
        let transport = ScriptedTransport::new(vec![500]);
        let engine = DeliveryEngine::new(Box::new(Arc::clone(&transport)));
        let store = Mutex::new(MemoryStore::new());
        store.lock().unwrap().append(vec![entry("kept")]).unwrap();

        engine.run_flush(&store, &delivery_config(10, 0), 0, false);

        assert_eq!(transport.posts(), 1);
        assert_eq!(store.lock().unwrap().len().unwrap(), 1);
    }

    #[test]
    fn retries_follow_the_budget_then_give_up() {
        let transport = ScriptedTransport::new(vec![500, 500, 500, 500]);
        let engine = DeliveryEngine::new(Box::new(Arc::clone(&transport)));
        let store = Mutex::new(MemoryStore::new());
        store.lock().unwrap().append(vec![entry("x")]).unwrap();

        engine.run_flush(&store, &delivery_config(10, 2), 0, false);

        // Initial attempt plus two retries.
        assert_eq!(transport.posts(), 3);
        assert_eq!(store.lock().unwrap().len().unwrap(), 1);
    }

    #[test]
    fn missing_dsn_is_a_no_op() {
        let transport = ScriptedTransport::new(vec![200]);
        let engine = DeliveryEngine::new(Box::new(Arc::clone(&transport)));
        let store = Mutex::new(MemoryStore::new());
        store.lock().unwrap().append(vec![entry("x")]).unwrap();

        let mut cfg = delivery_config(10, 0);
        cfg.dsn = None;
        engine.run_flush(&store, &cfg, 0, false);

        assert_eq!(transport.posts(), 0);
        assert_eq!(store.lock().unwrap().len().unwrap(), 1);
    }

    #[test]
    fn unload_flush_prefers_the_beacon() {
        let transport = ScriptedTransport::with_beacon(vec![]);
        let engine = DeliveryEngine::new(Box::new(Arc::clone(&transport)));
        let store = Mutex::new(MemoryStore::new());
        store
            .lock()
            .unwrap()
            .append(vec![entry("a"), entry("b")])
            .unwrap();

        engine.run_flush(&store, &delivery_config(10, 3), 0, true);

        assert_eq!(transport.beacon_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.posts(), 0);
        assert_eq!(store.lock().unwrap().len().unwrap(), 0);
    }

    #[test]
    fn refused_beacon_falls_back_to_post() {
        let transport = ScriptedTransport::new(vec![200]);
        let engine = DeliveryEngine::new(Box::new(Arc::clone(&transport)));
        let store = Mutex::new(MemoryStore::new());
        store.lock().unwrap().append(vec![entry("a")]).unwrap();

        engine.run_flush(&store, &delivery_config(10, 3), 0, true);

        assert_eq!(transport.beacon_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.posts(), 1);
        assert_eq!(store.lock().unwrap().len().unwrap(), 0);
    }

    #[test]
    fn open_circuit_short_circuits_without_consuming() {
        let transport = ScriptedTransport::new(vec![]);
        let engine = DeliveryEngine::new(Box::new(Arc::clone(&transport)));
        let store = Mutex::new(MemoryStore::new());
        let cfg = delivery_config(1, 0);

        // Five failing flushes open the circuit.
        for _ in 0..5 {
            store.lock().unwrap().append(vec![entry("x")]).unwrap();
            engine.run_flush(&store, &cfg, 0, false);
        }
        assert_eq!(engine.circuit_state(), CircuitState::Open);
        let posts_when_opened = transport.posts();
        assert_eq!(posts_when_opened, 5);

        // Further flushes produce no transport traffic and leave the store.
        let pending = store.lock().unwrap().len().unwrap();
        engine.run_flush(&store, &cfg, 0, false);
        assert_eq!(transport.posts(), posts_when_opened);
        assert_eq!(store.lock().unwrap().len().unwrap(), pending);
    }
}
