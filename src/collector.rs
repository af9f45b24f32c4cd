//! The public façade: configuration lifecycle, store routing, the
//! enrichment pipeline, and the background flusher.

use std::backtrace::Backtrace;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::breadcrumbs::BreadcrumbRing;
use crate::capture::interaction::ClickEvent;
use crate::capture::{AdapterRegistry, ConsoleCaptureLayer};
use crate::config::{error_ignored, CollectorConfig, ConfigPatch};
use crate::delivery::{CircuitState, DeliveryEngine, HttpTransport, Transport, TransportError};
use crate::entry::{Breadcrumb, BreadcrumbKind, Context, HostInfo, Level, LogEntry};
use crate::policy::{self, RateLimiter};
use crate::spool::Spool;
use crate::store::{LogStore, SqliteStore, StoreRouter};
use crate::INTERNAL_TARGET;

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("transport initialization failed: {0}")]
    Transport(#[from] TransportError),
}

/// Attribute groups a capture adapter attaches beyond message and context.
#[derive(Debug, Default, Clone)]
pub(crate) struct CaptureAttrs {
    pub error_name: Option<String>,
    pub stack: Option<String>,
    pub reason: Option<String>,
    pub request_method: Option<String>,
    pub request_url: Option<String>,
    pub status_code: Option<u16>,
    pub status_text: Option<String>,
    pub duration_ms: Option<u64>,
    pub response_size: Option<u64>,
    pub error_message: Option<String>,
    pub element: Option<String>,
    pub coords: Option<(f64, f64)>,
}

impl CaptureAttrs {
    fn apply(self, entry: &mut LogEntry) {
        entry.error_name = self.error_name;
        entry.stack = self.stack;
        entry.reason = self.reason;
        entry.request_method = self.request_method;
        entry.request_url = self.request_url;
        entry.status_code = self.status_code;
        entry.status_text = self.status_text;
        entry.duration_ms = self.duration_ms;
        entry.response_size = self.response_size;
        entry.error_message = self.error_message;
        entry.element = self.element;
        entry.coords = self.coords;
    }
}

enum FlusherSignal {
    Flush,
    Rearm,
    Shutdown,
}

pub(crate) struct Inner {
    config: RwLock<Arc<CollectorConfig>>,
    store: Mutex<StoreRouter>,
    breadcrumbs: Mutex<BreadcrumbRing>,
    rate: Mutex<RateLimiter>,
    engine: DeliveryEngine,
    host: HostInfo,
    registry: Mutex<AdapterRegistry>,
    flush_tx: Mutex<Option<Sender<FlusherSignal>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Cheaply cloneable handle to the collection pipeline.
#[derive(Clone)]
pub struct Collector {
    inner: Arc<Inner>,
}

/// Non-owning handle used by adapters installed into ambient globals, so a
/// dropped collector never lingers behind a patched hook.
#[derive(Clone)]
pub struct WeakCollector(Weak<Inner>);

impl WeakCollector {
    pub fn upgrade(&self) -> Option<Collector> {
        self.0.upgrade().map(|inner| Collector { inner })
    }
}

impl Collector {
    /// Builds the collector with the production HTTP transport.
    pub fn new(config: CollectorConfig) -> Result<Self, CollectorError> {
        let transport = HttpTransport::new()?;
        Ok(Self::with_transport(config, Box::new(transport)))
    }

    /// Builds the collector around an injected transport.
    pub fn with_transport(config: CollectorConfig, transport: Box<dyn Transport>) -> Self {
        let durable = config
            .enable_store
            .then(|| SqliteStore::new(&config.store_path, config.store_schema_version));
        let spool = config
            .enable_spool
            .then(|| Spool::new(&config.spool_path, config.max_spool_bytes));
        let mut router = StoreRouter::new(durable, spool);
        router.load_backlog();

        let ring = BreadcrumbRing::new(
            config.max_breadcrumbs,
            config.hooks.before_breadcrumb.clone(),
        );
        let rate = RateLimiter::new(config.max_logs_per_minute);

        let inner = Arc::new(Inner {
            config: RwLock::new(Arc::new(config)),
            store: Mutex::new(router),
            breadcrumbs: Mutex::new(ring),
            rate: Mutex::new(rate),
            engine: DeliveryEngine::new(transport),
            host: HostInfo::collect(),
            registry: Mutex::new(AdapterRegistry::new()),
            flush_tx: Mutex::new(None),
            flusher: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        });

        let (tx, rx) = mpsc::channel();
        let weak = Arc::downgrade(&inner);
        match thread::Builder::new()
            .name("logship-flusher".to_string())
            .spawn(move || flusher_loop(weak, rx))
        {
            Ok(handle) => {
                *inner
                    .flush_tx
                    .lock()
                    .expect("flush_tx lock should not be poisoned") = Some(tx);
                *inner
                    .flusher
                    .lock()
                    .expect("flusher lock should not be poisoned") = Some(handle);
            }
            Err(err) => warn!(
                target: INTERNAL_TARGET,
                component = "collector",
                event = "collector.flusher.spawn_failed",
                error = %err
            ),
        }

        let collector = Self { inner };
        collector
            .inner
            .registry
            .lock()
            .expect("registry lock should not be poisoned")
            .install_enabled(&collector);

        let cfg = collector.config_snapshot();
        info!(
            target: INTERNAL_TARGET,
            component = "collector",
            event = "collector.started",
            service = %cfg.service,
            durable = collector
                .inner
                .store
                .lock()
                .expect("store lock should not be poisoned")
                .is_durable(),
            dsn_configured = cfg.dsn.is_some()
        );
        collector
    }

    pub fn downgrade(&self) -> WeakCollector {
        WeakCollector(Arc::downgrade(&self.inner))
    }

    pub(crate) fn config_snapshot(&self) -> Arc<CollectorConfig> {
        Arc::clone(
            &self
                .inner
                .config
                .read()
                .expect("config lock should not be poisoned"),
        )
    }

    // ---- public capture API ------------------------------------------------

    pub fn log(&self, level: Level, message: &str, context: Option<Context>) {
        self.capture(
            level,
            message.to_string(),
            context.unwrap_or_default(),
            CaptureAttrs::default(),
        );
    }

    /// Variadic-style form: parts are joined with single spaces, non-string
    /// values rendered as compact JSON.
    pub fn log_parts(&self, level: Level, parts: &[serde_json::Value], context: Option<Context>) {
        self.capture(
            level,
            crate::entry::join_parts(parts),
            context.unwrap_or_default(),
            CaptureAttrs::default(),
        );
    }

    pub fn trace(&self, message: &str, context: Option<Context>) {
        self.log(Level::Trace, message, context);
    }

    pub fn debug(&self, message: &str, context: Option<Context>) {
        self.log(Level::Debug, message, context);
    }

    pub fn info(&self, message: &str, context: Option<Context>) {
        self.log(Level::Info, message, context);
    }

    pub fn warn(&self, message: &str, context: Option<Context>) {
        self.log(Level::Warn, message, context);
    }

    pub fn error(&self, message: &str, context: Option<Context>) {
        self.log(Level::Error, message, context);
    }

    pub fn fatal(&self, message: &str, context: Option<Context>) {
        self.log(Level::Fatal, message, context);
    }

    pub fn critical(&self, message: &str, context: Option<Context>) {
        self.log(Level::Critical, message, context);
    }

    /// Structured-error capture: extracts the error's type name and a
    /// backtrace, and honors `ignore_errors` before routing.
    pub fn capture_error<E>(&self, error: &E, context: Option<Context>)
    where
        E: std::error::Error + ?Sized,
    {
        let message = error.to_string();
        let cfg = self.config_snapshot();
        if error_ignored(&cfg.ignore_errors, &message) {
            return;
        }

        let attrs = CaptureAttrs {
            error_name: Some(short_type_name::<E>()),
            stack: Some(Backtrace::force_capture().to_string()),
            ..CaptureAttrs::default()
        };
        self.capture(
            Level::Error,
            message.clone(),
            context.unwrap_or_default(),
            attrs,
        );
        self.add_breadcrumb(Breadcrumb::new(BreadcrumbKind::Error, message));
    }

    pub fn add_breadcrumb(&self, crumb: Breadcrumb) {
        self.inner
            .breadcrumbs
            .lock()
            .expect("breadcrumb lock should not be poisoned")
            .add(crumb);
    }

    // ---- adapter-facing surface -------------------------------------------

    /// The enrichment sink every adapter and public wrapper routes through.
    pub(crate) fn capture(
        &self,
        level: Level,
        message: String,
        context: Context,
        attrs: CaptureAttrs,
    ) {
        let cfg = self.config_snapshot();
        if !policy::level_allows(cfg.log_level, level) {
            return;
        }
        if !policy::should_sample(&cfg.sampling_rates, level) {
            return;
        }
        let now_ms = Utc::now().timestamp_millis();
        if !self
            .inner
            .rate
            .lock()
            .expect("rate lock should not be poisoned")
            .admit(now_ms)
        {
            debug!(
                target: INTERNAL_TARGET,
                component = "collector",
                event = "collector.rate_limited",
                level = level.as_str()
            );
            return;
        }

        let mut entry = LogEntry::new(level, message, cfg.service.clone());
        entry.context = context;
        if let Some(provider) = &cfg.hooks.global_context {
            entry.global_context = provider();
        }
        if let Some(provider) = &cfg.hooks.user_context {
            entry.user_context = provider();
        }
        entry.user = cfg.user.clone();
        entry.host = Some(self.inner.host.clone());
        entry.breadcrumbs = self
            .inner
            .breadcrumbs
            .lock()
            .expect("breadcrumb lock should not be poisoned")
            .snapshot();
        attrs.apply(&mut entry);
        entry.ensure_id();

        policy::mask_entry(&mut entry, &cfg.mask_fields);

        let entry = match &cfg.hooks.before_send {
            Some(hook) => match hook(entry) {
                Some(entry) => entry,
                None => return,
            },
            None => entry,
        };

        let pending = {
            let mut store = self
                .inner
                .store
                .lock()
                .expect("store lock should not be poisoned");
            if let Err(err) = store.append(vec![entry]) {
                warn!(
                    target: INTERNAL_TARGET,
                    component = "collector",
                    event = "collector.enqueue_failed",
                    error = %err
                );
                return;
            }
            store.len().unwrap_or(0)
        };
        if pending >= cfg.batch_size {
            self.request_flush();
        }
    }

    pub(crate) fn network_capture_enabled(&self) -> bool {
        self.config_snapshot().enable_network_capture
            && self
                .inner
                .registry
                .lock()
                .expect("registry lock should not be poisoned")
                .network
                .enabled_flag()
                .load(Ordering::SeqCst)
    }

    /// The capture layer to hand to `tracing_subscriber` at telemetry init.
    pub fn console_layer(&self) -> ConsoleCaptureLayer {
        let flag = self
            .inner
            .registry
            .lock()
            .expect("registry lock should not be poisoned")
            .console
            .enabled_flag();
        ConsoleCaptureLayer::new(self.downgrade(), flag)
    }

    // ---- host-fed interaction and navigation ------------------------------

    pub fn record_click(&self, event: ClickEvent) {
        let window = self.config_snapshot().breadcrumb_buffer_interval;
        let mut registry = self
            .inner
            .registry
            .lock()
            .expect("registry lock should not be poisoned");
        registry.interaction.record_click(self, event, window);
    }

    pub fn record_input(&self, field_name: &str) {
        let mut registry = self
            .inner
            .registry
            .lock()
            .expect("registry lock should not be poisoned");
        registry.interaction.record_input(self, field_name);
    }

    pub fn route_push(&self, route: &str) {
        let mut registry = self
            .inner
            .registry
            .lock()
            .expect("registry lock should not be poisoned");
        registry.navigation.push(self, route);
    }

    pub fn route_replace(&self, route: &str) {
        let mut registry = self
            .inner
            .registry
            .lock()
            .expect("registry lock should not be poisoned");
        registry.navigation.replace(self, route);
    }

    pub fn route_back(&self) {
        let mut registry = self
            .inner
            .registry
            .lock()
            .expect("registry lock should not be poisoned");
        registry.navigation.back(self);
    }

    // ---- lifecycle ---------------------------------------------------------

    /// Shallow-merges the patch into a fresh immutable snapshot; derived
    /// state (rate limiter, breadcrumb capacity, batch timer) is rebuilt
    /// when its inputs changed.
    pub fn update_config(&self, patch: ConfigPatch) {
        let (old, new) = {
            let mut guard = self
                .inner
                .config
                .write()
                .expect("config lock should not be poisoned");
            let old = Arc::clone(&guard);
            let next = Arc::new(old.with_patch(&patch));
            *guard = Arc::clone(&next);
            (old, next)
        };

        if new.max_logs_per_minute != old.max_logs_per_minute {
            self.inner
                .rate
                .lock()
                .expect("rate lock should not be poisoned")
                .set_limit(new.max_logs_per_minute);
        }
        if new.max_breadcrumbs != old.max_breadcrumbs {
            self.inner
                .breadcrumbs
                .lock()
                .expect("breadcrumb lock should not be poisoned")
                .set_capacity(new.max_breadcrumbs);
        }
        if new.batch_interval != old.batch_interval {
            self.signal(FlusherSignal::Rearm);
        }

        info!(
            target: INTERNAL_TARGET,
            component = "collector",
            event = "collector.config.updated",
            batch_size = new.batch_size,
            batch_interval_ms = new.batch_interval.as_millis() as u64,
            log_level = new.log_level.as_str()
        );
    }

    /// Asks the flusher thread for an immediate flush.
    pub fn flush_now(&self) {
        self.request_flush();
    }

    /// Runs a flush on the calling thread; a flush already in progress
    /// makes this a no-op.
    pub fn flush_blocking(&self) {
        let cfg = self.config_snapshot();
        self.inner.engine.run_flush(&self.inner.store, &cfg, 0, false);
    }

    /// The unload path: stops the batch timer, flushes what is pending with
    /// the beacon preferred, and restores every patched global. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(tx) = self
            .inner
            .flush_tx
            .lock()
            .expect("flush_tx lock should not be poisoned")
            .take()
        {
            let _ = tx.send(FlusherSignal::Shutdown);
        }
        if let Some(handle) = self
            .inner
            .flusher
            .lock()
            .expect("flusher lock should not be poisoned")
            .take()
        {
            let _ = handle.join();
        }

        let cfg = self.config_snapshot();
        self.inner.engine.run_flush(&self.inner.store, &cfg, 0, true);

        self.inner
            .registry
            .lock()
            .expect("registry lock should not be poisoned")
            .uninstall_all();

        info!(
            target: INTERNAL_TARGET,
            component = "collector",
            event = "collector.shutdown",
            pending = self.pending()
        );
    }

    /// Arms a SIGINT watcher that runs the unload path; the flush itself is
    /// moved off the async runtime.
    pub async fn shutdown_on_ctrl_c(self) {
        if tokio::signal::ctrl_c().await.is_ok() {
            let collector = self.clone();
            let _ = tokio::task::spawn_blocking(move || collector.shutdown()).await;
        }
    }

    // ---- introspection -----------------------------------------------------

    /// Records currently awaiting delivery.
    pub fn pending(&self) -> usize {
        self.inner
            .store
            .lock()
            .expect("store lock should not be poisoned")
            .len()
            .unwrap_or(0)
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.engine.circuit_state()
    }

    pub fn installed_adapters(&self) -> Vec<&'static str> {
        self.inner
            .registry
            .lock()
            .expect("registry lock should not be poisoned")
            .installed_names()
    }

    /// Restores every patched global without shutting delivery down.
    pub fn uninstall_adapters(&self) {
        self.inner
            .registry
            .lock()
            .expect("registry lock should not be poisoned")
            .uninstall_all();
    }

    /// Re-installs the adapters the configuration enables; a fresh install
    /// after a teardown behaves identically to the first.
    pub fn reinstall_adapters(&self) {
        let mut registry = self
            .inner
            .registry
            .lock()
            .expect("registry lock should not be poisoned");
        registry.install_enabled(self);
    }

    fn request_flush(&self) {
        self.signal(FlusherSignal::Flush);
    }

    fn signal(&self, signal: FlusherSignal) {
        if let Some(tx) = &*self
            .inner
            .flush_tx
            .lock()
            .expect("flush_tx lock should not be poisoned")
        {
            let _ = tx.send(signal);
        }
    }
}

fn flusher_loop(weak: Weak<Inner>, rx: Receiver<FlusherSignal>) {
    loop {
        let interval = match weak.upgrade() {
            Some(inner) => {
                inner
                    .config
                    .read()
                    .expect("config lock should not be poisoned")
                    .batch_interval
            }
            None => return,
        };

        match rx.recv_timeout(interval) {
            Ok(FlusherSignal::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
            Ok(FlusherSignal::Rearm) => continue,
            Ok(FlusherSignal::Flush) | Err(RecvTimeoutError::Timeout) => {
                let Some(inner) = weak.upgrade() else { return };
                let cfg = Arc::clone(
                    &inner
                        .config
                        .read()
                        .expect("config lock should not be poisoned"),
                );
                inner.engine.run_flush(&inner.store, &cfg, 0, false);
                inner
                    .rate
                    .lock()
                    .expect("rate lock should not be poisoned")
                    .purge_stale(Utc::now().timestamp_millis());
            }
        }
    }
}

fn short_type_name<E: ?Sized>() -> String {
    std::any::type_name::<E>()
        .rsplit("::")
        .next()
        .unwrap_or("error")
        .to_string()
}
