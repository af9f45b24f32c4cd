//! Collector configuration: defaults, environment overlay, and the shallow
//! runtime patch applied by `update_config`.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use crate::delivery::TransportError;
use crate::entry::{Breadcrumb, Context, Level, LogEntry};

pub const DEFAULT_SERVICE: &str = "frontend-app";
pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BREADCRUMBS: usize = 50;
pub const DEFAULT_BREADCRUMB_BUFFER_INTERVAL: Duration = Duration::from_millis(300);
pub const DEFAULT_MAX_SPOOL_BYTES: usize = 1024 * 1024;
pub const DEFAULT_STORE_SCHEMA_VERSION: u32 = 1;

/// Pattern filtering captured network requests.
#[derive(Clone)]
pub enum UrlPattern {
    Substring(String),
    Pattern(Regex),
}

impl UrlPattern {
    pub fn matches(&self, url: &str) -> bool {
        match self {
            Self::Substring(fragment) => url.contains(fragment.as_str()),
            Self::Pattern(regex) => regex.is_match(url),
        }
    }
}

impl fmt::Debug for UrlPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Substring(fragment) => write!(f, "Substring({fragment:?})"),
            Self::Pattern(regex) => write!(f, "Pattern({:?})", regex.as_str()),
        }
    }
}

/// Pattern or predicate suppressing captured errors.
#[derive(Clone)]
pub enum ErrorPattern {
    Substring(String),
    Pattern(Regex),
    Predicate(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl ErrorPattern {
    pub fn matches(&self, message: &str) -> bool {
        match self {
            Self::Substring(fragment) => message.contains(fragment.as_str()),
            Self::Pattern(regex) => regex.is_match(message),
            Self::Predicate(predicate) => predicate(message),
        }
    }
}

impl fmt::Debug for ErrorPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Substring(fragment) => write!(f, "Substring({fragment:?})"),
            Self::Pattern(regex) => write!(f, "Pattern({:?})", regex.as_str()),
            Self::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

pub fn url_ignored(patterns: &[UrlPattern], url: &str) -> bool {
    patterns.iter().any(|pattern| pattern.matches(url))
}

pub fn error_ignored(patterns: &[ErrorPattern], message: &str) -> bool {
    patterns.iter().any(|pattern| pattern.matches(message))
}

pub type BeforeSend = Arc<dyn Fn(LogEntry) -> Option<LogEntry> + Send + Sync>;
pub type BeforeBreadcrumbHook = Arc<dyn Fn(Breadcrumb) -> Option<Breadcrumb> + Send + Sync>;
pub type SendSuccessHook = Arc<dyn Fn(&[LogEntry]) + Send + Sync>;
pub type SendFailureHook = Arc<dyn Fn(&TransportError, &[LogEntry]) + Send + Sync>;
pub type ContextProvider = Arc<dyn Fn() -> Context + Send + Sync>;
pub type RouteObserver = Arc<dyn Fn(&str, RouteChange) + Send + Sync>;

/// How a navigation transition was made; handed unchanged to the saved
/// route observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteChange {
    Push,
    Replace,
    Back,
}

/// Caller-supplied callbacks. Kept separate from the scalar keys so the
/// config snapshot stays cheap to clone and compare.
#[derive(Clone, Default)]
pub struct Hooks {
    pub before_send: Option<BeforeSend>,
    pub before_breadcrumb: Option<BeforeBreadcrumbHook>,
    pub on_send_success: Option<SendSuccessHook>,
    pub on_send_failure: Option<SendFailureHook>,
    pub global_context: Option<ContextProvider>,
    pub user_context: Option<ContextProvider>,
    pub route_observer: Option<RouteObserver>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_send", &self.before_send.is_some())
            .field("before_breadcrumb", &self.before_breadcrumb.is_some())
            .field("on_send_success", &self.on_send_success.is_some())
            .field("on_send_failure", &self.on_send_failure.is_some())
            .field("global_context", &self.global_context.is_some())
            .field("user_context", &self.user_context.is_some())
            .field("route_observer", &self.route_observer.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Ingestion endpoint. Delivery is inert without it.
    pub dsn: Option<String>,
    /// Sent verbatim as the `X-Api-Key` header.
    pub api_key: Option<String>,
    pub service: String,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub log_level: Level,
    pub enable_console_capture: bool,
    pub enable_panic_capture: bool,
    pub enable_network_capture: bool,
    pub enable_interaction_capture: bool,
    pub enable_navigation_capture: bool,
    pub ignore_urls: Vec<UrlPattern>,
    pub ignore_errors: Vec<ErrorPattern>,
    pub mask_fields: Vec<String>,
    pub sampling_rates: HashMap<Level, f64>,
    /// Hard cap per rolling minute; 0 means unlimited.
    pub max_logs_per_minute: u32,
    pub max_breadcrumbs: usize,
    pub breadcrumb_buffer_interval: Duration,
    pub enable_store: bool,
    pub store_path: PathBuf,
    pub store_schema_version: u32,
    pub enable_spool: bool,
    pub spool_path: PathBuf,
    pub max_spool_bytes: usize,
    pub user: Option<Value>,
    pub hooks: Hooks,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            api_key: None,
            service: DEFAULT_SERVICE.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_interval: DEFAULT_BATCH_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            log_level: Level::Info,
            enable_console_capture: true,
            enable_panic_capture: true,
            enable_network_capture: true,
            enable_interaction_capture: true,
            enable_navigation_capture: true,
            ignore_urls: Vec::new(),
            ignore_errors: Vec::new(),
            mask_fields: Vec::new(),
            sampling_rates: HashMap::new(),
            max_logs_per_minute: 0,
            max_breadcrumbs: DEFAULT_MAX_BREADCRUMBS,
            breadcrumb_buffer_interval: DEFAULT_BREADCRUMB_BUFFER_INTERVAL,
            enable_store: true,
            store_path: PathBuf::from("data/logship/logship.sqlite"),
            store_schema_version: DEFAULT_STORE_SCHEMA_VERSION,
            enable_spool: true,
            spool_path: PathBuf::from("data/logship/spool.json"),
            max_spool_bytes: DEFAULT_MAX_SPOOL_BYTES,
            user: None,
            hooks: Hooks::default(),
        }
    }
}

impl CollectorConfig {
    /// Defaults overlaid with `LOGSHIP_*` environment variables. Unparsable
    /// values keep the default.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(dsn) = env_string("LOGSHIP_DSN") {
            config.dsn = Some(dsn);
        }
        if let Some(api_key) = env_string("LOGSHIP_API_KEY") {
            config.api_key = Some(api_key);
        }
        if let Some(service) = env_string("LOGSHIP_SERVICE") {
            config.service = service;
        }
        if let Some(batch_size) = env_parse::<usize>("LOGSHIP_BATCH_SIZE") {
            if batch_size > 0 {
                config.batch_size = batch_size;
            }
        }
        if let Some(ms) = env_parse::<u64>("LOGSHIP_BATCH_INTERVAL_MS") {
            if ms > 0 {
                config.batch_interval = Duration::from_millis(ms);
            }
        }
        if let Some(max_retries) = env_parse::<u32>("LOGSHIP_MAX_RETRIES") {
            config.max_retries = max_retries;
        }
        if let Some(ms) = env_parse::<u64>("LOGSHIP_RETRY_DELAY_MS") {
            config.retry_delay = Duration::from_millis(ms);
        }
        if let Some(level) = env_string("LOGSHIP_LOG_LEVEL").and_then(|raw| Level::parse(&raw)) {
            config.log_level = level;
        }
        if let Some(cap) = env_parse::<u32>("LOGSHIP_MAX_LOGS_PER_MINUTE") {
            config.max_logs_per_minute = cap;
        }
        if let Some(path) = env_string("LOGSHIP_STORE_PATH") {
            config.store_path = PathBuf::from(path);
        }
        if let Some(path) = env_string("LOGSHIP_SPOOL_PATH") {
            config.spool_path = PathBuf::from(path);
        }

        config
    }

    /// Shallow merge of a runtime patch onto this snapshot; the snapshot
    /// itself is never mutated in place.
    pub fn with_patch(&self, patch: &ConfigPatch) -> Self {
        let mut next = self.clone();
        if let Some(dsn) = &patch.dsn {
            next.dsn = Some(dsn.clone());
        }
        if let Some(api_key) = &patch.api_key {
            next.api_key = Some(api_key.clone());
        }
        if let Some(service) = &patch.service {
            next.service = service.clone();
        }
        if let Some(batch_size) = patch.batch_size {
            next.batch_size = batch_size.max(1);
        }
        if let Some(batch_interval) = patch.batch_interval {
            next.batch_interval = batch_interval;
        }
        if let Some(max_retries) = patch.max_retries {
            next.max_retries = max_retries;
        }
        if let Some(retry_delay) = patch.retry_delay {
            next.retry_delay = retry_delay;
        }
        if let Some(log_level) = patch.log_level {
            next.log_level = log_level;
        }
        if let Some(sampling_rates) = &patch.sampling_rates {
            next.sampling_rates = sampling_rates.clone();
        }
        if let Some(cap) = patch.max_logs_per_minute {
            next.max_logs_per_minute = cap;
        }
        if let Some(mask_fields) = &patch.mask_fields {
            next.mask_fields = mask_fields.clone();
        }
        if let Some(ignore_urls) = &patch.ignore_urls {
            next.ignore_urls = ignore_urls.clone();
        }
        if let Some(ignore_errors) = &patch.ignore_errors {
            next.ignore_errors = ignore_errors.clone();
        }
        if let Some(max_breadcrumbs) = patch.max_breadcrumbs {
            next.max_breadcrumbs = max_breadcrumbs;
        }
        if let Some(interval) = patch.breadcrumb_buffer_interval {
            next.breadcrumb_buffer_interval = interval;
        }
        if let Some(user) = &patch.user {
            next.user = Some(user.clone());
        }
        next
    }
}

/// Runtime-mutable subset of the configuration; unset fields keep the
/// current value.
#[derive(Debug, Clone, Default)]
pub struct ConfigPatch {
    pub dsn: Option<String>,
    pub api_key: Option<String>,
    pub service: Option<String>,
    pub batch_size: Option<usize>,
    pub batch_interval: Option<Duration>,
    pub max_retries: Option<u32>,
    pub retry_delay: Option<Duration>,
    pub log_level: Option<Level>,
    pub sampling_rates: Option<HashMap<Level, f64>>,
    pub max_logs_per_minute: Option<u32>,
    pub mask_fields: Option<Vec<String>>,
    pub ignore_urls: Option<Vec<UrlPattern>>,
    pub ignore_errors: Option<Vec<ErrorPattern>>,
    pub max_breadcrumbs: Option<usize>,
    pub breadcrumb_buffer_interval: Option<Duration>,
    pub user: Option<Value>,
}

/// A set, non-blank environment value; whitespace-only counts as unset.
pub(crate) fn env_string(key: &str) -> Option<String> {
    let raw = env::var(key).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key)?.parse().ok()
}

/// Boolean environment switch; unrecognized spellings count as unset.
pub(crate) fn env_flag(key: &str) -> Option<bool> {
    let raw = env_string(key)?.to_ascii_lowercase();
    if ["1", "true", "yes", "on"].contains(&raw.as_str()) {
        Some(true)
    } else if ["0", "false", "no", "off"].contains(&raw.as_str()) {
        Some(false)
    } else {
        None
    }
}

/// Test-only scoped environment mutation: serializes env-reading tests
/// across the crate and restores every touched variable on drop.
#[cfg(test)]
pub(crate) mod test_env {
    use std::collections::HashMap;
    use std::env;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    pub struct ScopedEnv {
        _serial: MutexGuard<'static, ()>,
        saved: HashMap<String, Option<String>>,
    }

    impl ScopedEnv {
        pub fn new() -> Self {
            let lock = ENV_LOCK.get_or_init(|| Mutex::new(()));
            let serial = match lock.lock() {
                Ok(guard) => guard,
                // A test that failed mid-scope already restored its vars
                // through Drop; the lock itself is still usable.
                Err(poisoned) => poisoned.into_inner(),
            };
            Self {
                _serial: serial,
                saved: HashMap::new(),
            }
        }

        pub fn set(mut self, key: &str, value: &str) -> Self {
            self.remember(key);
            env::set_var(key, value);
            self
        }

        pub fn unset(mut self, key: &str) -> Self {
            self.remember(key);
            env::remove_var(key);
            self
        }

        fn remember(&mut self, key: &str) {
            self.saved
                .entry(key.to_string())
                .or_insert_with(|| env::var(key).ok());
        }
    }

    impl Drop for ScopedEnv {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain() {
                match value {
                    Some(previous) => env::set_var(&key, previous),
                    None => env::remove_var(&key),
                }
            }
        }
    }
}
