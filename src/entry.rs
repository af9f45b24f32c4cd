//! Log record data model shared by capture, persistence, and delivery.

use chrono::{SecondsFormat, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form key/value context attached to records and breadcrumbs.
pub type Context = Map<String, Value>;

/// Severity ladder, lowest first. `fatal` and `critical` exist on the wire
/// and the public API but have no tracing counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Critical,
}

impl Level {
    pub fn rank(self) -> u8 {
        match self {
            Self::Trace => 0,
            Self::Debug => 1,
            Self::Info => 2,
            Self::Warn => 3,
            Self::Error => 4,
            Self::Fatal => 5,
            Self::Critical => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
            Self::Critical => "critical",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "trace" => Some(Self::Trace),
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" | "warning" => Some(Self::Warn),
            "error" => Some(Self::Error),
            "fatal" => Some(Self::Fatal),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreadcrumbKind {
    Click,
    Navigation,
    #[serde(rename = "xhr")]
    Http,
    Console,
    Custom,
    Error,
}

/// A short structured record of a user or system event; a snapshot of the
/// recent ring is embedded into every log entry at enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breadcrumb {
    pub timestamp: String,
    #[serde(rename = "type")]
    pub kind: BreadcrumbKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Breadcrumb {
    pub fn new(kind: BreadcrumbKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: now_rfc3339(),
            kind,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Host metadata captured once per process and attached to every record.
/// Fields the platform cannot resolve are omitted, never null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInfo {
    pub os: String,
    pub arch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<usize>,
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_name: Option<String>,
    pub sdk_version: String,
}

impl HostInfo {
    pub fn collect() -> Self {
        let process_name = std::env::current_exe().ok().and_then(|path| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
        });

        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            hostname: std::env::var("HOSTNAME")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty()),
            cpu_count: std::thread::available_parallelism().ok().map(|n| n.get()),
            pid: std::process::id(),
            process_name,
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A single captured event. `timestamp` is assigned at enrichment and never
/// later; `id` is immutable once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub level: Level,
    pub message: String,
    pub timestamp: String,
    pub service: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Context,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub global_context: Context,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub user_context: Context,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breadcrumbs: Vec<Breadcrumb>,

    // Error attribute group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    // Network attribute group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    // Interaction attribute group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coords: Option<(f64, f64)>,
}

impl LogEntry {
    pub fn new(level: Level, message: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            id: None,
            level,
            message: message.into(),
            timestamp: now_rfc3339(),
            service: service.into(),
            context: Context::new(),
            global_context: Context::new(),
            user_context: Context::new(),
            user: None,
            host: None,
            breadcrumbs: Vec::new(),
            error_name: None,
            stack: None,
            reason: None,
            request_method: None,
            request_url: None,
            status_code: None,
            status_text: None,
            duration_ms: None,
            response_size: None,
            error_message: None,
            element: None,
            coords: None,
        }
    }

    /// Assigns an id when the record has none yet.
    pub fn ensure_id(&mut self) {
        if self.id.is_none() {
            self.id = Some(new_entry_id());
        }
    }
}

/// Opaque record id: 16 random bytes, hex encoded.
pub fn new_entry_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// ISO-8601 UTC with millisecond precision, e.g. `2026-02-01T09:30:00.123Z`.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Renders a JSON value the way a caller-facing message expects it:
/// strings bare, everything else compact JSON.
pub fn stringify_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "[unserializable]".to_string()),
    }
}

/// Joins message parts with a single space.
pub fn join_parts(parts: &[Value]) -> String {
    parts
        .iter()
        .map(stringify_value)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn level_ordering_matches_rank() {
        let ladder = [
            Level::Trace,
            Level::Debug,
            Level::Info,
            Level::Warn,
            Level::Error,
            Level::Fatal,
            Level::Critical,
        ];
        for pair in ladder.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn level_round_trips_through_wire_names() {
        for level in [Level::Trace, Level::Warn, Level::Critical] {
            let parsed = Level::parse(level.as_str()).unwrap();
            assert_eq!(parsed, level);
        }
        assert_eq!(Level::parse("WARNING"), Some(Level::Warn));
        assert_eq!(Level::parse("verbose"), None);
    }

    #[test]
    fn entry_serializes_camel_case_and_omits_empty_groups() {
        let mut entry = LogEntry::new(Level::Info, "hello", "frontend-app");
        entry.status_code = Some(200);
        let value = serde_json::to_value(&entry).unwrap();

        assert_eq!(value["level"], "info");
        assert_eq!(value["statusCode"], 200);
        assert!(value.get("errorName").is_none());
        assert!(value.get("context").is_none());
        assert!(value.get("breadcrumbs").is_none());
    }

    #[test]
    fn breadcrumb_http_kind_uses_xhr_wire_name() {
        let crumb = Breadcrumb::new(BreadcrumbKind::Http, "GET /x");
        let value = serde_json::to_value(&crumb).unwrap();
        assert_eq!(value["type"], "xhr");
    }

    #[test]
    fn entry_ids_are_unique_and_immutable() {
        let mut entry = LogEntry::new(Level::Debug, "x", "svc");
        entry.ensure_id();
        let first = entry.id.clone().unwrap();
        entry.ensure_id();
        assert_eq!(entry.id.as_deref(), Some(first.as_str()));
        assert_eq!(first.len(), 32);
        assert_ne!(first, new_entry_id());
    }

    #[test]
    fn join_parts_spaces_and_stringifies() {
        let parts = vec![json!("request failed"), json!({"code": 502}), json!(3)];
        assert_eq!(join_parts(&parts), "request failed {\"code\":502} 3");
    }
}
