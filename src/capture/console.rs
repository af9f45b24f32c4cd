//! Console capture: a `tracing` layer that observes every event reaching
//! the global dispatcher and routes it into the pipeline, while the
//! downstream fmt layer keeps receiving the original event untouched.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Number, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, Layer};

use crate::capture::{truncate_chars, Adapter};
use crate::collector::{CaptureAttrs, Collector, WeakCollector};
use crate::entry::{Breadcrumb, BreadcrumbKind, Context, Level};

/// Breadcrumb messages are capped at this many characters.
const CRUMB_MAX_CHARS: usize = 200;

/// Only these five severities have a tracing counterpart; `fatal` and
/// `critical` are reachable through the public API alone.
fn map_level(level: &tracing::Level) -> Level {
    if *level == tracing::Level::TRACE {
        Level::Trace
    } else if *level == tracing::Level::DEBUG {
        Level::Debug
    } else if *level == tracing::Level::INFO {
        Level::Info
    } else if *level == tracing::Level::WARN {
        Level::Warn
    } else {
        Level::Error
    }
}

pub(crate) struct ConsoleAdapter {
    enabled: Arc<AtomicBool>,
    installed: bool,
}

impl ConsoleAdapter {
    pub fn new() -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(false)),
            installed: false,
        }
    }

    pub fn enabled_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }
}

impl Adapter for ConsoleAdapter {
    fn name(&self) -> &'static str {
        "console"
    }

    fn install(&mut self, _collector: &Collector) {
        self.enabled.store(true, Ordering::SeqCst);
        self.installed = true;
    }

    fn uninstall(&mut self) {
        // The layer stays registered with the subscriber; disabling the
        // shared flag makes it a transparent pass-through, which is the
        // closest a global dispatcher gets to restoring the original.
        self.enabled.store(false, Ordering::SeqCst);
        self.installed = false;
    }

    fn is_installed(&self) -> bool {
        self.installed
    }
}

/// The layer handed to `tracing_subscriber` at telemetry init. Events on
/// the crate's own targets are skipped so internal diagnostics cannot
/// re-enter the pipeline.
pub struct ConsoleCaptureLayer {
    collector: WeakCollector,
    enabled: Arc<AtomicBool>,
}

impl ConsoleCaptureLayer {
    pub(crate) fn new(collector: WeakCollector, enabled: Arc<AtomicBool>) -> Self {
        Self { collector, enabled }
    }
}

impl<S: Subscriber> Layer<S> for ConsoleCaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        let metadata = event.metadata();
        if metadata.target().starts_with("logship") {
            return;
        }
        let Some(collector) = self.collector.upgrade() else {
            return;
        };

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        let message = visitor.message.unwrap_or_default();

        let mut context = visitor.fields;
        context.insert(
            "target".to_string(),
            Value::String(metadata.target().to_string()),
        );

        let level = map_level(metadata.level());
        collector.capture(level, message.clone(), context, CaptureAttrs::default());
        collector.add_breadcrumb(Breadcrumb::new(
            BreadcrumbKind::Console,
            truncate_chars(&message, CRUMB_MAX_CHARS),
        ));
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: Context,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        let number = Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(value.to_string()));
        self.fields.insert(field.name().to_string(), number);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), Value::Bool(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.fields
                .insert(field.name().to_string(), Value::String(format!("{value:?}")));
        }
    }
}
