//! UI interaction capture for embedding hosts: debounced click events and
//! value-free input breadcrumbs.

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::capture::{truncate_chars, Adapter};
use crate::collector::{CaptureAttrs, Collector};
use crate::entry::{Breadcrumb, BreadcrumbKind, Context, Level};

/// Element text is capped at this many characters.
const TEXT_MAX_CHARS: usize = 100;

/// Field names that are never recorded, not even by name.
const SECRET_FIELD_MARKERS: [&str; 3] = ["password", "secret", "token"];

/// A pointer event as reported by the embedding host.
#[derive(Debug, Clone, PartialEq)]
pub struct ClickEvent {
    /// Element kind, e.g. `button`.
    pub element: String,
    pub id: Option<String>,
    pub classes: Option<String>,
    pub text: Option<String>,
    pub coords: (f64, f64),
}

pub(crate) struct InteractionAdapter {
    installed: bool,
    last_emit: Option<Instant>,
    suppressed: u32,
}

impl InteractionAdapter {
    pub fn new() -> Self {
        Self {
            installed: false,
            last_emit: None,
            suppressed: 0,
        }
    }

    /// Emits the first click in each debounce window; later clicks within
    /// the window fold into a suppressed count reported with the next
    /// emission.
    pub fn record_click(&mut self, collector: &Collector, event: ClickEvent, window: Duration) {
        if !self.installed {
            return;
        }

        let now = Instant::now();
        if let Some(last) = self.last_emit {
            if now.duration_since(last) < window {
                self.suppressed = self.suppressed.saturating_add(1);
                return;
            }
        }

        let mut context = Context::new();
        context.insert("element".to_string(), Value::String(event.element.clone()));
        if let Some(id) = &event.id {
            context.insert("id".to_string(), Value::String(id.clone()));
        }
        if let Some(classes) = &event.classes {
            context.insert("classes".to_string(), Value::String(classes.clone()));
        }
        if let Some(text) = &event.text {
            context.insert(
                "text".to_string(),
                Value::String(truncate_chars(text, TEXT_MAX_CHARS)),
            );
        }
        if self.suppressed > 0 {
            context.insert("suppressedClicks".to_string(), json!(self.suppressed));
        }

        let attrs = CaptureAttrs {
            element: Some(event.element.clone()),
            coords: Some(event.coords),
            ..CaptureAttrs::default()
        };
        collector.capture(
            Level::Info,
            format!("click on {}", describe_target(&event)),
            context,
            attrs,
        );
        collector.add_breadcrumb(
            Breadcrumb::new(
                BreadcrumbKind::Click,
                format!("click on {}", describe_target(&event)),
            )
            .with_data(json!({"x": event.coords.0, "y": event.coords.1})),
        );

        self.last_emit = Some(now);
        self.suppressed = 0;
    }

    /// Input activity produces a breadcrumb only. The value is never
    /// recorded; secret-looking field names are skipped entirely.
    pub fn record_input(&mut self, collector: &Collector, field_name: &str) {
        if !self.installed || looks_secret(field_name) {
            return;
        }
        collector.add_breadcrumb(Breadcrumb::new(
            BreadcrumbKind::Custom,
            format!("input on {field_name}"),
        ));
    }
}

impl Adapter for InteractionAdapter {
    fn name(&self) -> &'static str {
        "interaction"
    }

    fn install(&mut self, _collector: &Collector) {
        self.installed = true;
        self.last_emit = None;
        self.suppressed = 0;
    }

    fn uninstall(&mut self) {
        self.installed = false;
        self.last_emit = None;
        self.suppressed = 0;
    }

    fn is_installed(&self) -> bool {
        self.installed
    }
}

fn describe_target(event: &ClickEvent) -> String {
    match &event.id {
        Some(id) => format!("{}#{id}", event.element),
        None => event.element.clone(),
    }
}

fn looks_secret(field_name: &str) -> bool {
    let lowered = field_name.to_ascii_lowercase();
    SECRET_FIELD_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}
