//! Uncaught-failure capture: a delegating panic hook plus a monitor for
//! background task failures.

use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::{self, PanicHookInfo};
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::capture::{claim_ambient_hooks, release_ambient_hooks, warn_missing_source, Adapter};
use crate::collector::{CaptureAttrs, Collector, WeakCollector};
use crate::config::error_ignored;
use crate::entry::{Breadcrumb, BreadcrumbKind, Context, Level};

type PrevHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

pub(crate) struct PanicAdapter {
    saved: Option<Arc<PrevHook>>,
    installed: bool,
}

impl PanicAdapter {
    pub fn new() -> Self {
        Self {
            saved: None,
            installed: false,
        }
    }
}

impl Adapter for PanicAdapter {
    fn name(&self) -> &'static str {
        "panics"
    }

    fn install(&mut self, collector: &Collector) {
        if !claim_ambient_hooks() {
            warn_missing_source("panics", "another collector already owns the panic hook");
            return;
        }

        let previous: Arc<PrevHook> = Arc::new(panic::take_hook());
        self.saved = Some(Arc::clone(&previous));

        let weak = collector.downgrade();
        panic::set_hook(Box::new(move |info| {
            capture_panic(&weak, info);
            // The saved hook always runs, even for ignored panics.
            previous(info);
        }));
        self.installed = true;
    }

    fn uninstall(&mut self) {
        if let Some(saved) = self.saved.take() {
            panic::set_hook(Box::new(move |info| saved(info)));
        }
        release_ambient_hooks();
        self.installed = false;
    }

    fn is_installed(&self) -> bool {
        self.installed
    }
}

fn capture_panic(weak: &WeakCollector, info: &PanicHookInfo<'_>) {
    let Some(collector) = weak.upgrade() else {
        return;
    };

    let message = payload_text(info.payload()).unwrap_or("panic with non-string payload");
    let cfg = collector.config_snapshot();
    if error_ignored(&cfg.ignore_errors, message) {
        return;
    }

    let mut context = Context::new();
    if let Some(location) = info.location() {
        context.insert(
            "location".to_string(),
            Value::String(format!(
                "{}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            )),
        );
    }

    let attrs = CaptureAttrs {
        error_name: Some("panic".to_string()),
        stack: Some(Backtrace::force_capture().to_string()),
        ..CaptureAttrs::default()
    };
    collector.capture(Level::Error, message.to_string(), context, attrs);
    collector.add_breadcrumb(
        Breadcrumb::new(BreadcrumbKind::Error, message.to_string())
            .with_data(Value::String("panic".to_string())),
    );
}

pub(crate) fn payload_text(payload: &dyn Any) -> Option<&str> {
    if let Some(text) = payload.downcast_ref::<&str>() {
        Some(text)
    } else {
        payload.downcast_ref::<String>().map(String::as_str)
    }
}

/// Watches a spawned task and routes its failure (an `Err` return, a panic,
/// or cancellation) through the pipeline: the unhandled-failure path for
/// work the caller never awaits.
pub fn monitor_task<T, E>(
    collector: &Collector,
    task_name: &str,
    handle: JoinHandle<Result<T, E>>,
) -> JoinHandle<Option<T>>
where
    T: Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let collector = collector.clone();
    let task_name = task_name.to_string();
    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                report_task_failure(&collector, &task_name, &err.to_string(), "error");
                None
            }
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    "panic"
                } else {
                    "cancelled"
                };
                report_task_failure(&collector, &task_name, &join_err.to_string(), reason);
                None
            }
        }
    })
}

fn report_task_failure(collector: &Collector, task_name: &str, message: &str, reason: &str) {
    let cfg = collector.config_snapshot();
    if error_ignored(&cfg.ignore_errors, message) {
        return;
    }

    let mut context = Context::new();
    context.insert("task".to_string(), Value::String(task_name.to_string()));

    let attrs = CaptureAttrs {
        error_name: Some("task_failure".to_string()),
        reason: Some(reason.to_string()),
        ..CaptureAttrs::default()
    };
    collector.capture(
        Level::Error,
        format!("task '{task_name}' failed: {message}"),
        context,
        attrs,
    );
    collector.add_breadcrumb(
        Breadcrumb::new(BreadcrumbKind::Error, format!("task '{task_name}' failed"))
            .with_data(Value::String(reason.to_string())),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_text_reads_str_and_string_payloads() {
        let static_payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(payload_text(static_payload.as_ref()), Some("boom"));

        let owned_payload: Box<dyn Any + Send> = Box::new("formatted boom".to_string());
        assert_eq!(payload_text(owned_payload.as_ref()), Some("formatted boom"));

        let other: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(payload_text(other.as_ref()), None);
    }
}
