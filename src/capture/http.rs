//! Network capture: instrumented wrappers over the async and blocking
//! request primitives. The wrapped client still performs the real request;
//! capture is a side effect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use crate::capture::Adapter;
use crate::collector::{CaptureAttrs, Collector};
use crate::config::url_ignored;
use crate::entry::{Breadcrumb, BreadcrumbKind, Context, Level};

/// Requests carrying this header pass through uncaptured (the header is
/// stripped before the request leaves). Guards against double capture when
/// a wrapped client is handed back into instrumented plumbing.
pub const BYPASS_HEADER: &str = "x-logship-bypass";

pub(crate) struct NetworkAdapter {
    enabled: Arc<AtomicBool>,
    installed: bool,
}

impl NetworkAdapter {
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

impl Adapter for NetworkAdapter {
    fn name(&self) -> &'static str {
        "network"
    }

    fn install(&mut self, _collector: &Collector) {
        self.enabled.store(true, Ordering::SeqCst);
        self.installed = true;
    }

    fn uninstall(&mut self) {
        self.enabled.store(false, Ordering::SeqCst);
        self.installed = false;
    }

    fn is_installed(&self) -> bool {
        self.installed
    }
}

/// Async wrapper over `reqwest::Client`.
pub struct InstrumentedClient {
    inner: reqwest::Client,
    collector: Collector,
}

impl InstrumentedClient {
    pub fn new(collector: &Collector) -> Self {
        Self::with_client(collector, reqwest::Client::new())
    }

    pub fn with_client(collector: &Collector, inner: reqwest::Client) -> Self {
        Self {
            inner,
            collector: collector.clone(),
        }
    }

    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }

    pub async fn get(&self, url: &str) -> reqwest::Result<reqwest::Response> {
        let request = self.inner.get(url).build()?;
        self.execute(request).await
    }

    pub async fn post(&self, url: &str, body: Vec<u8>) -> reqwest::Result<reqwest::Response> {
        let request = self.inner.post(url).body(body).build()?;
        self.execute(request).await
    }

    pub async fn execute(
        &self,
        mut request: reqwest::Request,
    ) -> reqwest::Result<reqwest::Response> {
        if request.headers().contains_key(BYPASS_HEADER) {
            request.headers_mut().remove(BYPASS_HEADER);
            return self.inner.execute(request).await;
        }

        let method = request.method().to_string();
        let url = request.url().to_string();
        if !self.collector.network_capture_enabled()
            || url_ignored(&self.collector.config_snapshot().ignore_urls, &url)
        {
            return self.inner.execute(request).await;
        }

        let started = Instant::now();
        match self.inner.execute(request).await {
            Ok(response) => {
                let status = response.status();
                capture_response(
                    &self.collector,
                    &method,
                    &url,
                    status.as_u16(),
                    status.canonical_reason(),
                    response.content_length(),
                    elapsed_ms(started),
                );
                Ok(response)
            }
            Err(err) => {
                capture_transport_failure(
                    &self.collector,
                    &method,
                    &url,
                    &err.to_string(),
                    elapsed_ms(started),
                );
                Err(err)
            }
        }
    }
}

/// Blocking counterpart of [`InstrumentedClient`].
pub struct InstrumentedBlockingClient {
    inner: reqwest::blocking::Client,
    collector: Collector,
}

impl InstrumentedBlockingClient {
    pub fn new(collector: &Collector) -> Self {
        Self::with_client(collector, reqwest::blocking::Client::new())
    }

    pub fn with_client(collector: &Collector, inner: reqwest::blocking::Client) -> Self {
        Self {
            inner,
            collector: collector.clone(),
        }
    }

    pub fn inner(&self) -> &reqwest::blocking::Client {
        &self.inner
    }

    pub fn get(&self, url: &str) -> reqwest::Result<reqwest::blocking::Response> {
        let request = self.inner.get(url).build()?;
        self.execute(request)
    }

    pub fn post(&self, url: &str, body: Vec<u8>) -> reqwest::Result<reqwest::blocking::Response> {
        let request = self.inner.post(url).body(body).build()?;
        self.execute(request)
    }

    pub fn execute(
        &self,
        mut request: reqwest::blocking::Request,
    ) -> reqwest::Result<reqwest::blocking::Response> {
        if request.headers().contains_key(BYPASS_HEADER) {
            request.headers_mut().remove(BYPASS_HEADER);
            return self.inner.execute(request);
        }

        let method = request.method().to_string();
        let url = request.url().to_string();
        if !self.collector.network_capture_enabled()
            || url_ignored(&self.collector.config_snapshot().ignore_urls, &url)
        {
            return self.inner.execute(request);
        }

        let started = Instant::now();
        match self.inner.execute(request) {
            Ok(response) => {
                let status = response.status();
                capture_response(
                    &self.collector,
                    &method,
                    &url,
                    status.as_u16(),
                    status.canonical_reason(),
                    response.content_length(),
                    elapsed_ms(started),
                );
                Ok(response)
            }
            Err(err) => {
                capture_transport_failure(
                    &self.collector,
                    &method,
                    &url,
                    &err.to_string(),
                    elapsed_ms(started),
                );
                Err(err)
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

fn capture_response(
    collector: &Collector,
    method: &str,
    url: &str,
    status: u16,
    status_text: Option<&str>,
    response_size: Option<u64>,
    duration_ms: u64,
) {
    let attrs = CaptureAttrs {
        request_method: Some(method.to_string()),
        request_url: Some(url.to_string()),
        status_code: Some(status),
        status_text: status_text.map(|text| text.to_string()),
        duration_ms: Some(duration_ms),
        response_size,
        ..CaptureAttrs::default()
    };
    collector.capture(
        Level::Info,
        format!("{method} {url} {status}"),
        Context::new(),
        attrs,
    );
    collector.add_breadcrumb(
        Breadcrumb::new(BreadcrumbKind::Http, format!("{method} {url}")).with_data(json!({
            "status": status,
            "durationMs": duration_ms,
        })),
    );
}

fn capture_transport_failure(
    collector: &Collector,
    method: &str,
    url: &str,
    error: &str,
    duration_ms: u64,
) {
    let attrs = CaptureAttrs {
        request_method: Some(method.to_string()),
        request_url: Some(url.to_string()),
        duration_ms: Some(duration_ms),
        error_message: Some(error.to_string()),
        ..CaptureAttrs::default()
    };
    collector.capture(
        Level::Error,
        format!("{method} {url} failed"),
        Context::new(),
        attrs,
    );
    collector.add_breadcrumb(
        Breadcrumb::new(BreadcrumbKind::Http, format!("{method} {url} failed"))
            .with_data(Value::String(error.to_string())),
    );
}
