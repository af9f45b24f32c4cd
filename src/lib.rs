//! In-process log collection and shipping.
//!
//! The pipeline captures events from ambient sources (the tracing
//! dispatcher, the panic hook, instrumented HTTP clients, host-fed UI and
//! navigation events) or from explicit API calls, enriches each record with
//! host metadata, context providers, and recent breadcrumbs, applies the
//! acceptance policies (level gate, sampling, rate limit, masking,
//! `before_send`), persists accepted records durably, and ships JSON batches
//! to the configured ingestion endpoint with retry, a circuit breaker, and a
//! best-effort beacon on shutdown.

/// Target for the crate's own diagnostics; the console capture layer skips
/// it so internal logging can never re-enter the pipeline.
pub const INTERNAL_TARGET: &str = "logship::internal";

pub mod breadcrumbs;
pub mod capture;
pub mod collector;
pub mod config;
pub mod delivery;
pub mod entry;
pub mod policy;
pub mod spool;
pub mod store;
pub mod telemetry;

pub use capture::{
    monitor_task, ClickEvent, ConsoleCaptureLayer, InstrumentedBlockingClient, InstrumentedClient,
};
pub use collector::{Collector, CollectorError, WeakCollector};
pub use config::{
    CollectorConfig, ConfigPatch, ErrorPattern, Hooks, RouteChange, UrlPattern,
};
pub use delivery::{BatchRequest, CircuitState, Transport, TransportError};
pub use entry::{Breadcrumb, BreadcrumbKind, Context, HostInfo, Level, LogEntry};
pub use policy::MASKED_VALUE;
pub use spool::Spool;
pub use store::{LogStore, MemoryStore, SqliteStore, StoreError, StoreRouter};
pub use telemetry::{
    init_telemetry, telemetry_config_from_env, LogFormat, TelemetryConfig, TelemetryInitError,
};
