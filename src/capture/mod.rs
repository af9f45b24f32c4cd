//! Ambient event capture.
//!
//! Every adapter wraps an in-process event source without changing its
//! behavior: the source's original handler is saved on install, every
//! wrapper delegates to it, and uninstall restores it. The registry makes
//! install/uninstall explicit and idempotent so a teardown-then-reinstall
//! behaves exactly like a fresh install.

pub mod console;
pub mod http;
pub mod interaction;
pub mod navigation;
pub mod panics;

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::collector::Collector;
use crate::INTERNAL_TARGET;

pub use console::ConsoleCaptureLayer;
pub use http::{InstrumentedBlockingClient, InstrumentedClient};
pub use interaction::ClickEvent;
pub use panics::monitor_task;

/// Ambient process-wide hooks (the panic hook) may be claimed by only one
/// collector at a time; a second collector in the same process is detected
/// and refused instead of double-capturing.
static AMBIENT_HOOKS_CLAIMED: AtomicBool = AtomicBool::new(false);

pub(crate) fn claim_ambient_hooks() -> bool {
    AMBIENT_HOOKS_CLAIMED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
}

pub(crate) fn release_ambient_hooks() {
    AMBIENT_HOOKS_CLAIMED.store(false, Ordering::SeqCst);
}

pub(crate) trait Adapter: Send {
    fn name(&self) -> &'static str;
    fn install(&mut self, collector: &Collector);
    fn uninstall(&mut self);
    fn is_installed(&self) -> bool;
}

/// Owns the five adapters and applies the configuration toggles.
pub(crate) struct AdapterRegistry {
    pub(crate) console: console::ConsoleAdapter,
    pub(crate) panics: panics::PanicAdapter,
    pub(crate) network: http::NetworkAdapter,
    pub(crate) interaction: interaction::InteractionAdapter,
    pub(crate) navigation: navigation::NavigationAdapter,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            console: console::ConsoleAdapter::new(),
            panics: panics::PanicAdapter::new(),
            network: http::NetworkAdapter::new(),
            interaction: interaction::InteractionAdapter::new(),
            navigation: navigation::NavigationAdapter::new(),
        }
    }

    pub fn install_enabled(&mut self, collector: &Collector) {
        let cfg = collector.config_snapshot();
        let toggles = [
            cfg.enable_console_capture,
            cfg.enable_panic_capture,
            cfg.enable_network_capture,
            cfg.enable_interaction_capture,
            cfg.enable_navigation_capture,
        ];

        for (adapter, enabled) in self.adapters_mut().into_iter().zip(toggles) {
            if enabled && !adapter.is_installed() {
                adapter.install(collector);
            }
        }

        info!(
            target: INTERNAL_TARGET,
            component = "capture",
            event = "capture.adapters.installed",
            adapters = ?self.installed_names()
        );
    }

    pub fn uninstall_all(&mut self) {
        for adapter in self.adapters_mut() {
            if adapter.is_installed() {
                adapter.uninstall();
            }
        }
    }

    pub fn installed_names(&self) -> Vec<&'static str> {
        let adapters: [&dyn Adapter; 5] = [
            &self.console,
            &self.panics,
            &self.network,
            &self.interaction,
            &self.navigation,
        ];
        adapters
            .iter()
            .filter(|adapter| adapter.is_installed())
            .map(|adapter| adapter.name())
            .collect()
    }

    fn adapters_mut(&mut self) -> [&mut dyn Adapter; 5] {
        [
            &mut self.console,
            &mut self.panics,
            &mut self.network,
            &mut self.interaction,
            &mut self.navigation,
        ]
    }
}

/// Character-safe truncation used for breadcrumb and element text caps.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

pub(crate) fn warn_missing_source(adapter: &'static str, detail: &str) {
    warn!(
        target: INTERNAL_TARGET,
        component = "capture",
        event = "capture.adapter.skipped",
        adapter,
        detail
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_is_character_safe() {
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");
        // Multi-byte characters do not split.
        assert_eq!(truncate_chars("héllo wörld", 5), "héllo");
    }

    #[test]
    fn ambient_claim_is_exclusive_until_released() {
        // No other test in this binary claims the guard, so the flag is
        // still in its initial state here.
        assert!(claim_ambient_hooks());
        assert!(!claim_ambient_hooks());
        release_ambient_hooks();
        assert!(claim_ambient_hooks());
        release_ambient_hooks();
    }
}
