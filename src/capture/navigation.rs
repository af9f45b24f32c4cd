//! Navigation capture: records route transitions, then delegates to the
//! host's saved observer with the arguments unchanged.

use serde_json::{json, Value};

use crate::capture::Adapter;
use crate::collector::{CaptureAttrs, Collector};
use crate::config::{RouteChange, RouteObserver};
use crate::entry::{Breadcrumb, BreadcrumbKind, Context, Level};

pub(crate) struct NavigationAdapter {
    installed: bool,
    routes: Vec<String>,
    observer: Option<RouteObserver>,
}

impl NavigationAdapter {
    pub fn new() -> Self {
        Self {
            installed: false,
            routes: Vec::new(),
            observer: None,
        }
    }

    pub fn current_route(&self) -> Option<&str> {
        self.routes.last().map(String::as_str)
    }

    pub fn push(&mut self, collector: &Collector, route: &str) {
        if !self.installed {
            return;
        }
        let from = self.current_route().map(str::to_string);
        self.emit(collector, route, RouteChange::Push, from.as_deref());
        self.routes.push(route.to_string());
        self.delegate(route, RouteChange::Push);
    }

    pub fn replace(&mut self, collector: &Collector, route: &str) {
        if !self.installed {
            return;
        }
        let from = self.current_route().map(str::to_string);
        self.emit(collector, route, RouteChange::Replace, from.as_deref());
        match self.routes.last_mut() {
            Some(current) => *current = route.to_string(),
            None => self.routes.push(route.to_string()),
        }
        self.delegate(route, RouteChange::Replace);
    }

    /// The popstate analog: drops the current route and reports the one
    /// uncovered beneath it.
    pub fn back(&mut self, collector: &Collector) {
        if !self.installed || self.routes.len() < 2 {
            return;
        }
        let from = self.routes.pop();
        let route = self.routes.last().cloned().unwrap_or_default();
        self.emit(collector, &route, RouteChange::Back, from.as_deref());
        self.delegate(&route, RouteChange::Back);
    }

    fn emit(&self, collector: &Collector, route: &str, change: RouteChange, from: Option<&str>) {
        let mut context = Context::new();
        context.insert("route".to_string(), Value::String(route.to_string()));
        context.insert("change".to_string(), json!(format!("{change:?}")));
        if let Some(from) = from {
            context.insert("from".to_string(), Value::String(from.to_string()));
        }

        collector.capture(
            Level::Info,
            format!("navigation to {route}"),
            context,
            CaptureAttrs::default(),
        );
        collector.add_breadcrumb(
            Breadcrumb::new(BreadcrumbKind::Navigation, format!("navigation to {route}"))
                .with_data(Value::String(format!("{change:?}"))),
        );
    }

    fn delegate(&self, route: &str, change: RouteChange) {
        if let Some(observer) = &self.observer {
            observer(route, change);
        }
    }
}

impl Adapter for NavigationAdapter {
    fn name(&self) -> &'static str {
        "navigation"
    }

    fn install(&mut self, collector: &Collector) {
        self.observer = collector.config_snapshot().hooks.route_observer.clone();
        self.installed = true;

        // The load analog: one event marking where capture began.
        collector.capture(
            Level::Info,
            "application started".to_string(),
            Context::new(),
            CaptureAttrs::default(),
        );
        collector.add_breadcrumb(Breadcrumb::new(
            BreadcrumbKind::Navigation,
            "application started",
        ));
    }

    fn uninstall(&mut self) {
        self.installed = false;
        self.routes.clear();
        self.observer = None;
    }

    fn is_installed(&self) -> bool {
        self.installed
    }
}
