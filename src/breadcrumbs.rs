//! Bounded FIFO ring of recent breadcrumbs.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::entry::Breadcrumb;

pub type BeforeBreadcrumb = Arc<dyn Fn(Breadcrumb) -> Option<Breadcrumb> + Send + Sync>;

#[derive(Default)]
pub struct BreadcrumbRing {
    capacity: usize,
    crumbs: VecDeque<Breadcrumb>,
    before: Option<BeforeBreadcrumb>,
}

impl BreadcrumbRing {
    pub fn new(capacity: usize, before: Option<BeforeBreadcrumb>) -> Self {
        Self {
            capacity,
            crumbs: VecDeque::with_capacity(capacity.min(64)),
            before,
        }
    }

    /// Runs the caller hook, then appends; the oldest crumbs are discarded
    /// once the ring exceeds its capacity. A `None` from the hook drops the
    /// crumb silently.
    pub fn add(&mut self, crumb: Breadcrumb) {
        if self.capacity == 0 {
            return;
        }
        let crumb = match &self.before {
            Some(hook) => match hook(crumb) {
                Some(transformed) => transformed,
                None => return,
            },
            None => crumb,
        };

        self.crumbs.push_back(crumb);
        while self.crumbs.len() > self.capacity {
            self.crumbs.pop_front();
        }
    }

    /// Copy of the ring in insertion order, for embedding into a log entry.
    pub fn snapshot(&self) -> Vec<Breadcrumb> {
        self.crumbs.iter().cloned().collect()
    }

    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.crumbs.len() > self.capacity {
            self.crumbs.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.crumbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.crumbs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::BreadcrumbKind;

    fn crumb(message: &str) -> Breadcrumb {
        Breadcrumb::new(BreadcrumbKind::Custom, message)
    }

    #[test]
    fn ring_keeps_the_last_capacity_crumbs_in_order() {
        let mut ring = BreadcrumbRing::new(3, None);
        for i in 0..7 {
            ring.add(crumb(&format!("c{i}")));
        }

        let messages: Vec<_> = ring.snapshot().into_iter().map(|c| c.message).collect();
        assert_eq!(messages, vec!["c4", "c5", "c6"]);
    }

    #[test]
    fn ring_below_capacity_keeps_everything() {
        let mut ring = BreadcrumbRing::new(10, None);
        ring.add(crumb("a"));
        ring.add(crumb("b"));
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn before_hook_can_drop_and_transform() {
        let hook: BeforeBreadcrumb = Arc::new(|mut crumb: Breadcrumb| {
            if crumb.message == "drop-me" {
                return None;
            }
            crumb.message = format!("seen:{}", crumb.message);
            Some(crumb)
        });

        let mut ring = BreadcrumbRing::new(5, Some(hook));
        ring.add(crumb("drop-me"));
        ring.add(crumb("keep"));

        let messages: Vec<_> = ring.snapshot().into_iter().map(|c| c.message).collect();
        assert_eq!(messages, vec!["seen:keep"]);
    }

    #[test]
    fn snapshot_is_a_copy() {
        let mut ring = BreadcrumbRing::new(5, None);
        ring.add(crumb("a"));
        let snap = ring.snapshot();
        ring.add(crumb("b"));
        assert_eq!(snap.len(), 1);
        assert_eq!(ring.len(), 2);
    }

    #[test]
    fn shrinking_capacity_discards_oldest() {
        let mut ring = BreadcrumbRing::new(5, None);
        for i in 0..5 {
            ring.add(crumb(&format!("c{i}")));
        }
        ring.set_capacity(2);
        let messages: Vec<_> = ring.snapshot().into_iter().map(|c| c.message).collect();
        assert_eq!(messages, vec!["c3", "c4"]);
    }
}
