use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// No-argument "please refresh" callback handed over by a view.
pub type RefreshSink = Arc<dyn Fn() + Send + Sync>;

/// Views that are currently visible, each with its refresh sink.
#[derive(Clone, Default)]
pub struct VisibilityRegistry {
    views: Arc<RwLock<BTreeMap<String, RefreshSink>>>,
}

impl VisibilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the sink for `view_id`.
    pub fn register(&self, view_id: &str, sink: RefreshSink) {
        self.views.write().insert(view_id.to_string(), sink);
    }

    /// Returns true if the view was registered.
    pub fn unregister(&self, view_id: &str) -> bool {
        self.views.write().remove(view_id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.views.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.views.read().len()
    }

    pub fn contains(&self, view_id: &str) -> bool {
        self.views.read().contains_key(view_id)
    }

    /// Fire the sink of every view registered right now. Returns the
    /// number of sinks called.
    ///
    /// Sinks run after the lock is released, so a sink may register or
    /// unregister views without deadlocking.
    pub fn fan_out(&self) -> usize {
        let sinks: Vec<RefreshSink> = self.views.read().values().cloned().collect();
        for sink in &sinks {
            sink();
        }
        sinks.len()
    }
}
