use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, Mutex, PoisonError,
};

use dashmap::DashMap;

use super::state::VisitorState;

/// A visitor known to the client.
#[derive(Debug, Default)]
pub(crate) struct Visitor {
    state: Mutex<VisitorState>,
    /// Unix seconds of the last time the visitor was touched.
    last_activity: AtomicI64,
}

impl Visitor {
    fn new(now: i64) -> Visitor {
        Visitor {
            state: Mutex::default(),
            last_activity: AtomicI64::new(now),
        }
    }

    /// Run `f` with exclusive access to the visitor state.
    ///
    /// A panic while holding the lock leaves the state usable; every mutation of
    /// `VisitorState` keeps it consistent between statements.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut VisitorState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn touch(&self, now: i64) {
        self.last_activity.fetch_max(now, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> i64 {
        self.last_activity.load(Ordering::Relaxed)
    }
}

/// Concurrent map of visitors keyed by visitor code.
///
/// Operations on different visitors don't contend beyond the map's shard locks.
#[derive(Debug, Default)]
pub(crate) struct VisitorStore {
    visitors: DashMap<String, Arc<Visitor>>,
}

impl VisitorStore {
    pub fn new() -> VisitorStore {
        VisitorStore::default()
    }

    pub fn get(&self, visitor_code: &str, now: i64) -> Option<Arc<Visitor>> {
        let visitor = self.visitors.get(visitor_code)?.value().clone();
        visitor.touch(now);
        Some(visitor)
    }

    /// Like [`VisitorStore::get`] without refreshing the last activity time.
    pub fn peek(&self, visitor_code: &str) -> Option<Arc<Visitor>> {
        Some(self.visitors.get(visitor_code)?.value().clone())
    }

    pub fn visitor_codes(&self) -> Vec<String> {
        self.visitors.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn get_or_create(&self, visitor_code: &str, now: i64) -> Arc<Visitor> {
        if let Some(visitor) = self.get(visitor_code, now) {
            return visitor;
        }
        let visitor = self
            .visitors
            .entry(visitor_code.to_owned())
            .or_insert_with(|| Arc::new(Visitor::new(now)))
            .value()
            .clone();
        visitor.touch(now);
        visitor
    }

    /// Remove visitors idle for at least `idle_seconds`. Returns the number of removed visitors.
    pub fn purge_idle(&self, now: i64, idle_seconds: i64) -> usize {
        let before = self.visitors.len();
        self.visitors
            .retain(|_, visitor| now - visitor.last_activity() < idle_seconds);
        before.saturating_sub(self.visitors.len())
    }

    pub fn len(&self) -> usize {
        self.visitors.len()
    }
}
