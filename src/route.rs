//! Route bridge: forward values from external sources into the tree.
//!
//! A route maps a source (anything that can report a current [`Value`]) to
//! a target parameter path. Sources are held weakly, so dropping a source
//! silently retires its routes. The bridge only resolves routes; applying
//! the value is the engine's job, through the same path as a local edit.

use std::sync::{Arc, Mutex, Weak};

use crate::codec::Value;
use crate::tree::normalize_path;

/// A value producer that can be routed into the mirror.
pub trait RouteSource: Send + Sync {
    /// Current value of the source.
    fn value(&self) -> Value;
}

/// Minimal [`RouteSource`] holding a settable value.
#[derive(Debug)]
pub struct SharedValue {
    value: Mutex<Value>,
}

impl SharedValue {
    /// Create a source holding `value`.
    pub fn new(value: Value) -> Self {
        Self {
            value: Mutex::new(value),
        }
    }

    /// Replace the held value.
    pub fn set(&self, value: Value) {
        *self.value.lock().expect("SharedValue mutex poisoned") = value;
    }
}

impl RouteSource for SharedValue {
    fn value(&self) -> Value {
        self.value.lock().expect("SharedValue mutex poisoned").clone()
    }
}

/// Identifier of a bound route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(u64);

struct Route {
    id: RouteId,
    source: Weak<dyn RouteSource>,
    target: String,
}

/// Set of source → target routes.
#[derive(Default)]
pub struct RouteBridge {
    routes: Vec<Route>,
    next_id: u64,
}

impl std::fmt::Debug for RouteBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteBridge")
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

impl RouteBridge {
    /// Create an empty bridge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `source` into the parameter at `target`.
    pub fn bind(&mut self, source: &Arc<dyn RouteSource>, target: &str) -> RouteId {
        let id = RouteId(self.next_id);
        self.next_id += 1;
        self.routes.push(Route {
            id,
            source: Arc::downgrade(source),
            target: normalize_path(target),
        });
        id
    }

    /// Remove a route. Returns whether it existed.
    pub fn unbind(&mut self, id: RouteId) -> bool {
        let before = self.routes.len();
        self.routes.retain(|r| r.id != id);
        self.routes.len() != before
    }

    /// Target paths routed from `source`, pruning routes whose source is gone.
    pub fn targets(&mut self, source: &Arc<dyn RouteSource>) -> Vec<String> {
        let pruned = self.prune();
        if pruned > 0 {
            log::debug!("Pruned {pruned} routes with dropped sources");
        }
        let source = Arc::downgrade(source);
        self.routes
            .iter()
            .filter(|r| Weak::ptr_eq(&r.source, &source))
            .map(|r| r.target.clone())
            .collect()
    }

    /// Drop routes whose source no longer exists. Returns how many were dropped.
    fn prune(&mut self) -> usize {
        let before = self.routes.len();
        self.routes.retain(|r| r.source.strong_count() > 0);
        before - self.routes.len()
    }
}
