//! Query variables
//!
//! A variable is a named, typed, mutable value that a query operation
//! declares (`($id0: String)`) and an argument references (`id: $id0`).
//! Every holder subscribes to change notification; replacing the value
//! fires the subscribers so armed query nodes can re-queue their fetch.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle returned by [`Variable::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Allocates wire ids for variables: argument name plus a monotonic
/// counter (`id0`, `id1`, ...). Injected wherever variables are declared;
/// counters reset only by constructing a fresh allocator.
#[derive(Debug, Default)]
pub struct VariableIdAllocator {
    next: AtomicU64,
}

impl VariableIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&self, name: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{name}{n}")
    }
}

struct VariableState {
    value: Value,
    subscribers: Vec<(SubscriptionId, ChangeCallback)>,
    next_subscription: u64,
}

/// Shared handle to a query variable. Clones observe the same value and
/// the same subscriber list.
#[derive(Clone)]
pub struct Variable {
    id: Arc<str>,
    var_type: Arc<str>,
    state: Arc<RwLock<VariableState>>,
}

impl Variable {
    /// Variable with a caller-chosen wire id.
    pub fn new(id: impl Into<String>, var_type: impl Into<String>, value: Value) -> Self {
        Self {
            id: Arc::from(id.into()),
            var_type: Arc::from(var_type.into()),
            state: Arc::new(RwLock::new(VariableState {
                value,
                subscribers: Vec::new(),
                next_subscription: 0,
            })),
        }
    }

    /// Variable whose wire id is drawn from `ids` (argument name + counter).
    pub fn declare(
        ids: &VariableIdAllocator,
        name: &str,
        var_type: impl Into<String>,
        value: Value,
    ) -> Self {
        Self::new(ids.allocate(name), var_type, value)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn var_type(&self) -> &str {
        &self.var_type
    }

    pub fn value(&self) -> Value {
        self.state.read().value.clone()
    }

    /// Current value rendered as payload text. Strings stay unquoted;
    /// null renders empty.
    pub fn value_string(&self) -> String {
        match &self.state.read().value {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Replaces the value and fires every subscriber. Subscribers run
    /// outside the value lock, so they may read the variable freely.
    pub fn set_value(&self, value: Value) {
        let subscribers: Vec<ChangeCallback> = {
            let mut state = self.state.write();
            state.value = value;
            state.subscribers.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for callback in subscribers {
            callback();
        }
    }

    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> SubscriptionId {
        let mut state = self.state.write();
        let id = SubscriptionId(state.next_subscription);
        state.next_subscription += 1;
        state.subscribers.push((id, Arc::new(callback)));
        id
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) {
        self.state
            .write()
            .subscribers
            .retain(|(id, _)| *id != subscription);
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.id)
            .field("var_type", &self.var_type)
            .field("value", &self.state.read().value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn allocator_combines_name_and_counter() {
        let ids = VariableIdAllocator::new();
        assert_eq!(ids.allocate("id"), "id0");
        assert_eq!(ids.allocate("id"), "id1");
        assert_eq!(ids.allocate("name"), "name2");
    }

    #[test]
    fn declare_draws_from_allocator() {
        let ids = VariableIdAllocator::new();
        let a = Variable::declare(&ids, "id", "String", json!("luke"));
        let b = Variable::declare(&ids, "id", "String", json!("leia"));
        assert_eq!(a.id(), "id0");
        assert_eq!(b.id(), "id1");
        assert_eq!(a.var_type(), "String");
    }

    #[test]
    fn set_value_fires_subscribers() {
        let var = Variable::new("id0", "String", json!("before"));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_callback = fired.clone();
        var.subscribe(move || {
            fired_in_callback.fetch_add(1, Ordering::SeqCst);
        });

        var.set_value(json!("after"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(var.value(), json!("after"));
    }

    #[test]
    fn unsubscribe_stops_notification() {
        let var = Variable::new("id0", "String", Value::Null);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_callback = fired.clone();
        let subscription = var.subscribe(move || {
            fired_in_callback.fetch_add(1, Ordering::SeqCst);
        });

        var.unsubscribe(subscription);
        var.set_value(json!(1));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn clones_share_value_and_subscribers() {
        let var = Variable::new("id0", "String", json!("a"));
        let clone = var.clone();
        clone.set_value(json!("b"));
        assert_eq!(var.value(), json!("b"));
    }

    #[test]
    fn value_string_rendering() {
        assert_eq!(
            Variable::new("v", "String", json!("luke")).value_string(),
            "luke"
        );
        assert_eq!(Variable::new("v", "Int", json!(42)).value_string(), "42");
        assert_eq!(Variable::new("v", "String", Value::Null).value_string(), "");
        assert_eq!(
            Variable::new("v", "Boolean", json!(true)).value_string(),
            "true"
        );
    }
}
