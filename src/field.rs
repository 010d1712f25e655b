//! Field nodes of the query tree
//!
//! A field carries a name, an optional alias, an optional pre-rendered
//! argument string, and an append-only list of sub-fields. `Field` is a
//! cheap clonable handle over shared state: one physical fragment can sit
//! in several ancestors' trees at once, and sub-fields appended later are
//! visible through every handle.

use std::sync::Arc;

use parking_lot::RwLock;

#[derive(Debug, Default)]
struct FieldData {
    name: Option<String>,
    alias: Option<String>,
    argument: Option<String>,
    sub_fields: Vec<Field>,
}

/// Shared handle to one node of a query field tree.
#[derive(Clone, Debug)]
pub struct Field {
    inner: Arc<RwLock<FieldData>>,
}

impl Field {
    /// Nameless container node. Serializes as its children spliced in place.
    pub fn container() -> Self {
        Self {
            inner: Arc::new(RwLock::new(FieldData::default())),
        }
    }

    /// Named field.
    pub fn named(name: impl Into<String>) -> Self {
        let field = Self::container();
        field.inner.write().name = Some(name.into());
        field
    }

    pub fn with_alias(self, alias: impl Into<String>) -> Self {
        self.inner.write().alias = Some(alias.into());
        self
    }

    /// Argument text in already-rendered form, e.g. `id: 1` or `id: $id0`.
    pub fn with_argument(self, argument: impl Into<String>) -> Self {
        self.inner.write().argument = Some(argument.into());
        self
    }

    pub fn name(&self) -> Option<String> {
        self.inner.read().name.clone()
    }

    pub fn alias(&self) -> Option<String> {
        self.inner.read().alias.clone()
    }

    pub fn argument(&self) -> Option<String> {
        self.inner.read().argument.clone()
    }

    /// The key a response object files this field under: alias when present,
    /// name otherwise.
    pub fn response_key(&self) -> Option<String> {
        let data = self.inner.read();
        data.alias.clone().or_else(|| data.name.clone())
    }

    pub fn sub_fields(&self) -> Vec<Field> {
        self.inner.read().sub_fields.clone()
    }

    pub fn sub_field_count(&self) -> usize {
        self.inner.read().sub_fields.len()
    }

    /// Sole sub-field when exactly one exists.
    pub fn single_sub_field(&self) -> Option<Field> {
        let data = self.inner.read();
        match data.sub_fields.as_slice() {
            [only] => Some(only.clone()),
            _ => None,
        }
    }

    /// Appends `child`. Appending the same physical node twice is a no-op.
    pub fn add_sub_field(&self, child: &Field) {
        let mut data = self.inner.write();
        if data.sub_fields.iter().any(|f| Field::ptr_eq(f, child)) {
            return;
        }
        data.sub_fields.push(child.clone());
    }

    /// Whether two handles refer to the same physical node.
    pub fn ptr_eq(a: &Field, b: &Field) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}
