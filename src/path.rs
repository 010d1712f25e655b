//! Binding paths
//!
//! A binding path is the ordered key sequence a query node uses to carve
//! its own slice out of response data: the `alias ?? name` of each field
//! along the single-child spine of its tree. Resolution over response
//! values treats absence as `None`, never as an error.

use serde_json::Value;

use crate::field::Field;

/// Collects `alias ?? name` down the single-child spine of `field`.
///
/// Nameless container nodes contribute no key. A node with zero or
/// multiple sub-fields ends the walk, so branching trees bind at the
/// branch point.
pub fn binding_path(field: &Field) -> Vec<String> {
    let mut path = Vec::new();
    let mut current = Some(field.clone());
    while let Some(node) = current {
        if node.name().is_some() {
            if let Some(key) = node.response_key() {
                path.push(key);
            }
        }
        current = node.single_sub_field();
    }
    path
}

/// Deepest node of the single-child spine: the attachment point for
/// fragments arriving from descendant query nodes.
pub fn last_field(field: &Field) -> Field {
    let mut current = field.clone();
    while let Some(next) = current.single_sub_field() {
        current = next;
    }
    current
}

/// Resolves `path` over a response value. Missing keys and non-object
/// intermediates yield `None`. An empty path yields the value itself.
pub fn walk(value: &Value, path: &[String]) -> Option<Value> {
    let mut current = value;
    for key in path {
        current = current.get(key.as_str())?;
    }
    Some(current.clone())
}
