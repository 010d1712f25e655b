//! Wire-format serialization
//!
//! Renders a field tree plus variable declarations into operation text,
//! and the variables payload that travels alongside it. Output is stable:
//! one field per line, 2-space indentation per nesting level, nameless
//! container nodes spliced in place of themselves.

use serde_json::Value;

use crate::field::Field;
use crate::variable::Variable;

/// Spaces per nesting level.
const INDENT: usize = 2;

/// Default operation kind.
pub const DEFAULT_OPERATION_KIND: &str = "query";

/// Renders a `query` operation without a name.
pub fn serialize_query(field: &Field, variables: &[Variable]) -> String {
    serialize_operation(field, DEFAULT_OPERATION_KIND, None, variables)
}

/// Renders an operation: kind, optional name, the `$id: type` declaration
/// group when at least one variable is supplied, then the field block.
pub fn serialize_operation(
    field: &Field,
    op_kind: &str,
    op_name: Option<&str>,
    variables: &[Variable],
) -> String {
    let mut out = String::from(op_kind);
    if let Some(name) = op_name {
        out.push(' ');
        out.push_str(name);
    }
    if !variables.is_empty() {
        let declarations: Vec<String> = variables
            .iter()
            .map(|v| format!("${}: {}", v.id(), v.var_type()))
            .collect();
        out.push_str(" (");
        out.push_str(&declarations.join(" "));
        out.push(')');
    }
    out.push_str(" {");
    serialize_into(field, &mut out, INDENT);
    out.push_str("\n}");
    out
}

/// Flat payload object mapping variable id to stringified value.
/// `None` when no variables are supplied.
pub fn variables_payload(variables: &[Variable]) -> Option<Value> {
    if variables.is_empty() {
        return None;
    }
    let mut payload = serde_json::Map::new();
    for variable in variables {
        payload.insert(
            variable.id().to_string(),
            Value::String(variable.value_string()),
        );
    }
    Some(Value::Object(payload))
}

fn serialize_into(field: &Field, out: &mut String, indent: usize) {
    let name = match field.name() {
        Some(name) => name,
        None => {
            // Nameless nodes splice their children at the invoking level.
            for child in field.sub_fields() {
                serialize_into(&child, out, indent);
            }
            return;
        }
    };

    out.push('\n');
    out.push_str(&" ".repeat(indent));
    if let Some(alias) = field.alias() {
        out.push_str(&alias);
        out.push_str(": ");
    }
    out.push_str(&name);
    if let Some(argument) = field.argument() {
        out.push_str(" (");
        out.push_str(&argument);
        out.push(')');
    }

    let children = field.sub_fields();
    if !children.is_empty() {
        out.push_str(" {");
        for child in &children {
            serialize_into(child, out, indent + INDENT);
        }
        out.push('\n');
        out.push_str(&" ".repeat(indent));
        out.push('}');
    }
}
