//! Binding declarations
//!
//! Presentation glue declares what a bound element needs with a compact
//! string: `[alias:]name[.name]*`, optionally an argument expression and
//! an extra sibling declaration fetched alongside. Parsing produces the
//! field fragment to attach and the binding path used to pluck the bound
//! value back out of the owning node's data.

use serde_json::Value;

use crate::error::TrellisError;
use crate::field::Field;
use crate::variable::{Variable, VariableIdAllocator};

/// Declared variables use the generic scalar type.
const SCALAR_TYPE: &str = "String";

/// A parsed binding declaration ready for attachment.
#[derive(Debug, Clone)]
pub struct ParsedDeclaration {
    /// Head of the field chain; the argument sits on this node.
    pub field: Field,
    /// `alias ?? name` for the head, then each chained name.
    pub binding_path: Vec<String>,
    /// Sibling fragment fetched alongside the main chain.
    pub extra: Option<Field>,
}

impl ParsedDeclaration {
    /// Parses an extra sibling declaration (no argument, no alias use of
    /// its path). An empty extra leaves the declaration unchanged.
    pub fn with_extra(mut self, declaration: &str) -> Result<Self, TrellisError> {
        if let Some(parsed) = parse_field_declaration(declaration, None)? {
            self.extra = Some(parsed.field);
        }
        Ok(self)
    }
}

/// Parses `[alias:]name[.name]*` into a single-chain fragment.
///
/// Alias and name segments are trimmed and empty segments on either
/// separator are dropped: `a::b` reads as alias `a` with name `b`, and
/// `a..b` chains `a` straight to `b`. More than two `:` segments is
/// malformed. A declaration with no usable name yields `Ok(None)`. The
/// argument expression, when given, is attached verbatim to the head of
/// the chain.
pub fn parse_field_declaration(
    declaration: &str,
    argument: Option<&str>,
) -> Result<Option<ParsedDeclaration>, TrellisError> {
    let parts: Vec<&str> = declaration
        .split(':')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    let (alias, names) = match parts.as_slice() {
        [] => return Ok(None),
        [names] => (None, *names),
        [alias, names] => (Some(*alias), *names),
        _ => {
            return Err(TrellisError::MalformedDeclaration {
                declaration: declaration.to_string(),
            })
        }
    };

    let mut links = names.split('.').map(str::trim).filter(|n| !n.is_empty());
    let head_name = match links.next() {
        Some(name) => name,
        None => return Ok(None),
    };

    let mut head = Field::named(head_name);
    if let Some(alias) = alias {
        head = head.with_alias(alias);
    }
    if let Some(argument) = argument {
        head = head.with_argument(argument);
    }

    let mut binding_path = vec![alias.unwrap_or(head_name).to_string()];
    let mut tail = head.clone();
    for name in links {
        let next = Field::named(name);
        tail.add_sub_field(&next);
        tail = next;
        binding_path.push(name.to_string());
    }

    Ok(Some(ParsedDeclaration {
        field: head,
        binding_path,
        extra: None,
    }))
}

/// Declares a variable bound to `name` and renders the argument
/// expression that references it (`name: $name0`).
pub fn declare_variable(
    ids: &VariableIdAllocator,
    name: &str,
    initial: Value,
) -> (Variable, String) {
    let variable = Variable::declare(ids, name, SCALAR_TYPE, initial);
    let expression = format!("{name}: ${}", variable.id());
    (variable, expression)
}
