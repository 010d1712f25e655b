//! Error types with fix suggestions

use thiserror::Error;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// All error variants are part of the public API.
#[derive(Error, Debug)]
pub enum TrellisError {
    // ─────────────────────────────────────────────────────────────
    // Configuration errors (synchronous, caller-side)
    // ─────────────────────────────────────────────────────────────
    #[error("Malformed field declaration '{declaration}': at most one ':' separator is allowed")]
    MalformedDeclaration { declaration: String },

    #[error("A query node cannot be its own parent")]
    SelfParent,

    #[error("Parenting under query node {id} would create an ancestry cycle")]
    ParentCycle { id: usize },

    #[error("Unknown query node handle {id}")]
    UnknownNode { id: usize },

    // ─────────────────────────────────────────────────────────────
    // Exchange errors (per-fetch, never abort future scheduling)
    // ─────────────────────────────────────────────────────────────
    #[error("Transport request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Service returned a malformed response (HTTP {status})")]
    MalformedResponse { status: u16 },

    #[error("Failed to decode response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Fetch was superseded before completion")]
    Cancelled,
}

impl FixSuggestion for TrellisError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            TrellisError::MalformedDeclaration { .. } => {
                Some("Use format: field, alias:field, or alias:field.subfield")
            }
            TrellisError::SelfParent => {
                Some("Parent the node to an ancestor query object, not to itself")
            }
            TrellisError::ParentCycle { .. } => {
                Some("Pick a parent that is not a descendant of this node")
            }
            TrellisError::UnknownNode { .. } => {
                Some("Use a handle issued by this graph's create_node")
            }
            TrellisError::Transport(_) => Some("Check the endpoint URL is reachable"),
            TrellisError::MalformedResponse { .. } => {
                Some("The service failed and returned a non-JSON body; check service logs")
            }
            TrellisError::Decode(_) => {
                Some("The service replied 2xx with a body that is not a valid response envelope")
            }
            TrellisError::Cancelled => None,
        }
    }
}
