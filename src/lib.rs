//! Trellis - reactive query composition and data binding engine
//!
//! Bound objects contribute query fragments that merge upward into a
//! root query node. The root serializes the merged tree, debounces
//! execution through a quiet window, fetches over a pluggable
//! transport, and routes response data back down the tree along each
//! node's binding path.

pub mod binding;
pub mod delayer;
pub mod error;
pub mod field;
pub mod graph;
pub mod path;
pub mod serialize;
pub mod transport;
pub mod variable;

pub use binding::{declare_variable, parse_field_declaration, ParsedDeclaration};
pub use delayer::{Delayer, Phase, DEFAULT_QUIET_PERIOD};
pub use error::{FixSuggestion, TrellisError};
pub use field::Field;
pub use graph::{ObserverId, QueryGraph, QueryId};
pub use serialize::{serialize_operation, serialize_query, variables_payload};
pub use transport::{
    ExchangeMethod, HttpTransport, MockTransport, QueryRequest, RecordedRequest,
    ResponseEnvelope, ServiceError, Transport,
};
pub use variable::{SubscriptionId, Variable, VariableIdAllocator};
