//! Query node graph
//!
//! The arena of query nodes. A node owns a field tree, variables, an
//! optional endpoint with a debounced scheduler, and a parent handle.
//! Fragments and variables attached anywhere propagate up to the root;
//! fetched data flows back down, each child carving its slice out of
//! the parent's value through its cached binding path.
//!
//! Handles are opaque indices into the arena. Parent links are plain
//! handles, never owning references, and the scheduler reaches back
//! into the graph through a weak reference so dropping the graph tears
//! down scheduled work.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::delayer::{Delayer, Phase, DEFAULT_QUIET_PERIOD};
use crate::error::TrellisError;
use crate::field::Field;
use crate::transport::{HttpTransport, Transport};
use crate::variable::{Variable, VariableIdAllocator};
use crate::{path, serialize};

/// Opaque handle to a node in a [`QueryGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(usize);

/// Handle returned by [`QueryGraph::observe_data`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverId(u64);

type DataObserver = Arc<dyn Fn(Option<&Value>) + Send + Sync>;

/// Root field plus the cached attachment point for incoming fragments.
/// Both are replaced together and only when the root reference changes.
struct RootField {
    root: Field,
    last: Field,
}

#[derive(Default)]
struct QueryNode {
    endpoint: Option<Url>,
    delayer: Option<Delayer>,
    field: Option<RootField>,
    binding_path: Vec<String>,
    variables: Vec<Variable>,
    parent: Option<QueryId>,
    children: Vec<QueryId>,
    data: Option<Value>,
    observers: Vec<(ObserverId, DataObserver)>,
}

struct GraphInner {
    nodes: RwLock<Vec<QueryNode>>,
    transport: Arc<dyn Transport>,
    quiet_period: Duration,
    ids: VariableIdAllocator,
    next_observer: AtomicU64,
}

/// Shared handle to the arena. Clones observe the same nodes.
#[derive(Clone)]
pub struct QueryGraph {
    inner: Arc<GraphInner>,
}

impl Default for QueryGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryGraph {
    /// Graph fetching over HTTP with the default quiet period.
    pub fn new() -> Self {
        Self::with_transport(Arc::new(HttpTransport::new()), DEFAULT_QUIET_PERIOD)
    }

    /// Graph with an explicit transport and quiet period.
    pub fn with_transport(transport: Arc<dyn Transport>, quiet_period: Duration) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                nodes: RwLock::new(Vec::new()),
                transport,
                quiet_period,
                ids: VariableIdAllocator::new(),
                next_observer: AtomicU64::new(0),
            }),
        }
    }

    /// Allocator for variable wire ids declared against this graph.
    pub fn ids(&self) -> &VariableIdAllocator {
        &self.inner.ids
    }

    /// Adds a node. Handles stay valid for the graph's lifetime.
    pub fn create_node(&self) -> QueryId {
        let mut nodes = self.inner.nodes.write();
        let id = QueryId(nodes.len());
        nodes.push(QueryNode::default());
        id
    }

    // ────────────────────────────────────────────────────────────
    // Endpoint and scheduling
    // ────────────────────────────────────────────────────────────

    /// Arms the node (`Some`): creates its scheduler when missing and
    /// queues a fetch. Disarms it (`None`): cancels and drops the
    /// scheduler. Fragments and variables already propagated to the
    /// parent remain attached there.
    pub fn set_endpoint(&self, id: QueryId, endpoint: Option<Url>) -> Result<(), TrellisError> {
        match endpoint {
            Some(url) => {
                let delayer = {
                    let mut nodes = self.inner.nodes.write();
                    let node = get_node_mut(&mut nodes, id)?;
                    node.endpoint = Some(url);
                    if node.delayer.is_none() {
                        node.delayer = Some(self.make_delayer(id));
                    }
                    node.delayer.clone()
                };
                if let Some(delayer) = delayer {
                    delayer.queue();
                }
            }
            None => {
                let delayer = {
                    let mut nodes = self.inner.nodes.write();
                    let node = get_node_mut(&mut nodes, id)?;
                    node.endpoint = None;
                    node.delayer.take()
                };
                if let Some(delayer) = delayer {
                    delayer.cancel();
                }
            }
        }
        Ok(())
    }

    /// Restarts the node's quiet window when it is armed.
    pub fn queue_fetch(&self, id: QueryId) -> Result<(), TrellisError> {
        let delayer = {
            let nodes = self.inner.nodes.read();
            match nodes.get(id.0) {
                Some(node) => node.delayer.clone(),
                None => return Err(TrellisError::UnknownNode { id: id.0 }),
            }
        };
        if let Some(delayer) = delayer {
            delayer.queue();
        }
        Ok(())
    }

    /// Serializes and fetches immediately, bypassing the quiet window.
    pub async fn execute_now(&self, id: QueryId) -> anyhow::Result<()> {
        {
            let nodes = self.inner.nodes.read();
            if nodes.get(id.0).is_none() {
                return Err(TrellisError::UnknownNode { id: id.0 }.into());
            }
        }
        GraphInner::run_query(&self.inner, id, CancellationToken::new()).await
    }

    // ────────────────────────────────────────────────────────────
    // Field tree and variables
    // ────────────────────────────────────────────────────────────

    /// Replaces the node's root field. Binding path and the attachment
    /// point are recomputed here and only here; later mutation of the
    /// tree's descendants leaves both caches untouched, and re-setting
    /// the same physical root is a no-op.
    pub fn set_field(&self, id: QueryId, field: Field) -> Result<(), TrellisError> {
        let delayer = {
            let mut nodes = self.inner.nodes.write();
            let node = get_node_mut(&mut nodes, id)?;
            if let Some(existing) = &node.field {
                if Field::ptr_eq(&existing.root, &field) {
                    return Ok(());
                }
            }
            replace_root_field(node, field);
            node.delayer.clone()
        };
        if let Some(delayer) = delayer {
            delayer.queue();
        }
        Ok(())
    }

    /// Appends `fragment` under the node's attachment point, lazily
    /// creating the nameless root container, then forwards each node's
    /// own root to its parent so the fragment reaches the fetching
    /// root. Armed nodes along the way re-queue.
    pub fn attach_field(&self, id: QueryId, fragment: &Field) -> Result<(), TrellisError> {
        let mut to_queue = Vec::new();
        {
            let mut nodes = self.inner.nodes.write();
            get_node_mut(&mut nodes, id)?;

            let mut current = id.0;
            let mut incoming = fragment.clone();
            loop {
                let (own_root, target) = field_and_target(&mut nodes[current]);
                target.add_sub_field(&incoming);
                if let Some(delayer) = &nodes[current].delayer {
                    to_queue.push(delayer.clone());
                }
                match nodes[current].parent {
                    Some(parent) => {
                        incoming = own_root;
                        current = parent.0;
                    }
                    None => break,
                }
            }
        }
        for delayer in to_queue {
            delayer.queue();
        }
        Ok(())
    }

    /// Records the variable on this node and every ancestor (idempotent
    /// by wire id) and subscribes each recording node's scheduler to the
    /// variable's change notification. Armed nodes re-queue.
    pub fn attach_variable(&self, id: QueryId, variable: &Variable) -> Result<(), TrellisError> {
        let mut to_queue = Vec::new();
        {
            let mut nodes = self.inner.nodes.write();
            get_node_mut(&mut nodes, id)?;

            let mut current = id.0;
            loop {
                let node = &mut nodes[current];
                let known = node.variables.iter().any(|v| v.id() == variable.id());
                if !known {
                    node.variables.push(variable.clone());
                    let graph = Arc::downgrade(&self.inner);
                    let holder = QueryId(current);
                    variable.subscribe(move || {
                        if let Some(inner) = graph.upgrade() {
                            GraphInner::queue_node(&inner, holder);
                        }
                    });
                }
                if let Some(delayer) = &node.delayer {
                    to_queue.push(delayer.clone());
                }
                match node.parent {
                    Some(parent) => current = parent.0,
                    None => break,
                }
            }
        }
        for delayer in to_queue {
            delayer.queue();
        }
        Ok(())
    }

    // ────────────────────────────────────────────────────────────
    // Parenting
    // ────────────────────────────────────────────────────────────

    /// Reparents `child`. Self-parenting and ancestry cycles are
    /// rejected synchronously; an unchanged parent is a no-op. The child
    /// deregisters from its previous parent's data routing, registers
    /// with the new one, and re-attaches its locally-known field
    /// container and variables through the new parent (idempotent when
    /// they were already attached through an earlier parent).
    pub fn set_parent(&self, child: QueryId, parent: Option<QueryId>) -> Result<(), TrellisError> {
        if parent == Some(child) {
            return Err(TrellisError::SelfParent);
        }

        let (field_to_attach, variables_to_attach) = {
            let mut nodes = self.inner.nodes.write();
            get_node_mut(&mut nodes, child)?;
            if let Some(parent) = parent {
                get_node_mut(&mut nodes, parent)?;
            }
            if nodes[child.0].parent == parent {
                return Ok(());
            }

            // The proposed parent's ancestry must not contain the child,
            // or upward propagation and downward routing would never
            // terminate.
            if let Some(proposed) = parent {
                let mut cursor = Some(proposed);
                while let Some(current) = cursor {
                    if current == child {
                        return Err(TrellisError::ParentCycle { id: proposed.0 });
                    }
                    cursor = nodes[current.0].parent;
                }
            }

            if let Some(previous) = nodes[child.0].parent {
                nodes[previous.0].children.retain(|c| *c != child);
            }
            nodes[child.0].parent = parent;
            if let Some(parent) = parent {
                if !nodes[parent.0].children.contains(&child) {
                    nodes[parent.0].children.push(child);
                }
            }
            (
                nodes[child.0].field.as_ref().map(|f| f.root.clone()),
                nodes[child.0].variables.clone(),
            )
        };

        if let Some(parent) = parent {
            if let Some(field) = field_to_attach {
                self.attach_field(parent, &field)?;
            }
            for variable in variables_to_attach {
                self.attach_variable(parent, &variable)?;
            }
        }
        Ok(())
    }

    // ────────────────────────────────────────────────────────────
    // Data and observation
    // ────────────────────────────────────────────────────────────

    /// Current data slice; absent until a fetch (own or an ancestor's)
    /// has routed a value here.
    pub fn data(&self, id: QueryId) -> Result<Option<Value>, TrellisError> {
        let nodes = self.inner.nodes.read();
        match nodes.get(id.0) {
            Some(node) => Ok(node.data.clone()),
            None => Err(TrellisError::UnknownNode { id: id.0 }),
        }
    }

    /// Calls `callback` with the new value each time the node's data is
    /// replaced, including replacement by absent.
    pub fn observe_data(
        &self,
        id: QueryId,
        callback: impl Fn(Option<&Value>) + Send + Sync + 'static,
    ) -> Result<ObserverId, TrellisError> {
        let mut nodes = self.inner.nodes.write();
        let node = get_node_mut(&mut nodes, id)?;
        let observer = ObserverId(self.inner.next_observer.fetch_add(1, Ordering::Relaxed));
        node.observers.push((observer, Arc::new(callback)));
        Ok(observer)
    }

    pub fn unobserve_data(&self, id: QueryId, observer: ObserverId) -> Result<(), TrellisError> {
        let mut nodes = self.inner.nodes.write();
        let node = get_node_mut(&mut nodes, id)?;
        node.observers.retain(|(o, _)| *o != observer);
        Ok(())
    }

    // ────────────────────────────────────────────────────────────
    // Introspection
    // ────────────────────────────────────────────────────────────

    pub fn endpoint(&self, id: QueryId) -> Result<Option<Url>, TrellisError> {
        self.read_node(id, |node| node.endpoint.clone())
    }

    pub fn field(&self, id: QueryId) -> Result<Option<Field>, TrellisError> {
        self.read_node(id, |node| node.field.as_ref().map(|f| f.root.clone()))
    }

    pub fn parent(&self, id: QueryId) -> Result<Option<QueryId>, TrellisError> {
        self.read_node(id, |node| node.parent)
    }

    pub fn variables(&self, id: QueryId) -> Result<Vec<Variable>, TrellisError> {
        self.read_node(id, |node| node.variables.clone())
    }

    pub fn binding_path(&self, id: QueryId) -> Result<Vec<String>, TrellisError> {
        self.read_node(id, |node| node.binding_path.clone())
    }

    /// Scheduler phase; `None` while disarmed.
    pub fn phase(&self, id: QueryId) -> Result<Option<Phase>, TrellisError> {
        self.read_node(id, |node| node.delayer.as_ref().map(Delayer::phase))
    }

    /// Operation text the node would fetch with right now; `None` while
    /// it has no field tree.
    pub fn query_text(&self, id: QueryId) -> Result<Option<String>, TrellisError> {
        self.read_node(id, |node| {
            node.field
                .as_ref()
                .map(|field| serialize::serialize_query(&field.root, &node.variables))
        })
    }

    fn read_node<T>(
        &self,
        id: QueryId,
        read: impl FnOnce(&QueryNode) -> T,
    ) -> Result<T, TrellisError> {
        let nodes = self.inner.nodes.read();
        match nodes.get(id.0) {
            Some(node) => Ok(read(node)),
            None => Err(TrellisError::UnknownNode { id: id.0 }),
        }
    }

    fn make_delayer(&self, id: QueryId) -> Delayer {
        let graph: Weak<GraphInner> = Arc::downgrade(&self.inner);
        Delayer::new(move |token| {
            let graph = graph.clone();
            Box::pin(async move {
                let inner = match graph.upgrade() {
                    Some(inner) => inner,
                    None => return,
                };
                if let Err(error) = GraphInner::run_query(&inner, id, token).await {
                    tracing::error!(node = id.0, "query execution failed: {error:#}");
                }
            })
        })
        .with_quiet_period(self.inner.quiet_period)
    }
}

impl GraphInner {
    fn queue_node(inner: &Arc<Self>, id: QueryId) {
        let delayer = {
            let nodes = inner.nodes.read();
            nodes.get(id.0).and_then(|node| node.delayer.clone())
        };
        if let Some(delayer) = delayer {
            delayer.queue();
        }
    }

    /// Serializes the node's tree, performs the exchange, and routes the
    /// node's slice of the response downward. Superseded work discards
    /// its result; exchange failures leave current data untouched and do
    /// not disturb future scheduling.
    async fn run_query(
        inner: &Arc<Self>,
        id: QueryId,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        let (endpoint, field, variables, binding) = {
            let nodes = inner.nodes.read();
            let node = match nodes.get(id.0) {
                Some(node) => node,
                None => return Ok(()),
            };
            let endpoint = match &node.endpoint {
                Some(endpoint) => endpoint.clone(),
                None => return Ok(()),
            };
            let field = match &node.field {
                Some(field) => field.root.clone(),
                None => return Ok(()),
            };
            (
                endpoint,
                field,
                node.variables.clone(),
                node.binding_path.clone(),
            )
        };

        let query = serialize::serialize_query(&field, &variables);
        let payload = serialize::variables_payload(&variables);
        tracing::debug!(node = id.0, %endpoint, "fetching query");

        let envelope = match inner
            .transport
            .execute(&endpoint, &query, payload, token.clone())
            .await
        {
            Ok(envelope) => envelope,
            Err(TrellisError::Cancelled) => {
                tracing::debug!(node = id.0, "fetch superseded before completion");
                return Ok(());
            }
            Err(error) => return Err(error).context("query exchange failed"),
        };

        if token.is_cancelled() {
            tracing::debug!(node = id.0, "discarding superseded response");
            return Ok(());
        }

        if let Some(errors) = &envelope.errors {
            for error in errors {
                tracing::warn!(node = id.0, "service error: {}", error.message);
            }
        }

        let slice = envelope
            .data
            .as_ref()
            .and_then(|data| path::walk(data, &binding));
        inner.apply_data(id, slice);
        Ok(())
    }

    /// Replaces a node's data and routes slices to registered children,
    /// breadth-first. Observers run after the arena lock is released so
    /// they may call back into the graph.
    fn apply_data(self: &Arc<Self>, id: QueryId, value: Option<Value>) {
        let mut notifications: Vec<(DataObserver, Option<Value>)> = Vec::new();
        {
            let mut nodes = self.nodes.write();
            let mut pending = VecDeque::new();
            pending.push_back((id, value));

            while let Some((current, value)) = pending.pop_front() {
                let (children, parent_data) = match nodes.get_mut(current.0) {
                    Some(node) => {
                        node.data = value;
                        for (_, observer) in &node.observers {
                            notifications.push((observer.clone(), node.data.clone()));
                        }
                        (node.children.clone(), node.data.clone())
                    }
                    None => continue,
                };

                for child in children {
                    let slice = match (&parent_data, nodes.get(child.0)) {
                        (Some(data), Some(child_node)) => path::walk(data, &child_node.binding_path),
                        _ => None,
                    };
                    pending.push_back((child, slice));
                }
            }
        }

        for (observer, value) in notifications {
            observer(value.as_ref());
        }
    }
}

fn get_node_mut<'a>(
    nodes: &'a mut Vec<QueryNode>,
    id: QueryId,
) -> Result<&'a mut QueryNode, TrellisError> {
    nodes
        .get_mut(id.0)
        .ok_or(TrellisError::UnknownNode { id: id.0 })
}

fn replace_root_field(node: &mut QueryNode, field: Field) {
    node.binding_path = path::binding_path(&field);
    let last = path::last_field(&field);
    node.field = Some(RootField { root: field, last });
}

/// Root and attachment point, creating the nameless container first when
/// the node has no field tree yet.
fn field_and_target(node: &mut QueryNode) -> (Field, Field) {
    match &node.field {
        Some(field) => (field.root.clone(), field.last.clone()),
        None => {
            let container = Field::container();
            replace_root_field(node, container.clone());
            (container.clone(), container)
        }
    }
}
