//! # Query Graph Tests
//!
//! End-to-end coverage of the engine:
//! - Debounce: bursts of invalidation collapse into one exchange
//! - Supersede: a fetch queued mid-flight discards the first result
//! - Routing: response data flows down binding paths to descendants
//! - Errors: service errors log without blocking data; exchange
//!   failures leave current data untouched
//! - Transports: HTTP POST and GET against a local mock server

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use trellis::{
    parse_field_declaration, Field, HttpTransport, MockTransport, QueryGraph, QueryId,
    ResponseEnvelope, Transport, TrellisError, Variable,
};
use url::Url;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// TEST HELPERS
// ============================================================================

fn service_endpoint() -> Url {
    Url::parse("https://service.test/graphql").unwrap()
}

fn graph_over(mock: &MockTransport, quiet_ms: u64) -> QueryGraph {
    QueryGraph::with_transport(Arc::new(mock.clone()), Duration::from_millis(quiet_ms))
}

fn arm(graph: &QueryGraph, node: QueryId) {
    graph.set_endpoint(node, Some(service_endpoint())).unwrap();
}

async fn settle(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

// ============================================================================
// DEBOUNCE AND SUPERSEDE
// ============================================================================

#[tokio::test]
async fn invalidation_burst_collapses_into_one_exchange() {
    let mock = MockTransport::new();
    let graph = graph_over(&mock, 30);
    let root = graph.create_node();

    let hero = Field::named("hero");
    graph.attach_field(root, &hero).unwrap();
    arm(&graph, root);
    for _ in 0..5 {
        graph.attach_field(root, &hero).unwrap();
        graph.queue_fetch(root).unwrap();
    }
    settle(200).await;

    assert_eq!(mock.request_count(), 1);
    assert_eq!(mock.requests()[0].query, "query {\n  hero\n}");
}

#[tokio::test]
async fn settled_windows_fetch_again() {
    let mock = MockTransport::new();
    let graph = graph_over(&mock, 15);
    let root = graph.create_node();

    graph.attach_field(root, &Field::named("hero")).unwrap();
    arm(&graph, root);
    settle(120).await;
    graph.queue_fetch(root).unwrap();
    settle(120).await;

    assert_eq!(mock.request_count(), 2);
}

#[tokio::test]
async fn execute_now_bypasses_the_quiet_window() {
    let mock = MockTransport::new();
    mock.enqueue(ResponseEnvelope::with_data(json!({"hero": "Luke"})));

    // Quiet period far beyond the test's lifetime.
    let graph = graph_over(&mock, 60_000);
    let root = graph.create_node();
    graph.attach_field(root, &Field::named("hero")).unwrap();
    arm(&graph, root);

    graph.execute_now(root).await.unwrap();
    assert_eq!(mock.request_count(), 1);
    assert_eq!(graph.data(root).unwrap(), Some(json!({"hero": "Luke"})));
}

#[tokio::test]
async fn fetch_superseded_in_flight_discards_the_first_result() {
    let mock = MockTransport::new().with_latency(Duration::from_millis(100));
    mock.enqueue(ResponseEnvelope::with_data(json!({"stale": true})));
    mock.enqueue(ResponseEnvelope::with_data(json!({"fresh": true})));

    let graph = graph_over(&mock, 10);
    let root = graph.create_node();
    graph.attach_field(root, &Field::named("hero")).unwrap();
    arm(&graph, root);

    // Let the first exchange start, then supersede it mid-flight.
    settle(50).await;
    graph.queue_fetch(root).unwrap();
    settle(300).await;

    assert_eq!(mock.request_count(), 2);
    assert_eq!(graph.data(root).unwrap(), Some(json!({"fresh": true})));
}

#[tokio::test]
async fn unarmed_node_never_fetches() {
    let mock = MockTransport::new();
    let graph = graph_over(&mock, 10);
    let node = graph.create_node();

    graph.attach_field(node, &Field::named("hero")).unwrap();
    graph
        .attach_variable(
            node,
            &Variable::declare(graph.ids(), "id", "String", json!("1")),
        )
        .unwrap();
    settle(100).await;

    assert_eq!(mock.request_count(), 0);
    assert_eq!(graph.phase(node).unwrap(), None);
}

#[tokio::test]
async fn armed_node_without_field_skips_the_exchange() {
    let mock = MockTransport::new();
    let graph = graph_over(&mock, 10);
    let root = graph.create_node();

    arm(&graph, root);
    settle(100).await;

    assert_eq!(mock.request_count(), 0);
}

#[tokio::test]
async fn disarm_cancels_pending_work_but_keeps_propagated_fragments() {
    let mock = MockTransport::new();
    let graph = graph_over(&mock, 50);
    let root = graph.create_node();
    let child = graph.create_node();

    let hero = parse_field_declaration("hero", None).unwrap().unwrap();
    graph.set_field(child, hero.field).unwrap();
    graph.set_parent(child, Some(root)).unwrap();

    arm(&graph, root);
    graph.set_endpoint(root, None).unwrap();
    settle(200).await;

    assert_eq!(mock.request_count(), 0);
    assert_eq!(graph.phase(root).unwrap(), None);
    assert_eq!(graph.endpoint(root).unwrap(), None);

    // The child's fragment survived the disarm and fetches on re-arm.
    assert_eq!(
        graph.query_text(root).unwrap().unwrap(),
        "query {\n  hero\n}"
    );
    arm(&graph, root);
    settle(200).await;
    assert_eq!(mock.request_count(), 1);
    assert_eq!(mock.requests()[0].query, "query {\n  hero\n}");
}

// ============================================================================
// VARIABLES
// ============================================================================

#[tokio::test]
async fn variable_change_requeues_with_the_new_payload() {
    let mock = MockTransport::new();
    let graph = graph_over(&mock, 15);
    let root = graph.create_node();

    let (variable, argument) =
        trellis::declare_variable(graph.ids(), "id", json!("1000"));
    let hero = parse_field_declaration("hero.name", Some(&argument))
        .unwrap()
        .unwrap();
    graph.attach_field(root, &hero.field).unwrap();
    graph.attach_variable(root, &variable).unwrap();
    arm(&graph, root);
    settle(120).await;

    variable.set_value(json!("1001"));
    settle(120).await;

    let requests = mock.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[0].query,
        "query ($id0: String) {\n  hero (id: $id0) {\n    name\n  }\n}"
    );
    assert_eq!(requests[0].variables, Some(json!({"id0": "1000"})));
    assert_eq!(requests[1].variables, Some(json!({"id0": "1001"})));
}

#[tokio::test]
async fn extra_declaration_fetches_alongside_the_bound_chain() {
    let mock = MockTransport::new();
    let graph = graph_over(&mock, 10);
    let root = graph.create_node();

    let parsed = parse_field_declaration("hero.name", None)
        .unwrap()
        .unwrap()
        .with_extra("hero.id")
        .unwrap();
    graph.attach_field(root, &parsed.field).unwrap();
    if let Some(extra) = &parsed.extra {
        graph.attach_field(root, extra).unwrap();
    }
    arm(&graph, root);
    settle(100).await;

    // The extra chain is a sibling fragment, not merged into the first.
    assert_eq!(
        mock.requests()[0].query,
        "query {\n  hero {\n    name\n  }\n  hero {\n    id\n  }\n}"
    );
}

// ============================================================================
// DATA ROUTING
// ============================================================================

#[tokio::test]
async fn response_data_flows_down_binding_paths() {
    let mock = MockTransport::new();
    mock.enqueue(ResponseEnvelope::with_data(
        json!({"hero": {"name": "Luke", "height": 172}}),
    ));

    let graph = graph_over(&mock, 10);
    let root = graph.create_node();
    let child = graph.create_node();
    let grandchild = graph.create_node();

    let hero = parse_field_declaration("hero", None).unwrap().unwrap();
    graph.set_field(child, hero.field).unwrap();
    let name = parse_field_declaration("name", None).unwrap().unwrap();
    graph.set_field(grandchild, name.field).unwrap();

    graph.set_parent(grandchild, Some(child)).unwrap();
    graph.set_parent(child, Some(root)).unwrap();

    arm(&graph, root);
    settle(150).await;

    assert_eq!(
        mock.requests()[0].query,
        "query {\n  hero {\n    name\n  }\n}"
    );
    assert_eq!(
        graph.data(root).unwrap(),
        Some(json!({"hero": {"name": "Luke", "height": 172}}))
    );
    assert_eq!(
        graph.data(child).unwrap(),
        Some(json!({"name": "Luke", "height": 172}))
    );
    assert_eq!(graph.data(grandchild).unwrap(), Some(json!("Luke")));
}

#[tokio::test]
async fn missing_key_in_parent_response_clears_child_data() {
    let mock = MockTransport::new();
    mock.enqueue(ResponseEnvelope::with_data(json!({"hero": {"name": "Luke"}})));
    // The second response carries nothing under the child's path.
    mock.enqueue(ResponseEnvelope::with_data(json!({"other": 1})));

    let graph = graph_over(&mock, 10);
    let root = graph.create_node();
    let child = graph.create_node();
    let hero = parse_field_declaration("hero.name", None).unwrap().unwrap();
    graph.set_field(child, hero.field).unwrap();
    graph.set_parent(child, Some(root)).unwrap();

    arm(&graph, root);
    settle(100).await;
    assert_eq!(graph.data(child).unwrap(), Some(json!("Luke")));

    graph.queue_fetch(root).unwrap();
    settle(100).await;
    assert_eq!(graph.data(root).unwrap(), Some(json!({"other": 1})));
    assert_eq!(graph.data(child).unwrap(), None);
}

#[tokio::test]
async fn observers_fire_on_every_replacement_including_absent() {
    let mock = MockTransport::new();
    mock.enqueue(ResponseEnvelope::with_data(json!({"hero": "Luke"})));
    // Second envelope carries no data at all.
    mock.enqueue(ResponseEnvelope::default());

    let graph = graph_over(&mock, 10);
    let root = graph.create_node();
    graph.attach_field(root, &Field::named("hero")).unwrap();

    let seen: Arc<Mutex<Vec<Option<Value>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    graph
        .observe_data(root, move |value| {
            sink.lock().push(value.cloned());
        })
        .unwrap();

    arm(&graph, root);
    settle(100).await;
    graph.queue_fetch(root).unwrap();
    settle(100).await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0], Some(json!({"hero": "Luke"})));
    assert_eq!(seen[1], None);
    assert_eq!(graph.data(root).unwrap(), None);
}

#[tokio::test]
async fn unobserved_callbacks_stop_firing() {
    let mock = MockTransport::new();
    mock.enqueue(ResponseEnvelope::with_data(json!({"n": 1})));
    mock.enqueue(ResponseEnvelope::with_data(json!({"n": 2})));

    let graph = graph_over(&mock, 10);
    let root = graph.create_node();
    graph.attach_field(root, &Field::named("n")).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let sink = fired.clone();
    let observer = graph
        .observe_data(root, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    arm(&graph, root);
    settle(100).await;
    graph.unobserve_data(root, observer).unwrap();
    graph.queue_fetch(root).unwrap();
    settle(100).await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(graph.data(root).unwrap(), Some(json!({"n": 2})));
}

#[tokio::test]
async fn reparenting_moves_data_routing_to_the_new_parent() {
    let mock = MockTransport::new();
    mock.enqueue(ResponseEnvelope::with_data(json!({"hero": "from-first"})));
    mock.enqueue(ResponseEnvelope::with_data(json!({"hero": "from-second"})));
    mock.enqueue(ResponseEnvelope::with_data(json!({"hero": "first-again"})));

    let graph = graph_over(&mock, 10);
    let first = graph.create_node();
    let second = graph.create_node();
    let child = graph.create_node();

    let hero = parse_field_declaration("hero", None).unwrap().unwrap();
    graph.set_field(child, hero.field).unwrap();
    graph.set_parent(child, Some(first)).unwrap();

    arm(&graph, first);
    settle(100).await;
    assert_eq!(graph.data(child).unwrap(), Some(json!("from-first")));

    graph.set_parent(child, Some(second)).unwrap();
    arm(&graph, second);
    settle(100).await;
    assert_eq!(graph.data(child).unwrap(), Some(json!("from-second")));

    // The old parent keeps fetching its (unchanged) tree, but the child
    // no longer follows it.
    graph.queue_fetch(first).unwrap();
    settle(100).await;
    assert_eq!(graph.data(first).unwrap(), Some(json!({"hero": "first-again"})));
    assert_eq!(graph.data(child).unwrap(), Some(json!("from-second")));
}

// ============================================================================
// ERROR HANDLING
// ============================================================================

#[tokio::test]
async fn service_errors_do_not_block_data_application() {
    let mock = MockTransport::new();
    mock.enqueue(
        ResponseEnvelope::with_data(json!({"hero": "Luke"}))
            .and_error("fieldSkipped")
            .and_error("deprecated"),
    );

    let graph = graph_over(&mock, 10);
    let root = graph.create_node();
    graph.attach_field(root, &Field::named("hero")).unwrap();
    arm(&graph, root);
    settle(100).await;

    assert_eq!(graph.data(root).unwrap(), Some(json!({"hero": "Luke"})));
}

#[tokio::test]
async fn exchange_failure_leaves_data_and_scheduling_intact() {
    let mock = MockTransport::new();
    mock.enqueue(ResponseEnvelope::with_data(json!({"hero": "Luke"})));
    mock.enqueue_error(TrellisError::MalformedResponse { status: 502 });
    mock.enqueue(ResponseEnvelope::with_data(json!({"hero": "Leia"})));

    let graph = graph_over(&mock, 10);
    let root = graph.create_node();
    graph.attach_field(root, &Field::named("hero")).unwrap();
    arm(&graph, root);
    settle(100).await;
    assert_eq!(graph.data(root).unwrap(), Some(json!({"hero": "Luke"})));

    graph.queue_fetch(root).unwrap();
    settle(100).await;
    // The failed exchange changed nothing.
    assert_eq!(graph.data(root).unwrap(), Some(json!({"hero": "Luke"})));

    graph.queue_fetch(root).unwrap();
    settle(100).await;
    assert_eq!(graph.data(root).unwrap(), Some(json!({"hero": "Leia"})));
    assert_eq!(mock.request_count(), 3);
}

// ============================================================================
// HTTP TRANSPORT
// ============================================================================

#[tokio::test]
async fn http_transport_posts_the_request_envelope() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .and(body_json(json!({
            "query": "query {\n  hero\n}",
            "variables": {"id0": "1"}
        })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": {"hero": "Luke"}})),
        )
        .mount(&server)
        .await;

    let endpoint = Url::parse(&format!("{}/graphql", server.uri())).unwrap();
    let envelope = HttpTransport::new()
        .execute(
            &endpoint,
            "query {\n  hero\n}",
            Some(json!({"id0": "1"})),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(envelope.data, Some(json!({"hero": "Luke"})));
}

#[tokio::test]
async fn http_transport_get_carries_the_query_string() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/graphql"))
        .and(query_param("query", "query {\n  hero\n}"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"data": {"hero": "Luke"}})),
        )
        .mount(&server)
        .await;

    let endpoint = Url::parse(&format!("{}/graphql", server.uri())).unwrap();
    let envelope = HttpTransport::new()
        .with_method(trellis::ExchangeMethod::Get)
        .execute(&endpoint, "query {\n  hero\n}", None, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(envelope.data, Some(json!({"hero": "Luke"})));
}

#[tokio::test]
async fn http_transport_distinguishes_malformed_from_decode_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(502).set_body_string("<html>bad gateway</html>"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chatty"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json at all"))
        .mount(&server)
        .await;

    let transport = HttpTransport::new();
    let broken = Url::parse(&format!("{}/broken", server.uri())).unwrap();
    let err = transport
        .execute(&broken, "query {\n}", None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TrellisError::MalformedResponse { status: 502 }));

    let chatty = Url::parse(&format!("{}/chatty", server.uri())).unwrap();
    let err = transport
        .execute(&chatty, "query {\n}", None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TrellisError::Decode(_)));
}

#[tokio::test]
async fn graph_fetches_end_to_end_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/graphql"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "data": {"hero": {"name": "Luke"}},
            "errors": [{"message": "minor warning"}]
        })))
        .mount(&server)
        .await;

    let graph = QueryGraph::with_transport(
        Arc::new(HttpTransport::new()),
        Duration::from_millis(10),
    );
    let root = graph.create_node();
    let child = graph.create_node();
    let hero = parse_field_declaration("hero.name", None).unwrap().unwrap();
    graph.set_field(child, hero.field).unwrap();
    graph.set_parent(child, Some(root)).unwrap();

    let endpoint = Url::parse(&format!("{}/graphql", server.uri())).unwrap();
    graph.set_endpoint(root, Some(endpoint)).unwrap();
    settle(200).await;

    assert_eq!(
        graph.data(root).unwrap(),
        Some(json!({"hero": {"name": "Luke"}}))
    );
    assert_eq!(graph.data(child).unwrap(), Some(json!("Luke")));
}
