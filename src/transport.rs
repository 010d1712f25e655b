//! Query transports
//!
//! The exchange layer query nodes fetch through. `HttpTransport`
//! performs one real HTTP exchange per call with a client scoped to
//! that call; `MockTransport` records requests and replays queued
//! envelopes for tests. Implementations honor the cancellation token
//! so superseded fetches abandon promptly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::TrellisError;

// ============================================================================
// WIRE TYPES
// ============================================================================

/// POST body of a query exchange.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<Value>,
}

/// One error reported by the service inside a well-formed envelope.
/// Anything beyond the message is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceError {
    #[serde(default)]
    pub message: String,
}

/// Response envelope: data plus service-reported errors. Either half may
/// be absent; unknown envelope fields are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Option<Vec<ServiceError>>,
}

impl ResponseEnvelope {
    /// Envelope carrying only data.
    pub fn with_data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: None,
        }
    }

    /// Appends a service error.
    pub fn and_error(mut self, message: impl Into<String>) -> Self {
        self.errors
            .get_or_insert_with(Vec::new)
            .push(ServiceError {
                message: message.into(),
            });
        self
    }
}

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// One query exchange per call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(
        &self,
        endpoint: &Url,
        query: &str,
        variables: Option<Value>,
        token: CancellationToken,
    ) -> Result<ResponseEnvelope, TrellisError>;
}

// ============================================================================
// HTTP TRANSPORT
// ============================================================================

/// How the query text travels to the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeMethod {
    /// JSON request envelope in a POST body.
    #[default]
    Post,
    /// Query in the URL query string, for services that accept GET.
    Get,
}

/// HTTP transport. The client is scoped to each exchange and released
/// afterwards; no pooling across fetches.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    method: ExchangeMethod,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, method: ExchangeMethod) -> Self {
        self.method = method;
        self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(
        &self,
        endpoint: &Url,
        query: &str,
        variables: Option<Value>,
        token: CancellationToken,
    ) -> Result<ResponseEnvelope, TrellisError> {
        let client = reqwest::Client::new();
        let request = match self.method {
            ExchangeMethod::Post => client.post(endpoint.clone()).json(&QueryRequest {
                query: query.to_string(),
                variables,
            }),
            ExchangeMethod::Get => {
                let mut url = endpoint.clone();
                {
                    let mut pairs = url.query_pairs_mut();
                    pairs.append_pair("query", query);
                    if let Some(variables) = &variables {
                        pairs.append_pair("variables", &variables.to_string());
                    }
                }
                client.get(url)
            }
        };

        tracing::debug!(%endpoint, "executing query exchange");
        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status.as_u16(), status.is_success(), body))
        };

        let (status, success, body) = tokio::select! {
            _ = token.cancelled() => return Err(TrellisError::Cancelled),
            result = exchange => result?,
        };
        decode_envelope(&body, status, success)
    }
}

/// Decode rule: an unparseable body on a failed exchange is the
/// service's failure; on a successful exchange it is a contract
/// violation. A parseable envelope passes through regardless of status.
fn decode_envelope(
    body: &str,
    status: u16,
    success: bool,
) -> Result<ResponseEnvelope, TrellisError> {
    match serde_json::from_str(body) {
        Ok(envelope) => Ok(envelope),
        Err(decode) if success => Err(TrellisError::Decode(decode)),
        Err(_) => Err(TrellisError::MalformedResponse { status }),
    }
}

// ============================================================================
// MOCK TRANSPORT
// ============================================================================

/// Request captured by [`MockTransport`] for assertions.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub endpoint: Url,
    pub query: String,
    pub variables: Option<Value>,
}

#[derive(Default)]
struct MockState {
    queued: Mutex<VecDeque<Result<ResponseEnvelope, TrellisError>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    latency: Mutex<Option<Duration>>,
}

/// In-memory transport for tests: records every request, replays queued
/// results in order, then falls back to the empty envelope.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every exchange sleeps this long before answering; lets tests keep
    /// a fetch in flight while they supersede it.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.inner.latency.lock() = Some(latency);
        self
    }

    pub fn enqueue(&self, envelope: ResponseEnvelope) {
        self.inner.queued.lock().push_back(Ok(envelope));
    }

    pub fn enqueue_error(&self, error: TrellisError) {
        self.inner.queued.lock().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.inner.requests.lock().len()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(
        &self,
        endpoint: &Url,
        query: &str,
        variables: Option<Value>,
        token: CancellationToken,
    ) -> Result<ResponseEnvelope, TrellisError> {
        self.inner.requests.lock().push(RecordedRequest {
            endpoint: endpoint.clone(),
            query: query.to_string(),
            variables,
        });

        // Claim the response up front: a superseded exchange consumes and
        // discards its own answer instead of shifting the queue.
        let result = match self.inner.queued.lock().pop_front() {
            Some(result) => result,
            None => Ok(ResponseEnvelope::default()),
        };

        let latency = *self.inner.latency.lock();
        if let Some(latency) = latency {
            tokio::select! {
                _ = token.cancelled() => return Err(TrellisError::Cancelled),
                _ = tokio::time::sleep(latency) => {}
            }
        }
        result
    }
}
