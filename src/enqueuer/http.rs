//! HTTP enqueuer - routes requests to function targets.
//!
//! The host HTTP framework hands every request to [`HttpEnqueuer::dispatch`].
//! A matching route turns it into an event; the caller then waits until the
//! worker answers with `HttpRespond`, fails the event (500), or acks it
//! without answering (204). A request that cannot be queued, or that is still
//! waiting when the enqueuer shuts down, gets 503; one that no worker answers
//! in time gets 504.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{parse_options, EnqueueError, Enqueuer, Result};
use crate::event::{Event, EventType, Target};
use crate::queue::{Completion, EventQueue, Outcome};
use crate::registry::TargetRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    /// Matches every method.
    All,
}

impl HttpMethod {
    const CONCRETE: [HttpMethod; 7] = [
        HttpMethod::Get,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Delete,
        HttpMethod::Patch,
        HttpMethod::Head,
        HttpMethod::Options,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::All => "ALL",
        }
    }

    fn accepts(&self, method: HttpMethod) -> bool {
        *self == HttpMethod::All || *self == method
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "DELETE" => Ok(HttpMethod::Delete),
            "PATCH" => Ok(HttpMethod::Patch),
            "HEAD" => Ok(HttpMethod::Head),
            "OPTIONS" => Ok(HttpMethod::Options),
            "ALL" => Ok(HttpMethod::All),
            other => Err(format!("unsupported method '{}'", other)),
        }
    }
}

impl TryFrom<String> for HttpMethod {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<HttpMethod> for String {
    fn from(method: HttpMethod) -> Self {
        method.as_str().to_string()
    }
}

fn default_preflight() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpOptions {
    pub method: HttpMethod,
    pub path: String,
    /// Answer CORS preflight requests for this route.
    #[serde(default = "default_preflight")]
    pub preflight: bool,
}

/// Normalize a request or route path: leading `/`, no trailing `/`, no empty segments.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A route path with optional `:name` parameter segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePattern {
    path: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(path: &str) -> std::result::Result<Self, String> {
        let path = normalize_path(path.trim());
        let mut segments = Vec::new();
        let mut names = BTreeSet::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            match segment.strip_prefix(':') {
                Some("") => return Err(format!("empty parameter name in '{}'", path)),
                Some(name) => {
                    if !names.insert(name.to_string()) {
                        return Err(format!("duplicate parameter ':{}' in '{}'", name, path));
                    }
                    segments.push(Segment::Param(name.to_string()));
                }
                None => segments.push(Segment::Literal(segment.to_string())),
            }
        }
        Ok(Self { path, segments })
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    fn param_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Param(_)))
            .count()
    }

    /// Captured parameters if `path` matches.
    fn capture(&self, path: &[&str]) -> Option<BTreeMap<String, String>> {
        if path.len() != self.segments.len() {
            return None;
        }
        let mut params = BTreeMap::new();
        for (segment, value) in self.segments.iter().zip(path) {
            match segment {
                Segment::Literal(literal) if literal == value => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), value.to_string());
                }
            }
        }
        Some(params)
    }

    /// Whether both patterns match exactly the same paths.
    fn same_shape(&self, other: &RoutePattern) -> bool {
        self.segments.len() == other.segments.len()
            && self
                .segments
                .iter()
                .zip(&other.segments)
                .all(|pair| match pair {
                    (Segment::Literal(a), Segment::Literal(b)) => a == b,
                    (Segment::Param(_), Segment::Param(_)) => true,
                    _ => false,
                })
    }
}

/// Request handed over by the host HTTP framework.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Build a request; a `?query` suffix on `path` is split into `query`.
    pub fn new(method: impl Into<String>, path: &str) -> Self {
        let (path, query) = match path.split_once('?') {
            Some((path, query)) => (path, parse_query(query)),
            None => (path, BTreeMap::new()),
        };
        Self {
            method: method.into(),
            path: path.to_string(),
            query,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

fn parse_query(query: &str) -> BTreeMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (decode_component(key), decode_component(value)),
            None => (decode_component(pair), String::new()),
        })
        .collect()
}

/// Form-style decoding: `+` is a space, `%XX` escapes are resolved. Input
/// that does not decode to UTF-8 is kept as sent.
fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    match urlencoding::decode(&spaced) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => raw.to_string(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(body.into())
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }
}

/// Payload carried by HTTP events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpInvocation {
    pub method: String,
    pub path: String,
    pub params: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    /// Base64-encoded request body.
    pub body: String,
}

impl HttpInvocation {
    pub fn decode_body(&self) -> std::result::Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.body)
    }
}

type PendingMap = HashMap<String, oneshot::Sender<HttpResponse>>;

/// Requests waiting for a worker's answer, keyed by event id.
#[derive(Clone, Default)]
pub struct PendingResponses {
    inner: Arc<Mutex<PendingMap>>,
}

impl PendingResponses {
    fn lock(&self) -> MutexGuard<'_, PendingMap> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, event_id: &str) -> (oneshot::Receiver<HttpResponse>, PendingGuard) {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(event_id.to_string(), tx);
        let guard = PendingGuard {
            responses: self.clone(),
            event_id: event_id.to_string(),
        };
        (rx, guard)
    }

    /// Deliver the response for `event_id`.
    ///
    /// Returns `false` if nobody is waiting for it (already answered, or the
    /// client went away).
    pub fn respond(&self, event_id: &str, response: HttpResponse) -> bool {
        match self.lock().remove(event_id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Drop every waiting request; their callers answer 503.
    fn release_all(&self) -> usize {
        let mut pending = self.lock();
        let released = pending.len();
        pending.clear();
        released
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drops the pending entry when the dispatching caller goes away.
struct PendingGuard {
    responses: PendingResponses,
    event_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.responses.lock().remove(&self.event_id);
    }
}

/// Turn worker completions into responses for requests still waiting.
async fn relay_completions(mut completions: broadcast::Receiver<Completion>, responses: PendingResponses) {
    loop {
        match completions.recv().await {
            Ok(completion) => {
                let response = match completion.outcome {
                    Outcome::Acked => HttpResponse::new(204),
                    Outcome::Failed(message) => HttpResponse::text(500, message),
                };
                responses.respond(&completion.event_id, response);
            }
            Err(broadcast::error::RecvError::Lagged(count)) => {
                warn!(skipped = count, "HTTP completion relay lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

type Routes = TargetRegistry<HttpOptions, RoutePattern>;

struct Matched {
    target: Target,
    route: String,
    params: BTreeMap<String, String>,
}

/// Default time a request waits for its worker's answer.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct HttpEnqueuer {
    queue: Arc<EventQueue>,
    routes: Mutex<Routes>,
    responses: PendingResponses,
    response_timeout: Duration,
    relay: JoinHandle<()>,
}

impl HttpEnqueuer {
    /// Create the enqueuer and start relaying completions.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(queue: Arc<EventQueue>) -> Self {
        let responses = PendingResponses::default();
        let relay = tokio::spawn(relay_completions(queue.subscribe_completions(), responses.clone()));
        Self {
            queue,
            routes: Mutex::new(Routes::new()),
            responses,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            relay,
        }
    }

    /// Answer 504 when no worker responds within `timeout`.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Handle used by the worker transport to deliver `HttpRespond` calls.
    pub fn responses(&self) -> PendingResponses {
        self.responses.clone()
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Best route for a request: exact method over `ALL`, then fewest parameters,
    /// then the smaller pattern.
    fn find_route(&self, method: HttpMethod, path: &[&str]) -> Option<Matched> {
        let routes = self.routes();
        let mut best: Option<((bool, usize, &str), Matched)> = None;
        for entry in routes.entries() {
            if !entry.options.method.accepts(method) {
                continue;
            }
            let Some(params) = entry.resource.capture(path) else {
                continue;
            };
            let rank = (
                entry.options.method == HttpMethod::All,
                entry.resource.param_count(),
                entry.resource.as_str(),
            );
            if best.as_ref().map_or(true, |(current, _)| rank < *current) {
                best = Some((
                    rank,
                    Matched {
                        target: entry.target.clone(),
                        route: entry.resource.as_str().to_string(),
                        params,
                    },
                ));
            }
        }
        best.map(|(_, matched)| matched)
    }

    /// CORS preflight answer, if any preflight-enabled route owns `path`.
    fn preflight(&self, path: &[&str], request: &HttpRequest) -> Option<HttpResponse> {
        let routes = self.routes();
        let mut methods = BTreeSet::new();
        for entry in routes.entries() {
            if entry.options.preflight && entry.resource.capture(path).is_some() {
                match entry.options.method {
                    HttpMethod::All => methods.extend(HttpMethod::CONCRETE),
                    method => {
                        methods.insert(method);
                    }
                }
            }
        }
        if methods.is_empty() {
            return None;
        }
        methods.insert(HttpMethod::Options);

        let allow_methods = methods
            .iter()
            .map(HttpMethod::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let allow_headers = request
            .headers
            .get("access-control-request-headers")
            .cloned()
            .unwrap_or_else(|| "*".to_string());

        Some(
            HttpResponse::new(204)
                .with_header("access-control-allow-origin", "*")
                .with_header("access-control-allow-methods", allow_methods)
                .with_header("access-control-allow-headers", allow_headers)
                .with_header("access-control-max-age", "86400"),
        )
    }

    /// Route a request to its target and wait for the worker's answer.
    pub async fn dispatch(&self, request: HttpRequest) -> HttpResponse {
        let Ok(method) = request.method.parse::<HttpMethod>() else {
            return HttpResponse::text(405, "Method Not Allowed");
        };
        let path = normalize_path(&request.path);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        // An explicit OPTIONS route handles its own preflight.
        if method == HttpMethod::Options && !self.has_explicit_options(&segments) {
            if let Some(response) = self.preflight(&segments, &request) {
                return response;
            }
        }
        let Some(matched) = self.find_route(method, &segments) else {
            return HttpResponse::text(404, "Not Found");
        };

        let invocation = HttpInvocation {
            method: method.to_string(),
            path: path.clone(),
            params: matched.params,
            query: request.query,
            headers: request.headers,
            body: BASE64.encode(&request.body),
        };
        let event = match Event::with_json(matched.target.clone(), EventType::Http, &invocation) {
            Ok(event) => event,
            Err(e) => {
                warn!(target_id = %matched.target.id, error = %e, "Failed to encode HTTP event");
                return HttpResponse::text(500, "Internal Server Error");
            }
        };

        let (rx, _guard) = self.responses.register(event.id());
        debug!(
            event_id = %event.id(),
            target_id = %matched.target.id,
            route = %matched.route,
            method = %method,
            "HTTP request dispatched"
        );
        let event_id = event.id().to_string();
        if self.queue.enqueue(event).is_err() {
            return HttpResponse::text(503, "Service Unavailable");
        }

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => HttpResponse::text(503, "Service Unavailable"),
            Err(_) => {
                warn!(
                    event_id = %event_id,
                    timeout_ms = self.response_timeout.as_millis() as u64,
                    "No worker answer for HTTP request"
                );
                HttpResponse::text(504, "Gateway Timeout")
            }
        }
    }

    fn has_explicit_options(&self, path: &[&str]) -> bool {
        self.routes().entries().any(|entry| {
            entry.options.method == HttpMethod::Options && entry.resource.capture(path).is_some()
        })
    }
}

#[async_trait]
impl Enqueuer for HttpEnqueuer {
    fn kind(&self) -> EventType {
        EventType::Http
    }

    async fn subscribe(&self, target: Target, options: serde_json::Value) -> Result<()> {
        let options: HttpOptions = parse_options(EventType::Http, options)?;
        let pattern = RoutePattern::parse(&options.path)
            .map_err(|e| EnqueueError::invalid(EventType::Http, e))?;

        let mut routes = self.routes();
        routes.ensure_vacant(&target)?;
        if let Some(owner) = routes.entries().find(|entry| {
            entry.options.method == options.method && entry.resource.same_shape(&pattern)
        }) {
            return Err(EnqueueError::invalid(
                EventType::Http,
                format!(
                    "route {} {} is already owned by '{}'",
                    options.method, owner.resource.as_str(), owner.target.id
                ),
            ));
        }

        let target_id = target.id.clone();
        let route = pattern.as_str().to_string();
        let method = options.method;
        routes.insert(target, options, pattern)?;
        info!(target_id = %target_id, method = %method, route = %route, "Subscribed to HTTP route");
        Ok(())
    }

    async fn unsubscribe(&self, target: &Target) {
        if let Some(entry) = self.routes().remove(target) {
            info!(
                target_id = %target.id,
                method = %entry.options.method,
                route = %entry.resource.as_str(),
                "Unsubscribed from HTTP route"
            );
        }
    }

    async fn subscriptions(&self) -> Vec<Target> {
        self.routes()
            .entries()
            .map(|entry| entry.target.clone())
            .collect()
    }

    async fn shutdown(&self) {
        let routes = self.routes().drain();
        let released = self.responses.release_all();
        info!(routes = routes.len(), released_requests = released, "HTTP enqueuer shut down");
    }
}

impl Drop for HttpEnqueuer {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::target;
    use serde_json::json;

    async fn enqueuer() -> (Arc<EventQueue>, Arc<HttpEnqueuer>) {
        let queue = Arc::new(EventQueue::new());
        let http = Arc::new(HttpEnqueuer::new(Arc::clone(&queue)));
        (queue, http)
    }

    async fn subscribe(http: &HttpEnqueuer, id: &str, method: &str, path: &str) {
        http.subscribe(target(id), json!({ "method": method, "path": path }))
            .await
            .unwrap();
    }

    async fn next_invocation(queue: &EventQueue) -> (Event, HttpInvocation) {
        let event = tokio::time::timeout(Duration::from_secs(1), queue.pop("worker"))
            .await
            .unwrap()
            .unwrap();
        let invocation = serde_json::from_slice(event.payload()).unwrap();
        (event, invocation)
    }

    #[tokio::test]
    async fn test_request_round_trip_through_worker() {
        let (queue, http) = enqueuer().await;
        subscribe(&http, "fn-users", "GET", "/users/:id/").await;

        let request = HttpRequest::new("get", "/users/42?expand=true&flag")
            .with_header("X-Trace", "abc")
            .with_body(b"ping".to_vec());
        let pending = tokio::spawn({
            let http = Arc::clone(&http);
            async move { http.dispatch(request).await }
        });

        let (event, invocation) = next_invocation(&queue).await;
        assert_eq!(event.event_type(), EventType::Http);
        assert_eq!(event.target().id, "fn-users");
        assert_eq!(invocation.method, "GET");
        assert_eq!(invocation.path, "/users/42");
        assert_eq!(invocation.params["id"], "42");
        assert_eq!(invocation.query["expand"], "true");
        assert_eq!(invocation.query["flag"], "");
        assert_eq!(invocation.headers["x-trace"], "abc");
        assert_eq!(invocation.decode_body().unwrap(), b"ping");

        let answer = HttpResponse::new(200).with_body(br#"{"id":42}"#.to_vec());
        assert!(http.responses().respond(event.id(), answer.clone()));
        queue.ack(event.id());

        assert_eq!(pending.await.unwrap(), answer);
        assert!(http.responses().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let (queue, http) = enqueuer().await;
        subscribe(&http, "fn-1", "GET", "/users").await;

        let response = http.dispatch(HttpRequest::new("GET", "/orders")).await;
        assert_eq!(response.status, 404);
        let response = http.dispatch(HttpRequest::new("POST", "/users")).await;
        assert_eq!(response.status, 404);
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn test_worker_error_is_500() {
        let (queue, http) = enqueuer().await;
        subscribe(&http, "fn-1", "POST", "/jobs").await;

        let pending = tokio::spawn({
            let http = Arc::clone(&http);
            async move { http.dispatch(HttpRequest::new("POST", "/jobs")).await }
        });
        let (event, _) = next_invocation(&queue).await;
        queue.error(event.id(), "handler threw");

        let response = pending.await.unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(response.body, b"handler threw");
    }

    #[tokio::test]
    async fn test_ack_without_response_is_204() {
        let (queue, http) = enqueuer().await;
        subscribe(&http, "fn-1", "ALL", "/hooks").await;

        let pending = tokio::spawn({
            let http = Arc::clone(&http);
            async move { http.dispatch(HttpRequest::new("DELETE", "/hooks")).await }
        });
        let (event, _) = next_invocation(&queue).await;
        queue.ack(event.id());

        assert_eq!(pending.await.unwrap().status, 204);
    }

    #[tokio::test]
    async fn test_preflight() {
        let (queue, http) = enqueuer().await;
        subscribe(&http, "fn-1", "POST", "/items/:id").await;
        http.subscribe(
            target("fn-2"),
            json!({ "method": "GET", "path": "/private", "preflight": false }),
        )
        .await
        .unwrap();

        let response = http
            .dispatch(
                HttpRequest::new("OPTIONS", "/items/7")
                    .with_header("Access-Control-Request-Headers", "content-type"),
            )
            .await;
        assert_eq!(response.status, 204);
        assert_eq!(response.headers["access-control-allow-origin"], "*");
        assert_eq!(response.headers["access-control-allow-methods"], "POST, OPTIONS");
        assert_eq!(response.headers["access-control-allow-headers"], "content-type");

        let response = http.dispatch(HttpRequest::new("OPTIONS", "/private")).await;
        assert_eq!(response.status, 404);
        assert_eq!(queue.size(), 0);
    }

    #[tokio::test]
    async fn test_route_selection_prefers_exact_method_and_literals() {
        let (queue, http) = enqueuer().await;
        subscribe(&http, "any-user", "ALL", "/users/:id").await;
        subscribe(&http, "get-user", "GET", "/users/:id").await;
        subscribe(&http, "get-me", "GET", "/users/me").await;

        for (method, path, expected) in [
            ("GET", "/users/me", "get-me"),
            ("GET", "/users/7", "get-user"),
            ("PUT", "/users/7", "any-user"),
        ] {
            let dispatch = {
                let http = Arc::clone(&http);
                tokio::spawn(async move { http.dispatch(HttpRequest::new(method, path)).await })
            };
            let (event, _) = next_invocation(&queue).await;
            assert_eq!(event.target().id, expected);
            queue.ack(event.id());
            dispatch.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_conflicting_route_rejected() {
        let (_queue, http) = enqueuer().await;
        subscribe(&http, "fn-1", "GET", "/users/:id").await;

        let err = http
            .subscribe(target("fn-2"), json!({ "method": "get", "path": "users/:uid" }))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::InvalidOptions { kind: EventType::Http, .. }));

        http.subscribe(target("fn-2"), json!({ "method": "PUT", "path": "/users/:uid" }))
            .await
            .unwrap();

        let err = http
            .subscribe(target("fn-3"), json!({ "method": "TRACE", "path": "/x" }))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::InvalidOptions { .. }));
    }

    #[tokio::test]
    async fn test_unsubscribe_removes_route() {
        let (_queue, http) = enqueuer().await;
        subscribe(&http, "fn-1", "GET", "/status").await;
        http.unsubscribe(&target("fn-1")).await;

        let response = http.dispatch(HttpRequest::new("GET", "/status")).await;
        assert_eq!(response.status, 404);
        subscribe(&http, "fn-2", "GET", "/status").await;
    }

    #[tokio::test]
    async fn test_abandoned_request_clears_pending_entry() {
        let (queue, http) = enqueuer().await;
        subscribe(&http, "fn-1", "GET", "/slow").await;

        let result = tokio::time::timeout(
            Duration::from_millis(20),
            http.dispatch(HttpRequest::new("GET", "/slow")),
        )
        .await;
        assert!(result.is_err());
        assert!(http.responses().is_empty());

        let (event, _) = next_invocation(&queue).await;
        assert!(!http.responses().respond(event.id(), HttpResponse::new(200)));
    }

    #[tokio::test]
    async fn test_request_after_queue_closed_is_503() {
        let (queue, http) = enqueuer().await;
        subscribe(&http, "fn-1", "GET", "/a").await;
        queue.close();

        let response = tokio::time::timeout(Duration::from_secs(2), http.dispatch(HttpRequest::new("GET", "/a")))
            .await
            .expect("request must not hang on a closed queue");
        assert_eq!(response.status, 503);
        assert!(http.responses().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_releases_waiting_requests() {
        let (queue, http) = enqueuer().await;
        subscribe(&http, "fn-1", "GET", "/a").await;

        let pending = tokio::spawn({
            let http = Arc::clone(&http);
            async move { http.dispatch(HttpRequest::new("GET", "/a")).await }
        });
        let _ = next_invocation(&queue).await;

        http.shutdown().await;
        let response = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.status, 503);
        assert!(http.subscriptions().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_gone_after_pop_times_out_with_504() {
        let queue = Arc::new(EventQueue::new());
        let http = Arc::new(
            HttpEnqueuer::new(Arc::clone(&queue)).with_response_timeout(Duration::from_secs(5)),
        );
        subscribe(&http, "fn-1", "GET", "/a").await;

        let pending = tokio::spawn({
            let http = Arc::clone(&http);
            async move { http.dispatch(HttpRequest::new("GET", "/a")).await }
        });
        // The worker takes the event and never answers.
        let _ = queue.pop("worker").await.unwrap();

        let response = pending.await.unwrap();
        assert_eq!(response.status, 504);
        assert!(http.responses().is_empty());
    }

    #[tokio::test]
    async fn test_query_is_percent_decoded() {
        let request = HttpRequest::new("GET", "/search?q=a%20b&tag=x+y&name%3D=%E2%9C%93&bad=%FF");
        assert_eq!(request.query["q"], "a b");
        assert_eq!(request.query["tag"], "x y");
        assert_eq!(request.query["name="], "\u{2713}");
        assert_eq!(request.query["bad"], "%FF");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("users//42/"), "/users/42");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
        assert!(RoutePattern::parse("/a/:").is_err());
        assert!(RoutePattern::parse("/a/:id/:id").is_err());
    }
}
