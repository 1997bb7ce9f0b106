//! HTTP surface of the gateway.
//!
//! The gateway service is exposed as JSON over HTTP POST, one route per verb.
//! Listen answers with server-sent events.

use crate::error::{code_name, Error, Result};
use crate::gateway::Gateway;
use crate::grpc_client::CallContext;
use crate::headers::parse_timeout;
use crate::metrics::GatewayMetrics;
use crate::shutdown::{InFlight, ShutdownCoordinator};
use crate::types::{
    DoRequest, FetchRequest, FetchResponse, ListenRequest, ListenResponse, Verb, GATEWAY_SERVICE,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response as HttpResponse,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::{de::DeserializeOwned, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tonic::Code;

/// ServeMux - routes HTTP requests to the gateway verbs
pub struct ServeMux {
    gateway: Arc<Gateway>,
    shutdown: Option<ShutdownCoordinator>,
}

impl ServeMux {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            shutdown: None,
        }
    }

    /// Reject new requests once `coordinator` is triggered and track the
    /// in-flight ones.
    pub fn with_shutdown(mut self, coordinator: ShutdownCoordinator) -> Self {
        self.shutdown = Some(coordinator);
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    fn admit(&self) -> Result<Option<InFlight>> {
        match &self.shutdown {
            Some(coordinator) if coordinator.is_draining() => Err(Error::Grpc(
                tonic::Status::unavailable("gateway is shutting down"),
            )),
            Some(coordinator) => Ok(Some(coordinator.track())),
            None => Ok(None),
        }
    }

    fn call_context(&self, headers: &HeaderMap) -> CallContext {
        let ctx = CallContext::new(self.gateway.header_policy().extract_metadata(headers));
        match parse_timeout(headers) {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx,
        }
    }

    /// Convert to Axum router
    pub fn into_router(self) -> Router {
        let metrics_enabled = self.gateway.metrics_enabled();
        let state = Arc::new(self);

        let mut router = Router::new()
            .route(&verb_route(Verb::Fetch), post(handle_fetch))
            .route(&verb_route(Verb::Do), post(handle_do))
            .route(&verb_route(Verb::Listen), post(handle_listen))
            .route("/health", get(health_handler));

        if metrics_enabled {
            router = router.route("/metrics", get(metrics_handler));
        }

        router.with_state(state)
    }
}

fn verb_route(verb: Verb) -> String {
    format!("/{}/{}", GATEWAY_SERVICE, verb.method_name())
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body)
        .map_err(|e| Error::InvalidArgument(format!("invalid request body: {}", e)))
}

async fn handle_fetch(
    State(mux): State<Arc<ServeMux>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<FetchResponse>> {
    let _guard = mux.admit()?;
    let request: FetchRequest = parse_body(&body)?;
    let ctx = mux.call_context(&headers);
    let responses = mux.gateway.fetch(request.requests, &ctx).await?;
    Ok(Json(FetchResponse { responses }))
}

async fn handle_do(
    State(mux): State<Arc<ServeMux>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<FetchResponse>> {
    let _guard = mux.admit()?;
    let request: DoRequest = parse_body(&body)?;
    let ctx = mux.call_context(&headers);
    let responses = mux.gateway.do_batch(request.requests, &ctx).await?;
    Ok(Json(FetchResponse { responses }))
}

/// One `message` event per response; a failure ends the stream with an
/// `error` event.
async fn handle_listen(
    State(mux): State<Arc<ServeMux>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let guard = mux.admit()?;
    let request: ListenRequest = parse_body(&body)?;
    let ctx = mux.call_context(&headers);
    let responses = mux.gateway.listen(request.request, ctx).await?;

    let events = responses.map(move |item| {
        let _guard = &guard;
        Ok(match item {
            Ok(response) => Event::default()
                .json_data(ListenResponse { response })
                .unwrap_or_else(|e| error_event(&Error::Internal(e.to_string()))),
            Err(err) => {
                tracing::debug!(code = ?err.code(), "Listen stream failed");
                error_event(&err)
            }
        })
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn error_event(err: &Error) -> Event {
    let body = ErrorBody::from(err);
    Event::default()
        .event("error")
        .json_data(&body)
        .unwrap_or_else(|_| Event::default().event("error").data(body.message))
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    methods: usize,
    relations: usize,
}

/// Liveness check, 503 while draining.
async fn health_handler(State(mux): State<Arc<ServeMux>>) -> HttpResponse {
    let draining = mux.shutdown.as_ref().is_some_and(|c| c.is_draining());
    let body = HealthResponse {
        status: if draining { "draining" } else { "healthy" },
        methods: mux.gateway.methods().count(),
        relations: mux.gateway.relations().values().map(Vec::len).sum(),
    };
    let status = if draining {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (status, Json(body)).into_response()
}

/// Handler for Prometheus metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    let body = GatewayMetrics::global().render();
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

/// JSON error body: `{"code": "invalid_argument", "message": "..."}`
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            code: code_name(err.code()).to_ascii_lowercase(),
            message: err.message(),
        }
    }
}

/// HTTP status reported for a status code.
pub fn http_status(code: Code) -> StatusCode {
    match code {
        Code::Ok => StatusCode::OK,
        Code::Cancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            StatusCode::BAD_REQUEST
        }
        Code::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        Code::NotFound => StatusCode::NOT_FOUND,
        Code::AlreadyExists | Code::Aborted => StatusCode::CONFLICT,
        Code::PermissionDenied => StatusCode::FORBIDDEN,
        Code::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        Code::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        Code::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        Code::Unauthenticated => StatusCode::UNAUTHORIZED,
        Code::Unknown | Code::Internal | Code::DataLoss => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> HttpResponse {
        let status = http_status(self.code());
        if status.is_server_error() {
            tracing::warn!(error = %self, "Request failed");
        }
        (status, Json(ErrorBody::from(&self))).into_response()
    }
}
