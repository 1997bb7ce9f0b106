//! The Fetch, Do and Listen verbs.
//!
//! Every verb validates its requests and compiles their schemas before any
//! downstream call is issued, so a malformed batch never causes partial side
//! effects.

use crate::error::{code_name, Error, Result};
use crate::format::{format_error, format_message, Document};
use crate::gateway::{EntryPoint, Gateway};
use crate::grpc_client::{invoke_server_streaming, invoke_unary, CallContext, MessageStream};
use crate::metrics::RequestTimer;
use crate::schema::{compile, Schema, SchemaCache};
use crate::stitch::stitch;
use crate::types::{should_catch, ErrorPolicy, Request, Response, Verb};
use futures::future::try_join_all;
use futures::stream::BoxStream;
use futures::StreamExt;
use prost_reflect::{DynamicMessage, MethodDescriptor};
use std::sync::Arc;
use tracing::Instrument;

/// Responses of a Listen call, one per downstream stream item.
pub type ResponseStream = BoxStream<'static, Result<Response>>;

/// `idempotency_level = NO_SIDE_EFFECTS`
const NO_SIDE_EFFECTS: i32 = 1;

/// Whether `method` is declared free of side effects.
pub fn is_side_effect_free(method: &MethodDescriptor) -> bool {
    method
        .options()
        .get_field_by_name("idempotency_level")
        .and_then(|value| value.as_enum_number())
        == Some(NO_SIDE_EFFECTS)
}

/// A validated request, ready to be sent.
struct Prepared<'g> {
    entry: &'g EntryPoint,
    method: String,
    on_error: Option<ErrorPolicy>,
    input: DynamicMessage,
    schema: Arc<Schema>,
    operations: Arc<[String]>,
}

fn decode_body(method: &MethodDescriptor, body: Option<serde_json::Value>) -> Result<DynamicMessage> {
    match body {
        None | Some(serde_json::Value::Null) => Ok(DynamicMessage::new(method.input())),
        Some(json) => DynamicMessage::deserialize(method.input(), json).map_err(|e| {
            Error::InvalidArgument(format!("invalid body for {}: {}", method.full_name(), e))
        }),
    }
}

impl Gateway {
    /// Run a batch of side-effect-free unary calls.
    ///
    /// Downstream errors fail the whole call unless the request or field opts
    /// into `catch`.
    pub async fn fetch(&self, requests: Vec<Request>, ctx: &CallContext) -> Result<Vec<Response>> {
        self.dispatch_unary(Verb::Fetch, requests, ctx)
            .instrument(tracing::info_span!("fetch"))
            .await
    }

    /// Run a batch of unary calls that may have side effects.
    ///
    /// Downstream errors are embedded in the response unless the request or
    /// field opts into `throw`.
    pub async fn do_batch(&self, requests: Vec<Request>, ctx: &CallContext) -> Result<Vec<Response>> {
        self.dispatch_unary(Verb::Do, requests, ctx)
            .instrument(tracing::info_span!("do"))
            .await
    }

    /// Open a server-streaming call and format every item it yields.
    ///
    /// Only the first response carries the schema. The request is timed
    /// until the stream ends or is dropped.
    pub async fn listen(&self, request: Option<Request>, ctx: CallContext) -> Result<ResponseStream> {
        let timer = RequestTimer::new(Verb::Listen.label());
        let state = match self.open_listen(request, ctx).await {
            Ok(state) => state,
            Err(err) => {
                timer.record_error(code_name(err.code()));
                return Err(err);
            }
        };

        Ok(futures::stream::unfold(Some((state, timer)), |state| async move {
            let (mut state, timer) = state?;
            let error = match state.stream.next().await {
                None => return None,
                Some(Err(status)) => Error::Grpc(status),
                Some(Ok(message)) => {
                    let include_schema = std::mem::replace(&mut state.first, false);
                    let response = make_response(
                        state.method.clone(),
                        state.on_error,
                        &state.schema,
                        &message,
                        Verb::Listen.catches_by_default(),
                        &state.ctx,
                        include_schema,
                    )
                    .await;
                    match response {
                        Ok(response) => return Some((Ok(response), Some((state, timer)))),
                        Err(err) => err,
                    }
                }
            };
            timer.record_error(code_name(error.code()));
            Some((Err(error), None))
        })
        .boxed())
    }

    async fn open_listen(&self, request: Option<Request>, ctx: CallContext) -> Result<ListenState> {
        let request =
            request.ok_or_else(|| Error::InvalidArgument("missing request".to_string()))?;
        let prepared = self.prepare(Verb::Listen, request)?;
        let entry = prepared.entry;

        let call_ctx = ctx.with_operations(&prepared.operations);
        let stream = invoke_server_streaming(
            entry.transport.as_ref(),
            &entry.method,
            prepared.input,
            call_ctx.headers(),
            call_ctx.call_timeout(entry.timeout),
        )
        .await?;
        tracing::debug!(method = %prepared.method, "Listening");

        Ok(ListenState {
            stream,
            method: prepared.method,
            on_error: prepared.on_error,
            schema: prepared.schema,
            ctx,
            first: true,
        })
    }

    async fn dispatch_unary(
        &self,
        verb: Verb,
        requests: Vec<Request>,
        ctx: &CallContext,
    ) -> Result<Vec<Response>> {
        let timer = RequestTimer::new(verb.label());
        let result = self.run_batch(verb, requests, ctx).await;
        if let Err(err) = &result {
            timer.record_error(code_name(err.code()));
        }
        result
    }

    async fn run_batch(
        &self,
        verb: Verb,
        requests: Vec<Request>,
        ctx: &CallContext,
    ) -> Result<Vec<Response>> {
        if requests.is_empty() {
            return Err(Error::InvalidArgument("no requests".to_string()));
        }
        let fallback_catch = verb.catches_by_default();
        let prepared = requests
            .into_iter()
            .map(|request| self.prepare(verb, request))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(verb = verb.label(), requests = prepared.len(), "Dispatching batch");
        try_join_all(
            prepared
                .into_iter()
                .map(|prepared| run_unary(prepared, fallback_catch, ctx)),
        )
        .await
    }

    /// Validate a request against the verb and compile its schema.
    fn prepare(&self, verb: Verb, request: Request) -> Result<Prepared<'_>> {
        let entry = self
            .entry_point(&request.method)
            .ok_or_else(|| Error::NotFound(format!("method {} not found", request.method)))?;
        let method = &entry.method;

        match verb {
            Verb::Fetch | Verb::Do if method.is_server_streaming() => {
                return Err(Error::InvalidArgument(format!(
                    "{} is not a unary method",
                    request.method
                )));
            }
            Verb::Listen if !method.is_server_streaming() => {
                return Err(Error::InvalidArgument(format!(
                    "{} is not a server-streaming method",
                    request.method
                )));
            }
            _ => {}
        }
        if verb == Verb::Fetch && !is_side_effect_free(method) {
            return Err(Error::InvalidArgument(format!(
                "{} may have side effects, use Do",
                request.method
            )));
        }

        let input = decode_body(method, request.body)?;
        let operations: Arc<[String]> = Arc::from(vec![verb.operation(), request.method.clone()]);
        let mut cache = SchemaCache::new(self.relations());
        let schema = compile(
            &method.output(),
            &request.mask,
            &request.method,
            &operations,
            &mut cache,
        )?;

        Ok(Prepared {
            entry,
            method: request.method,
            on_error: request.on_error,
            input,
            schema: Arc::new(schema),
            operations,
        })
    }
}

async fn run_unary(
    prepared: Prepared<'_>,
    fallback_catch: bool,
    ctx: &CallContext,
) -> Result<Response> {
    let entry = prepared.entry;
    let call_ctx = ctx.with_operations(&prepared.operations);
    let result = invoke_unary(
        entry.transport.as_ref(),
        &entry.method,
        prepared.input,
        call_ctx.headers(),
        call_ctx.call_timeout(entry.timeout),
    )
    .await;

    let message = match result {
        Ok(message) => message,
        Err(err) if should_catch(prepared.on_error, fallback_catch) => {
            tracing::warn!(method = %prepared.method, code = ?err.code(), "Call failed, embedding error");
            let body = format_error(&err, &prepared.method, Some(entry.method.parent_pool()));
            return Ok(Response {
                method: prepared.method,
                body,
                schema: Some(prepared.schema),
            });
        }
        Err(err) => return Err(err),
    };

    make_response(
        prepared.method,
        prepared.on_error,
        &prepared.schema,
        &message,
        fallback_catch,
        ctx,
        true,
    )
    .await
}

/// Format and stitch one downstream message.
async fn make_response(
    method: String,
    on_error: Option<ErrorPolicy>,
    schema: &Arc<Schema>,
    message: &DynamicMessage,
    fallback_catch: bool,
    ctx: &CallContext,
    include_schema: bool,
) -> Result<Response> {
    let mut doc = Document::new();
    let root = doc.reserve();
    let error_slot = should_catch(on_error, fallback_catch).then_some(root);

    let (node, patches) = format_message(&mut doc, message, schema, error_slot, fallback_catch)?;
    doc.fill(root, node);
    stitch(&mut doc, patches, fallback_catch, ctx).await?;

    Ok(Response {
        method,
        body: doc.into_json(root),
        schema: include_schema.then(|| schema.clone()),
    })
}

struct ListenState {
    stream: MessageStream,
    method: String,
    on_error: Option<ErrorPolicy>,
    schema: Arc<Schema>,
    ctx: CallContext,
    first: bool,
}
