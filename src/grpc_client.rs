//! Downstream transport.
//!
//! Every outbound call goes through the [`Transport`] trait, which speaks
//! `tonic` requests carrying [`DynamicMessage`]s. [`GrpcClient`] implements it
//! on top of a tonic [`Channel`] with a reflection-based codec, so no generated
//! client code is needed for the services behind the gateway.

use crate::error::{code_name, Error, Result};
use crate::headers::apply_metadata_to_request;
use crate::metrics::UpstreamTimer;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tonic::client::Grpc;
use tonic::codec::{Codec, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

/// Stream of messages produced by a server-streaming call.
pub type MessageStream = BoxStream<'static, std::result::Result<DynamicMessage, Status>>;

/// A way of invoking methods described by a descriptor.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Issue a unary call.
    async fn unary(
        &self,
        method: &MethodDescriptor,
        request: tonic::Request<DynamicMessage>,
    ) -> std::result::Result<tonic::Response<DynamicMessage>, Status>;

    /// Open a server-streaming call.
    async fn server_streaming(
        &self,
        method: &MethodDescriptor,
        request: tonic::Request<DynamicMessage>,
    ) -> std::result::Result<tonic::Response<MessageStream>, Status>;
}

/// Shared handle to a transport.
pub type SharedTransport = Arc<dyn Transport>;

/// gRPC client for a single downstream endpoint.
#[derive(Clone, Debug)]
pub struct GrpcClient {
    endpoint: String,
    channel: Channel,
}

impl GrpcClient {
    /// Connect eagerly.
    pub async fn connect(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        let channel = Endpoint::from_shared(endpoint.clone())?.connect().await?;
        Ok(Self { endpoint, channel })
    }

    /// Create a client whose channel connects on first use.
    pub fn connect_lazy(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        let channel = Endpoint::from_shared(endpoint.clone())?.connect_lazy();
        Ok(Self { endpoint, channel })
    }

    /// Wrap an existing channel.
    pub fn from_channel(endpoint: impl Into<String>, channel: Channel) -> Self {
        Self {
            endpoint: endpoint.into(),
            channel,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    async fn ready(&self) -> std::result::Result<Grpc<Channel>, Status> {
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| Status::unavailable(format!("{} not ready: {e}", self.endpoint)))?;
        Ok(grpc)
    }
}

fn method_path(method: &MethodDescriptor) -> std::result::Result<PathAndQuery, Status> {
    format!("/{}/{}", method.parent_service().full_name(), method.name())
        .parse()
        .map_err(|e| Status::internal(format!("invalid gRPC path: {e}")))
}

#[async_trait]
impl Transport for GrpcClient {
    async fn unary(
        &self,
        method: &MethodDescriptor,
        request: tonic::Request<DynamicMessage>,
    ) -> std::result::Result<tonic::Response<DynamicMessage>, Status> {
        let path = method_path(method)?;
        let mut grpc = self.ready().await?;
        grpc.unary(request, path, ReflectCodec::new(method.output()))
            .await
    }

    async fn server_streaming(
        &self,
        method: &MethodDescriptor,
        request: tonic::Request<DynamicMessage>,
    ) -> std::result::Result<tonic::Response<MessageStream>, Status> {
        let path = method_path(method)?;
        let mut grpc = self.ready().await?;
        let response = grpc
            .server_streaming(request, path, ReflectCodec::new(method.output()))
            .await?;
        Ok(response.map(|stream| stream.boxed()))
    }
}

/// Codec for encoding/decoding dynamic protobuf messages
#[derive(Clone)]
struct ReflectCodec {
    output_desc: MessageDescriptor,
}

impl ReflectCodec {
    fn new(output_desc: MessageDescriptor) -> Self {
        Self { output_desc }
    }
}

impl Codec for ReflectCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = ReflectEncoder;
    type Decoder = ReflectDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        ReflectEncoder
    }

    fn decoder(&mut self) -> Self::Decoder {
        ReflectDecoder {
            desc: self.output_desc.clone(),
        }
    }
}

struct ReflectEncoder;

impl Encoder for ReflectEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut EncodeBuf<'_>,
    ) -> std::result::Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("encode error: {e}")))
    }
}

struct ReflectDecoder {
    desc: MessageDescriptor,
}

impl Decoder for ReflectDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    // Called once per complete frame; an empty frame is a valid empty message.
    fn decode(
        &mut self,
        src: &mut DecodeBuf<'_>,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        let msg = DynamicMessage::decode(self.desc.clone(), src)
            .map_err(|e| Status::internal(format!("decode error: {e}")))?;
        Ok(Some(msg))
    }
}

/// Per-request call state: forwarded headers and the inbound deadline.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    headers: MetadataMap,
    deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(headers: MetadataMap) -> Self {
        Self {
            headers,
            deadline: None,
        }
    }

    /// Set the deadline `timeout` from now.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn headers(&self) -> &MetadataMap {
        &self.headers
    }

    /// Same deadline, with the operations header rewritten to `operations`.
    pub fn with_operations(&self, operations: &[String]) -> Self {
        Self {
            headers: crate::headers::with_operations(&self.headers, operations),
            deadline: self.deadline,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Timeout for one downstream call: the smaller of the remaining inbound
    /// budget and the configured per-method timeout.
    pub fn call_timeout(&self, configured: Option<Duration>) -> Option<Duration> {
        let remaining = self
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        match (remaining, configured) {
            (Some(remaining), Some(configured)) => Some(remaining.min(configured)),
            (remaining, configured) => remaining.or(configured),
        }
    }
}

fn deadline_exceeded(method: &MethodDescriptor) -> Status {
    Status::deadline_exceeded(format!("deadline exceeded calling {}", method.full_name()))
}

fn prepare(
    method: &MethodDescriptor,
    message: DynamicMessage,
    metadata: &MetadataMap,
    timeout: Option<Duration>,
) -> std::result::Result<tonic::Request<DynamicMessage>, Status> {
    let mut request = apply_metadata_to_request(tonic::Request::new(message), metadata);
    if let Some(timeout) = timeout {
        if timeout.is_zero() {
            return Err(deadline_exceeded(method));
        }
        request.set_timeout(timeout);
    }
    Ok(request)
}

async fn bounded<F, T>(
    method: &MethodDescriptor,
    timeout: Option<Duration>,
    call: F,
) -> std::result::Result<T, Status>
where
    F: std::future::Future<Output = std::result::Result<T, Status>>,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, call)
            .await
            .unwrap_or_else(|_| Err(deadline_exceeded(method))),
        None => call.await,
    }
}

/// Issue a unary call with forwarded metadata and deadline.
pub(crate) async fn invoke_unary(
    transport: &dyn Transport,
    method: &MethodDescriptor,
    message: DynamicMessage,
    metadata: &MetadataMap,
    timeout: Option<Duration>,
) -> Result<DynamicMessage> {
    let timer = UpstreamTimer::new(method.parent_service().full_name(), method.name());
    tracing::debug!(method = %method.full_name(), ?timeout, "Calling downstream method");

    let outcome = match prepare(method, message, metadata, timeout) {
        Ok(request) => bounded(method, timeout, transport.unary(method, request)).await,
        Err(status) => Err(status),
    };

    outcome.map(tonic::Response::into_inner).map_err(|status| {
        timer.record_error(code_name(status.code()));
        tracing::debug!(method = %method.full_name(), code = ?status.code(), "Downstream call failed");
        Error::Grpc(status)
    })
}

/// Open a server-streaming call with forwarded metadata and deadline.
pub(crate) async fn invoke_server_streaming(
    transport: &dyn Transport,
    method: &MethodDescriptor,
    message: DynamicMessage,
    metadata: &MetadataMap,
    timeout: Option<Duration>,
) -> Result<MessageStream> {
    let timer = UpstreamTimer::new(method.parent_service().full_name(), method.name());
    tracing::debug!(method = %method.full_name(), ?timeout, "Opening downstream stream");

    let outcome = match prepare(method, message, metadata, timeout) {
        Ok(request) => {
            bounded(method, timeout, transport.server_streaming(method, request)).await
        }
        Err(status) => Err(status),
    };

    outcome.map(tonic::Response::into_inner).map_err(|status| {
        timer.record_error(code_name(status.code()));
        Error::Grpc(status)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_timeout_without_deadline() {
        let ctx = CallContext::default();
        assert_eq!(ctx.call_timeout(None), None);
        assert_eq!(
            ctx.call_timeout(Some(Duration::from_secs(3))),
            Some(Duration::from_secs(3))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_takes_minimum() {
        let ctx = CallContext::default().with_timeout(Duration::from_secs(5));

        assert_eq!(ctx.call_timeout(None), Some(Duration::from_secs(5)));
        assert_eq!(
            ctx.call_timeout(Some(Duration::from_secs(1))),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            ctx.call_timeout(Some(Duration::from_secs(10))),
            Some(Duration::from_secs(5))
        );

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            ctx.call_timeout(Some(Duration::from_secs(10))),
            Some(Duration::from_secs(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_deadline_is_zero() {
        let ctx = CallContext::default().with_timeout(Duration::from_millis(10));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(ctx.call_timeout(None), Some(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_connect_lazy_rejects_bad_uri() {
        assert!(GrpcClient::connect_lazy("not a uri").is_err());
        let client = GrpcClient::connect_lazy("http://127.0.0.1:50051").unwrap();
        assert_eq!(client.endpoint(), "http://127.0.0.1:50051");
    }
}
