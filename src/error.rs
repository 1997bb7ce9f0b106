//! Error types for the stitching gateway

use prost::Message;
use thiserror::Error;
use tonic::Code;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the gateway
///
/// Configuration errors surface while the gateway is being built. Everything
/// else is raised while serving a request and carries a gRPC status code, see
/// [`Error::code`].
#[derive(Error, Debug)]
pub enum Error {
    /// Errors returned by a downstream method
    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    /// gRPC transport errors
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Invalid service or relation registration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed request, mask or params
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown method
    #[error("Not found: {0}")]
    NotFound(String),

    /// Broken internal invariant
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Descriptor pool errors
    #[error("Descriptor error: {0}")]
    Descriptor(#[from] prost_reflect::DescriptorError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The gRPC status code reported for this error.
    pub fn code(&self) -> Code {
        match self {
            Error::Grpc(status) => status.code(),
            Error::Transport(_) => Code::Unavailable,
            Error::Config(_) => Code::FailedPrecondition,
            Error::InvalidArgument(_) => Code::InvalidArgument,
            Error::NotFound(_) => Code::NotFound,
            Error::Internal(_) | Error::Serialization(_) | Error::Descriptor(_) | Error::Io(_) => {
                Code::Internal
            }
        }
    }

    /// The message without the variant prefix used by `Display`.
    pub fn message(&self) -> String {
        match self {
            Error::Grpc(status) => status.message().to_string(),
            Error::Config(msg)
            | Error::InvalidArgument(msg)
            | Error::NotFound(msg)
            | Error::Internal(msg) => msg.clone(),
            Error::Transport(err) => err.to_string(),
            Error::Serialization(err) => err.to_string(),
            Error::Descriptor(err) => err.to_string(),
            Error::Io(err) => err.to_string(),
        }
    }

    /// Packed `google.rpc.Status` details attached by a downstream method.
    pub fn details(&self) -> Vec<prost_types::Any> {
        match self {
            Error::Grpc(status) if !status.details().is_empty() => {
                match RpcStatus::decode(status.details()) {
                    Ok(decoded) => decoded.details,
                    Err(err) => {
                        tracing::debug!("Ignoring undecodable status details: {}", err);
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        }
    }

    /// Convert into a `tonic::Status`, keeping downstream statuses intact.
    pub fn to_status(&self) -> tonic::Status {
        match self {
            Error::Grpc(status) => status.clone(),
            other => tonic::Status::new(other.code(), other.message()),
        }
    }
}

/// Symbolic name of a status code as used in error values, e.g. `NOT_FOUND`.
pub fn code_name(code: Code) -> &'static str {
    match code {
        Code::Ok => "OK",
        Code::Cancelled => "CANCELED",
        Code::Unknown => "UNKNOWN",
        Code::InvalidArgument => "INVALID_ARGUMENT",
        Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
        Code::NotFound => "NOT_FOUND",
        Code::AlreadyExists => "ALREADY_EXISTS",
        Code::PermissionDenied => "PERMISSION_DENIED",
        Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
        Code::FailedPrecondition => "FAILED_PRECONDITION",
        Code::Aborted => "ABORTED",
        Code::OutOfRange => "OUT_OF_RANGE",
        Code::Unimplemented => "UNIMPLEMENTED",
        Code::Internal => "INTERNAL",
        Code::Unavailable => "UNAVAILABLE",
        Code::DataLoss => "DATA_LOSS",
        Code::Unauthenticated => "UNAUTHENTICATED",
    }
}

/// Wire form of `google.rpc.Status`, only used to unpack error details.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct RpcStatus {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<prost_types::Any>,
}
