//! Header forwarding
//!
//! Inbound HTTP headers are forwarded to every downstream call as gRPC
//! metadata, minus the hop-by-hop and protocol headers that belong to the
//! inbound connection. Forwarding uses a **denylist**, so authentication,
//! tenancy and tracing headers pass through without configuration.
//!
//! Two headers are owned by the gateway itself:
//!
//! - [`OPERATIONS_HEADER`] carries the chain of operations that led to a
//!   downstream call (`verb`, entry point, relation methods). It is rewritten
//!   on every hop, never appended to.
//! - The inbound deadline is read from `connect-timeout-ms` or `grpc-timeout`
//!   (see [`parse_timeout`]) and re-applied per call, so both headers are
//!   stripped with the rest of their prefixes.
//!
//! # Example
//!
//! ```rust
//! use axum::http::HeaderMap;
//! use grpc_stitch_gateway::HeaderPolicy;
//!
//! let mut headers = HeaderMap::new();
//! headers.insert("authorization", "Bearer abc".parse().unwrap());
//! headers.insert("content-type", "application/json".parse().unwrap());
//!
//! let metadata = HeaderPolicy::new().extract_metadata(&headers);
//! assert!(metadata.get("authorization").is_some());
//! assert!(metadata.get("content-type").is_none());
//! ```

use axum::http::HeaderMap;
use base64::Engine;
use std::collections::HashSet;
use std::time::Duration;
use tonic::metadata::{Ascii, Binary, MetadataKey, MetadataMap, MetadataValue};

/// Metadata key carrying the operation chain of a downstream call.
pub const OPERATIONS_HEADER: &str = "stitch-operations";

const DENIED_HEADERS: &[&str] = &[
    "accept",
    "connect",
    "connection",
    "expect",
    "host",
    "http2-settings",
    "keep-alive",
    "origin",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const DENIED_PREFIXES: &[&str] = &[":", "accept-", "connect-", "content-", "grpc-", "if-"];

/// Decides which inbound headers become outbound metadata.
#[derive(Debug, Clone, Default)]
pub struct HeaderPolicy {
    /// Extra header names to drop (lowercase)
    exclude: HashSet<String>,
}

impl HeaderPolicy {
    /// Policy with the built-in denylist only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop an additional header (case-insensitive).
    pub fn exclude(mut self, header: impl Into<String>) -> Self {
        self.exclude.insert(header.into().to_lowercase());
        self
    }

    /// Check if a header should be forwarded.
    pub fn should_forward(&self, header_name: &str) -> bool {
        let lower = header_name.to_lowercase();

        if DENIED_HEADERS.contains(&lower.as_str()) || self.exclude.contains(&lower) {
            return false;
        }
        if lower == OPERATIONS_HEADER {
            return false;
        }

        !DENIED_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
    }

    /// Extract forwardable headers from an HTTP HeaderMap as gRPC metadata.
    ///
    /// Repeated headers keep all of their values. `-bin` headers are expected
    /// to be base64 encoded, as they are on the gRPC wire.
    pub fn extract_metadata(&self, headers: &HeaderMap) -> MetadataMap {
        let mut metadata = MetadataMap::new();

        for (name, value) in headers.iter() {
            let header_name = name.as_str();

            if !self.should_forward(header_name) {
                continue;
            }

            if header_name.ends_with("-bin") {
                let Ok(key) = MetadataKey::<Binary>::from_bytes(header_name.as_bytes()) else {
                    tracing::debug!("Skipping header '{}': invalid metadata key", header_name);
                    continue;
                };
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(value.as_bytes())
                    .or_else(|_| base64::engine::general_purpose::STANDARD_NO_PAD.decode(value.as_bytes()));
                let Ok(bytes) = decoded else {
                    tracing::debug!("Skipping header '{}': value is not base64", header_name);
                    continue;
                };
                metadata.append_bin(key, MetadataValue::from_bytes(&bytes));
                continue;
            }

            let Ok(value_str) = value.to_str() else {
                continue;
            };

            let Ok(key) = MetadataKey::<Ascii>::from_bytes(header_name.as_bytes()) else {
                tracing::debug!("Skipping header '{}': invalid metadata key", header_name);
                continue;
            };

            let Ok(value) = MetadataValue::try_from(value_str) else {
                tracing::debug!("Skipping header '{}': invalid metadata value", header_name);
                continue;
            };

            metadata.append(key, value);
        }

        metadata
    }
}

/// Copy `headers` and replace the operations header with `operations`,
/// one metadata value per operation.
pub fn with_operations(headers: &MetadataMap, operations: &[String]) -> MetadataMap {
    let mut metadata = headers.clone();
    metadata.remove(OPERATIONS_HEADER);
    for operation in operations {
        match MetadataValue::try_from(operation.as_str()) {
            Ok(value) => {
                metadata.append(OPERATIONS_HEADER, value);
            }
            Err(_) => tracing::debug!("Skipping operation '{}': invalid metadata value", operation),
        }
    }
    metadata
}

/// Merge metadata into a tonic Request, keeping repeated values.
pub fn apply_metadata_to_request<T>(
    mut request: tonic::Request<T>,
    metadata: &MetadataMap,
) -> tonic::Request<T> {
    for key_value in metadata.iter() {
        match key_value {
            tonic::metadata::KeyAndValueRef::Ascii(key, value) => {
                request.metadata_mut().append(key.clone(), value.clone());
            }
            tonic::metadata::KeyAndValueRef::Binary(key, value) => {
                request.metadata_mut().append_bin(key.clone(), value.clone());
            }
        }
    }
    request
}

/// Read the inbound deadline.
///
/// `connect-timeout-ms` takes a plain millisecond count; `grpc-timeout` uses
/// the gRPC `<digits><unit>` form with units `H M S m u n`.
pub fn parse_timeout(headers: &HeaderMap) -> Option<Duration> {
    if let Some(ms) = headers
        .get("connect-timeout-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return Some(Duration::from_millis(ms));
    }

    let raw = headers.get("grpc-timeout")?.to_str().ok()?.trim();
    if raw.len() < 2 || raw.len() > 9 {
        return None;
    }
    let (digits, unit) = raw.split_at(raw.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(amount.saturating_mul(3600))),
        "M" => Some(Duration::from_secs(amount.saturating_mul(60))),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}
