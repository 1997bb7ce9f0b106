//! # grpc-stitch-gateway
//!
//! An aggregating gateway in front of gRPC services. Clients send batches of
//! method calls as JSON, narrow each response with a field mask, and ask for
//! relation fields: virtual fields computed by other gRPC methods from the
//! already-fetched objects.
//!
//! ## Features
//!
//! - **Three verbs**: `Fetch` (side-effect-free batches), `Do` (mutating
//!   batches) and `Listen` (server streaming)
//! - **Field masks**: responses carry only the selected fields, plus a schema
//!   describing them
//! - **Relations**: a unary method taking `bases` and returning `values` adds a
//!   field to the base type; calls are batched per relation and params
//! - **Error policies**: `catch` embeds downstream errors in place, `throw`
//!   fails the request
//! - **Header forwarding**: inbound headers minus a denylist, plus the
//!   `stitch-operations` chain
//! - **Prometheus metrics** and graceful shutdown
//!
//! ## Example
//!
//! ```rust,no_run
//! use grpc_stitch_gateway::{Gateway, GrpcClient, RelationConfig, ServiceOptions};
//! use prost_reflect::DescriptorPool;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = DescriptorPool::decode(std::fs::read("descriptors.bin")?.as_slice())?;
//!     let users = pool.get_service_by_name("demo.UserService").unwrap();
//!     let teams = pool.get_service_by_name("demo.RelationService").unwrap();
//!
//!     Gateway::builder()
//!         .with_transport(Arc::new(GrpcClient::connect_lazy("http://localhost:50051")?))
//!         .register_service(&users, ServiceOptions::new())?
//!         .register_relation(&teams, [("GetTeams", RelationConfig::new("team"))])?
//!         .serve("0.0.0.0:8888")
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod format;
pub mod gateway;
pub mod grpc_client;
pub mod headers;
pub mod metrics;
pub mod relation;
pub mod runtime;
pub mod schema;
pub mod service;
pub mod shutdown;
pub mod stitch;
pub mod types;

pub use config::{GatewayConfig, RelationMethodConfig, RelationServiceConfig, ServiceConfig};
pub use error::{Error, Result};
pub use gateway::{EntryPoint, Gateway, GatewayBuilder, RelationConfig, ServiceOptions};
pub use grpc_client::{CallContext, GrpcClient, MessageStream, SharedTransport, Transport};
pub use headers::{HeaderPolicy, OPERATIONS_HEADER};
pub use metrics::{GatewayMetrics, RequestTimer, UpstreamTimer};
pub use relation::{Relation, RelationMap, RelationResolver};
pub use runtime::ServeMux;
pub use schema::{Field, FieldType, Schema, ScalarType};
pub use service::ResponseStream;
pub use shutdown::{run_with_graceful_shutdown, ShutdownConfig, ShutdownCoordinator};
pub use types::{ErrorPolicy, MaskField, Request, Response, Verb};
