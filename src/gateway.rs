//! Gateway builder and registry

use crate::error::{Error, Result};
use crate::grpc_client::SharedTransport;
use crate::headers::HeaderPolicy;
use crate::relation::{Relation, RelationMap};
use crate::runtime::ServeMux;
use crate::shutdown::{run_with_graceful_shutdown, ShutdownConfig, ShutdownCoordinator};
use axum::Router;
use prost_reflect::{MethodDescriptor, ServiceDescriptor};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A registered method clients can call.
#[derive(Clone)]
pub struct EntryPoint {
    pub method: MethodDescriptor,
    pub transport: SharedTransport,
    pub timeout: Option<Duration>,
}

impl std::fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryPoint")
            .field("method", &self.method.full_name())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Main Gateway struct - entry point for the library
///
/// Holds the entry points and relations registered through the
/// [`GatewayBuilder`]. It is immutable once built and is shared between
/// requests behind an `Arc`.
///
/// # Example
///
/// ```rust,no_run
/// use grpc_stitch_gateway::{Gateway, GrpcClient, ServiceOptions};
/// use prost_reflect::DescriptorPool;
/// use std::sync::Arc;
///
/// # async fn example(pool: DescriptorPool) -> Result<(), Box<dyn std::error::Error>> {
/// let users = pool.get_service_by_name("demo.UserService").unwrap();
/// let gateway = Gateway::builder()
///     .with_transport(Arc::new(GrpcClient::connect_lazy("http://127.0.0.1:50051")?))
///     .register_service(&users, ServiceOptions::new())?
///     .build()?;
///
/// # let _ = gateway;
/// # Ok(())
/// # }
/// ```
pub struct Gateway {
    entry_points: HashMap<String, EntryPoint>,
    relations: RelationMap,
    header_policy: HeaderPolicy,
    metrics_enabled: bool,
}

impl Gateway {
    /// Create a new gateway builder
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    /// Look up an entry point by `package.Service.Method`.
    pub fn entry_point(&self, method: &str) -> Option<&EntryPoint> {
        self.entry_points.get(method)
    }

    /// Names of all entry points.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.entry_points.keys().map(String::as_str)
    }

    pub fn relations(&self) -> &RelationMap {
        &self.relations
    }

    /// Look up a relation by base type and name.
    pub fn relation(&self, base: &str, name: &str) -> Option<&Arc<Relation>> {
        self.relations
            .get(base)?
            .iter()
            .find(|relation| relation.name() == name)
    }

    pub fn header_policy(&self) -> &HeaderPolicy {
        &self.header_policy
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_enabled
    }

    /// Convert the gateway into an Axum Router
    pub fn into_router(self) -> Router {
        ServeMux::new(Arc::new(self)).into_router()
    }
}

/// Options for [`GatewayBuilder::register_service`].
#[derive(Clone, Default)]
pub struct ServiceOptions {
    transport: Option<SharedTransport>,
    methods: Option<Vec<String>>,
    timeout: Option<Duration>,
}

impl ServiceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport for this service instead of the gateway default.
    pub fn with_transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Only register these methods (proto method names).
    pub fn with_methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = Some(methods.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Configuration of one relation method.
#[derive(Clone)]
pub struct RelationConfig {
    /// Name of the field added to the base type
    pub name: String,
    pub transport: Option<SharedTransport>,
    pub timeout: Option<Duration>,
}

impl RelationConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            transport: None,
            timeout: None,
        }
    }

    pub fn with_transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Builder for configuring and creating a [`Gateway`].
pub struct GatewayBuilder {
    transport: Option<SharedTransport>,
    timeout: Option<Duration>,
    entry_points: HashMap<String, EntryPoint>,
    relations: RelationMap,
    header_policy: HeaderPolicy,
    metrics_enabled: bool,
    shutdown_config: Option<ShutdownConfig>,
}

impl GatewayBuilder {
    /// Create a new gateway builder
    pub fn new() -> Self {
        Self {
            transport: None,
            timeout: None,
            entry_points: HashMap::new(),
            relations: RelationMap::new(),
            header_policy: HeaderPolicy::new(),
            metrics_enabled: false,
            shutdown_config: None,
        }
    }

    /// Default transport for services and relations registered afterwards.
    pub fn with_transport(mut self, transport: SharedTransport) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Default timeout for every downstream call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replace the header forwarding policy.
    pub fn with_header_policy(mut self, policy: HeaderPolicy) -> Self {
        self.header_policy = policy;
        self
    }

    /// Expose Prometheus metrics at `/metrics`.
    pub fn enable_metrics(mut self) -> Self {
        self.metrics_enabled = true;
        self
    }

    /// Enable graceful shutdown for [`serve`](Self::serve).
    pub fn with_graceful_shutdown(mut self, config: ShutdownConfig) -> Self {
        self.shutdown_config = Some(config);
        self
    }

    fn transport_for(&self, explicit: Option<SharedTransport>, what: &str) -> Result<SharedTransport> {
        explicit
            .or_else(|| self.transport.clone())
            .ok_or_else(|| Error::Config(format!("no transport configured for {what}")))
    }

    /// Register the unary and server-streaming methods of `service`.
    ///
    /// Client and bidi streaming methods are skipped.
    pub fn register_service(
        mut self,
        service: &ServiceDescriptor,
        options: ServiceOptions,
    ) -> Result<Self> {
        let transport = self.transport_for(options.transport, service.full_name())?;
        let timeout = options.timeout.or(self.timeout);

        if let Some(methods) = &options.methods {
            for name in methods {
                if !service.methods().any(|m| m.name() == name) {
                    return Err(Error::Config(format!(
                        "method {} not found on {}",
                        name,
                        service.full_name()
                    )));
                }
            }
        }

        for method in service.methods() {
            if let Some(methods) = &options.methods {
                if !methods.iter().any(|name| name == method.name()) {
                    continue;
                }
            }
            if method.is_client_streaming() {
                tracing::debug!("Skipping client streaming method {}", method.full_name());
                continue;
            }

            let key = format!("{}.{}", service.full_name(), method.name());
            if self.entry_points.contains_key(&key) {
                return Err(Error::Config(format!("method {} already registered", key)));
            }
            tracing::debug!("Registered entry point {}", key);
            self.entry_points.insert(
                key,
                EntryPoint {
                    method,
                    transport: transport.clone(),
                    timeout,
                },
            );
        }

        Ok(self)
    }

    /// Register methods of `service` as relations.
    ///
    /// Each entry maps a proto method name to its relation config.
    pub fn register_relation<I, S>(mut self, service: &ServiceDescriptor, relations: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, RelationConfig)>,
        S: Into<String>,
    {
        for (method_name, config) in relations {
            let method_name = method_name.into();
            let method = service
                .methods()
                .find(|m| m.name() == method_name)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "method {} not found on {}",
                        method_name,
                        service.full_name()
                    ))
                })?;
            let transport = self.transport_for(config.transport, method.full_name())?;
            let relation = Relation::from_method(
                &method,
                config.name,
                transport,
                config.timeout.or(self.timeout),
            )?;
            self = self.add_relation(relation)?;
        }
        Ok(self)
    }

    /// Add an already validated relation.
    pub fn add_relation(mut self, relation: Relation) -> Result<Self> {
        let base = relation.base().full_name().to_string();
        if relation.base().get_field_by_name(relation.name()).is_some() {
            return Err(Error::Config(format!(
                "relation {} collides with field {}.{}",
                relation.method().full_name(),
                base,
                relation.name()
            )));
        }
        let existing = self.relations.entry(base.clone()).or_default();
        if existing.iter().any(|r| r.name() == relation.name()) {
            return Err(Error::Config(format!(
                "relation {}.{} already registered",
                base,
                relation.name()
            )));
        }
        tracing::debug!("Registered relation {}.{}", base, relation.name());
        existing.push(Arc::new(relation));
        Ok(self)
    }

    /// Build the gateway
    pub fn build(self) -> Result<Gateway> {
        if self.entry_points.is_empty() {
            return Err(Error::Config("no methods registered".to_string()));
        }
        Ok(Gateway {
            entry_points: self.entry_points,
            relations: self.relations,
            header_policy: self.header_policy,
            metrics_enabled: self.metrics_enabled,
        })
    }

    /// Build and start the gateway server
    pub async fn serve(self, addr: impl Into<String>) -> Result<()> {
        let shutdown_config = self.shutdown_config.clone();
        let gateway = self.build()?;
        let addr = addr.into();
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Gateway server listening on {}", addr);

        let mux = ServeMux::new(Arc::new(gateway));
        if let Some(config) = shutdown_config {
            let coordinator = ShutdownCoordinator::new(config);
            let app = mux.with_shutdown(coordinator.clone()).into_router();
            run_with_graceful_shutdown(listener, app, coordinator).await?;
        } else {
            axum::serve(listener, mux.into_router()).await?;
        }

        Ok(())
    }

    /// Build and start the gateway server with an explicit shutdown signal.
    pub async fn serve_with_shutdown<F>(self, addr: impl Into<String>, shutdown_signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let gateway = self.build()?;
        let addr = addr.into();
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tracing::info!("Gateway server listening on {}", addr);

        let app = gateway.into_router();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await?;

        Ok(())
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}
