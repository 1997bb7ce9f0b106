//! File-based gateway configuration.
//!
//! ```json
//! {
//!   "listen": "0.0.0.0:8080",
//!   "descriptor_sets": ["descriptors.bin"],
//!   "default_endpoint": "http://127.0.0.1:50051",
//!   "timeout_ms": 5000,
//!   "services": [
//!     {"name": "demo.UserService", "methods": ["GetUser", "ListUsers"]}
//!   ],
//!   "relations": [
//!     {"service": "demo.RelationService",
//!      "endpoint": "http://127.0.0.1:50052",
//!      "methods": {"GetTeams": {"name": "team", "timeout_ms": 500}}}
//!   ],
//!   "metrics": true
//! }
//! ```
//!
//! Relative descriptor paths are resolved against the config file's directory.

use crate::error::{Error, Result};
use crate::gateway::{Gateway, GatewayBuilder, RelationConfig, ServiceOptions};
use crate::grpc_client::{GrpcClient, SharedTransport};
use crate::headers::HeaderPolicy;
use crate::shutdown::ShutdownConfig;
use prost_reflect::{DescriptorPool, ServiceDescriptor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Serialized `FileDescriptorSet`s describing every service below
    pub descriptor_sets: Vec<PathBuf>,
    /// Endpoint used by services and relations without their own
    #[serde(default)]
    pub default_endpoint: Option<String>,
    /// Default timeout for every downstream call
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub relations: Vec<RelationServiceConfig>,
    /// Extra inbound headers never forwarded downstream
    #[serde(default)]
    pub exclude_headers: Vec<String>,
    #[serde(default)]
    pub metrics: bool,
    /// Graceful shutdown timeout; absent disables graceful shutdown
    #[serde(default)]
    pub shutdown_timeout_secs: Option<u64>,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

/// A service whose methods become entry points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Fully-qualified service name
    pub name: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Restrict registration to these methods
    #[serde(default)]
    pub methods: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// A service whose methods become relations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationServiceConfig {
    pub service: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Proto method name to relation settings
    pub methods: BTreeMap<String, RelationMethodConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationMethodConfig {
    /// Field name added to the base type
    pub name: String,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl GatewayConfig {
    /// Load a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_json_str(&raw)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.base_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    /// Decode every configured descriptor set into one pool.
    pub fn load_descriptors(&self) -> Result<DescriptorPool> {
        if self.descriptor_sets.is_empty() {
            return Err(Error::Config("no descriptor_sets configured".to_string()));
        }
        let mut pool = DescriptorPool::new();
        for path in &self.descriptor_sets {
            let path = self.resolve(path);
            let bytes = std::fs::read(&path).map_err(|e| {
                Error::Config(format!("failed to read {}: {}", path.display(), e))
            })?;
            pool.decode_file_descriptor_set(bytes.as_slice())?;
            tracing::debug!("Loaded descriptor set {}", path.display());
        }
        Ok(pool)
    }

    pub fn shutdown_config(&self) -> Option<ShutdownConfig> {
        self.shutdown_timeout_secs.map(|secs| ShutdownConfig {
            timeout: Duration::from_secs(secs),
            ..Default::default()
        })
    }

    /// Configure a builder from `pool`, creating one lazy client per
    /// distinct endpoint.
    pub fn builder(&self, pool: &DescriptorPool) -> Result<GatewayBuilder> {
        let mut clients = Clients::default();
        let mut builder = Gateway::builder();

        if let Some(timeout) = self.timeout_ms {
            builder = builder.with_timeout(Duration::from_millis(timeout));
        }
        if self.metrics {
            builder = builder.enable_metrics();
        }
        if let Some(config) = self.shutdown_config() {
            builder = builder.with_graceful_shutdown(config);
        }
        let policy = self
            .exclude_headers
            .iter()
            .fold(HeaderPolicy::new(), |policy, header| policy.exclude(header.as_str()));
        builder = builder.with_header_policy(policy);

        for service in &self.services {
            let descriptor = find_service(pool, &service.name)?;
            let endpoint = self.endpoint_for(service.endpoint.as_deref(), &service.name)?;
            let mut options = ServiceOptions::new().with_transport(clients.get(endpoint)?);
            if let Some(methods) = &service.methods {
                options = options.with_methods(methods.iter().cloned());
            }
            if let Some(timeout) = service.timeout_ms {
                options = options.with_timeout(Duration::from_millis(timeout));
            }
            builder = builder.register_service(&descriptor, options)?;
        }

        for relations in &self.relations {
            let descriptor = find_service(pool, &relations.service)?;
            let endpoint = self.endpoint_for(relations.endpoint.as_deref(), &relations.service)?;
            let transport = clients.get(endpoint)?;
            let methods = relations.methods.iter().map(|(method, config)| {
                let mut relation =
                    RelationConfig::new(config.name.clone()).with_transport(transport.clone());
                if let Some(timeout) = config.timeout_ms {
                    relation = relation.with_timeout(Duration::from_millis(timeout));
                }
                (method.clone(), relation)
            });
            builder = builder.register_relation(&descriptor, methods)?;
        }

        Ok(builder)
    }

    /// Load descriptors and build the gateway.
    pub fn build(&self) -> Result<Gateway> {
        let pool = self.load_descriptors()?;
        self.builder(&pool)?.build()
    }

    fn endpoint_for<'a>(&'a self, endpoint: Option<&'a str>, service: &str) -> Result<&'a str> {
        endpoint
            .or(self.default_endpoint.as_deref())
            .ok_or_else(|| Error::Config(format!("no endpoint configured for {}", service)))
    }
}

fn find_service(pool: &DescriptorPool, name: &str) -> Result<ServiceDescriptor> {
    pool.get_service_by_name(name)
        .ok_or_else(|| Error::Config(format!("service {} not found in descriptor sets", name)))
}

#[derive(Default)]
struct Clients {
    by_endpoint: HashMap<String, SharedTransport>,
}

impl Clients {
    fn get(&mut self, endpoint: &str) -> Result<SharedTransport> {
        if let Some(client) = self.by_endpoint.get(endpoint) {
            return Ok(client.clone());
        }
        let client: SharedTransport = Arc::new(GrpcClient::connect_lazy(endpoint)?);
        self.by_endpoint.insert(endpoint.to_string(), client.clone());
        Ok(client)
    }
}
