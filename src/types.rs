//! Request and response messages of the gateway service.

use crate::schema::Schema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Fully-qualified name of the service the gateway exposes.
pub const GATEWAY_SERVICE: &str = "stitch.gateway.v1.GatewayService";

/// The three gateway verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Batch of side-effect-free unary calls
    Fetch,
    /// Batch of unary calls that may mutate
    Do,
    /// One server-streaming call
    Listen,
}

impl Verb {
    /// Fully-qualified operation name, the head of every operation chain.
    pub fn operation(&self) -> String {
        format!("{}.{}", GATEWAY_SERVICE, self.method_name())
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            Verb::Fetch => "Fetch",
            Verb::Do => "Do",
            Verb::Listen => "Listen",
        }
    }

    /// Label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Verb::Fetch => "fetch",
            Verb::Do => "do",
            Verb::Listen => "listen",
        }
    }

    /// Whether downstream errors are embedded when no policy is given.
    pub fn catches_by_default(&self) -> bool {
        matches!(self, Verb::Do)
    }
}

/// What to do when a subtree fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    /// Embed the error in place of the failed value
    Catch,
    /// Fail the enclosing request
    Throw,
}

/// Effective policy for a subtree with an optional override.
pub fn should_catch(policy: Option<ErrorPolicy>, fallback_catch: bool) -> bool {
    match policy {
        Some(ErrorPolicy::Catch) => true,
        Some(ErrorPolicy::Throw) => false,
        None => fallback_catch,
    }
}

/// One field selection in a request mask.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaskField {
    pub name: String,
    /// Relation parameters, proto-JSON of the relation's params type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mask: Vec<MaskField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorPolicy>,
}

impl MaskField {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_mask(mut self, mask: Vec<MaskField>) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = Some(policy);
        self
    }
}

/// A call to one entry point.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// `package.Service.Method`
    pub method: String,
    /// Proto-JSON of the method input; absent means the empty message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub mask: Vec<MaskField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorPolicy>,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_mask(mut self, mask: Vec<MaskField>) -> Self {
        self.mask = mask;
        self
    }

    pub fn on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = Some(policy);
        self
    }
}

/// Result of one entry-point call.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub method: String,
    pub body: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Arc<Schema>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchRequest {
    #[serde(default)]
    pub requests: Vec<Request>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResponse {
    pub responses: Vec<Response>,
}

pub type DoRequest = FetchRequest;
pub type DoResponse = FetchResponse;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListenRequest {
    #[serde(default)]
    pub request: Option<Request>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenResponse {
    pub response: Response,
}
