//! Relations: virtual fields computed by a second method.
//!
//! A relation method takes a batch of already-fetched objects (the *bases*)
//! and returns one value per base, in order:
//!
//! ```text
//! rpc GetUserTeam(GetUserTeamRequest) returns (GetUserTeamResponse);
//!
//! message GetUserTeamRequest {
//!   repeated User bases = 1;   // the base type
//!   string filter = 2;         // anything else is a parameter
//! }
//! message GetUserTeamResponse {
//!   repeated Result values = 1;
//!   message Result { Team team = 1; }   // exactly one field, named after the relation
//! }
//! ```
//!
//! Registering that method as relation `team` adds a field `team` of type
//! `Team` to `User`.

use crate::error::{Error, Result};
use crate::grpc_client::{invoke_unary, CallContext, SharedTransport};
use async_trait::async_trait;
use prost::Message;
use prost_reflect::{DynamicMessage, FieldDescriptor, MessageDescriptor, MethodDescriptor, ReflectMessage, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const BASES_FIELD: &str = "bases";
const VALUES_FIELD: &str = "values";

/// Relations by base type full name.
pub type RelationMap = HashMap<String, Vec<Arc<Relation>>>;

/// Computes relation values for a batch of bases.
#[async_trait]
pub trait RelationResolver: Send + Sync {
    /// Return exactly one entry per base, in order. `None` leaves the field
    /// unset on that base.
    async fn resolve(
        &self,
        bases: Vec<DynamicMessage>,
        params: Option<&DynamicMessage>,
        ctx: &CallContext,
    ) -> Result<Vec<Option<Value>>>;
}

/// A virtual field registered on a base message type.
pub struct Relation {
    base: MessageDescriptor,
    name: String,
    method: MethodDescriptor,
    field: FieldDescriptor,
    params: Option<MessageDescriptor>,
    bases_field: FieldDescriptor,
    resolver: Arc<dyn RelationResolver>,
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("base", &self.base.full_name())
            .field("name", &self.name)
            .field("method", &self.method.full_name())
            .finish()
    }
}

impl Relation {
    /// Validate `method` as a relation named `name` and back it with a unary
    /// call over `transport`.
    pub fn from_method(
        method: &MethodDescriptor,
        name: impl Into<String>,
        transport: SharedTransport,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let name = name.into();
        let shape = Shape::of(method, &name)?;
        let resolver = Arc::new(MethodResolver {
            method: method.clone(),
            transport,
            timeout,
            bases_field: shape.bases_field.clone(),
            values_field: shape.values_field.clone(),
            field: shape.field.clone(),
        });
        Ok(shape.into_relation(method, name, resolver))
    }

    /// Validate `method` as a relation but resolve it with a custom resolver.
    pub fn with_resolver(
        method: &MethodDescriptor,
        name: impl Into<String>,
        resolver: Arc<dyn RelationResolver>,
    ) -> Result<Self> {
        let name = name.into();
        let shape = Shape::of(method, &name)?;
        Ok(shape.into_relation(method, name, resolver))
    }

    /// Full name of the type this relation extends.
    pub fn base(&self) -> &MessageDescriptor {
        &self.base
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self) -> &MethodDescriptor {
        &self.method
    }

    /// Descriptor of the value field inside the method's result type.
    pub fn field(&self) -> &FieldDescriptor {
        &self.field
    }

    /// Type parameters are decoded into, if the relation takes any.
    pub fn params(&self) -> Option<&MessageDescriptor> {
        self.params.as_ref()
    }

    /// Decode relation parameters from proto-JSON.
    ///
    /// Parameters are decoded into the method input type; `bases` must not
    /// be supplied by the client.
    pub fn decode_params(&self, json: &serde_json::Value) -> Result<DynamicMessage> {
        let desc = self.params.clone().ok_or_else(|| {
            Error::InvalidArgument(format!("relation {} takes no params", self.name))
        })?;
        let message = DynamicMessage::deserialize(desc, json.clone())
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        if message.has_field(&self.bases_field) {
            return Err(Error::InvalidArgument(format!(
                "`{}` cannot be passed as a param",
                BASES_FIELD
            )));
        }
        Ok(message)
    }

    pub async fn resolve(
        &self,
        bases: Vec<DynamicMessage>,
        params: Option<&DynamicMessage>,
        ctx: &CallContext,
    ) -> Result<Vec<Option<Value>>> {
        self.resolver.resolve(bases, params, ctx).await
    }
}

/// Descriptors a relation method must expose.
struct Shape {
    base: MessageDescriptor,
    field: FieldDescriptor,
    params: Option<MessageDescriptor>,
    bases_field: FieldDescriptor,
    values_field: FieldDescriptor,
}

impl Shape {
    fn of(method: &MethodDescriptor, name: &str) -> Result<Self> {
        if method.is_client_streaming() || method.is_server_streaming() {
            return Err(Error::Config(format!(
                "relation method {} must be unary",
                method.full_name()
            )));
        }

        let input = method.input();
        let bases_field = input
            .get_field(1)
            .filter(|f| f.name() == BASES_FIELD && f.is_list())
            .ok_or_else(|| {
                Error::Config(format!(
                    "relation method {} input must have field 1 `repeated <Base> {}`",
                    method.full_name(),
                    BASES_FIELD
                ))
            })?;
        let base = bases_field.kind().as_message().cloned().ok_or_else(|| {
            Error::Config(format!(
                "relation method {} `{}` must be a message list",
                method.full_name(),
                BASES_FIELD
            ))
        })?;

        let values_field = method
            .output()
            .get_field(1)
            .filter(|f| f.name() == VALUES_FIELD && f.is_list())
            .ok_or_else(|| {
                Error::Config(format!(
                    "relation method {} output must have field 1 `repeated <Result> {}`",
                    method.full_name(),
                    VALUES_FIELD
                ))
            })?;
        let element = values_field.kind().as_message().cloned().ok_or_else(|| {
            Error::Config(format!(
                "relation method {} `{}` must be a message list",
                method.full_name(),
                VALUES_FIELD
            ))
        })?;
        let mut element_fields = element.fields();
        let field = match (element_fields.next(), element_fields.next()) {
            (Some(field), None) if field.number() == 1 && field.name() == name => field,
            _ => {
                return Err(Error::Config(format!(
                    "relation method {} result {} must have exactly one field `{}` = 1",
                    method.full_name(),
                    element.full_name(),
                    name
                )))
            }
        };

        let params = input
            .fields()
            .any(|f| f.number() != 1)
            .then(|| input.clone());

        Ok(Self {
            base,
            field,
            params,
            bases_field,
            values_field,
        })
    }

    fn into_relation(
        self,
        method: &MethodDescriptor,
        name: String,
        resolver: Arc<dyn RelationResolver>,
    ) -> Relation {
        Relation {
            base: self.base,
            name,
            method: method.clone(),
            field: self.field,
            params: self.params,
            bases_field: self.bases_field,
            resolver,
        }
    }
}

/// Resolves a relation with one unary call carrying all bases.
struct MethodResolver {
    method: MethodDescriptor,
    transport: SharedTransport,
    timeout: Option<Duration>,
    bases_field: FieldDescriptor,
    values_field: FieldDescriptor,
    field: FieldDescriptor,
}

#[async_trait]
impl RelationResolver for MethodResolver {
    async fn resolve(
        &self,
        bases: Vec<DynamicMessage>,
        params: Option<&DynamicMessage>,
        ctx: &CallContext,
    ) -> Result<Vec<Option<Value>>> {
        let mut request = match params {
            Some(params) => params.clone(),
            None => DynamicMessage::new(self.method.input()),
        };

        let element = self
            .bases_field
            .kind()
            .as_message()
            .cloned()
            .ok_or_else(|| Error::Internal("bases must be messages".to_string()))?;
        let bases = bases
            .into_iter()
            .map(|base| transcode(base, &element).map(Value::Message))
            .collect::<Result<Vec<_>>>()?;
        request
            .try_set_field(&self.bases_field, Value::List(bases))
            .map_err(|e| Error::Internal(format!("cannot set bases: {e}")))?;

        let response = invoke_unary(
            self.transport.as_ref(),
            &self.method,
            request,
            ctx.headers(),
            ctx.call_timeout(self.timeout),
        )
        .await?;

        let values = response.get_field(&self.values_field);
        let list = values.as_list().ok_or_else(|| {
            Error::Internal(format!("{} returned no values list", self.method.full_name()))
        })?;
        list.iter()
            .map(|value| {
                let message = value.as_message().ok_or_else(|| {
                    Error::Internal(format!("{} returned a non-message value", self.method.full_name()))
                })?;
                Ok(field_value(message, &self.field))
            })
            .collect()
    }
}

/// The value of `field`, or `None` when a singular field is unset.
pub(crate) fn field_value(message: &DynamicMessage, field: &FieldDescriptor) -> Option<Value> {
    if field.is_list() || field.is_map() || message.has_field(field) {
        Some(message.get_field(field).into_owned())
    } else {
        None
    }
}

// Bases may come from a different descriptor pool than the relation method.
fn transcode(message: DynamicMessage, target: &MessageDescriptor) -> Result<DynamicMessage> {
    if message.descriptor() == *target {
        return Ok(message);
    }
    DynamicMessage::decode(target.clone(), message.encode_to_vec().as_slice())
        .map_err(|e| Error::Internal(format!("cannot convert base to {}: {e}", target.full_name())))
}
