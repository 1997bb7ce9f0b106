//! Response formatting.
//!
//! Formatting turns a downstream message into JSON shaped by a [`Schema`].
//! Relation fields cannot be filled yet: they become placeholders in a
//! [`Document`] and a [`Patch`] is emitted for each, to be resolved by the
//! stitcher. Placeholders and error targets are slot indices, so the stitcher
//! can write into any point of the output tree without holding references
//! into it.

use crate::error::{code_name, Error, Result};
use crate::relation::field_value;
use crate::schema::{is_well_known, Field, FieldType, Schema};
use crate::types::should_catch;
use base64::Engine;
use prost_reflect::{DescriptorPool, DynamicMessage, FieldDescriptor, Kind, MapKey, ReflectMessage, Value};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

const NULL_VALUE: &str = "google.protobuf.NullValue";

/// Index of a slot in a [`Document`].
pub type SlotId = usize;

/// Output tree under construction.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Value(serde_json::Value),
    Object(Vec<(String, Node)>),
    List(Vec<Node>),
    /// Placeholder filled later
    Slot(SlotId),
}

#[derive(Debug)]
enum SlotState {
    Pending,
    Filled(Node),
    Failed(serde_json::Value),
}

/// Arena of output slots for one response body.
///
/// A failed slot stays failed: later fills are ignored, so an error written
/// to an ancestor is never overwritten by a sibling's result.
#[derive(Debug, Default)]
pub struct Document {
    slots: Vec<SlotState>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an empty slot.
    pub fn reserve(&mut self) -> SlotId {
        self.slots.push(SlotState::Pending);
        self.slots.len() - 1
    }

    pub fn fill(&mut self, slot: SlotId, node: Node) {
        if let Some(state) = self.slots.get_mut(slot) {
            if !matches!(state, SlotState::Failed(_)) {
                *state = SlotState::Filled(node);
            }
        }
    }

    /// Replace the slot's content with an error value.
    pub fn fail(&mut self, slot: SlotId, error: serde_json::Value) {
        if let Some(state) = self.slots.get_mut(slot) {
            *state = SlotState::Failed(error);
        }
    }

    pub fn is_failed(&self, slot: SlotId) -> bool {
        matches!(self.slots.get(slot), Some(SlotState::Failed(_)))
    }

    /// Render the tree rooted at `root`. Unfilled placeholders are omitted
    /// from their object.
    pub fn into_json(mut self, root: SlotId) -> serde_json::Value {
        self.take(root).unwrap_or(serde_json::Value::Null)
    }

    fn take(&mut self, slot: SlotId) -> Option<serde_json::Value> {
        let state = std::mem::replace(self.slots.get_mut(slot)?, SlotState::Pending);
        match state {
            SlotState::Pending => None,
            SlotState::Filled(node) => self.render(node),
            SlotState::Failed(error) => Some(error),
        }
    }

    fn render(&mut self, node: Node) -> Option<serde_json::Value> {
        match node {
            Node::Value(value) => Some(value),
            Node::Object(entries) => {
                let mut object = serde_json::Map::with_capacity(entries.len());
                for (name, node) in entries {
                    if let Some(value) = self.render(node) {
                        object.insert(name, value);
                    }
                }
                Some(serde_json::Value::Object(object))
            }
            Node::List(nodes) => Some(serde_json::Value::Array(
                nodes
                    .into_iter()
                    .map(|node| self.render(node).unwrap_or(serde_json::Value::Null))
                    .collect(),
            )),
            Node::Slot(slot) => self.take(slot),
        }
    }
}

/// A relation field awaiting resolution.
#[derive(Debug, Clone)]
pub struct Patch {
    /// Message the relation is computed from
    pub base: DynamicMessage,
    /// Placeholder receiving the value
    pub slot: SlotId,
    /// Where a failure is written; `None` means the failure propagates
    pub error_slot: Option<SlotId>,
    pub field: Arc<Field>,
}

/// Format `message` against `schema`.
///
/// `error_slot` is the inherited catch target; `fallback_catch` is the verb's
/// policy for fields without an explicit one.
pub fn format_message(
    doc: &mut Document,
    message: &DynamicMessage,
    schema: &Schema,
    error_slot: Option<SlotId>,
    fallback_catch: bool,
) -> Result<(Node, Vec<Patch>)> {
    let mut formatter = Formatter {
        doc,
        fallback_catch,
        patches: Vec::new(),
    };
    let node = formatter.message(message, schema, error_slot)?;
    Ok((node, formatter.patches))
}

/// Format one resolved relation value against the relation field's schema.
pub fn format_relation_value(
    doc: &mut Document,
    value: &Value,
    field: &Field,
    error_slot: Option<SlotId>,
    fallback_catch: bool,
) -> Result<(Node, Vec<Patch>)> {
    let relation = field
        .relation
        .as_ref()
        .ok_or_else(|| Error::Internal(format!("{} is not a relation", field.path)))?;
    let mut formatter = Formatter {
        doc,
        fallback_catch,
        patches: Vec::new(),
    };
    let node = formatter.value(value, relation.field(), &field.ty, error_slot)?;
    Ok((node, formatter.patches))
}

struct Formatter<'d> {
    doc: &'d mut Document,
    fallback_catch: bool,
    patches: Vec<Patch>,
}

impl Formatter<'_> {
    fn message(
        &mut self,
        message: &DynamicMessage,
        schema: &Schema,
        error_slot: Option<SlotId>,
    ) -> Result<Node> {
        let desc = message.descriptor();
        if is_well_known(desc.full_name()) {
            return Ok(Node::Value(serde_json::to_value(message)?));
        }

        let mut entries = Vec::with_capacity(schema.fields.len());
        for field in &schema.fields {
            if field.relation.is_some() {
                let slot = self.doc.reserve();
                let patch_error_slot = if should_catch(field.on_error, self.fallback_catch) {
                    Some(slot)
                } else {
                    error_slot
                };
                self.patches.push(Patch {
                    base: message.clone(),
                    slot,
                    error_slot: patch_error_slot,
                    field: field.clone(),
                });
                entries.push((field.name.clone(), Node::Slot(slot)));
                continue;
            }

            let descriptor = desc.get_field_by_name(&field.name).ok_or_else(|| {
                Error::Internal(format!(
                    "field '{}' not found for '{}'",
                    field.name,
                    desc.full_name()
                ))
            })?;
            if let Some(value) = field_value(message, &descriptor) {
                let node = self.value(&value, &descriptor, &field.ty, error_slot)?;
                entries.push((field.name.clone(), node));
            }
        }
        Ok(Node::Object(entries))
    }

    fn value(
        &mut self,
        value: &Value,
        descriptor: &FieldDescriptor,
        ty: &FieldType,
        error_slot: Option<SlotId>,
    ) -> Result<Node> {
        match (ty, value) {
            (FieldType::Repeated(repeated), Value::List(elements)) => {
                let kind = descriptor.kind();
                let nodes = elements
                    .iter()
                    .map(|element| self.element(element, &kind, &repeated.element, error_slot, true))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Node::List(nodes))
            }
            (FieldType::Map(map), Value::Map(entries)) => {
                let entry = descriptor.kind().as_message().cloned().ok_or_else(|| {
                    Error::Internal(format!("map field {} has no entry type", descriptor.name()))
                })?;
                let kind = entry.map_entry_value_field().kind();
                let nodes = sorted_entries(entries)
                    .into_iter()
                    .map(|(key, value)| {
                        Ok((map_key(key), self.element(value, &kind, &map.value, error_slot, true)?))
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Node::Object(nodes))
            }
            (FieldType::Repeated(_) | FieldType::Map(_), _) => Err(Error::Internal(format!(
                "value of {} does not match its schema",
                descriptor.name()
            ))),
            (singular, value) => self.element(value, &descriptor.kind(), singular, error_slot, false),
        }
    }

    fn element(
        &mut self,
        value: &Value,
        kind: &Kind,
        ty: &FieldType,
        error_slot: Option<SlotId>,
        in_container: bool,
    ) -> Result<Node> {
        match (ty, value) {
            (FieldType::Message(schema), Value::Message(message)) => {
                self.message(message, schema, error_slot)
            }
            (FieldType::Scalar(_), value) if in_container && is_default_scalar(value) => {
                Ok(Node::Value(serde_json::Value::Null))
            }
            (FieldType::Scalar(_), value) => Ok(Node::Value(scalar_json(value, kind)?)),
            _ => Err(Error::Internal(format!(
                "value {:?} does not match schema type",
                value
            ))),
        }
    }
}

fn is_default_scalar(value: &Value) -> bool {
    match value {
        Value::Bool(b) => !b,
        Value::I32(n) => *n == 0,
        Value::I64(n) => *n == 0,
        Value::U32(n) => *n == 0,
        Value::U64(n) => *n == 0,
        Value::F32(n) => *n == 0.0,
        Value::F64(n) => *n == 0.0,
        Value::String(s) => s.is_empty(),
        Value::Bytes(b) => b.is_empty(),
        _ => false,
    }
}

/// Map entries ordered by key, numerically for integer keys.
fn sorted_entries(entries: &HashMap<MapKey, Value>) -> Vec<(&MapKey, &Value)> {
    let mut sorted: Vec<_> = entries.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    sorted
}

fn map_key(key: &MapKey) -> String {
    match key {
        MapKey::Bool(b) => b.to_string(),
        MapKey::I32(n) => n.to_string(),
        MapKey::I64(n) => n.to_string(),
        MapKey::U32(n) => n.to_string(),
        MapKey::U64(n) => n.to_string(),
        MapKey::String(s) => s.clone(),
    }
}

fn float_json(value: f64) -> serde_json::Value {
    if value.is_nan() {
        json!("NaN")
    } else if value == f64::INFINITY {
        json!("Infinity")
    } else if value == f64::NEG_INFINITY {
        json!("-Infinity")
    } else {
        serde_json::Number::from_f64(value)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

/// Proto-JSON form of a scalar value.
fn scalar_json(value: &Value, kind: &Kind) -> Result<serde_json::Value> {
    Ok(match value {
        Value::Bool(b) => json!(b),
        Value::I32(n) => json!(n),
        Value::U32(n) => json!(n),
        Value::I64(n) => json!(n.to_string()),
        Value::U64(n) => json!(n.to_string()),
        // Shortest decimal form, so 0.1f32 stays 0.1
        Value::F32(n) => match n.to_string().parse::<f64>() {
            Ok(widened) if n.is_finite() => float_json(widened),
            _ => float_json(f64::from(*n)),
        },
        Value::F64(n) => float_json(*n),
        Value::String(s) => json!(s),
        Value::Bytes(b) => json!(base64::engine::general_purpose::STANDARD.encode(b)),
        Value::EnumNumber(number) => match kind {
            Kind::Enum(desc) if desc.full_name() == NULL_VALUE => serde_json::Value::Null,
            Kind::Enum(desc) => desc
                .get_value(*number)
                .map(|v| json!(v.name()))
                .unwrap_or_else(|| json!(number)),
            _ => json!(number),
        },
        Value::Message(_) | Value::List(_) | Value::Map(_) => {
            return Err(Error::Internal(format!("{:?} is not a scalar", value)))
        }
    })
}

/// Normalise a failure into the embedded error value.
///
/// `pool` is used to render known detail types as JSON under `debug`.
pub fn format_error(err: &Error, path: &str, pool: Option<&DescriptorPool>) -> serde_json::Value {
    let details: Vec<serde_json::Value> = err
        .details()
        .into_iter()
        .map(|detail| {
            let type_name = detail
                .type_url
                .rsplit('/')
                .next()
                .unwrap_or(detail.type_url.as_str())
                .to_string();
            let debug = pool
                .and_then(|pool| pool.get_message_by_name(&type_name))
                .and_then(|desc| DynamicMessage::decode(desc, detail.value.as_slice()).ok())
                .and_then(|message| serde_json::to_value(&message).ok())
                .unwrap_or(serde_json::Value::Null);
            json!({
                "type": type_name,
                "value": base64::engine::general_purpose::STANDARD.encode(&detail.value),
                "debug": debug,
            })
        })
        .collect();

    json!({
        "[@error]": {},
        "code": code_name(err.code()),
        "message": err.message(),
        "details": details,
        "path": path,
    })
}
