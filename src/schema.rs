//! Schema compilation.
//!
//! A [`Schema`] is the shape of one response: the message type narrowed to the
//! fields a request's mask selected, with relation fields resolved to the
//! [`Relation`] that computes them. Clients receive it alongside the first
//! response body so they can decode the pruned JSON.
//!
//! Compilation runs in two layers:
//!
//! 1. [`SchemaCache::canonical`] lists every field of a type, real fields and
//!    registered relations alike. Nested message types are referenced by
//!    descriptor and looked up again through the cache, so building a
//!    canonical schema never recurses and self-referential types need no
//!    special casing. Each type is built once per request and shared.
//! 2. [`compile`] walks the mask over canonical schemas, producing a fresh
//!    [`Field`] per selection with its path, error policy, decoded params and
//!    operation chain.

use crate::error::{Error, Result};
use crate::relation::{Relation, RelationMap};
use crate::types::{ErrorPolicy, MaskField};
use prost_reflect::{DynamicMessage, FieldDescriptor, Kind, MessageDescriptor};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

const NULL_VALUE: &str = "google.protobuf.NullValue";

const WELL_KNOWN_TYPES: &[&str] = &[
    "google.protobuf.Any",
    "google.protobuf.BoolValue",
    "google.protobuf.BytesValue",
    "google.protobuf.DoubleValue",
    "google.protobuf.Duration",
    "google.protobuf.Empty",
    "google.protobuf.FieldMask",
    "google.protobuf.FloatValue",
    "google.protobuf.Int32Value",
    "google.protobuf.Int64Value",
    "google.protobuf.ListValue",
    "google.protobuf.StringValue",
    "google.protobuf.Struct",
    "google.protobuf.Timestamp",
    "google.protobuf.UInt32Value",
    "google.protobuf.UInt64Value",
    "google.protobuf.Value",
];

/// Whether `name` is a well-known type with a dedicated JSON mapping.
pub fn is_well_known(name: &str) -> bool {
    WELL_KNOWN_TYPES.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScalarType {
    #[serde(rename = "SCALAR_TYPE_INT32")]
    Int32,
    #[serde(rename = "SCALAR_TYPE_UINT32")]
    Uint32,
    #[serde(rename = "SCALAR_TYPE_INT64")]
    Int64,
    #[serde(rename = "SCALAR_TYPE_UINT64")]
    Uint64,
    #[serde(rename = "SCALAR_TYPE_FLOAT")]
    Float,
    #[serde(rename = "SCALAR_TYPE_DOUBLE")]
    Double,
    #[serde(rename = "SCALAR_TYPE_BOOL")]
    Bool,
    #[serde(rename = "SCALAR_TYPE_STRING")]
    String,
    #[serde(rename = "SCALAR_TYPE_BYTES")]
    Bytes,
    #[serde(rename = "SCALAR_TYPE_ENUM")]
    Enum,
    #[serde(rename = "SCALAR_TYPE_NULL")]
    Null,
}

impl ScalarType {
    /// Scalar for a non-message kind; `None` for messages.
    pub fn of(kind: &Kind) -> Option<Self> {
        Some(match kind {
            Kind::Double => ScalarType::Double,
            Kind::Float => ScalarType::Float,
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => ScalarType::Int32,
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => ScalarType::Int64,
            Kind::Uint32 | Kind::Fixed32 => ScalarType::Uint32,
            Kind::Uint64 | Kind::Fixed64 => ScalarType::Uint64,
            Kind::Bool => ScalarType::Bool,
            Kind::String => ScalarType::String,
            Kind::Bytes => ScalarType::Bytes,
            Kind::Enum(desc) if desc.full_name() == NULL_VALUE => ScalarType::Null,
            Kind::Enum(_) => ScalarType::Enum,
            Kind::Message(_) => return None,
        })
    }
}

/// Field type in a canonical schema.
#[derive(Debug, Clone)]
pub enum CanonicalType {
    Scalar(ScalarType),
    Message(MessageDescriptor),
    Map {
        key: ScalarType,
        value: Box<CanonicalType>,
    },
    Repeated(Box<CanonicalType>),
}

impl CanonicalType {
    fn of(field: &FieldDescriptor) -> Self {
        if field.is_map() {
            if let Some(entry) = field.kind().as_message() {
                let key = ScalarType::of(&entry.map_entry_key_field().kind())
                    .unwrap_or(ScalarType::String);
                let value = Self::element(&entry.map_entry_value_field().kind());
                return CanonicalType::Map {
                    key,
                    value: Box::new(value),
                };
            }
        }
        let element = Self::element(&field.kind());
        if field.is_list() {
            CanonicalType::Repeated(Box::new(element))
        } else {
            element
        }
    }

    fn element(kind: &Kind) -> Self {
        match kind {
            Kind::Message(desc) => CanonicalType::Message(desc.clone()),
            other => CanonicalType::Scalar(ScalarType::of(other).unwrap_or(ScalarType::Null)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CanonicalField {
    pub name: String,
    pub json_name: String,
    pub ty: CanonicalType,
    pub relation: Option<Arc<Relation>>,
}

/// Every field of one message type, including relations.
#[derive(Debug)]
pub struct CanonicalSchema {
    pub name: String,
    pub fields: Vec<CanonicalField>,
    index: HashMap<String, usize>,
}

impl CanonicalSchema {
    fn build(desc: &MessageDescriptor, relations: &RelationMap) -> Self {
        let name = desc.full_name().to_string();
        let mut fields = Vec::new();

        if !is_well_known(&name) {
            for field in desc.fields() {
                fields.push(CanonicalField {
                    name: field.name().to_string(),
                    json_name: alias(&field),
                    ty: CanonicalType::of(&field),
                    relation: None,
                });
            }
            for relation in relations.get(&name).into_iter().flatten() {
                fields.push(CanonicalField {
                    name: relation.name().to_string(),
                    json_name: alias(relation.field()),
                    ty: CanonicalType::of(relation.field()),
                    relation: Some(relation.clone()),
                });
            }
        }

        let index = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        Self {
            name,
            fields,
            index,
        }
    }

    pub fn field(&self, name: &str) -> Option<&CanonicalField> {
        self.index.get(name).map(|&i| &self.fields[i])
    }
}

fn alias(field: &FieldDescriptor) -> String {
    if field.json_name() == field.name() {
        String::new()
    } else {
        field.json_name().to_string()
    }
}

/// Request-scoped cache of canonical schemas keyed by type name.
pub struct SchemaCache<'a> {
    relations: &'a RelationMap,
    schemas: HashMap<String, Arc<CanonicalSchema>>,
}

impl<'a> SchemaCache<'a> {
    pub fn new(relations: &'a RelationMap) -> Self {
        Self {
            relations,
            schemas: HashMap::new(),
        }
    }

    /// The canonical schema of `desc`, built on first use.
    pub fn canonical(&mut self, desc: &MessageDescriptor) -> Arc<CanonicalSchema> {
        if let Some(schema) = self.schemas.get(desc.full_name()) {
            return schema.clone();
        }
        let schema = Arc::new(CanonicalSchema::build(desc, self.relations));
        self.schemas
            .insert(desc.full_name().to_string(), schema.clone());
        schema
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// The masked shape of a message.
#[derive(Debug, Clone, Serialize)]
pub struct Schema {
    pub name: String,
    pub fields: Vec<Arc<Field>>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Schema {
    pub fn field(&self, name: &str) -> Option<&Arc<Field>> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn is_well_known(&self) -> bool {
        is_well_known(&self.name)
    }
}

/// One selected field.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    pub name: String,
    /// JSON name when it differs from `name`
    #[serde(skip_serializing_if = "String::is_empty")]
    pub json_name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    #[serde(skip)]
    pub relation: Option<Arc<Relation>>,
    /// Decoded relation params, shared by every base this field is applied to
    #[serde(skip)]
    pub params: Option<Arc<DynamicMessage>>,
    /// Dotted path from the method name
    #[serde(skip)]
    pub path: String,
    #[serde(skip)]
    pub on_error: Option<ErrorPolicy>,
    /// Operation chain leading to this field
    #[serde(skip)]
    pub operations: Arc<[String]>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    Scalar(ScalarType),
    Message(Schema),
    Map(MapType),
    Repeated(RepeatedType),
}

#[derive(Debug, Clone, Serialize)]
pub struct MapType {
    pub key: ScalarType,
    pub value: Box<FieldType>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepeatedType {
    pub element: Box<FieldType>,
}

/// Compile the schema of `desc` narrowed to `mask`.
///
/// `path` is the dotted location of the message, starting from the method
/// name; `operations` is the chain inherited by every selected field.
pub fn compile(
    desc: &MessageDescriptor,
    mask: &[MaskField],
    path: &str,
    operations: &Arc<[String]>,
    cache: &mut SchemaCache<'_>,
) -> Result<Schema> {
    let canonical = cache.canonical(desc);
    apply_mask(&canonical, mask, path, operations, cache)
}

fn apply_mask(
    canonical: &CanonicalSchema,
    mask: &[MaskField],
    path: &str,
    operations: &Arc<[String]>,
    cache: &mut SchemaCache<'_>,
) -> Result<Schema> {
    let mut fields = Vec::with_capacity(mask.len());
    let mut index = HashMap::with_capacity(mask.len());

    for selection in mask {
        let field_path = format!("{}.{}", path, selection.name);
        let Some(source) = canonical.field(&selection.name) else {
            return Err(Error::InvalidArgument(format!(
                "field {} not found",
                field_path
            )));
        };

        let operations = match &source.relation {
            Some(relation) => {
                let mut chain = operations.to_vec();
                chain.push(relation.method().full_name().to_string());
                Arc::from(chain)
            }
            None => operations.clone(),
        };

        let params = match &source.relation {
            Some(relation) if relation.params().is_some() => {
                let Some(json) = &selection.params else {
                    return Err(Error::InvalidArgument(format!(
                        "params for field {} not found",
                        field_path
                    )));
                };
                let decoded = relation.decode_params(json).map_err(|e| {
                    Error::InvalidArgument(format!(
                        "Invalid params passed at {}: {}",
                        field_path,
                        e.message()
                    ))
                })?;
                Some(Arc::new(decoded))
            }
            _ => None,
        };

        let ty = apply_mask_to_type(&source.ty, &selection.mask, &field_path, &operations, cache)?;

        index.insert(selection.name.clone(), fields.len());
        fields.push(Arc::new(Field {
            name: source.name.clone(),
            json_name: source.json_name.clone(),
            ty,
            relation: source.relation.clone(),
            params,
            path: field_path,
            on_error: selection.on_error,
            operations,
        }));
    }

    Ok(Schema {
        name: canonical.name.clone(),
        fields,
        index,
    })
}

fn apply_mask_to_type(
    ty: &CanonicalType,
    mask: &[MaskField],
    path: &str,
    operations: &Arc<[String]>,
    cache: &mut SchemaCache<'_>,
) -> Result<FieldType> {
    Ok(match ty {
        CanonicalType::Scalar(scalar) => FieldType::Scalar(*scalar),
        CanonicalType::Message(desc) => {
            FieldType::Message(compile(desc, mask, path, operations, cache)?)
        }
        CanonicalType::Map { key, value } => FieldType::Map(MapType {
            key: *key,
            value: Box::new(apply_mask_to_type(value, mask, path, operations, cache)?),
        }),
        CanonicalType::Repeated(element) => FieldType::Repeated(RepeatedType {
            element: Box::new(apply_mask_to_type(element, mask, path, operations, cache)?),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_well_known_types() {
        assert!(is_well_known("google.protobuf.Timestamp"));
        assert!(is_well_known("google.protobuf.Struct"));
        assert!(!is_well_known("google.protobuf.NullValue"));
        assert!(!is_well_known("demo.User"));
    }

    #[test]
    fn test_scalar_kinds() {
        assert_eq!(ScalarType::of(&Kind::Sint32), Some(ScalarType::Int32));
        assert_eq!(ScalarType::of(&Kind::Sfixed64), Some(ScalarType::Int64));
        assert_eq!(ScalarType::of(&Kind::Fixed32), Some(ScalarType::Uint32));
        assert_eq!(ScalarType::of(&Kind::Fixed64), Some(ScalarType::Uint64));
        assert_eq!(ScalarType::of(&Kind::Bytes), Some(ScalarType::Bytes));
    }

    #[test]
    fn test_field_type_serialization() {
        let ty = FieldType::Map(MapType {
            key: ScalarType::String,
            value: Box::new(FieldType::Repeated(RepeatedType {
                element: Box::new(FieldType::Scalar(ScalarType::Int64)),
            })),
        });
        assert_eq!(
            serde_json::to_value(&ty).unwrap(),
            json!({"map": {
                "key": "SCALAR_TYPE_STRING",
                "value": {"repeated": {"element": {"scalar": "SCALAR_TYPE_INT64"}}}
            }})
        );
    }

    #[test]
    fn test_empty_cache() {
        let relations = RelationMap::new();
        let cache = SchemaCache::new(&relations);
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
    }
}
