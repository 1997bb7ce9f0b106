//! Stitching of relation fields
//!
//! The stitcher resolves the [`Patch`]es left behind by formatting. Patches
//! that share a relation and the same decoded params are batched into a single
//! relation call, which keeps the number of downstream calls proportional to
//! the depth of the mask rather than the number of objects returned.
//!
//! Resolution runs in waves: every batch of the current wave is resolved
//! concurrently, the results are formatted into the document, and any
//! relation fields nested inside those results form the next wave.

use crate::error::{Error, Result};
use crate::format::{format_error, format_relation_value, Document, Patch, SlotId};
use crate::grpc_client::CallContext;
use crate::metrics::GatewayMetrics;
use crate::relation::Relation;
use futures::future::join_all;
use prost_reflect::{DynamicMessage, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Patches resolved by one relation call.
struct Batch {
    relation: Arc<Relation>,
    params: Option<Arc<DynamicMessage>>,
    entries: Vec<Patch>,
}

/// Group patches by relation and params identity, keeping first-seen order.
fn make_batches(patches: Vec<Patch>) -> Result<Vec<Batch>> {
    let mut batches: Vec<Batch> = Vec::new();
    let mut index: HashMap<(usize, usize), usize> = HashMap::new();

    for patch in patches {
        let relation = patch.field.relation.clone().ok_or_else(|| {
            Error::Internal(format!("{} is not a relation", patch.field.path))
        })?;
        let params = patch.field.params.clone();
        let key = (
            Arc::as_ptr(&relation) as usize,
            params.as_ref().map_or(0, |p| Arc::as_ptr(p) as usize),
        );

        match index.get(&key) {
            Some(&i) => batches[i].entries.push(patch),
            None => {
                index.insert(key, batches.len());
                batches.push(Batch {
                    relation,
                    params,
                    entries: vec![patch],
                });
            }
        }
    }

    Ok(batches)
}

async fn resolve_batch(batch: &Batch, ctx: &CallContext) -> Result<Vec<Option<Value>>> {
    let relation = &batch.relation;
    let ctx = match batch.entries.first() {
        Some(first) => ctx.with_operations(&first.field.operations),
        None => return Ok(Vec::new()),
    };
    let bases: Vec<DynamicMessage> = batch.entries.iter().map(|p| p.base.clone()).collect();

    tracing::debug!(
        relation = %format!("{}.{}", relation.base().full_name(), relation.name()),
        bases = bases.len(),
        "Resolving relation batch"
    );
    GatewayMetrics::global().record_batch_size(relation.method().full_name(), bases.len());

    let values = relation
        .resolve(bases, batch.params.as_deref(), &ctx)
        .await?;
    if values.len() != batch.entries.len() {
        return Err(Error::Internal(format!(
            "relation {} returned {} values for {} bases",
            relation.method().full_name(),
            values.len(),
            batch.entries.len()
        )));
    }
    Ok(values)
}

/// Resolve `patches` and everything they uncover into `doc`.
///
/// A failed batch is written into each entry's error slot. If any entry has
/// no error slot the failure aborts stitching and is returned.
pub async fn stitch(
    doc: &mut Document,
    patches: Vec<Patch>,
    fallback_catch: bool,
    ctx: &CallContext,
) -> Result<()> {
    let mut pending = patches;

    while !pending.is_empty() {
        let batches = make_batches(std::mem::take(&mut pending))?;
        let results = join_all(batches.iter().map(|batch| resolve_batch(batch, ctx))).await;

        for (batch, result) in batches.into_iter().zip(results) {
            let values = match result {
                Ok(values) => values,
                Err(err) => {
                    let slots: Option<Vec<SlotId>> =
                        batch.entries.iter().map(|p| p.error_slot).collect();
                    let Some(slots) = slots else {
                        return Err(err);
                    };
                    tracing::warn!(
                        method = %batch.relation.method().full_name(),
                        code = ?err.code(),
                        "Relation failed, embedding error"
                    );
                    let pool = batch.relation.method().parent_pool();
                    for (patch, slot) in batch.entries.iter().zip(slots) {
                        doc.fail(slot, format_error(&err, &patch.field.path, Some(pool)));
                    }
                    continue;
                }
            };

            for (patch, value) in batch.entries.into_iter().zip(values) {
                let Some(value) = value else {
                    continue;
                };
                let (node, next) = format_relation_value(
                    doc,
                    &value,
                    &patch.field,
                    patch.error_slot,
                    fallback_catch,
                )?;
                doc.fill(patch.slot, node);
                pending.extend(next);
            }
        }
    }

    Ok(())
}
