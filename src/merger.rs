//! LoRA weight merger
//!
//! Folds adapter deltas into the base weights permanently:
//! `W' = W + (alpha / r) * B.A`. After the merge the weight map contains
//! dense tensors only; no adapter structure survives into the output.

use crate::adapter::{LoraAdapter, LoraLayer};
use crate::error::{Error, Result};
use candle_core::{DType, Tensor};
use std::collections::HashMap;
use tracing::debug;

/// Merge every adapter layer into the base weight map. Returns the number of
/// merged layers. A layer whose name or shapes do not line up with the base
/// model is a fatal error; nothing is merged partially on failure paths that
/// the caller persists, because serialization only happens after this
/// function returns `Ok`.
pub fn merge_adapter(
    tensors: &mut HashMap<String, Tensor>,
    adapter: &LoraAdapter,
) -> Result<usize> {
    let mut merged = 0;

    for layer in adapter.layers.values() {
        let target = resolve_target(tensors, &layer.name)?;
        debug!("Merging LoRA layer into: {}", target);

        let scaling = adapter.scaling(layer)?;
        let base = &tensors[&target];
        let merged_tensor = merge_layer(base, layer, scaling)?;
        tensors.insert(target, merged_tensor);
        merged += 1;
    }

    Ok(merged)
}

/// Find the base tensor a normalized adapter layer name refers to. Adapters
/// saved against checkpoints without the `model.` prefix are also handled.
fn resolve_target(tensors: &HashMap<String, Tensor>, layer_name: &str) -> Result<String> {
    let direct = format!("{}.weight", layer_name);
    if tensors.contains_key(&direct) {
        return Ok(direct);
    }

    let prefixed = format!("model.{}.weight", layer_name);
    if tensors.contains_key(&prefixed) {
        return Ok(prefixed);
    }

    Err(Error::ShapeMismatch {
        layer: layer_name.to_string(),
        reason: "no matching weight tensor in the base model".to_string(),
    })
}

/// Compute `W + scaling * B.A` for one layer. The matmul runs in f32; the
/// delta is cast back to the base dtype before the add so the output keeps
/// the requested precision.
fn merge_layer(base: &Tensor, layer: &LoraLayer, scaling: f64) -> Result<Tensor> {
    let (b_out, b_rank) = dims2(&layer.b, layer, "lora_B")?;
    let (a_rank, a_in) = dims2(&layer.a, layer, "lora_A")?;

    if a_rank != b_rank {
        return Err(Error::ShapeMismatch {
            layer: layer.name.clone(),
            reason: format!(
                "lora_A rank {} does not match lora_B rank {}",
                a_rank, b_rank
            ),
        });
    }

    let base_dims = base.dims();
    if base_dims != [b_out, a_in] {
        return Err(Error::ShapeMismatch {
            layer: layer.name.clone(),
            reason: format!(
                "base weight shape {:?} does not match LoRA delta shape [{}, {}]",
                base_dims, b_out, a_in
            ),
        });
    }

    let delta = layer
        .b
        .to_dtype(DType::F32)?
        .matmul(&layer.a.to_dtype(DType::F32)?)?
        .affine(scaling, 0.0)?
        .to_dtype(base.dtype())?;

    Ok((base + delta)?)
}

fn dims2(tensor: &Tensor, layer: &LoraLayer, which: &str) -> Result<(usize, usize)> {
    match tensor.dims() {
        [rows, cols] => Ok((*rows, *cols)),
        dims => Err(Error::ShapeMismatch {
            layer: layer.name.clone(),
            reason: format!("{} must be 2-dimensional, got shape {:?}", which, dims),
        }),
    }
}
