//! PEFT LoRA adapter loading
//!
//! An adapter directory follows the PEFT layout: `adapter_config.json`
//! describing the adaptation, and `adapter_model.safetensors` holding
//! `lora_A` / `lora_B` weight pairs keyed with a `base_model.model.` prefix.

use crate::error::{Error, Result};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// PEFT adapter configuration (adapter_config.json), subset we consume.
/// Unknown fields are preserved but unused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// PEFT adapter type; must be "LORA" when present
    #[serde(default)]
    pub peft_type: Option<String>,
    /// LoRA rank
    pub r: usize,
    /// LoRA alpha scaling factor
    pub lora_alpha: f32,
    /// LoRA dropout (irrelevant at merge time)
    #[serde(default)]
    pub lora_dropout: f32,
    /// Target modules the adapter was trained on
    #[serde(default)]
    pub target_modules: Vec<String>,
    /// Base model the adapter was trained against
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    /// Remaining PEFT fields, carried for diagnostics only
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Low-rank weights for one adapted layer.
#[derive(Debug, Clone)]
pub struct LoraLayer {
    /// Normalized layer name, matching the base checkpoint (no `.weight` suffix)
    pub name: String,
    /// Down-projection, shape `[r, in]`
    pub a: Tensor,
    /// Up-projection, shape `[out, r]`
    pub b: Tensor,
}

impl LoraLayer {
    /// Rank as stored in the tensors (first dimension of A).
    pub fn rank(&self) -> Result<usize> {
        Ok(self.a.dim(0)?)
    }
}

/// A fully loaded LoRA adapter.
#[derive(Debug)]
pub struct LoraAdapter {
    /// Adapter configuration
    pub config: AdapterConfig,
    /// Adapted layers by normalized name, in deterministic order
    pub layers: BTreeMap<String, LoraLayer>,
}

impl LoraAdapter {
    /// Merge scaling factor for a layer: `alpha / r`, using the rank the
    /// tensors actually have (PEFT rank patterns can vary it per layer).
    pub fn scaling(&self, layer: &LoraLayer) -> Result<f64> {
        let rank = layer.rank()?;
        if rank == 0 {
            return Err(Error::adapter_load(format!(
                "LoRA rank is zero for layer: {}",
                layer.name
            )));
        }
        Ok(self.config.lora_alpha as f64 / rank as f64)
    }
}

/// Which half of a LoRA pair a checkpoint key names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoraMatrix {
    A,
    B,
}

/// Load a PEFT adapter directory onto the given device.
pub fn load_adapter(dir: &Path, device: &Device) -> Result<LoraAdapter> {
    if !dir.is_dir() {
        return Err(Error::adapter_load(format!(
            "adapter directory does not exist: {}",
            dir.display()
        )));
    }

    let config_path = dir.join("adapter_config.json");
    let config: AdapterConfig = serde_json::from_str(&fs::read_to_string(&config_path).map_err(
        |e| Error::adapter_load(format!("failed to read {}: {}", config_path.display(), e)),
    )?)?;

    if let Some(peft_type) = &config.peft_type {
        if peft_type != "LORA" {
            return Err(Error::adapter_load(format!(
                "unsupported peft_type: {} (only LORA adapters can be merged)",
                peft_type
            )));
        }
    }

    let weights_path = dir.join("adapter_model.safetensors");
    if !weights_path.is_file() {
        return Err(Error::adapter_load(format!(
            "adapter_model.safetensors not found in {}",
            dir.display()
        )));
    }

    let raw = candle_core::safetensors::load(&weights_path, device)?;
    let layers = pair_layers(raw)?;
    if layers.is_empty() {
        return Err(Error::adapter_load(
            "adapter contains no LoRA weight pairs".to_string(),
        ));
    }

    info!(
        "Loaded adapter: {} layers, r={}, alpha={}",
        layers.len(),
        config.r,
        config.lora_alpha
    );

    Ok(LoraAdapter { config, layers })
}

/// Pair `lora_A` / `lora_B` tensors into per-layer entries. Every tensor must
/// belong to a complete pair; anything else in the checkpoint is an error.
fn pair_layers(raw: HashMap<String, Tensor>) -> Result<BTreeMap<String, LoraLayer>> {
    let mut pending: BTreeMap<String, (Option<Tensor>, Option<Tensor>)> = BTreeMap::new();

    for (key, tensor) in raw {
        let (name, matrix) = parse_lora_key(&key).ok_or_else(|| {
            Error::adapter_load(format!("unsupported tensor in adapter checkpoint: {}", key))
        })?;
        debug!("Adapter tensor: {} -> {} ({:?})", key, name, matrix);

        let entry = pending.entry(name).or_default();
        let slot = match matrix {
            LoraMatrix::A => &mut entry.0,
            LoraMatrix::B => &mut entry.1,
        };
        if slot.is_some() {
            return Err(Error::adapter_load(format!(
                "duplicate LoRA tensor in adapter checkpoint: {}",
                key
            )));
        }
        *slot = Some(tensor);
    }

    let mut layers = BTreeMap::new();
    for (name, (a, b)) in pending {
        match (a, b) {
            (Some(a), Some(b)) => {
                layers.insert(name.clone(), LoraLayer { name, a, b });
            }
            (a, _) => {
                let missing = if a.is_none() { "lora_A" } else { "lora_B" };
                return Err(Error::adapter_load(format!(
                    "adapter layer {} is missing its {} matrix",
                    name, missing
                )));
            }
        }
    }

    Ok(layers)
}

/// Normalize a PEFT checkpoint key down to the base-model layer name.
///
/// `base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight`
/// becomes `model.layers.0.self_attn.q_proj` plus the matrix kind; the base
/// checkpoint stores that layer as `model.layers.0.self_attn.q_proj.weight`.
fn parse_lora_key(key: &str) -> Option<(String, LoraMatrix)> {
    let key = key.strip_prefix("base_model.model.").unwrap_or(key);

    if let Some(stem) = key.strip_suffix(".lora_A.weight") {
        Some((stem.to_string(), LoraMatrix::A))
    } else if let Some(stem) = key.strip_suffix(".lora_B.weight") {
        Some((stem.to_string(), LoraMatrix::B))
    } else {
        None
    }
}
