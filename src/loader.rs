//! Base model loader
//!
//! Resolves a model source (local directory or HuggingFace Hub repo id),
//! loads every weight tensor onto the requested device at the requested
//! precision, and loads the tokenizer that ships with the checkpoint.

use crate::error::{Error, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::api::sync::Api;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info};

/// Tokenizer sidecar files that are carried through to the output directory
/// when present next to the base model.
const AUX_TOKENIZER_FILES: &[&str] = &[
    "tokenizer_config.json",
    "special_tokens_map.json",
    "generation_config.json",
];

/// A base model loaded into memory: raw weight tensors plus the metadata
/// needed to write a standalone checkpoint back out.
pub struct BaseModel {
    /// Model configuration (config.json), passed through unchanged
    pub config: serde_json::Value,
    /// All weight tensors by checkpoint name
    pub tensors: HashMap<String, Tensor>,
    /// Tokenizer loaded from tokenizer.json
    pub tokenizer: Tokenizer,
    /// Auxiliary tokenizer files to copy into the output (name, source path)
    pub tokenizer_files: Vec<(String, PathBuf)>,
}

/// Load a base model from a local directory or a HuggingFace Hub repo id.
///
/// Floating-point tensors are converted to `dtype`; integer tensors keep
/// their stored representation.
pub fn load_base_model(base: &str, dtype: DType, device: &Device) -> Result<BaseModel> {
    let files = resolve_model_files(base)?;

    let config_path = files
        .get("config.json")
        .ok_or_else(|| Error::model_load(format!("no config.json found for model: {}", base)))?;
    let config: serde_json::Value = serde_json::from_str(&fs::read_to_string(config_path)?)?;
    if let Some(model_type) = config.get("model_type").and_then(|v| v.as_str()) {
        info!("Detected model architecture: {}", model_type);
    }

    let weight_paths = weight_files(&files)?;
    let mut tensors = HashMap::new();
    for path in &weight_paths {
        debug!("Loading tensors from: {}", path.display());
        let loaded = candle_core::safetensors::load(path, device)?;
        for (name, tensor) in loaded {
            let tensor = if tensor.dtype().is_float() {
                tensor.to_dtype(dtype)?
            } else {
                tensor
            };
            tensors.insert(name, tensor);
        }
    }
    if tensors.is_empty() {
        return Err(Error::model_load(format!(
            "no weight tensors could be loaded for model: {}",
            base
        )));
    }
    info!(
        "Loaded {} weight tensors from {} file(s)",
        tensors.len(),
        weight_paths.len()
    );

    let tokenizer_path = files
        .get("tokenizer.json")
        .ok_or_else(|| Error::model_load(format!("no tokenizer.json found for model: {}", base)))?;
    let tokenizer = Tokenizer::from_file(tokenizer_path)
        .map_err(|e| Error::Tokenizer(format!("failed to load tokenizer.json: {}", e)))?;

    let tokenizer_files = AUX_TOKENIZER_FILES
        .iter()
        .filter_map(|name| files.get(*name).map(|p| (name.to_string(), p.clone())))
        .collect();

    Ok(BaseModel {
        config,
        tensors,
        tokenizer,
        tokenizer_files,
    })
}

/// Map every relevant model file name to a local path, downloading from the
/// Hub when `base` is a repo id rather than a directory.
fn resolve_model_files(base: &str) -> Result<HashMap<String, PathBuf>> {
    let path = Path::new(base);
    if path.is_dir() {
        local_model_files(path)
    } else if looks_like_hub_id(base) {
        info!("Fetching model files from HuggingFace Hub: {}", base);
        hub_model_files(base)
    } else {
        Err(Error::model_load(format!(
            "model not found: {} (not a directory and not a Hub repo id)",
            base
        )))
    }
}

/// A repo id is `org/name`, which a relative or absolute filesystem path is not.
fn looks_like_hub_id(base: &str) -> bool {
    base.contains('/') && !base.starts_with('.') && !base.starts_with('/')
}

fn local_model_files(dir: &Path) -> Result<HashMap<String, PathBuf>> {
    let mut files = HashMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            files.insert(name.to_string(), path.clone());
        }
    }

    if !files.contains_key("config.json") {
        return Err(Error::model_load(format!(
            "no config.json found in model directory: {}",
            dir.display()
        )));
    }

    Ok(files)
}

fn hub_model_files(model_id: &str) -> Result<HashMap<String, PathBuf>> {
    let api = Api::new()?;
    let repo = api.model(model_id.to_string());
    let mut files = HashMap::new();

    let config = repo.get("config.json").map_err(|e| {
        Error::model_load(format!("failed to fetch config.json for {}: {}", model_id, e))
    })?;
    files.insert("config.json".to_string(), config);

    // Sharded checkpoints carry an index naming the shard files; single-file
    // checkpoints ship model.safetensors directly.
    match repo.get("model.safetensors.index.json") {
        Ok(index_path) => {
            let shards = shards_from_index(&index_path)?;
            info!("Fetching {} weight shard(s) for {}", shards.len(), model_id);
            for shard in shards {
                let path = repo.get(&shard)?;
                files.insert(shard, path);
            }
            files.insert("model.safetensors.index.json".to_string(), index_path);
        }
        Err(_) => {
            let weights = repo.get("model.safetensors").map_err(|e| {
                Error::model_load(format!(
                    "no safetensors weights found for {}: {}",
                    model_id, e
                ))
            })?;
            files.insert("model.safetensors".to_string(), weights);
        }
    }

    let tokenizer = repo.get("tokenizer.json").map_err(|e| {
        Error::model_load(format!(
            "failed to fetch tokenizer.json for {}: {}",
            model_id, e
        ))
    })?;
    files.insert("tokenizer.json".to_string(), tokenizer);

    for name in AUX_TOKENIZER_FILES {
        if let Ok(path) = repo.get(name) {
            files.insert(name.to_string(), path);
        }
    }

    Ok(files)
}

/// Pick the weight files to load, in a deterministic order.
fn weight_files(files: &HashMap<String, PathBuf>) -> Result<Vec<PathBuf>> {
    if let Some(index_path) = files.get("model.safetensors.index.json") {
        let shards = shards_from_index(index_path)?;
        return shards
            .into_iter()
            .map(|name| {
                files.get(&name).cloned().ok_or_else(|| {
                    Error::model_load(format!("weight shard listed in index is missing: {}", name))
                })
            })
            .collect();
    }

    if let Some(single) = files.get("model.safetensors") {
        return Ok(vec![single.clone()]);
    }

    let mut candidates: Vec<(&String, &PathBuf)> = files
        .iter()
        .filter(|(name, _)| name.ends_with(".safetensors"))
        .collect();
    candidates.sort_by(|a, b| a.0.cmp(b.0));

    if candidates.is_empty() {
        return Err(Error::model_load(
            "no safetensors weight files found".to_string(),
        ));
    }

    Ok(candidates.into_iter().map(|(_, p)| p.clone()).collect())
}

#[derive(Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

/// Read the shard file names out of a model.safetensors.index.json,
/// deduplicated and sorted.
fn shards_from_index(path: &Path) -> Result<Vec<String>> {
    let index: ShardIndex = serde_json::from_str(&fs::read_to_string(path)?)?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    Ok(shards.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_id_detection() {
        assert!(looks_like_hub_id("Qwen/Qwen2.5-7B-Instruct"));
        assert!(looks_like_hub_id("meta-llama/Llama-3.1-8B"));
        assert!(!looks_like_hub_id("./models/llama"));
        assert!(!looks_like_hub_id("../checkpoints/base"));
        assert!(!looks_like_hub_id("/srv/models/base"));
        assert!(!looks_like_hub_id("llama-7b"));
    }

    #[test]
    fn missing_config_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("model.safetensors"), b"not read").unwrap();

        let err = local_model_files(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ModelLoad(_)));
    }

    #[test]
    fn shard_index_is_deduplicated_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let index_path = dir.path().join("model.safetensors.index.json");
        fs::write(
            &index_path,
            serde_json::json!({
                "metadata": {"total_size": 0},
                "weight_map": {
                    "model.layers.1.weight": "model-00002-of-00002.safetensors",
                    "model.layers.0.weight": "model-00001-of-00002.safetensors",
                    "model.norm.weight": "model-00002-of-00002.safetensors",
                }
            })
            .to_string(),
        )
        .unwrap();

        let shards = shards_from_index(&index_path).unwrap();
        assert_eq!(
            shards,
            vec![
                "model-00001-of-00002.safetensors".to_string(),
                "model-00002-of-00002.safetensors".to_string(),
            ]
        );
    }

    #[test]
    fn single_file_checkpoint_is_preferred_over_globbing() {
        let mut files = HashMap::new();
        files.insert(
            "model.safetensors".to_string(),
            PathBuf::from("/m/model.safetensors"),
        );
        files.insert("config.json".to_string(), PathBuf::from("/m/config.json"));

        let weights = weight_files(&files).unwrap();
        assert_eq!(weights, vec![PathBuf::from("/m/model.safetensors")]);
    }

    #[test]
    fn no_weight_files_is_a_load_error() {
        let mut files = HashMap::new();
        files.insert("config.json".to_string(), PathBuf::from("/m/config.json"));

        assert!(matches!(
            weight_files(&files).unwrap_err(),
            Error::ModelLoad(_)
        ));
    }
}
