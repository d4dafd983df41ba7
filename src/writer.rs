//! Merged model writer
//!
//! Serializes the merged weight set and tokenizer artifacts into the output
//! directory, creating it if absent. Files already present in the directory
//! are left alone; the writer only adds or replaces its own outputs.

use crate::error::{Error, Result};
use crate::loader::BaseModel;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// Write `model.safetensors`, `config.json`, and tokenizer files to `out`.
pub fn save_model(model: &BaseModel, out: &Path) -> Result<()> {
    fs::create_dir_all(out)?;

    let config_path = out.join("config.json");
    fs::write(&config_path, serde_json::to_string_pretty(&model.config)?)?;
    debug!("Wrote model config to: {}", config_path.display());

    let weights_path = out.join("model.safetensors");
    candle_core::safetensors::save(&model.tensors, &weights_path)?;
    debug!(
        "Wrote {} tensors to: {}",
        model.tensors.len(),
        weights_path.display()
    );

    let tokenizer_path = out.join("tokenizer.json");
    model
        .tokenizer
        .save(&tokenizer_path, false)
        .map_err(|e| Error::Tokenizer(format!("failed to save tokenizer.json: {}", e)))?;
    debug!("Wrote tokenizer to: {}", tokenizer_path.display());

    for (name, src) in &model.tokenizer_files {
        let dst = out.join(name);
        if src == &dst {
            continue;
        }
        fs::copy(src, &dst)?;
        debug!("Copied {} to: {}", name, dst.display());
    }

    info!("Saved merged model to: {}", out.display());
    Ok(())
}
