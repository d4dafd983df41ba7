//! lora-merge - fold a PEFT LoRA adapter into a base model
//!
//! This crate provides the building blocks for merging a low-rank adapter
//! into a base language model's weights:
//! - Base model loading (local directories or HuggingFace Hub)
//! - PEFT adapter loading and key normalization
//! - Weight merging (`W' = W + alpha/r * B.A`)
//! - Serialization of the merged checkpoint plus tokenizer artifacts

pub mod adapter;
pub mod cli;
pub mod error;
pub mod loader;
pub mod logging;
pub mod merger;
pub mod writer;

pub use error::{Error, Result};

use candle_core::{DType, Device};
use std::path::PathBuf;
use tracing::info;

/// Current version of lora-merge
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Resolved run configuration. Built once from CLI input and never mutated.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Base model name or path
    pub base: String,
    /// LoRA adapter directory
    pub adapter: PathBuf,
    /// Output directory for the merged model
    pub out: PathBuf,
    /// Precision for loaded weights
    pub dtype: DType,
    /// Device holding the weights during the merge
    pub device: Device,
}

/// Run the full merge pipeline: load base model and tokenizer, load the
/// adapter, fold the adapter into the base weights, write the result.
///
/// The sequence is strictly linear; any failure aborts the run before
/// anything is written to `out`.
pub fn run(config: &MergeConfig) -> Result<()> {
    info!("Loading base model from: {}", config.base);
    let mut model = loader::load_base_model(&config.base, config.dtype, &config.device)?;

    info!("Loading LoRA adapter from: {}", config.adapter.display());
    let adapter = adapter::load_adapter(&config.adapter, &config.device)?;

    info!("Merging LoRA weights into base model");
    let merged = merger::merge_adapter(&mut model.tensors, &adapter)?;
    info!("Merged {} LoRA layers into base weights", merged);

    info!("Saving merged model to: {}", config.out.display());
    writer::save_model(&model, &config.out)?;

    Ok(())
}
