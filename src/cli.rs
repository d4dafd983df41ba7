//! Command-line interface for lora-merge

use crate::error::Result;
use crate::MergeConfig;
use candle_core::{DType, Device};
use clap::{ArgAction, Parser, ValueEnum};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "lora-merge",
    version,
    about = "Merge a PEFT LoRA adapter into a base model",
    long_about = "Loads a base model and a PEFT LoRA adapter, folds the adapter's low-rank \
                  deltas into the base weights, and writes a standalone merged checkpoint \
                  (safetensors) plus tokenizer artifacts to the output directory."
)]
pub struct Cli {
    /// Base model name or path (e.g., 'Qwen/Qwen2.5-7B-Instruct' or a local directory)
    #[arg(long)]
    pub base: String,

    /// LoRA adapter directory (PEFT layout: adapter_config.json + adapter_model.safetensors)
    #[arg(long)]
    pub adapter: PathBuf,

    /// Output directory for the merged model
    #[arg(long)]
    pub out: PathBuf,

    /// Numeric precision for loaded weights
    #[arg(long, value_enum, default_value_t = DtypeArg::Bfloat16)]
    pub dtype: DtypeArg,

    /// Device to hold the weights during the merge
    #[arg(long, value_enum, default_value_t = DeviceArg::Auto)]
    pub device: DeviceArg,

    /// Set the verbosity level (can be repeated for more verbose output)
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Silence all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

/// Weight precision selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DtypeArg {
    #[value(name = "float16")]
    Float16,
    #[value(name = "bfloat16")]
    Bfloat16,
    #[value(name = "float32")]
    Float32,
}

impl DtypeArg {
    /// Map to the candle dtype
    pub fn to_dtype(self) -> DType {
        match self {
            DtypeArg::Float16 => DType::F16,
            DtypeArg::Bfloat16 => DType::BF16,
            DtypeArg::Float32 => DType::F32,
        }
    }
}

/// Compute device selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceArg {
    #[value(name = "auto")]
    Auto,
    #[value(name = "cpu")]
    Cpu,
    #[value(name = "cuda")]
    Cuda,
}

impl DeviceArg {
    /// Resolve to a concrete device. `auto` probes CUDA and falls back to CPU;
    /// an explicit `cuda` request also falls back (with a warning) when no
    /// device is available.
    pub fn resolve(self) -> Result<Device> {
        match self {
            DeviceArg::Cpu => {
                info!("Using CPU device");
                Ok(Device::Cpu)
            }
            DeviceArg::Cuda => match Device::new_cuda(0) {
                Ok(device) => {
                    info!("Using CUDA device 0");
                    Ok(device)
                }
                Err(e) => {
                    warn!("CUDA requested but not available: {}", e);
                    info!("Falling back to CPU");
                    Ok(Device::Cpu)
                }
            },
            DeviceArg::Auto => match Device::cuda_if_available(0) {
                Ok(device) => {
                    if device.is_cuda() {
                        info!("Auto-detected CUDA device");
                    } else {
                        info!("Auto-detected CPU device (CUDA not available)");
                    }
                    Ok(device)
                }
                Err(_) => Ok(Device::Cpu),
            },
        }
    }
}

impl Cli {
    /// Resolve parsed arguments into an immutable run configuration.
    pub fn into_config(self) -> Result<MergeConfig> {
        let device = self.device.resolve()?;
        Ok(MergeConfig {
            base: self.base,
            adapter: self.adapter,
            out: self.out,
            dtype: self.dtype.to_dtype(),
            device,
        })
    }
}
