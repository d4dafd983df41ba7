//! Logging setup for the lora-merge binary

use anyhow::Result;
use std::io::{self, IsTerminal};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize tracing output. Logs go to stderr so stdout stays reserved for
/// the final confirmation line. `RUST_LOG` overrides the verbosity flags.
pub fn init_logging(verbosity: u8, quiet: bool) -> Result<()> {
    let default_directive = if quiet {
        "error"
    } else {
        match verbosity {
            0 => "lora_merge=info,warn",
            1 => "lora_merge=debug,info",
            _ => "trace",
        }
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_ansi(io::stderr().is_terminal())
        .with_writer(io::stderr)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(fmt_layer).init();

    Ok(())
}
