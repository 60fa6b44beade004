//! The binary entrypoint for `kiln`, the build-engine core.
//!
//! The engine itself is a library; this binary loads a configuration file,
//! applies `/name[:value]` overrides, and reports the resolved
//! configuration. Errors stream to stderr and flip the exit code.

use clap::{Parser, crate_version};
use color_eyre::Result;
use tracing_subscriber::util::SubscriberInitExt;

// Since this is a binary crate, nothing here should be `pub` so that dead
// code warnings stay accurate.
mod log;

use kiln::{config::EngineConfig, path::PathTable};

#[derive(Clone, Debug, Parser)]
#[command(
    name = "kiln",
    about = "Scheduling and caching core for content-addressed builds",
    version = crate_version!(),
)]
struct TopLevelFlags {
    /// Path to the engine configuration file.
    config: String,

    /// Overrides of the form `/name[:value]`; booleans accept `+`/`-`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    overrides: Vec<String>,

    /// When to colorize output.
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto)]
    color: log::WhenColor,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let flags = TopLevelFlags::parse();
    log::make_logger(std::io::stderr, flags.color)?.init();

    let mut config = EngineConfig::load(&flags.config)?;
    for raw in &flags.overrides {
        config.apply_override(raw)?;
    }
    config.validate()?;

    let paths = PathTable::new();
    let mounts = config.materialize_mounts(&paths)?;

    println!("configuration: {}", flags.config);
    println!("filesystem mode: {}", config.filesystem_mode);
    println!("unsafe options: {}", config.unsafe_options_tag());
    println!(
        "slots: process={} cacheLookup={} materialize={} ipc={} light={}",
        config.effective_process_slots(),
        config.effective_cache_lookup_slots(),
        config.effective_materialize_input_slots(),
        config.effective_ipc_slots(),
        config.effective_light_slots(),
    );
    for mount in mounts.mounts() {
        println!(
            "mount {}: {} (readable={} writable={} hashable={})",
            mount.name,
            paths.expand(mount.root),
            mount.readable,
            mount.writable,
            mount.hashable,
        );
    }
    Ok(())
}
