use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::bridge::EngineKind;

/// Run scripts through the interpreter bridge and inspect settings
#[derive(Parser, Debug, Clone)]
#[command(name = "agent-bridge", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "AGENT_BRIDGE_CONFIG", default_value = "agent-bridge.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Execute a script and print its events as JSON lines
    Run {
        /// Script file
        script: PathBuf,

        /// Interpreter, overriding `bridge.engine`
        #[arg(short, long)]
        engine: Option<EngineKind>,

        /// Execution timeout in milliseconds, overriding `bridge.timeout_ms`
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Thread the interpreter belongs to
        #[arg(long, default_value = "cli")]
        thread: String,
    },
    /// Print the effective settings as TOML
    Config,
}
