use agent_bridge::bridge::{
    BridgeCache, BridgeEvent, HostFunction, HostFunctionSchema, HostInstaller, HostParam,
    ParamType,
};
use agent_bridge::cli::{Cli, Command};
use agent_bridge::config::Settings;
use agent_bridge::domain::ThreadKey;
use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    debug!(config = %cli.config.display(), "Settings loaded");

    match cli.command {
        Command::Config => {
            print!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Run {
            script,
            engine,
            timeout_ms,
            thread,
        } => {
            if let Some(engine) = engine {
                settings.bridge.engine = engine;
            }
            if let Some(timeout_ms) = timeout_ms {
                settings.bridge.timeout_ms = timeout_ms;
            }
            settings.validate()?;

            let code = tokio::fs::read_to_string(&script)
                .await
                .with_context(|| format!("failed to read {}", script.display()))?;
            run_script(&settings, &thread, &code).await
        }
    }
}

async fn run_script(settings: &Settings, thread: &str, code: &str) -> anyhow::Result<()> {
    let cache = BridgeCache::with_installer(
        settings.bridge_config(),
        settings.platform_constraints(),
        builtin_functions(),
    );
    let key = ThreadKey::new(settings.runtime.server_id.clone(), "cli", thread);
    let bridge = cache.acquire(&key).await?;
    info!(thread_id = %key, engine = %settings.bridge.engine, "Running script");

    let mut events = bridge.execute(code);
    let mut failed = false;
    while let Some(event) = events.next().await {
        failed |= matches!(event, BridgeEvent::RunError { .. });
        println!("{}", serde_json::to_string(&event)?);
    }
    drop(bridge);
    cache.clear();

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Host functions every CLI interpreter gets
fn builtin_functions() -> HostInstaller {
    Arc::new(|_key: &ThreadKey| {
        let now = HostFunction::from_fn(
            HostFunctionSchema::new("now", "Current local time as HH:MM:SS"),
            |_| async { Ok(Value::String(chrono::Local::now().format("%H:%M:%S").to_string())) },
        );
        let sleep = HostFunction::from_fn(
            HostFunctionSchema::new("sleep_ms", "Suspend the script for a number of milliseconds")
                .param(HostParam::required("ms", ParamType::Integer)),
            |args| async move {
                let ms = args.get("ms").and_then(Value::as_u64).unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Value::Null)
            },
        );
        vec![now, sleep]
    })
}
