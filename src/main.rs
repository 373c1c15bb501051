//! wxbridge CLI entry point.
//!
//! Provides `detect`, `call`, and `repl` subcommands for checking runtime
//! selection, sending a single command, or driving the automation script
//! interactively.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use wxbridge::config::{load_runtime_override, BridgeConfig};
use wxbridge::runtime::version::CompatibilityPolicy;
use wxbridge::runtime::{RuntimeCandidate, RuntimeSelector, SystemProbe};
use wxbridge::{Bridge, BridgeEvent};

/// wxbridge: supervised bridge to the WeChat automation script.
#[derive(Parser)]
#[command(name = "wxbridge", version, about)]
struct Cli {
    /// Config file (default: `$WXBRIDGE_CONFIG_PATH` or `~/.wxbridge/bridge.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Print the runtime that would be selected.
    Detect,
    /// Start the script, send one command, print its payload, and shut down.
    Call {
        /// Command name understood by the script.
        command: String,
        /// Command parameters as a JSON object.
        #[arg(long)]
        params: Option<String>,
    },
    /// Start the script and read `command [json]` lines from stdin.
    Repl,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    wxbridge::logging::init_cli();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Detect => handle_detect(config).await,
        Command::Call { command, params } => handle_call(config, &command, params.as_deref()).await,
        Command::Repl => handle_repl(config).await,
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<BridgeConfig> {
    match path {
        Some(path) => {
            let mut config = BridgeConfig::load_from(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            config.apply_overrides(|key| std::env::var(key).ok());
            Ok(config)
        }
        None => BridgeConfig::load().context("failed to load configuration"),
    }
}

/// Run runtime selection only.
async fn handle_detect(config: BridgeConfig) -> anyhow::Result<()> {
    let override_path = config
        .override_file()
        .and_then(|path| load_runtime_override(&path))
        .map(|o| o.python_path);
    let selector = RuntimeSelector::new(
        RuntimeCandidate::ranked(&config.runtime.candidates),
        override_path,
        CompatibilityPolicy::from(&config.runtime.policy),
        Arc::new(SystemProbe::new(Duration::from_secs(
            config.runtime.probe_timeout_secs,
        ))),
    );

    let runtime = selector.detect().await?;
    println!("candidate:     {}", runtime.candidate.id);
    println!("version:       {}", runtime.version);
    println!("compatibility: {:?}", runtime.compatibility);
    println!("invocation:    {}", runtime.invocation);
    println!("script:        {}", config.launch.resolve_script().display());
    println!("work dir:      {}", config.launch.resolve_work_dir().display());
    Ok(())
}

fn parse_params(raw: Option<&str>) -> anyhow::Result<serde_json::Value> {
    match raw {
        Some(text) if !text.trim().is_empty() => {
            serde_json::from_str(text).with_context(|| format!("invalid JSON params: {text}"))
        }
        _ => Ok(serde_json::Value::Null),
    }
}

/// Start the bridge or fail with its report message.
async fn start(config: BridgeConfig) -> anyhow::Result<Bridge> {
    let bridge = Bridge::new(config);
    let report = bridge.initialize().await;
    if !report.success {
        anyhow::bail!("initialization failed: {}", report.message);
    }
    info!(message = %report.message, "bridge initialized");
    Ok(bridge)
}

/// Send a single command and print the payload as JSON.
async fn handle_call(
    config: BridgeConfig,
    command: &str,
    params: Option<&str>,
) -> anyhow::Result<()> {
    let params = parse_params(params)?;
    let bridge = start(config).await?;

    let result = tokio::select! {
        result = bridge.send(command, params) => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };
    bridge.cleanup().await;

    let payload = result?;
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

/// Interactive loop: one command per stdin line, events printed as they arrive.
async fn handle_repl(config: BridgeConfig) -> anyhow::Result<()> {
    let bridge = start(config).await?;

    let mut events = bridge.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(BridgeEvent::Automation { payload, received_at }) => {
                    println!("EVENT {} {payload}", received_at.to_rfc3339());
                }
                Ok(BridgeEvent::StateChanged(state)) => {
                    eprintln!("-- state: {state}");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event printer fell behind");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, raw_params) = match line.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, Some(rest)),
            None => (line, None),
        };
        let params = match parse_params(raw_params) {
            Ok(params) => params,
            Err(e) => {
                eprintln!("error: {e:#}");
                continue;
            }
        };
        tokio::select! {
            result = bridge.send(command, params) => match result {
                Ok(payload) => println!("{payload}"),
                Err(e) => eprintln!("error: {e}"),
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted");
                break;
            }
        }
    }

    bridge.cleanup().await;
    printer.abort();
    Ok(())
}
