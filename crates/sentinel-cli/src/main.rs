use std::sync::Arc;

use clap::Parser;
use sentinel_core::config::Config;
use sentinel_core::events::InProcessBus;
use sentinel_core::store::MemoryStore;
use sentinel_core::Engine;
use tracing::{error, info};

/// Operator demo harness for the sentinel-core engine: registers the
/// targets named on the command line, starts active probing if
/// configured, and then accepts line-oriented commands on stdin to feed
/// in passive observations and inspect verdicts.
#[derive(Parser, Debug)]
#[command(name = "sentinel-cli", about = "Drive a sentinel-core Engine from a config file and stdin")]
struct Args {
    /// Path to a TOML config file (see sentinel_core::config::Config).
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Engine instance name; required unless set in --config.
    #[arg(long, default_value = "sentinel-cli")]
    name: String,

    /// Shared-store namespace; required unless set in --config.
    #[arg(long, default_value = "sentinel-cli")]
    shm_name: String,

    /// `ip:port` pairs to register before reading stdin commands.
    #[arg(long = "target", value_name = "IP:PORT")]
    targets: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
                error!("failed to read config file {:?}: {}", path, e);
                e
            })?;
            toml::from_str(&raw)?
        }
        None => Config::new(args.name.clone(), args.shm_name.clone()),
    };
    config.validate()?;

    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(InProcessBus::default());
    let engine = Engine::new(config, store.clone(), store, bus)?;

    for spec in &args.targets {
        let (ip, port) = parse_addr(spec)?;
        engine.add_target(&ip, port, None, None, None).await?;
        info!(ip, port, "registered target");
    }

    engine.start()?;
    info!("scheduler started, reading commands from stdin (try: help)");

    run_command_loop(&engine).await;

    engine.stop();
    Ok(())
}

fn parse_addr(spec: &str) -> anyhow::Result<(String, u16)> {
    let (ip, port) = spec
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("expected ip:port, got {spec:?}"))?;
    Ok((ip.to_string(), port.parse()?))
}

async fn run_command_loop(engine: &Arc<Engine>) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let stdin = tokio::io::stdin();
    let mut lines = BufReader::new(stdin).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("stdin read error: {e}");
                break;
            }
        };

        let words: Vec<&str> = line.split_whitespace().collect();
        match words.as_slice() {
            ["quit"] | ["exit"] => break,
            ["success", addr] => {
                if let Ok((ip, port)) = parse_addr(addr) {
                    dispatch(engine.report_success(&ip, port, None)).await;
                }
            }
            ["failure", addr] => {
                if let Ok((ip, port)) = parse_addr(addr) {
                    dispatch(engine.report_failure(&ip, port, None)).await;
                }
            }
            ["timeout", addr] => {
                if let Ok((ip, port)) = parse_addr(addr) {
                    dispatch(engine.report_timeout(&ip, port, None)).await;
                }
            }
            ["status", addr] => {
                let Ok((ip, port)) = parse_addr(addr) else {
                    println!("bad address: {addr}");
                    continue;
                };
                match engine.get_target_status(&ip, port, None).await {
                    Some(healthy) => println!("{addr}: {}", if healthy { "healthy" } else { "unhealthy" }),
                    None => println!("{addr}: unknown"),
                }
            }
            ["add", addr] => {
                if let Ok((ip, port)) = parse_addr(addr) {
                    dispatch(engine.add_target(&ip, port, None, None, None)).await;
                }
            }
            ["remove", addr] => {
                if let Ok((ip, port)) = parse_addr(addr) {
                    dispatch(engine.remove_target(&ip, port, None)).await;
                }
            }
            ["help"] | [] => {
                println!("commands: add <ip:port> | remove <ip:port> | success <ip:port> | failure <ip:port> | timeout <ip:port> | status <ip:port> | quit");
            }
            _ => println!("unrecognized command: {line}"),
        }
    }
}

async fn dispatch(result: sentinel_core::Result<()>) {
    if let Err(e) = result {
        error!("command failed: {e}");
    }
}
