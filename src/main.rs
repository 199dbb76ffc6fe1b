use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{error, info};

use swarm_kb::config::LoggingConfig;
use swarm_kb::transport::{HttpTransport, TaskEnvelope, Transport, TASK_TOPIC};
use swarm_kb::{handler, logging, NodeId, Swarm, SwarmConfig, TaskOptions};

#[derive(Parser)]
#[command(name = "swarm-kb", version, about = "Cluster task scheduler node")]
struct Cli {
    /// Configuration file, created with defaults when missing. Defaults to
    /// swarm-kb/config.yml under the user config directory
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until interrupted
    Start {
        /// Message server port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run a task on a node and print its result
    Exec {
        /// Target node, HOST or HOST:PORT
        #[arg(short, long)]
        node: String,
        task: String,
        /// Arguments, parsed as JSON when possible
        args: Vec<String>,
    },
    /// Print the effective configuration
    Config {
        /// Write it to this file instead
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(SwarmConfig::default_path)
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn run_node(config: SwarmConfig) -> anyhow::Result<i32> {
    let _log_guard = logging::init(&config.logging)?;

    let swarm = Swarm::builder(config)
        .on_ready(|nodes| info!(members = nodes.len(), "Cluster ready"))
        .on_error(|e| error!("Cluster error: {}", e))
        .build()?;

    swarm.tasks().register(
        "echo",
        handler(|args: Vec<Value>| async move { Ok::<_, anyhow::Error>(Value::Array(args)) }),
        TaskOptions::new().serialized(false),
    )?;

    // Setup Ctrl+C handler
    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    ctrlc::set_handler(move || {
        let _ = tx.blocking_send(());
    })
    .context("Error setting Ctrl-C handler")?;

    swarm.start().await?;

    let code = tokio::select! {
        _ = rx.recv() => {
            info!("Interrupted, shutting down");
            0
        }
        _ = swarm.terminated() => {
            error!("Node removed from the cluster, exiting");
            1
        }
    };
    swarm.shutdown().await;
    Ok(code)
}

async fn exec_remote(
    config: SwarmConfig,
    node: String,
    task: String,
    args: Vec<String>,
) -> anyhow::Result<()> {
    let transport = Arc::new(HttpTransport::new(config.transport)?);
    let envelope = TaskEnvelope {
        task,
        args: args.iter().map(|a| parse_arg(a)).collect(),
    };
    let response = transport
        .send(&NodeId::from(node), TASK_TOPIC, serde_json::to_value(&envelope)?)
        .await?;
    match response {
        Some(Value::String(text)) => println!("{}", text),
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => {}
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = SwarmConfig::load(&config_path(&cli))?;
    config.apply_env()?;

    match cli.command {
        Commands::Start { port } => {
            if let Some(port) = port {
                config.transport.port = port;
            }
            run_node(config).await
        }
        Commands::Exec { node, task, args } => {
            let _log_guard = logging::init(&LoggingConfig {
                level: "warn".to_string(),
                directory: None,
                ..LoggingConfig::default()
            })?;
            exec_remote(config, node, task, args).await?;
            Ok(0)
        }
        Commands::Config { write } => {
            match write {
                Some(path) => {
                    config.save(&path)?;
                    println!("Configuration written to {}", path.display());
                }
                None => print!("{}", serde_yaml::to_string(&config)?),
            }
            Ok(0)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            process::exit(1);
        }
    }
}
