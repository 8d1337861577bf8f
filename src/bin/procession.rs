use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use procession::compiler::{Compiler, load_process_from_yaml};
use procession::runtime::history::HistoryLevel;
use procession::{EngineConfig, ProcessEngine};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a process file and report problems without running it
    Validate {
        /// Path to the process YAML file
        #[arg(long, short)]
        file: PathBuf,
    },

    /// Run a process in memory until it ends
    Run {
        /// Path to the process YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Initial variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, serde_json::Value)>,

        /// Engine configuration YAML file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Give up when the instance has not ended after this many milliseconds
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
    },
}

fn parse_key_val(s: &str) -> Result<(String, serde_json::Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // JSON first, plain string otherwise
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| serde_json::Value::String(val_str.to_string()));
    Ok((key, val))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            let definition = load_process_from_yaml(&file)?;
            let graph = Compiler::new().compile(definition)?;
            info!(process = %graph.key, nodes = graph.nodes.len(), flows = graph.flows.len(), "Process is valid");
        }

        Commands::Run {
            file,
            vars,
            config,
            timeout_ms,
        } => {
            let mut config = match config {
                Some(path) => EngineConfig::from_yaml_file(&path.to_string_lossy())?,
                None => EngineConfig::default(),
            };
            // final variables are only kept in full history
            config.history_level = HistoryLevel::Full;
            let poll_interval = config.job_executor.poll_interval();
            let engine = ProcessEngine::new(config);

            let definition = load_process_from_yaml(&file)?;
            let graph = engine.deploy(definition).await?;
            let initial_vars: HashMap<_, _> = vars.into_iter().collect();
            let instance_id = engine.start_process_instance_by_key(&graph.key, initial_vars).await?;
            info!(instance_id = %instance_id, process = %graph.key, "Process instance started");

            let drive = async {
                while engine.process_instance_exists(instance_id).await {
                    engine.run_due_jobs().await;
                    tokio::time::sleep(poll_interval).await;
                }
            };
            if tokio::time::timeout(Duration::from_millis(timeout_ms), drive).await.is_err() {
                let waiting = engine.active_activity_ids(instance_id).await;
                warn!(instance_id = %instance_id, ?waiting, "Process instance did not end in time");
                return Err(anyhow!("process instance {} still waiting in {:?}", instance_id, waiting));
            }

            let historic = engine
                .historic_process_instance(instance_id)
                .await
                .ok_or_else(|| anyhow!("no history for process instance {}", instance_id))?;
            info!(
                instance_id = %instance_id,
                end_activity = historic.end_activity_id.as_deref().unwrap_or("-"),
                "Process instance finished"
            );
            println!("{}", serde_json::to_string_pretty(&historic.variables)?);
        }
    }

    Ok(())
}
