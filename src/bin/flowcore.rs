use anyhow::Result;
use clap::{Parser, Subcommand};
use flowcore::definition::ProcessDefinition;
use flowcore::definition::loader::load_model_from_yaml;
use flowcore::runtime::engine::Engine;
use flowcore::runtime::instance::InstanceStatus;
use flowcore::runtime::redis_storage::RedisSnapshotStore;
use flowcore::runtime::scheduler::{Scheduler, SchedulerConfig};
use flowcore::tasks::builtin::{LogTask, SetTask};
use flowcore::tasks::http::HttpTask;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a process definition without running it
    Validate {
        /// Path to the process YAML file
        #[arg(long, short)]
        file: PathBuf,
    },

    /// Run a process instance to completion in memory
    Run {
        /// Path to the process YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Initial variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, serde_json::Value)>,

        /// Persist snapshots to this Redis URL
        #[arg(long)]
        redis: Option<String>,
    },
}

fn parse_key_val(s: &str) -> Result<(String, serde_json::Value), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // Try parsing as JSON, otherwise treat as string
    let val = serde_json::from_str(val_str)
        .unwrap_or_else(|_| serde_json::Value::String(val_str.to_string()));
    Ok((key, val))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            let model = load_model_from_yaml(&file)?;
            let def = ProcessDefinition::parse(model)?;
            info!(definition_id = %def.id, version = def.version, nodes = def.nodes().len(), "definition is valid");
            println!("{} v{}: ok", def.id, def.version);
        }

        Commands::Run { file, vars, redis } => {
            let (scheduler, events) = Scheduler::new(SchedulerConfig::default());
            scheduler.register_task(Arc::new(LogTask));
            scheduler.register_task(Arc::new(SetTask));
            scheduler.register_task(Arc::new(HttpTask::new()));

            let mut engine = Engine::new(scheduler.clone());
            if let Some(url) = redis {
                let client = redis::Client::open(url)?;
                engine = engine.with_store(Arc::new(RedisSnapshotStore::new(client)));
            }
            let engine = Arc::new(engine);

            tokio::spawn(scheduler.clone().run());
            let pump = engine.clone();
            tokio::spawn(async move { pump.run_events(events).await });

            let model = load_model_from_yaml(&file)?;
            let def = engine.register_model(model)?;

            let initial_vars: HashMap<_, _> = vars.into_iter().collect();
            let instance_id = engine.start_instance(&def.id, initial_vars).await?;
            info!(%instance_id, "instance started");

            // Poll until the instance settles.
            let snapshot = loop {
                let snapshot = engine.snapshot(instance_id).await?;
                match snapshot.status {
                    InstanceStatus::Running | InstanceStatus::Suspended => {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    _ => break snapshot,
                }
            };

            info!(%instance_id, status = ?snapshot.status, "instance settled");
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    Ok(())
}
