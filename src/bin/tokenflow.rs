use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokenflow::definition::loader::load_process_from_yaml;
use tokenflow::runtime::{EngineEvent, ProcessEngine, ProcessEventListener};
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a process definition file until it completes or parks
    Run {
        /// Path to the process YAML file
        file: PathBuf,
        /// Initial variables, as name=json pairs
        #[arg(short = 'D', long = "define", value_parser = parse_var)]
        vars: Vec<(String, Value)>,
        /// Auto-trigger wait states until the instance completes
        #[arg(long)]
        auto_complete: bool,
    },
    /// Parse and validate a process definition file
    Validate {
        /// Path to the process YAML file
        file: PathBuf,
    },
}

fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))?;
    let value = serde_json::from_str(value).unwrap_or(Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

struct StdoutListener;

#[async_trait::async_trait]
impl ProcessEventListener for StdoutListener {
    async fn on_event(&self, instance_id: Uuid, event: &EngineEvent) {
        match serde_json::to_string(event) {
            Ok(json) => println!("{instance_id} {json}"),
            Err(err) => tracing::warn!(%err, "failed to serialize event"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            file,
            vars,
            auto_complete,
        } => run(file, vars, auto_complete).await,
        Commands::Validate { file } => {
            let definition = load_process_from_yaml(&file)?;
            info!(
                definition = %definition.id,
                activities = definition.activity_count(),
                "definition is valid"
            );
            Ok(())
        }
    }
}

async fn run(file: PathBuf, vars: Vec<(String, Value)>, auto_complete: bool) -> anyhow::Result<()> {
    let definition = load_process_from_yaml(&file)?;
    let definition_id = definition.id.clone();
    info!(definition = %definition_id, "loaded process definition");

    let mut engine = ProcessEngine::new();
    engine.add_listener(Arc::new(StdoutListener));
    engine.register_definition(definition);

    let initial: HashMap<String, Value> = vars.into_iter().collect();
    let instance_id = engine.start_process(&definition_id, initial).await?;
    info!(instance_id = %instance_id, "started process instance");

    if auto_complete {
        while !engine.is_ended(instance_id)? {
            let waiting = engine.waiting_executions(instance_id)?;
            let Some((execution, activity)) = waiting.into_iter().next() else {
                break;
            };
            info!(%execution, activity = %activity, "auto-triggering wait state");
            engine.trigger(instance_id, execution, HashMap::new()).await?;
        }
    }

    if engine.is_ended(instance_id)? {
        info!(instance_id = %instance_id, "process instance completed");
    } else {
        let waiting = engine.waiting_executions(instance_id)?;
        info!(
            instance_id = %instance_id,
            waiting = waiting.len(),
            "process instance parked at wait states"
        );
    }
    engine.close();
    Ok(())
}
