use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use grimoire::{
    config::EngineConfig,
    flow::JsonMap,
    host::{builtin::ConsolePlayer, Host},
    Engine, FlowRegistry, GrimoireError, ResumeTicket, RunOutcome,
};
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
enum Commands {
    /// Load and validate flow documents without running them.
    Check(CheckArgs),
    /// Continue a paused invocation from a resume ticket.
    Resume(ResumeArgs),
}

#[derive(Parser)]
struct CheckArgs {
    /// Flow files or directories to validate
    files: Vec<PathBuf>,
}

#[derive(Parser)]
struct ResumeArgs {
    /// Path to a resume ticket written by a paused run
    ticket: PathBuf,

    /// Flow file or directory to load into the registry
    #[arg(short, long, default_value = "flows")]
    flows: PathBuf,

    /// Seed for the built-in collaborators
    #[arg(short, long, default_value_t = 0)]
    seed: u64,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Flow file or directory to load into the registry
    #[arg(short, long, default_value = "flows")]
    flows: PathBuf,

    /// Id of the flow to run (defaults to the first loaded)
    #[arg(long)]
    flow_id: Option<String>,

    /// JSON file with the caller-supplied inputs
    #[arg(short, long)]
    inputs: Option<PathBuf>,

    /// Path to config file
    #[arg(short, long, default_value = "grimoire.json")]
    config: PathBuf,

    /// Seed for the built-in collaborators
    #[arg(short, long, default_value_t = 0)]
    seed: u64,

    /// Where to write the resume ticket if the run pauses
    #[arg(long, default_value = "grimoire-ticket.json")]
    ticket: PathBuf,
}

fn load_config(path: &Path) -> Result<EngineConfig, GrimoireError> {
    if path.exists() {
        EngineConfig::from_file(path)
    } else {
        Ok(EngineConfig::default())
    }
}

fn load_flows(registry: &FlowRegistry, path: &Path) -> Result<Vec<String>, GrimoireError> {
    let mut ids = Vec::new();
    if path.is_dir() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
            .map_err(io_error)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        entries.sort();
        for entry in entries {
            let source = std::fs::read_to_string(&entry).map_err(io_error)?;
            ids.extend(registry.load_str(&source)?);
        }
    } else {
        let source = std::fs::read_to_string(path).map_err(io_error)?;
        ids.extend(registry.load_str(&source)?);
    }
    Ok(ids)
}

fn io_error(e: std::io::Error) -> GrimoireError {
    grimoire::LoadError::Schema {
        message: e.to_string(),
    }
    .into()
}

fn build_engine(
    flows: &Path,
    config: &Path,
    seed: u64,
) -> Result<(Engine, Vec<String>), GrimoireError> {
    let config = load_config(config)?;
    let registry = Arc::new(FlowRegistry::new());
    let ids = load_flows(&registry, flows)?;
    let host = Arc::new(
        Host::builder(seed)
            .player(Arc::new(ConsolePlayer::default()))
            .build(),
    );
    let engine = Engine::new(registry, host, config)?;
    Ok((engine, ids))
}

fn read_inputs(path: Option<&PathBuf>) -> Result<JsonMap, GrimoireError> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(io_error)?;
            serde_json::from_str(&text).map_err(|e| {
                grimoire::LoadError::Schema {
                    message: format!("failed to parse inputs file: {}", e),
                }
                .into()
            })
        }
        None => Ok(JsonMap::new()),
    }
}

fn report_outcome(outcome: RunOutcome, ticket_path: &Path) -> Result<(), GrimoireError> {
    match outcome {
        RunOutcome::Completed(outputs) => {
            let rendered = serde_json::to_string_pretty(&outputs).map_err(|e| {
                grimoire::LoadError::Schema {
                    message: e.to_string(),
                }
            })?;
            println!("{}", rendered);
        }
        RunOutcome::Paused(ticket) => {
            std::fs::write(ticket_path, ticket.to_bytes()?).map_err(io_error)?;
            println!("flow paused; resume ticket written to {}", ticket_path.display());
        }
    }
    Ok(())
}

async fn check(args: &CheckArgs) -> Result<(), GrimoireError> {
    let registry = FlowRegistry::new();
    for file in &args.files {
        let ids = load_flows(&registry, file)?;
        for id in ids {
            println!("ok: {} ({})", id, file.display());
        }
    }
    Ok(())
}

async fn resume(args: &ResumeArgs) -> Result<(), GrimoireError> {
    let (engine, _) = build_engine(&args.flows, Path::new("grimoire.json"), args.seed)?;
    let bytes = std::fs::read(&args.ticket).map_err(io_error)?;
    let ticket = ResumeTicket::from_bytes(&bytes)?;
    info!("resuming flow from {}", args.ticket.display());
    let outcome = engine.resume(ticket).await?;
    report_outcome(outcome, &args.ticket)
}

async fn run(cli: &Cli) -> Result<(), GrimoireError> {
    match &cli.command {
        Some(Commands::Check(args)) => check(args).await,
        Some(Commands::Resume(args)) => resume(args).await,
        None => {
            let (engine, ids) = build_engine(&cli.flows, &cli.config, cli.seed)?;
            let flow_id = match &cli.flow_id {
                Some(id) => id.clone(),
                None => ids.first().cloned().ok_or_else(|| {
                    GrimoireError::from(grimoire::LoadError::Schema {
                        message: format!("no flows found under {}", cli.flows.display()),
                    })
                })?,
            };
            let inputs = read_inputs(cli.inputs.as_ref())?;

            debug!(flow_id = %flow_id, "starting flow");
            let outcome = engine.run(&flow_id, inputs).await?;
            report_outcome(outcome, &cli.ticket)
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
