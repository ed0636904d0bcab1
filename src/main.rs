// src/main.rs - Command line runner
use anyhow::{bail, Context};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use vesta::project::ProjectConfig;
use vesta::protocols::{CipSession, Controller, Simulator};
use vesta::scheduler::Scheduler;
use vesta::{Config, Engine, PlcClient, RunStatus, TagTable};

#[derive(Parser)]
#[command(author, version, about = "Run a VESTA test project against a controller", long_about = None)]
struct Args {
    /// Project file (.yaml, .yml or .json)
    project: PathBuf,

    /// Runtime configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Controller IPv4 address, overrides the configuration
    #[arg(short, long)]
    address: Option<String>,

    /// Backplane slot of the processor
    #[arg(short, long)]
    slot: Option<u8>,

    /// Run against the in-memory simulator instead of a controller
    #[arg(long)]
    simulate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    vesta::init();

    info!("VESTA v{} starting", vesta::VERSION);

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(address) = args.address {
        config.connection.address = Some(address);
    }
    if let Some(slot) = args.slot {
        config.connection.slot = slot;
    }
    config.validate()?;

    let project = ProjectConfig::from_file(&args.project)
        .with_context(|| format!("loading project {}", args.project.display()))?;
    info!(
        "Loaded project '{}': {} tags, {} sets",
        project.name,
        project.tags.len(),
        project.action_sets.len()
    );

    let (controller, address): (Arc<dyn Controller>, String) = if args.simulate {
        (Arc::new(Simulator::new()), "127.0.0.1".to_string())
    } else {
        let Some(address) = config.connection.address.clone() else {
            bail!("no controller address given; use --address or connection.address");
        };
        (Arc::new(CipSession::from_config(&config.connection)), address)
    };

    let tags = TagTable::from_configs(&project.tags)?;
    let client = PlcClient::new(controller, Scheduler::new(&config.scheduler), tags);
    client
        .open(&address, config.connection.slot, config.connection.timeout())
        .await
        .with_context(|| format!("connecting to {}", address))?;
    if let Some(identity) = client.identity() {
        info!(
            "Connected to '{}' rev {} over {}",
            identity.name,
            identity.version,
            client.protocol_name()
        );
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(result) = rx.recv().await {
            match serde_json::to_string(&result) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Could not serialize result: {}", e),
            }
        }
    });

    let engine = Engine::new(project, client.clone(), config.engine.clone());
    let abort = engine.abort_handle();
    let outcome = {
        let run = engine.run(Some(tx));
        tokio::pin!(run);

        tokio::select! {
            res = &mut run => res,
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                abort.abort();
                (&mut run).await
            }
        }
    };
    if printer.await.is_err() {
        warn!("Result printer stopped unexpectedly");
    }

    if let Err(e) = client.close().await {
        warn!("Closing the session failed: {}", e);
    }

    match outcome {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.status != RunStatus::Passed {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(e) => {
            error!("Run terminated: {}", e);
            Err(e.into())
        }
    }
}
