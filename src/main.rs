// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod demo;
mod fleet;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, EvalCommands};
use demo::DemoGenerator;
use maice_backend::ChatRequest;
use maice_eval::Evaluator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Arc::new(maice_config::load(cli.config.as_deref())?);

    match cli.command {
        Commands::ShowConfig => {
            println!("{}", serde_yaml::to_string(config.as_ref())?);
            Ok(())
        }
        Commands::Serve => serve(config).await,
        Commands::Chat {
            message,
            user,
            session,
        } => chat(config, &user, session, &message).await,
        Commands::Eval { command } => eval(config, command).await,
        Commands::Status => status(config).await,
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn serve(config: Arc<maice_config::Config>) -> anyhow::Result<()> {
    let fleet = fleet::start(config, Arc::new(DemoGenerator));
    println!("maice fleet running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    fleet.shutdown().await;
    Ok(())
}

async fn chat(
    config: Arc<maice_config::Config>,
    user: &str,
    session: Option<maice_types::SessionId>,
    message: &str,
) -> anyhow::Result<()> {
    let fleet = fleet::start(config, Arc::new(DemoGenerator));
    let outcome = fleet
        .service
        .chat(
            user,
            ChatRequest {
                session_id: session,
                message: message.to_string(),
                image: None,
            },
        )
        .await?;

    let mut events = outcome.events;
    while let Some(ev) = events.recv().await {
        println!("{}", serde_json::to_string(&ev)?);
        if ev.is_terminal() {
            break;
        }
    }
    fleet.shutdown().await;
    Ok(())
}

async fn eval(config: Arc<maice_config::Config>, command: EvalCommands) -> anyhow::Result<()> {
    let fleet = fleet::start(config.clone(), Arc::new(DemoGenerator));
    let evaluator = Evaluator::new(fleet.store.clone(), Arc::new(DemoGenerator), &config.eval);

    match command {
        EvalCommands::Session { id } => {
            let record = evaluator.evaluate_session(id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        EvalCommands::Batch { ids } => {
            let report = evaluator.evaluate_batch(ids).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        EvalCommands::All { only_unevaluated } => {
            let report = evaluator.evaluate_all(only_unevaluated).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    fleet.shutdown().await;
    Ok(())
}

async fn status(config: Arc<maice_config::Config>) -> anyhow::Result<()> {
    let fleet = fleet::start(config, Arc::new(DemoGenerator));
    // Give the sidecars one heartbeat cycle before reading.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let status = fleet.service.monitoring().agents_status().await?;
    println!("{:<14} {:<8} {:<26} metrics", "agent", "alive", "last update");
    for entry in status {
        println!(
            "{:<14} {:<8} {:<26} {}",
            entry.agent_name,
            entry.is_alive,
            entry
                .last_update
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into()),
            entry.metrics_count
        );
    }
    fleet.shutdown().await;
    Ok(())
}
