//! Companion - Main entry point
//!
//! `companion run` hosts the session manager and the update controller;
//! the other subcommands are maintenance tools.

use anyhow::{Context, Result};
use clap::Parser;
use companion_lib::engine::{
    cli::output::{format_duration, or_dash, Printer},
    cli::{Cli, Commands, OutputFormat, UpdateAction, VaultAction},
    config::Config,
    crypto::MasterKey,
    logging,
    session::{self, CredentialBlob, SessionManager},
    updater::{DeploymentState, UpdateController},
    vault::SessionVault,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    if let Err(e) = run_cli(cli).await {
        Printer::error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run_cli(cli: Cli) -> Result<()> {
    let json = cli.format == OutputFormat::Json;

    match cli.command {
        Commands::Run => cmd_run().await,
        Commands::Keygen => cmd_keygen(json),
        Commands::Vault { action: VaultAction::Verify } => cmd_vault_verify(json),
        Commands::Update { action } => match action {
            UpdateAction::Check => cmd_update_check(json).await,
            UpdateAction::Status => cmd_update_status(json),
        },
    }
}

fn load_config() -> Result<Config> {
    Config::from_env().context("Invalid configuration")
}

async fn cmd_run() -> Result<()> {
    let config = load_config()?;

    let vault = Arc::new(SessionVault::new(
        config.vault_path.clone(),
        Arc::clone(&config.master_key),
    ));
    let sessions = Arc::new(SessionManager::new(vault));
    let restored = sessions
        .restore()
        .context("Saved session could not be opened; refusing to start")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The messaging client attaches through this queue and the restored blob
    let (client_events, events_rx) = session::event_channel();
    tracing::info!(session_restored = restored.is_some(), "session manager started");

    let session_task = {
        let sessions = Arc::clone(&sessions);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { sessions.run(events_rx, shutdown).await })
    };

    let update_task = if config.updater.enabled {
        let controller = Arc::new(
            UpdateController::from_config(config.updater.clone(), shutdown_rx.clone())
                .context("Failed to start update controller")?,
        );
        Some(tokio::spawn(async move { controller.run().await }))
    } else {
        tracing::info!("self-update disabled");
        None
    };

    shutdown_signal().await?;
    tracing::info!("shutdown requested");
    let _ = shutdown_tx.send(true);
    drop(client_events);

    if let Some(task) = update_task {
        task.await.context("Update controller task failed")?;
    }
    session_task.await.context("Session task failed")?;

    tracing::info!("companion stopped");
    Ok(())
}

fn cmd_keygen(json: bool) -> Result<()> {
    let key = MasterKey::generate().to_base64();
    if json {
        println!("{}", serde_json::json!({ "encryption_key": key }));
    } else {
        println!("{}", key);
    }
    Ok(())
}

fn cmd_vault_verify(json: bool) -> Result<()> {
    let config = load_config()?;
    let vault = SessionVault::new(config.vault_path.clone(), Arc::clone(&config.master_key));

    let blob = vault
        .load::<CredentialBlob>()
        .with_context(|| format!("Vault at {} failed verification", vault.path().display()))?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "path": vault.path().display().to_string(),
                "present": blob.is_some(),
                "valid": true,
            })
        );
    } else if blob.is_some() {
        Printer::success(&format!("Vault OK: {}", vault.path().display()));
    } else {
        Printer::info(&format!("No vault at {}", vault.path().display()));
    }
    Ok(())
}

async fn cmd_update_check(json: bool) -> Result<()> {
    let config = load_config()?;
    config.updater.validate().context("Updater is not configured")?;

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let controller = UpdateController::from_config(config.updater.clone(), shutdown_rx)?;
    let report = controller.check().await.context("Release feed query failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    Printer::header("Release Feed");
    Printer::kv("Repository", &config.updater.repo);
    Printer::kv("Channel", &report.channel);
    Printer::kv("Latest", &or_dash(report.latest.as_deref()));
    Printer::kv("Deployed", &or_dash(report.last_applied.as_deref()));
    Printer::kv("Poll interval", &format_duration(config.updater.interval));
    println!();
    if report.update_available {
        Printer::warning("Update available");
    } else if report.latest.is_some() {
        Printer::success("Up to date");
    } else {
        Printer::info("No release on this channel");
    }
    Ok(())
}

fn cmd_update_status(json: bool) -> Result<()> {
    let config = load_config()?;
    let updater = &config.updater;
    let state = DeploymentState::load_or_new(
        &updater.state_path,
        updater.live_dir.clone(),
        updater.staging_dir.clone(),
    )?;

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    Printer::header("Deployment");
    Printer::kv("Enabled", &updater.enabled.to_string());
    Printer::kv("Live", &updater.live_dir.display().to_string());
    Printer::kv("Staging", &updater.staging_dir.display().to_string());
    Printer::kv("Applied", &or_dash(state.last_applied_tag.as_deref()));
    let last_check = state.last_check.map(|t| t.to_rfc3339());
    Printer::kv("Last check", &or_dash(last_check.as_deref()));
    if state.restart_pending {
        Printer::warning("Restart pending");
    }
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.context("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<_, anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        res = ctrl_c => res?,
        res = terminate => res?,
    }
    Ok(())
}
