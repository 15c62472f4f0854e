//! privd-daemon entry point.
//!
//! Loads configuration, synchronizes the rights registry with the
//! authority, binds the helper socket, and serves until quiescent or
//! signalled.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use privd_core::{
    synchronize_rights, Authority, Authorizer, HelperConfig, InMemoryAuthority, SyncOutcome,
};
use privd_daemon::{
    install_systemd_unit, CodeIdentityVerifier, HelperDispatcher, HelperListener, HelperService,
    InstallOptions, ListenerConfig, NullHandler,
};

#[derive(Debug, Parser)]
#[command(name = "privd-daemon", version, about = "privd privileged helper")]
struct Args {
    /// Path to the helper configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Service name (used when no config file is given).
    #[arg(long)]
    service: Option<String>,

    /// Socket path override.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Synchronize rights with the authority and exit.
    #[arg(long)]
    sync_only: bool,

    /// Write the systemd unit for this helper and exit.
    #[arg(long)]
    install: bool,

    /// Unit directory for --install.
    #[arg(long, default_value = "/etc/systemd/system")]
    unit_dir: PathBuf,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn load_config(args: &Args) -> anyhow::Result<HelperConfig> {
    let mut config = match &args.config {
        Some(path) => HelperConfig::from_path(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let service = args.service.clone().unwrap_or_else(|| "privd".to_string());
            HelperConfig::new(service)
        }
    };
    if let Some(service) = &args.service {
        config.service.clone_from(service);
    }
    if let Some(socket) = &args.socket {
        config.socket_path = Some(socket.clone());
    }
    Ok(config)
}

fn build_verifier(config: &HelperConfig) -> anyhow::Result<CodeIdentityVerifier> {
    let mut verifier = match &config.expected_peer_digest {
        Some(hex) => CodeIdentityVerifier::from_hex_digest(hex)
            .context("invalid expected_peer_digest in config")?,
        None => CodeIdentityVerifier::for_current_exe()
            .context("failed to digest current executable")?,
    };
    if let Some(uid) = config.required_peer_uid {
        verifier = verifier.require_uid(uid);
    }
    Ok(verifier)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = load_config(&args)?;

    if args.install {
        let binary = std::env::current_exe().context("failed to resolve current executable")?;
        let mut options = InstallOptions::new(binary, &config.service);
        options.unit_dir = args.unit_dir.clone();
        options.config_path = args.config.clone();
        let report = install_systemd_unit(&options)?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let registry = config.registry().context("invalid rights declaration")?;
    let authority: Arc<dyn Authority> = Arc::new(InMemoryAuthority::new());

    let outcomes = synchronize_rights(authority.as_ref(), &registry);
    let mut failures = 0usize;
    for outcome in &outcomes {
        match outcome {
            SyncOutcome::Unchanged { name } => info!(right = %name, "right up to date"),
            SyncOutcome::Updated { name } => info!(right = %name, "right installed"),
            SyncOutcome::Failed { name, error } => {
                failures += 1;
                warn!(right = %name, %error, "right synchronization failed");
            }
        }
    }
    if failures > 0 {
        warn!(failures, total = outcomes.len(), "some rights failed to synchronize");
    }
    if args.sync_only {
        return Ok(());
    }

    let authorizer = Arc::new(Authorizer::new(
        registry,
        config.unmapped_command,
        Arc::clone(&authority),
    ));
    let verifier = Arc::new(build_verifier(&config)?);
    let dispatcher = Arc::new(HelperDispatcher::new(authorizer, Arc::new(NullHandler)));

    let listener = Arc::new(
        HelperListener::bind(ListenerConfig::from_helper_config(&config))
            .context("failed to bind helper socket")?,
    );

    // Signals request the same shutdown path the empty live set uses.
    {
        let listener = Arc::clone(&listener);
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(error) => {
                    warn!(%error, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                result = tokio::signal::ctrl_c() => {
                    if let Err(error) = result {
                        warn!(%error, "ctrl-c handler failed");
                    } else {
                        info!("received interrupt");
                    }
                }
            }
            listener.request_shutdown();
        });
    }

    let service = HelperService::new(listener, verifier, dispatcher)
        .with_poll_interval(config.poll_interval());
    service.run().await?;
    Ok(())
}
