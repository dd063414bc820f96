//! Control-plane daemon: boots the lifecycle machine, keeps the status
//! screen current, and serves the appliance HTTP API.

use anyhow::{Context, Result};
use clap::Parser;
use coffer_core::config::{HostPaths, DEFAULT_MOUNT_ROOT, DEFAULT_STATE_DIR};
use coffer_core::{lifecycle, logging, AccessStore, LifecycleState, ResetCodes, SecretCache};
use coffer_provider::StatusScreen;
use coffer_system::{
    system_serial, FramebufferScreen, MkpasswdVerifier, SystemAccounts, SystemDiskProvider,
};
use log::{error, info, warn};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::{select, signal, time::interval, time::Duration};

mod http;

use http::AppState;

#[derive(Parser, Debug)]
#[command(name = "coffer-daemon", version, about = "Coffer appliance control plane")]
struct Cli {
    /// Unencrypted state directory (markers, owner record).
    #[arg(long, default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,

    /// Mountpoint of the encrypted volume.
    #[arg(long, default_value = DEFAULT_MOUNT_ROOT)]
    mount_root: PathBuf,

    /// HTTP listen address.
    #[arg(long, default_value = "0.0.0.0:80")]
    listen: SocketAddr,

    /// Unix socket of the display daemon.
    #[arg(long, default_value = "/var/run/coffer-screen.sock")]
    screen_socket: PathBuf,

    /// Seconds between lifecycle re-evaluations.
    #[arg(long, default_value_t = 30)]
    poll_interval: u64,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();

    let paths = HostPaths::new(&cli.state_dir, &cli.mount_root);
    let lifecycle_state = Arc::new(LifecycleState::default());
    let provider = Arc::new(SystemDiskProvider::system(paths.clone()));
    let screen: Arc<dyn StatusScreen> = Arc::new(FramebufferScreen::new(&cli.screen_socket));
    let serial = system_serial(provider.runner());
    if serial.is_none() {
        warn!("no system serial available; device name will omit it");
    }

    let state = AppState {
        provider: provider.clone(),
        accounts: Arc::new(SystemAccounts::system()),
        verifier: Arc::new(MkpasswdVerifier::system()),
        screen: screen.clone(),
        store: Arc::new(AccessStore::new(paths.clone(), lifecycle_state.clone())),
        lifecycle: lifecycle_state.clone(),
        cache: Arc::new(SecretCache::new()),
        reset_codes: Arc::new(ResetCodes::new()),
        serial,
    };

    info!(
        "coffer daemon booting (state: {}, mount: {})",
        cli.state_dir.display(),
        cli.mount_root.display()
    );

    // establish the phase before accepting requests
    evaluate_once(&provider, &paths, &lifecycle_state, screen.clone()).await;
    info!("initial phase: {:?}", lifecycle_state.current());

    let poll_handle = tokio::spawn(poll_lifecycle(
        provider.clone(),
        paths.clone(),
        lifecycle_state.clone(),
        screen.clone(),
        cli.poll_interval,
    ));

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("bind {}", cli.listen))?;
    info!("api listening on http://{}", cli.listen);
    let server = axum::serve(listener, http::router(state)).into_future();

    select! {
        res = server => res.context("http server")?,
        res = poll_handle => res.context("lifecycle poll task")?,
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}

/// Re-derive the phase from the hardware; failures degrade to the previous
/// phase rather than taking the daemon down.
async fn evaluate_once(
    provider: &Arc<SystemDiskProvider>,
    paths: &HostPaths,
    state: &Arc<LifecycleState>,
    screen: Arc<dyn StatusScreen>,
) {
    let provider = provider.clone();
    let paths = paths.clone();
    let state = state.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        lifecycle::evaluate(provider.as_ref(), &paths, &state, screen.as_ref())
    })
    .await;
    match outcome {
        Ok(Ok(snapshot)) => {
            info!(
                "lifecycle evaluation: {:?} over {} disk(s)",
                snapshot.phase,
                snapshot.disks.len()
            );
        }
        Ok(Err(err)) => warn!("lifecycle evaluation failed: {err}"),
        Err(err) => warn!("lifecycle evaluation panicked: {err}"),
    }
}

async fn poll_lifecycle(
    provider: Arc<SystemDiskProvider>,
    paths: HostPaths,
    state: Arc<LifecycleState>,
    screen: Arc<dyn StatusScreen>,
    interval_secs: u64,
) {
    let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
    ticker.tick().await; // the boot evaluation already ran
    loop {
        ticker.tick().await;
        evaluate_once(&provider, &paths, &state, screen.clone()).await;
    }
}
