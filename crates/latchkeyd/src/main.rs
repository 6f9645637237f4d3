use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

mod config;
mod display;
mod engine;
mod sequencer;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("latchkeyd starting");

    let config = config::Config::from_env();
    tracing::info!(
        gallery = %config.gallery_dir.display(),
        models = %config.model_dir.display(),
        tolerance = config.tolerance,
        servo = ?config.servo,
        "configuration loaded"
    );

    let engine = engine::build(&config).context("startup failed")?;
    tracing::info!(identities = engine.gallery.len(), "gallery enrolled");

    let stop = Arc::new(AtomicBool::new(false));
    let handle = engine.spawn(stop.clone())?;
    let mut worker = tokio::task::spawn_blocking(move || handle.join());

    tracing::info!("latchkeyd ready");

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let joined = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("waiting for ctrl-c")?;
            tracing::info!("SIGINT received");
            None
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received");
            None
        }
        joined = &mut worker => Some(joined),
    };

    let joined = match joined {
        Some(joined) => joined,
        None => {
            tracing::info!("latchkeyd shutting down");
            stop.store(true, Ordering::Relaxed);
            worker.await
        }
    };

    match joined.context("engine join task failed")? {
        Ok(reason) => tracing::info!(reason = ?reason, "latchkeyd stopped"),
        Err(_) => anyhow::bail!("engine thread panicked"),
    }

    Ok(())
}
