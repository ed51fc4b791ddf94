use anyhow::Result;
use colored::*;
use coreswitch::daemon::build_control_surface;
use coreswitch::{init_logger, ApiConfig, ApiServer, Settings, UnlinkedPacketEngine};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));
const SETTINGS_FILE: &str = "coreswitch.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let settings_path = Path::new(SETTINGS_FILE);
    let settings = match Settings::load_or_create(settings_path) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} {}", "failed to load settings:".red().bold(), e);
            Settings::default()
        }
    };
    init_logger(&settings.log_filter);

    println!("{} {}", "coreswitch".bright_cyan().bold(), VERSION.bright_black());
    info!(version = VERSION, settings = %settings_path.display(), "coreswitch starting");

    let surface = build_control_surface(&settings, Arc::new(UnlinkedPacketEngine));
    let server = ApiServer::new(surface.clone(), ApiConfig::from(settings.api.clone()));

    let shutdown = CancellationToken::new();
    let api_shutdown = shutdown.clone();
    let mut api = tokio::spawn(async move { server.run_with_shutdown(api_shutdown).await });

    let finished = tokio::select! {
        _ = signal::ctrl_c() => None,
        finished = &mut api => Some(finished),
    };
    let finished = match finished {
        Some(finished) => finished,
        None => {
            info!("interrupt received, shutting down");
            shutdown.cancel();
            api.await
        }
    };
    match finished {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("API server failed: {:#}", e),
        Err(e) => error!("API server task ended abnormally: {}", e),
    }

    if surface.is_core_running().await.unwrap_or(false) {
        if let Err(e) = surface.stop_core().await {
            warn!("failed to stop active core: {}", e);
        }
    }

    info!("coreswitch stopped");
    Ok(())
}
