use anyhow::Result;
use clap::Parser;
use colored::*;
use coreswitch_cli::{create_spinner, print_banner, print_error, print_info, print_success, Args};
use coreswitch_core::{init_logger, Core, ProbeSettings, TunnelService};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

const VERSION: &str = concat!("v", env!("CARGO_PKG_VERSION"));
const LOG_POLL: Duration = Duration::from_millis(200);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    // core lines are printed from the log buffer; tracing only carries warnings
    init_logger("warn");
    print_banner(VERSION);

    let opts = match args.start_options() {
        Ok(opts) => opts,
        Err(e) => {
            print_error(&format!("{:#}", e));
            std::process::exit(1);
        }
    };

    let tunnel = Arc::new(TunnelService::new(ProbeSettings::default()));
    let cancel = CancellationToken::new();
    if let Err(e) = tunnel.start(&opts, &cancel).await {
        print_error(&format!("start failed: {}", e));
        std::process::exit(1);
    }
    if let Some(addr) = tunnel.local_addr().await {
        print_success(&format!("SOCKS5 proxy listening on {}", addr));
    }

    let printer = tokio::spawn(print_logs(tunnel.clone(), cancel.clone()));

    if !args.ping.is_empty() {
        let spinner = create_spinner("probing through the tunnel");
        let probed = tunnel.measure_ping(&args.ping, &cancel).await;
        spinner.finish_and_clear();
        match probed {
            Ok(results) => {
                for result in results {
                    if result.is_success() {
                        println!("{} {} - {}ms", "✓".green().bold(), result.url, result.delay);
                    } else {
                        println!("{} {} - failed", "✗".red().bold(), result.url);
                    }
                }
            }
            Err(e) => print_error(&format!("ping failed: {}", e)),
        }
    }

    print_info("press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("interrupt received, stopping tunnel");

    cancel.cancel();
    let _ = printer.await;
    tunnel.stop().await?;
    let remaining = tunnel.fetch_logs();
    if !remaining.is_empty() {
        println!("{}", remaining);
    }
    print_success("tunnel stopped");
    Ok(())
}

async fn print_logs(tunnel: Arc<TunnelService>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(LOG_POLL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let logs = tunnel.fetch_logs();
                if !logs.is_empty() {
                    println!("{}", logs);
                }
            }
        }
    }
}
