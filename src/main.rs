use clap::Parser;
use html2image::cdp::CdpBackend;
use html2image::http::HttpServer;
use html2image::{parse_pool_size, InstancePool, LaunchConfig, PoolConfig, RenderOptions, Service};
use log::{error, info};
use std::path::PathBuf;
use std::time::Duration;

/// Render HTML to images over HTTP using a pool of headless Chrome tabs
#[derive(Parser, Debug)]
#[command(name = "html2image", version, about)]
struct Cli {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Number of pre-warmed browser tabs (invalid or non-positive values use 5)
    #[arg(long, env = "CHROME_POOL_SIZE")]
    pool_size: Option<String>,

    /// Chrome/Chromium binary to launch instead of the auto-detected one
    #[arg(long, env = "CHROME_PATH")]
    chrome_path: Option<PathBuf>,

    /// Seconds to wait for borrowed tabs when shutting down
    #[arg(long, default_value_t = 60)]
    shutdown_timeout_secs: u64,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let pool_config = PoolConfig {
        capacity: parse_pool_size(cli.pool_size.as_deref()),
        shutdown_timeout: Duration::from_secs(cli.shutdown_timeout_secs),
    };
    let launch = LaunchConfig {
        chrome_path: cli.chrome_path,
        ..Default::default()
    };

    let pool = match CdpBackend::launch(&launch).and_then(|b| InstancePool::new(b, pool_config.capacity)) {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to create browser pool: {}", e);
            std::process::exit(1);
        }
    };

    let server = match HttpServer::bind(&format!("0.0.0.0:{}", cli.port)) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to start server: {}", e);
            pool.shutdown(pool_config.shutdown_timeout).await;
            std::process::exit(1);
        }
    };

    let stop = server.stop_handle();
    let service = Service::new(pool.clone(), RenderOptions::default());
    let runtime = tokio::runtime::Handle::current();
    let serving = tokio::task::spawn_blocking(move || server.run(service, runtime));

    shutdown_signal().await;
    stop.stop();
    let _ = serving.await;

    let report = pool.shutdown(pool_config.shutdown_timeout).await;
    info!("Closed {}/{} browser contexts", report.closed, report.capacity);
}

/// Resolves on Ctrl-C, or SIGTERM on unix (what container runtimes send).
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                info!("Received shutdown signal");
                return;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    }
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
}
