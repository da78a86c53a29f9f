// src/main.rs
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use crab_perfd::agent::ShellAttacher;
use crab_perfd::clock::SteadyClock;
use crab_perfd::config;
use crab_perfd::daemon::Daemon;
use crab_perfd::monitor::{Monitor, serve_metrics};
use crab_perfd::server::{self, ServerContext};

/// 设备端性能采集 daemon
#[derive(Parser)]
#[command(name = "crab-perfd", version, about)]
struct Cli {
    /// JSON 配置文件；不存在时写出默认配置
    #[arg(short, long, default_value = "crab-perfd.json")]
    config: PathBuf,

    /// 日志级别（trace, debug, info, warn, error）
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = config::load(&cli.config)?;
    info!(config = %cli.config.display(), unified_pipeline = cfg.unified_pipeline, "starting crab-perfd");

    let monitor = Monitor::new();
    let daemon = Arc::new(
        Daemon::builder(cfg.clone())
            .clock(Arc::new(SteadyClock::new()))
            .attacher(Arc::new(ShellAttacher::new(cfg.attach_program.clone())))
            .metrics(monitor.metrics.clone())
            .build(),
    );
    let mut status_thread = daemon.start_status_thread()?;

    // 服务退出（ctrl-c 或出错）后通知 metrics 端点
    let (stop_tx, stop_rx) = watch::channel(false);

    let metrics_task = if cfg.metrics_enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], cfg.metrics_port));
        let mut rx = stop_rx;
        Some(tokio::spawn(serve_metrics(
            monitor.clone(),
            daemon.buffer().clone(),
            addr,
            async move {
                let _ = rx.wait_for(|stop| *stop).await;
            },
        )))
    } else {
        None
    };

    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received ctrl-c"),
            Err(e) => {
                warn!(error = %e, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        }
    };
    let result = server::run(ServerContext::new(daemon.clone(), monitor), ctrl_c).await;
    let _ = stop_tx.send(true);

    daemon.shutdown();
    status_thread.stop();
    if let Some(task) = metrics_task {
        match task.await {
            Ok(Err(e)) => warn!(error = %e, "metrics endpoint failed"),
            Err(e) => warn!(error = %e, "metrics task panicked"),
            Ok(Ok(())) => {}
        }
    }
    result
}
