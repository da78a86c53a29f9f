// src/monitor/http.rs

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use warp::Filter;

use super::Monitor;
use crate::event::EventBuffer;

/// 在 `addr` 上以 Prometheus 文本格式提供 GET /metrics，`shutdown` 完成后退出
pub async fn serve_metrics(
    monitor: Monitor,
    buffer: Arc<EventBuffer>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let metrics = monitor.metrics.clone();
    let route = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || {
            warp::reply::with_header(
                metrics.to_prometheus(&buffer),
                "content-type",
                "text/plain; version=0.0.4",
            )
        });

    let (bound, server) = warp::serve(route)
        .try_bind_with_graceful_shutdown(addr, shutdown)
        .with_context(|| format!("binding metrics endpoint {addr}"))?;
    info!(addr = %bound, "metrics endpoint listening");
    server.await;
    Ok(())
}
