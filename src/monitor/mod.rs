// src/monitor/mod.rs
//! 监控与诊断模块
mod client;
mod http;
mod metrics;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

pub use client::ClientTracker;
pub use http::serve_metrics;
pub use metrics::Metrics;

/// 监控系统主结构
#[derive(Clone, Default)]
pub struct Monitor {
    pub client_tracker: Arc<ClientTracker>,
    pub metrics: Arc<Metrics>,
}

impl Monitor {
    pub fn new() -> Self {
        Monitor::default()
    }
}

/// 客户端信息
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub addr: SocketAddr,
    /// 连接来自哪个监听端口（public / agent）
    pub listener: &'static str,
    pub connect_time: Instant,
    pub last_op: String,
    pub last_op_time: Instant,
}
