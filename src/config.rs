// src/config.rs

use serde::{Deserialize, Serialize};
use std::{fs, path::Path, time::Duration};
use anyhow::{Context, Result};
use tracing::info;

/// 进程启动后，从 config.json 中读到的全局配置
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// 面向桌面客户端的服务地址
    pub public_addr: String,
    /// 面向 app 内 agent 的服务地址
    pub agent_addr: String,
    // 监控配置
    pub metrics_enabled: bool,
    pub metrics_port: u16,
    /// 关闭后 session 不再挂载任何 sampler
    pub unified_pipeline: bool,
    // 各 sampler 的采样周期（毫秒）
    pub cpu_usage_interval_ms: u64,
    pub cpu_thread_interval_ms: u64,
    pub network_interval_ms: u64,
    pub agent_status_interval_ms: u64,
    /// 超过该时长没有心跳即视为 agent 已断开
    pub heartbeat_threshold_ms: u64,
    pub status_scan_interval_ms: u64,
    /// 断开超过该时长的 agent 记录会被清理
    pub agent_entry_ttl_secs: u64,
    /// 事件缓冲区最多保留的事件数
    pub event_retention: usize,
    /// attach agent 时调用的外部程序
    pub attach_program: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            public_addr: "127.0.0.1:12389".into(),
            agent_addr: "127.0.0.1:12390".into(),
            metrics_enabled: true,
            metrics_port: 9090,
            unified_pipeline: true,
            cpu_usage_interval_ms: 500,
            cpu_thread_interval_ms: 500,
            network_interval_ms: 500,
            agent_status_interval_ms: 500,
            heartbeat_threshold_ms: 500,
            status_scan_interval_ms: 500,
            agent_entry_ttl_secs: 600,
            event_retention: 100_000,
            attach_program: "cmd".into(),
        }
    }
}

impl Config {
    pub fn heartbeat_threshold(&self) -> Duration {
        Duration::from_millis(self.heartbeat_threshold_ms)
    }

    pub fn status_scan_interval(&self) -> Duration {
        Duration::from_millis(self.status_scan_interval_ms)
    }

    pub fn agent_entry_ttl(&self) -> Duration {
        Duration::from_secs(self.agent_entry_ttl_secs)
    }
}

/// 从指定路径读取并反序列化 JSON 配置
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path_ref = path.as_ref();

    // 如果配置文件不存在，创建默认配置
    if !path_ref.exists() {
        let default_cfg = Config::default();
        let default_json = serde_json::to_string_pretty(&default_cfg)?;
        fs::write(path_ref, default_json)
            .with_context(|| format!("writing default config to {}", path_ref.display()))?;
        info!(path = %path_ref.display(), "default config created");
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(path_ref)
        .with_context(|| format!("reading {}", path_ref.display()))?;
    let cfg: Config = serde_json::from_str(&data)
        .with_context(|| format!("parsing {}", path_ref.display()))?;
    Ok(cfg)
}
