// src/session/mod.rs
//! 会话：一个被监控进程在一台设备上的生命周期
mod manager;

pub use manager::SessionsManager;

use serde::{Deserialize, Serialize};

use crate::sampler::SamplerRunner;

/// `end_timestamp == SESSION_ACTIVE` 表示会话仍在进行
pub const SESSION_ACTIVE: i64 = i64::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: i64,
    pub device_id: i64,
    pub pid: i32,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
}

/// 由 (device_id, start_timestamp) 推导会话 id，冲突由 SessionsManager 处理
pub fn derive_session_id(device_id: i64, start_timestamp: i64) -> i64 {
    device_id ^ start_timestamp.wrapping_shl(1)
}

pub struct Session {
    info: SessionInfo,
    samplers: Vec<SamplerRunner>,
}

impl Session {
    pub(crate) fn new(info: SessionInfo, samplers: Vec<SamplerRunner>) -> Self {
        Session { info, samplers }
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn is_active(&self) -> bool {
        self.info.end_timestamp == SESSION_ACTIVE
    }

    pub fn sampler_names(&self) -> Vec<&'static str> {
        self.samplers.iter().map(SamplerRunner::name).collect()
    }

    pub fn running_samplers(&self) -> usize {
        self.samplers.iter().filter(|s| s.is_running()).count()
    }

    pub fn start_samplers(&mut self) {
        for sampler in &mut self.samplers {
            sampler.start();
        }
    }

    /// 阻塞直到每个 sampler 的定时线程退出
    pub fn stop_samplers(&mut self) {
        for sampler in &mut self.samplers {
            sampler.stop();
        }
    }

    /// 结束会话；已结束时返回 false 且不做任何改动
    pub fn end(&mut self, timestamp: i64) -> bool {
        if !self.is_active() {
            return false;
        }
        self.stop_samplers();
        // 停止后的 sampler 不再需要，释放其占用的资源
        self.samplers.clear();
        self.info.end_timestamp = timestamp;
        true
    }
}
