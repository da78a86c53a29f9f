// src/agent.rs

//! agent 心跳与状态跟踪
//!
//! 心跳表和状态表属于 daemon，只在 daemon 锁内修改；
//! 状态表额外以 `DashMap` 发布出去，供 sampler 无锁读取。
use std::collections::HashMap;
use std::process::{Command, Stdio};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Unspecified,
    Attached,
    Detached,
}

pub type AgentStatusMap = Arc<DashMap<i32, AgentStatus>>;

/// 状态变化回调，在 daemon 锁内同步调用，不能再调用 `Daemon::execute`
pub type AgentStatusChanged = Box<dyn Fn(i32) + Send>;

/// 把 agent 注入到目标进程的外部原语
pub trait AgentAttacher: Send + Sync {
    fn attach(&self, pid: i32, app_name: &str, lib_file: &str) -> bool;
}

/// 通过外部命令注入：`<program> activity attach-agent <app> <lib>`
pub struct ShellAttacher {
    program: String,
}

impl ShellAttacher {
    pub fn new(program: impl Into<String>) -> Self {
        ShellAttacher { program: program.into() }
    }
}

impl AgentAttacher for ShellAttacher {
    fn attach(&self, pid: i32, app_name: &str, lib_file: &str) -> bool {
        let status = Command::new(&self.program)
            .args(["activity", "attach-agent", app_name, lib_file])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => true,
            Ok(s) => {
                warn!(pid, app = app_name, code = ?s.code(), "attach-agent failed");
                false
            }
            Err(e) => {
                warn!(pid, app = app_name, error = %e, "attach-agent could not run");
                false
            }
        }
    }
}

pub struct AgentTracker {
    // pid -> 最近一次心跳（ns）
    heartbeats: HashMap<i32, i64>,
    statuses: AgentStatusMap,
    callbacks: Vec<AgentStatusChanged>,
    attacher: Arc<dyn AgentAttacher>,
    threshold_ns: i64,
    ttl_ns: i64,
}

impl AgentTracker {
    pub fn new(attacher: Arc<dyn AgentAttacher>, threshold_ns: i64, ttl_ns: i64) -> Self {
        AgentTracker {
            heartbeats: HashMap::new(),
            statuses: Arc::new(DashMap::new()),
            callbacks: Vec::new(),
            attacher,
            threshold_ns,
            ttl_ns,
        }
    }

    /// 只读视图，供 sampler 使用
    pub fn status_map(&self) -> AgentStatusMap {
        self.statuses.clone()
    }

    pub fn status(&self, pid: i32) -> AgentStatus {
        self.statuses.get(&pid).map(|s| *s).unwrap_or(AgentStatus::Unspecified)
    }

    pub fn tracked_pids(&self) -> usize {
        self.heartbeats.len()
    }

    pub fn add_status_changed_callback(&mut self, callback: AgentStatusChanged) {
        self.callbacks.push(callback);
    }

    fn transition(&mut self, pid: i32, status: AgentStatus) -> bool {
        let prev = self.statuses.insert(pid, status);
        if prev == Some(status) {
            return false;
        }
        info!(pid, ?status, "agent status changed");
        for cb in &self.callbacks {
            cb(pid);
        }
        true
    }

    /// 收到心跳：刷新时间戳；此前不是 Attached 时切换并通知。
    /// 返回是否发生了 Attached 切换。
    pub fn set_heartbeat_timestamp(&mut self, pid: i32, timestamp: i64) -> bool {
        self.heartbeats.insert(pid, timestamp);
        if self.status(pid) == AgentStatus::Attached {
            return false;
        }
        self.transition(pid, AgentStatus::Attached)
    }

    /// 扫描心跳表：超时的 Attached 切换为 Detached；
    /// 断开超过 TTL 的记录被清理。返回本轮切换为 Detached 的 pid。
    pub fn scan(&mut self, now: i64) -> Vec<i32> {
        let mut detached = Vec::new();
        let mut expired = Vec::new();
        for (&pid, &last_seen) in &self.heartbeats {
            let silent = now - last_seen;
            if silent > self.threshold_ns && self.status(pid) == AgentStatus::Attached {
                detached.push(pid);
            } else if silent > self.ttl_ns && self.status(pid) != AgentStatus::Attached {
                expired.push(pid);
            }
        }
        detached.sort_unstable();
        for &pid in &detached {
            self.transition(pid, AgentStatus::Detached);
        }
        for pid in expired {
            debug!(pid, "evicting stale agent entry");
            self.heartbeats.remove(&pid);
            self.statuses.remove(&pid);
        }
        detached
    }

    /// 已经 Attached 时直接返回 true；否则调用外部注入并记录结果
    pub fn try_attach_app_agent(&mut self, pid: i32, app_name: &str, lib_file: &str, now: i64) -> bool {
        if self.status(pid) == AgentStatus::Attached {
            return true;
        }
        if self.attacher.attach(pid, app_name, lib_file) {
            // 以注入时刻作为首个心跳，agent 需要在阈值内开始上报
            self.heartbeats.insert(pid, now);
            self.transition(pid, AgentStatus::Attached);
            true
        } else {
            self.heartbeats.entry(pid).or_insert(now);
            self.statuses.insert(pid, AgentStatus::Detached);
            false
        }
    }
}
