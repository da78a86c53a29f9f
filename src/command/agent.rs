// src/command/agent.rs

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Command, CommandReply, CommandRequest, CommandType};
use crate::cpu::CpuProfilerConfiguration;
use crate::daemon::{Daemon, DaemonState};
use crate::error::DaemonError;
use crate::event::{Event, EventPayload};

/// 来自 app 进程的心跳；时间以 daemon 时钟为准
pub struct AgentHeartbeat {
    pid: i32,
}

impl AgentHeartbeat {
    pub fn create(request: &CommandRequest) -> Result<Box<dyn Command>, DaemonError> {
        Ok(Box::new(AgentHeartbeat { pid: request.pid }))
    }
}

impl Command for AgentHeartbeat {
    fn command_type(&self) -> CommandType {
        CommandType::AgentHeartbeat
    }

    fn execute_on(&self, daemon: &Daemon, state: &mut DaemonState) -> Result<CommandReply, DaemonError> {
        let now = daemon.clock().now_ns();
        state.agents.set_heartbeat_timestamp(self.pid, now);
        // attach 可能早于首个心跳，所以只要还有预约就尝试
        if state.traces.has_pending_startup() {
            promote_startup_capture(daemon, state, self.pid, now);
        }
        Ok(CommandReply::Ack)
    }
}

/// app 进程已连上 agent：若它预约了 startup capture，则从此刻起归属这个 pid
fn promote_startup_capture(daemon: &Daemon, state: &mut DaemonState, pid: i32, now: i64) {
    let Ok(app) = daemon.procfs().cmdline(pid) else {
        return;
    };
    let Some(trace_id) = state.traces.promote_startup_profiling(pid, &app) else {
        return;
    };
    info!(pid, trace_id, app = %app, "startup capture bound to process");
    if let Some(session) = state.sessions.active_session_for_pid(pid) {
        let trace_path = state
            .traces
            .ongoing_capture(pid)
            .map(|c| c.trace_path.clone())
            .unwrap_or_default();
        daemon.buffer().add(Event::new(
            session.info().session_id,
            pid,
            trace_id as i64,
            now,
            EventPayload::CpuTraceStarted { trace_id, trace_path },
        ));
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttachAgentData {
    /// 缺省时取 /proc/<pid>/cmdline
    #[serde(default)]
    pub app_name: Option<String>,
    /// 缺省时使用该 app 的 startup agent 配置
    #[serde(default)]
    pub agent_lib_file_name: Option<String>,
}

pub struct AttachAgent {
    pid: i32,
    data: AttachAgentData,
}

impl AttachAgent {
    pub fn create(request: &CommandRequest) -> Result<Box<dyn Command>, DaemonError> {
        Ok(Box::new(AttachAgent { pid: request.pid, data: request.parse_payload()? }))
    }
}

impl Command for AttachAgent {
    fn command_type(&self) -> CommandType {
        CommandType::AttachAgent
    }

    fn execute_on(&self, daemon: &Daemon, state: &mut DaemonState) -> Result<CommandReply, DaemonError> {
        let pid = self.pid;
        let app = match &self.data.app_name {
            Some(name) => name.clone(),
            None => daemon.procfs().cmdline(pid).unwrap_or_else(|e| {
                debug!(pid, error = %e, "cmdline lookup failed");
                String::new()
            }),
        };
        let lib = match &self.data.agent_lib_file_name {
            Some(lib) => lib.clone(),
            None => state
                .startup_agents
                .get(&app)
                .map(|c| c.agent_lib_file_name.clone())
                .ok_or_else(|| DaemonError::InvalidPayload {
                    command: CommandType::AttachAgent,
                    reason: format!("no agent library given or configured for {app:?}"),
                })?,
        };
        let now = daemon.clock().now_ns();
        let attached = state.agents.try_attach_app_agent(pid, &app, &lib, now);
        if attached && state.traces.has_pending_startup() {
            promote_startup_capture(daemon, state, pid, now);
        }
        Ok(CommandReply::Attached { attached })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupAgentConfig {
    pub app_package_name: String,
    pub agent_lib_file_name: String,
    pub agent_config_path: String,
    /// 设置后在 app 启动时立即开始 CPU capture
    #[serde(default)]
    pub cpu_config: Option<CpuProfilerConfiguration>,
    #[serde(default)]
    pub trace_path: String,
}

impl StartupAgentConfig {
    pub fn agent_args(&self) -> String {
        format!("-agentpath:{}={}", self.agent_lib_file_name, self.agent_config_path)
    }
}

/// 在 app 主进程启动之前配置 agent
pub struct ConfigureStartupAgent {
    data: StartupAgentConfig,
}

impl ConfigureStartupAgent {
    pub fn create(request: &CommandRequest) -> Result<Box<dyn Command>, DaemonError> {
        Ok(Box::new(ConfigureStartupAgent { data: request.parse_payload()? }))
    }
}

impl Command for ConfigureStartupAgent {
    fn command_type(&self) -> CommandType {
        CommandType::ConfigureStartupAgent
    }

    fn execute_on(&self, daemon: &Daemon, state: &mut DaemonState) -> Result<CommandReply, DaemonError> {
        let app = &self.data.app_package_name;
        if let Some(cpu_config) = self.data.cpu_config {
            let trace_id = state.traces.add_startup_profiling(
                app,
                cpu_config,
                self.data.trace_path.clone(),
                daemon.clock().now_ns(),
            );
            info!(app = %app, trace_id, "startup capture scheduled");
        }
        state.startup_agents.insert(app.clone(), self.data.clone());
        Ok(CommandReply::StartupAgent { agent_args: self.data.agent_args() })
    }
}
