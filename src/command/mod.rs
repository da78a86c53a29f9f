// src/command/mod.rs

//! # 命令模块
//!
//! 所有由外部触发的状态修改都是一条 `Command`：
//! - 请求以 `CommandRequest { type, pid, stream_id, payload }` 的形式到达；
//! - 注册表按 `CommandType` 找到工厂函数，把 payload 解析成具体命令；
//! - `Daemon::execute` 在 daemon 锁内调用 `execute_on`，一条命令就是一个原子步骤。
mod agent;
mod cpu_trace;
mod echo;
mod session;

pub use agent::{AgentHeartbeat, AttachAgent, ConfigureStartupAgent, StartupAgentConfig};
pub use cpu_trace::{CpuTraceStart, CpuTraceStartData, CpuTraceStop, CpuTraceStopData};
pub use echo::Echo;
pub use session::{BeginSession, BeginSessionData, EndSession, EndSessionData};

use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::daemon::{Daemon, DaemonState};
use crate::error::DaemonError;
use crate::session::SessionInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    BeginSession,
    EndSession,
    Echo,
    CpuTraceStart,
    CpuTraceStop,
    AgentHeartbeat,
    AttachAgent,
    ConfigureStartupAgent,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::BeginSession => "BEGIN_SESSION",
            CommandType::EndSession => "END_SESSION",
            CommandType::Echo => "ECHO",
            CommandType::CpuTraceStart => "CPU_TRACE_START",
            CommandType::CpuTraceStop => "CPU_TRACE_STOP",
            CommandType::AgentHeartbeat => "AGENT_HEARTBEAT",
            CommandType::AttachAgent => "ATTACH_AGENT",
            CommandType::ConfigureStartupAgent => "CONFIGURE_STARTUP_AGENT",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 外部请求；payload 的结构由 `type` 决定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(rename = "type")]
    pub command_type: CommandType,
    #[serde(default)]
    pub pid: i32,
    /// 发起请求的设备 id
    #[serde(default)]
    pub stream_id: i64,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandRequest {
    pub fn new(command_type: CommandType, pid: i32) -> Self {
        CommandRequest {
            command_type,
            pid,
            stream_id: 0,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_stream(mut self, stream_id: i64) -> Self {
        self.stream_id = stream_id;
        self
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.payload = serde_json::to_value(payload).unwrap_or_default();
        self
    }

    /// 把 payload 解析为具体命令的数据；null 视为空对象
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, DaemonError> {
        let value = match &self.payload {
            serde_json::Value::Null => serde_json::Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(value).map_err(|e| DaemonError::InvalidPayload {
            command: self.command_type,
            reason: e.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum CommandReply {
    Ack,
    Session(SessionInfo),
    SessionEnded { ended: bool },
    TraceStart { start_operation_allowed: bool, trace_id: i32 },
    /// stop 的校验失败不算 RPC 错误，只在 `rejected` 中给出原因
    TraceStop {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rejected: Option<String>,
    },
    Attached { attached: bool },
    StartupAgent { agent_args: String },
}

/// 一条可执行的状态修改
pub trait Command: Send {
    fn command_type(&self) -> CommandType;

    /// 在 daemon 锁内执行；不能再调用 `Daemon::execute`
    fn execute_on(&self, daemon: &Daemon, state: &mut DaemonState) -> Result<CommandReply, DaemonError>;
}

pub type CommandFactory = fn(&CommandRequest) -> Result<Box<dyn Command>, DaemonError>;

/// 内置命令的注册表
pub fn default_registry() -> HashMap<CommandType, CommandFactory> {
    let mut commands: HashMap<CommandType, CommandFactory> = HashMap::new();
    commands.insert(CommandType::BeginSession, BeginSession::create);
    commands.insert(CommandType::EndSession, EndSession::create);
    commands.insert(CommandType::Echo, Echo::create);
    commands.insert(CommandType::CpuTraceStart, CpuTraceStart::create);
    commands.insert(CommandType::CpuTraceStop, CpuTraceStop::create);
    commands.insert(CommandType::AgentHeartbeat, AgentHeartbeat::create);
    commands.insert(CommandType::AttachAgent, AttachAgent::create);
    commands.insert(CommandType::ConfigureStartupAgent, ConfigureStartupAgent::create);
    commands
}
