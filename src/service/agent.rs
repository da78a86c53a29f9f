// src/service/agent.rs

use serde::{Deserialize, Serialize};

use super::Response;
use crate::command::{CommandRequest, CommandType, CpuTraceStartData, CpuTraceStopData};
use crate::daemon::Daemon;

/// agent 的 CPU trace 通知，start 与 stop 二选一
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceEvent {
    Start {
        #[serde(default)]
        method_name: String,
        #[serde(default)]
        method_signature: String,
        #[serde(default)]
        arg_trace_path: String,
    },
    Stop {
        trace_id: i32,
        #[serde(default)]
        trace_content: Vec<u8>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AgentRequest {
    /// agent 自带的 timestamp 只用于日志，在线判定以 daemon 时钟为准
    Heartbeat {
        pid: i32,
        #[serde(default)]
        timestamp: Option<i64>,
    },
    SendTraceEvent {
        pid: i32,
        #[serde(default)]
        timestamp: Option<i64>,
        event: TraceEvent,
    },
}

impl AgentRequest {
    pub fn op(&self) -> &'static str {
        match self {
            AgentRequest::Heartbeat { .. } => "heartbeat",
            AgentRequest::SendTraceEvent { .. } => "send_trace_event",
        }
    }
}

pub fn handle_agent(daemon: &Daemon, request: AgentRequest) -> Response {
    let command = match request {
        AgentRequest::Heartbeat { pid, timestamp } => {
            tracing::trace!(pid, ?timestamp, "heartbeat");
            CommandRequest::new(CommandType::AgentHeartbeat, pid)
        }
        AgentRequest::SendTraceEvent { pid, timestamp, event } => match event {
            TraceEvent::Start { method_name, method_signature, arg_trace_path } => {
                CommandRequest::new(CommandType::CpuTraceStart, pid).with_payload(&CpuTraceStartData {
                    timestamp,
                    method_name,
                    method_signature,
                    arg_trace_path,
                })
            }
            TraceEvent::Stop { trace_id, trace_content } => {
                CommandRequest::new(CommandType::CpuTraceStop, pid).with_payload(&CpuTraceStopData {
                    timestamp,
                    trace_id,
                    trace_content,
                })
            }
        },
    };
    daemon.execute(&command).into()
}
