// src/command/cpu_trace.rs

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Command, CommandReply, CommandRequest, CommandType};
use crate::daemon::{Daemon, DaemonState};
use crate::error::DaemonError;
use crate::event::{Event, EventPayload};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuTraceStartData {
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub method_name: String,
    #[serde(default)]
    pub method_signature: String,
    #[serde(default)]
    pub arg_trace_path: String,
}

/// app 内调用 Debug.startMethodTracing
pub struct CpuTraceStart {
    pid: i32,
    data: CpuTraceStartData,
}

impl CpuTraceStart {
    pub fn create(request: &CommandRequest) -> Result<Box<dyn Command>, DaemonError> {
        Ok(Box::new(CpuTraceStart { pid: request.pid, data: request.parse_payload()? }))
    }
}

impl Command for CpuTraceStart {
    fn command_type(&self) -> CommandType {
        CommandType::CpuTraceStart
    }

    fn execute_on(&self, daemon: &Daemon, state: &mut DaemonState) -> Result<CommandReply, DaemonError> {
        let pid = self.pid;
        let timestamp = self.data.timestamp.unwrap_or_else(|| daemon.clock().now_ns());
        let app_pkg_name = daemon.procfs().cmdline(pid).unwrap_or_else(|e| {
            debug!(pid, error = %e, "cmdline lookup failed");
            String::new()
        });

        let outcome = state.traces.start_api_trace(
            pid,
            timestamp,
            app_pkg_name,
            self.data.arg_trace_path.clone(),
        );
        if !outcome.allowed {
            warn!(pid, ongoing = outcome.trace_id, "trace start ignored, capture already ongoing");
            return Ok(CommandReply::TraceStart { start_operation_allowed: false, trace_id: outcome.trace_id });
        }

        info!(
            pid,
            trace_id = outcome.trace_id,
            method = %self.data.method_name,
            signature = %self.data.method_signature,
            path = %self.data.arg_trace_path,
            "trace started",
        );
        if let Some(session) = state.sessions.active_session_for_pid(pid) {
            daemon.buffer().add(Event::new(
                session.info().session_id,
                pid,
                outcome.trace_id as i64,
                timestamp,
                EventPayload::CpuTraceStarted {
                    trace_id: outcome.trace_id,
                    trace_path: self.data.arg_trace_path.clone(),
                },
            ));
        }
        Ok(CommandReply::TraceStart { start_operation_allowed: true, trace_id: outcome.trace_id })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuTraceStopData {
    #[serde(default)]
    pub timestamp: Option<i64>,
    pub trace_id: i32,
    #[serde(default)]
    pub trace_content: Vec<u8>,
}

/// app 内调用 Debug.stopMethodTracing。
/// 校验失败只记录日志，命令本身仍然成功。
pub struct CpuTraceStop {
    pid: i32,
    data: CpuTraceStopData,
}

impl CpuTraceStop {
    pub fn create(request: &CommandRequest) -> Result<Box<dyn Command>, DaemonError> {
        Ok(Box::new(CpuTraceStop { pid: request.pid, data: request.parse_payload()? }))
    }
}

impl Command for CpuTraceStop {
    fn command_type(&self) -> CommandType {
        CommandType::CpuTraceStop
    }

    fn execute_on(&self, daemon: &Daemon, state: &mut DaemonState) -> Result<CommandReply, DaemonError> {
        let pid = self.pid;
        let trace_id = self.data.trace_id;
        let timestamp = self.data.timestamp.unwrap_or_else(|| daemon.clock().now_ns());
        let size = self.data.trace_content.len();

        match state.traces.stop_api_trace(pid, timestamp, trace_id, self.data.trace_content.clone()) {
            Ok(_) => {
                info!(pid, trace_id, size, "trace stopped");
                if let Some(session) = state.sessions.active_session_for_pid(pid) {
                    daemon.buffer().add(
                        Event::new(
                            session.info().session_id,
                            pid,
                            trace_id as i64,
                            timestamp,
                            EventPayload::CpuTraceEnded { trace_id, content_size: size },
                        )
                        .ended(),
                    );
                }
                Ok(CommandReply::TraceStop { rejected: None })
            }
            Err(rejection) => {
                warn!(pid, trace_id, size, reason = %rejection, "trace stop rejected");
                Ok(CommandReply::TraceStop { rejected: Some(rejection.to_string()) })
            }
        }
    }
}
