// src/command/session.rs

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Command, CommandReply, CommandRequest, CommandType};
use crate::daemon::{Daemon, DaemonState};
use crate::error::DaemonError;
use crate::event::{Event, EventPayload};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeginSessionData {
    /// 缺省时使用 daemon 时钟
    #[serde(default)]
    pub start_timestamp: Option<i64>,
}

pub struct BeginSession {
    device_id: i64,
    pid: i32,
    data: BeginSessionData,
}

impl BeginSession {
    pub fn create(request: &CommandRequest) -> Result<Box<dyn Command>, DaemonError> {
        Ok(Box::new(BeginSession {
            device_id: request.stream_id,
            pid: request.pid,
            data: request.parse_payload()?,
        }))
    }
}

impl Command for BeginSession {
    fn command_type(&self) -> CommandType {
        CommandType::BeginSession
    }

    fn execute_on(&self, daemon: &Daemon, state: &mut DaemonState) -> Result<CommandReply, DaemonError> {
        let start = self.data.start_timestamp.unwrap_or_else(|| daemon.clock().now_ns());
        let info = state.sessions.begin_session(self.device_id, self.pid, start)?;
        daemon.buffer().add(Event::new(
            info.session_id,
            info.pid,
            info.session_id,
            start,
            EventPayload::SessionStarted { device_id: info.device_id, start_timestamp: start },
        ));
        Ok(CommandReply::Session(info))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndSessionData {
    pub session_id: i64,
    #[serde(default)]
    pub end_timestamp: Option<i64>,
}

pub struct EndSession {
    data: EndSessionData,
}

impl EndSession {
    pub fn create(request: &CommandRequest) -> Result<Box<dyn Command>, DaemonError> {
        Ok(Box::new(EndSession { data: request.parse_payload()? }))
    }
}

impl Command for EndSession {
    fn command_type(&self) -> CommandType {
        CommandType::EndSession
    }

    fn execute_on(&self, daemon: &Daemon, state: &mut DaemonState) -> Result<CommandReply, DaemonError> {
        let session_id = self.data.session_id;
        let end = self.data.end_timestamp.unwrap_or_else(|| daemon.clock().now_ns());
        let ended = state.sessions.end_session(session_id, end);
        if ended {
            if let Some(session) = state.sessions.get(session_id) {
                let pid = session.info().pid;
                daemon.buffer().add(
                    Event::new(session_id, pid, session_id, end, EventPayload::SessionEnded { end_timestamp: end })
                        .ended(),
                );
            }
        } else {
            warn!(session_id, "end session ignored, session not active");
        }
        Ok(CommandReply::SessionEnded { ended })
    }
}
