// src/command/echo.rs

use serde::{Deserialize, Serialize};

use super::{Command, CommandReply, CommandRequest, CommandType};
use crate::daemon::{Daemon, DaemonState};
use crate::error::DaemonError;
use crate::event::{Event, EventPayload};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EchoData {
    #[serde(default)]
    pub session_id: i64,
    #[serde(default)]
    pub data: String,
}

/// 原样写回一条 Echo 事件，客户端用来探测事件管线是否畅通
pub struct Echo {
    pid: i32,
    data: EchoData,
}

impl Echo {
    pub fn create(request: &CommandRequest) -> Result<Box<dyn Command>, DaemonError> {
        Ok(Box::new(Echo { pid: request.pid, data: request.parse_payload()? }))
    }
}

impl Command for Echo {
    fn command_type(&self) -> CommandType {
        CommandType::Echo
    }

    fn execute_on(&self, daemon: &Daemon, _state: &mut DaemonState) -> Result<CommandReply, DaemonError> {
        daemon.buffer().add(Event::new(
            self.data.session_id,
            self.pid,
            0,
            daemon.clock().now_ns(),
            EventPayload::Echo { data: self.data.data.clone() },
        ));
        Ok(CommandReply::Ack)
    }
}
