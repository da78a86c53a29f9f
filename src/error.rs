// src/error.rs

use thiserror::Error;

use crate::command::CommandType;

/// 命令执行过程中可能出现的协议/不变量错误
/// 这些错误都不是致命的：记录日志，状态保持不变
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DaemonError {
    #[error("session already active for device {device_id} pid {pid}")]
    AlreadyActive { device_id: i64, pid: i32 },

    #[error("no factory registered for command {0}")]
    UnknownCommand(CommandType),

    #[error("invalid payload for {command}: {reason}")]
    InvalidPayload { command: CommandType, reason: String },
}

/// CPU trace stop 请求被拒绝的原因，按校验顺序排列
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TraceRejection {
    #[error("no ongoing capture")]
    NoOngoingCapture,

    #[error("ongoing capture was not initiated by the API")]
    InitiationMismatch,

    #[error("trace id mismatch: ongoing {expected}, requested {got}")]
    TraceIdMismatch { expected: i32, got: i32 },
}
