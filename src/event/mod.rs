// src/event/mod.rs
//! 遥测事件模型
//!
//! 所有 sampler 和命令产生的数据都统一成 `Event` 追加到 `EventBuffer`，
//! 由流式读者按追加顺序读出。
mod buffer;

pub use buffer::{EventBuffer, EventWriter};

use serde::{Deserialize, Serialize};

use crate::agent::AgentStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Session,
    CpuUsage,
    CpuThread,
    NetworkSpeed,
    NetworkConnectionCount,
    Agent,
    CpuTrace,
    Echo,
}

/// 一次 CPU 使用率采样，单位均为毫秒
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuUsageData {
    pub elapsed_time_in_millisec: i64,
    pub system_cpu_time_in_millisec: i64,
    pub app_cpu_time_in_millisec: i64,
    pub cores: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreadState {
    Running,
    Sleeping,
    Waiting,
    Zombie,
    Stopped,
    Tracing,
    Dead,
    Unspecified,
}

impl ThreadState {
    /// 由 /proc/<pid>/task/<tid>/stat 的状态字符转换
    pub fn from_proc_char(c: char) -> Self {
        match c {
            'R' => ThreadState::Running,
            'S' => ThreadState::Sleeping,
            'D' => ThreadState::Waiting,
            'Z' => ThreadState::Zombie,
            'T' => ThreadState::Stopped,
            't' => ThreadState::Tracing,
            'X' | 'x' => ThreadState::Dead,
            _ => ThreadState::Unspecified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadActivity {
    pub tid: i32,
    pub name: String,
    pub state: ThreadState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SpeedDirection {
    Rx,
    Tx,
}

impl SpeedDirection {
    pub fn group_id(self) -> i64 {
        match self {
            SpeedDirection::Rx => 0,
            SpeedDirection::Tx => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionStarted { device_id: i64, start_timestamp: i64 },
    SessionEnded { end_timestamp: i64 },
    CpuUsage(CpuUsageData),
    CpuThread(ThreadActivity),
    NetworkSpeed { direction: SpeedDirection, throughput: i64 },
    NetworkConnections { num_connections: u32 },
    Agent { status: AgentStatus },
    CpuTraceStarted { trace_id: i32, trace_path: String },
    CpuTraceEnded { trace_id: i32, content_size: usize },
    Echo { data: String },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::SessionStarted { .. } | EventPayload::SessionEnded { .. } => {
                EventKind::Session
            }
            EventPayload::CpuUsage(_) => EventKind::CpuUsage,
            EventPayload::CpuThread(_) => EventKind::CpuThread,
            EventPayload::NetworkSpeed { .. } => EventKind::NetworkSpeed,
            EventPayload::NetworkConnections { .. } => EventKind::NetworkConnectionCount,
            EventPayload::Agent { .. } => EventKind::Agent,
            EventPayload::CpuTraceStarted { .. } | EventPayload::CpuTraceEnded { .. } => {
                EventKind::CpuTrace
            }
            EventPayload::Echo { .. } => EventKind::Echo,
        }
    }
}

/// 追加后不可变；`sequence` 由缓冲区在追加时分配
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence: u64,
    pub session_id: i64,
    pub pid: i32,
    pub group_id: i64,
    pub kind: EventKind,
    pub timestamp: i64,
    /// 该 group 的最后一个事件
    pub ended: bool,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(session_id: i64, pid: i32, group_id: i64, timestamp: i64, payload: EventPayload) -> Self {
        Event {
            sequence: 0,
            session_id,
            pid,
            group_id,
            kind: payload.kind(),
            timestamp,
            ended: false,
            payload,
        }
    }

    pub fn ended(mut self) -> Self {
        self.ended = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventGroup {
    pub group_id: i64,
    pub events: Vec<Event>,
}

/// 查询条件；时间范围为闭区间，缺省即不限
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetEventGroupsRequest {
    pub session_id: i64,
    pub kind: EventKind,
    #[serde(default = "min_timestamp")]
    pub from_timestamp: i64,
    #[serde(default = "max_timestamp")]
    pub to_timestamp: i64,
}

fn min_timestamp() -> i64 {
    i64::MIN
}

fn max_timestamp() -> i64 {
    i64::MAX
}

impl GetEventGroupsRequest {
    pub fn new(session_id: i64, kind: EventKind) -> Self {
        GetEventGroupsRequest {
            session_id,
            kind,
            from_timestamp: i64::MIN,
            to_timestamp: i64::MAX,
        }
    }

    fn matches(&self, event: &Event) -> bool {
        event.session_id == self.session_id
            && event.kind == self.kind
            && event.timestamp >= self.from_timestamp
            && event.timestamp <= self.to_timestamp
    }
}
