// src/cpu/mod.rs
//! CPU 方法追踪（trace capture）状态
//!
//! 每个 pid 同时最多只有一个进行中的 capture：
//! 重复的 start 被拒绝而不是排队，stop 依次校验进行中、发起方式、trace_id。
mod trace_cache;

pub use trace_cache::{TraceCache, TraceStartOutcome};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CpuProfilerType {
    Art,
    Simpleperf,
    Atrace,
    Perfetto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CpuProfilerMode {
    Instrumented,
    Sampled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuProfilerConfiguration {
    pub profiler_type: CpuProfilerType,
    pub profiler_mode: CpuProfilerMode,
}

impl CpuProfilerConfiguration {
    /// app 内调用 Debug.startMethodTracing 时使用的配置
    pub const API_INITIATED: CpuProfilerConfiguration = CpuProfilerConfiguration {
        profiler_type: CpuProfilerType::Art,
        profiler_mode: CpuProfilerMode::Instrumented,
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TraceInitiationType {
    InitiatedByUi,
    InitiatedByApi,
    InitiatedByStartup,
}

/// 一次 capture 的元数据；`end_timestamp == -1` 表示仍在录制
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilingApp {
    pub app_pkg_name: String,
    /// 设备上 trace 文件的绝对路径
    pub trace_path: String,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub configuration: CpuProfilerConfiguration,
    pub initiation_type: TraceInitiationType,
    pub trace_id: i32,
    pub is_startup_profiling: bool,
}

impl ProfilingApp {
    pub const IN_PROGRESS: i64 = -1;

    pub fn is_in_progress(&self) -> bool {
        self.end_timestamp == Self::IN_PROGRESS
    }
}
