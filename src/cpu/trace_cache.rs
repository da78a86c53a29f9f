// src/cpu/trace_cache.rs

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{CpuProfilerConfiguration, ProfilingApp, TraceInitiationType};
use crate::error::TraceRejection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceStartOutcome {
    pub allowed: bool,
    pub trace_id: i32,
}

/// pid -> 进行中 / 已完成的 capture，以及按 (pid, trace_id) 存放的 trace 内容
#[derive(Debug)]
pub struct TraceCache {
    next_trace_id: i32,
    ongoing: HashMap<i32, ProfilingApp>,
    completed: HashMap<i32, Vec<ProfilingApp>>,
    contents: HashMap<(i32, i32), Vec<u8>>,
    // app 包名 -> 等待进程启动的 startup capture
    startup: HashMap<String, ProfilingApp>,
}

impl Default for TraceCache {
    fn default() -> Self {
        TraceCache {
            next_trace_id: 1,
            ongoing: HashMap::new(),
            completed: HashMap::new(),
            contents: HashMap::new(),
            startup: HashMap::new(),
        }
    }
}

impl TraceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_trace_id(&mut self) -> i32 {
        let id = self.next_trace_id;
        self.next_trace_id = self.next_trace_id.checked_add(1).unwrap_or(1);
        id
    }

    pub fn ongoing_capture(&self, pid: i32) -> Option<&ProfilingApp> {
        self.ongoing.get(&pid)
    }

    pub fn completed_captures(&self, pid: i32) -> &[ProfilingApp] {
        self.completed.get(&pid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn trace_content(&self, pid: i32, trace_id: i32) -> Option<&[u8]> {
        self.contents.get(&(pid, trace_id)).map(Vec::as_slice)
    }

    /// 登记新的 capture 并分配 trace_id；调用方需保证 pid 上没有进行中的 capture
    fn add_profiling_start(&mut self, pid: i32, mut capture: ProfilingApp) -> i32 {
        let trace_id = self.allocate_trace_id();
        capture.trace_id = trace_id;
        capture.end_timestamp = ProfilingApp::IN_PROGRESS;
        self.ongoing.insert(pid, capture);
        trace_id
    }

    fn add_profiling_stop(&mut self, pid: i32, end_timestamp: i64) -> Option<ProfilingApp> {
        let mut capture = self.ongoing.remove(&pid)?;
        capture.end_timestamp = end_timestamp;
        self.completed.entry(pid).or_default().push(capture.clone());
        Some(capture)
    }

    /// app 通过 API 发起的 start。已有进行中的 capture 时拒绝，
    /// 并返回那次 capture 的 trace_id，状态不变。
    pub fn start_api_trace(
        &mut self,
        pid: i32,
        timestamp: i64,
        app_pkg_name: String,
        trace_path: String,
    ) -> TraceStartOutcome {
        if let Some(ongoing) = self.ongoing.get(&pid) {
            return TraceStartOutcome { allowed: false, trace_id: ongoing.trace_id };
        }
        let capture = ProfilingApp {
            app_pkg_name,
            trace_path,
            start_timestamp: timestamp,
            end_timestamp: ProfilingApp::IN_PROGRESS,
            configuration: CpuProfilerConfiguration::API_INITIATED,
            initiation_type: TraceInitiationType::InitiatedByApi,
            trace_id: 0,
            is_startup_profiling: false,
        };
        let trace_id = self.add_profiling_start(pid, capture);
        TraceStartOutcome { allowed: true, trace_id }
    }

    /// app 通过 API 发起的 stop。任一校验失败都不改变状态。
    pub fn stop_api_trace(
        &mut self,
        pid: i32,
        timestamp: i64,
        trace_id: i32,
        content: Vec<u8>,
    ) -> Result<ProfilingApp, TraceRejection> {
        let ongoing = self.ongoing.get(&pid).ok_or(TraceRejection::NoOngoingCapture)?;
        if ongoing.initiation_type != TraceInitiationType::InitiatedByApi {
            return Err(TraceRejection::InitiationMismatch);
        }
        if ongoing.trace_id != trace_id {
            return Err(TraceRejection::TraceIdMismatch { expected: ongoing.trace_id, got: trace_id });
        }
        let capture = self
            .add_profiling_stop(pid, timestamp)
            .ok_or(TraceRejection::NoOngoingCapture)?;
        self.contents.insert((pid, trace_id), content);
        Ok(capture)
    }

    /// 为尚未启动的 app 预约 startup capture，返回分配的 trace_id
    pub fn add_startup_profiling(
        &mut self,
        app_pkg_name: &str,
        configuration: CpuProfilerConfiguration,
        trace_path: String,
        timestamp: i64,
    ) -> i32 {
        let trace_id = self.allocate_trace_id();
        self.startup.insert(
            app_pkg_name.to_string(),
            ProfilingApp {
                app_pkg_name: app_pkg_name.to_string(),
                trace_path,
                start_timestamp: timestamp,
                end_timestamp: ProfilingApp::IN_PROGRESS,
                configuration,
                initiation_type: TraceInitiationType::InitiatedByStartup,
                trace_id,
                is_startup_profiling: true,
            },
        );
        trace_id
    }

    pub fn has_pending_startup(&self) -> bool {
        !self.startup.is_empty()
    }

    pub fn startup_profiling(&self, app_pkg_name: &str) -> Option<&ProfilingApp> {
        self.startup.get(app_pkg_name)
    }

    /// app 进程出现后，把预约的 startup capture 转为该 pid 的进行中 capture
    pub fn promote_startup_profiling(&mut self, pid: i32, app_pkg_name: &str) -> Option<i32> {
        if self.ongoing.contains_key(&pid) {
            return None;
        }
        let capture = self.startup.remove(app_pkg_name)?;
        let trace_id = capture.trace_id;
        self.ongoing.insert(pid, capture);
        Some(trace_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(cache: &mut TraceCache, pid: i32) -> TraceStartOutcome {
        cache.start_api_trace(pid, 100, "com.example".into(), "/data/trace".into())
    }

    #[test]
    fn test_start_allocates_sequential_ids() {
        let mut cache = TraceCache::new();
        assert_eq!(start(&mut cache, 1), TraceStartOutcome { allowed: true, trace_id: 1 });
        assert_eq!(start(&mut cache, 2), TraceStartOutcome { allowed: true, trace_id: 2 });
        let ongoing = cache.ongoing_capture(1).unwrap();
        assert!(ongoing.is_in_progress());
        assert_eq!(ongoing.initiation_type, TraceInitiationType::InitiatedByApi);
        assert_eq!(ongoing.configuration, CpuProfilerConfiguration::API_INITIATED);
    }

    // 同一 pid 重复 start 被拒绝，原 capture 不变
    #[test]
    fn test_second_start_rejected() {
        let mut cache = TraceCache::new();
        start(&mut cache, 1);
        let before = cache.ongoing_capture(1).cloned();
        let outcome = cache.start_api_trace(1, 999, "other".into(), "/other".into());
        assert_eq!(outcome, TraceStartOutcome { allowed: false, trace_id: 1 });
        assert_eq!(cache.ongoing_capture(1).cloned(), before);
    }

    #[test]
    fn test_stop_validation_order() {
        let mut cache = TraceCache::new();
        assert_eq!(
            cache.stop_api_trace(1, 5, 1, vec![]),
            Err(TraceRejection::NoOngoingCapture)
        );

        start(&mut cache, 1);
        assert_eq!(
            cache.stop_api_trace(1, 5, 42, vec![1]),
            Err(TraceRejection::TraceIdMismatch { expected: 1, got: 42 })
        );
        assert!(cache.ongoing_capture(1).is_some());
        assert!(cache.trace_content(1, 42).is_none());

        // 正确的 stop 依旧成功
        let done = cache.stop_api_trace(1, 500, 1, b"trace".to_vec()).unwrap();
        assert_eq!(done.end_timestamp, 500);
        assert!(cache.ongoing_capture(1).is_none());
        assert_eq!(cache.trace_content(1, 1), Some(&b"trace"[..]));
        assert_eq!(cache.completed_captures(1).len(), 1);
    }

    #[test]
    fn test_startup_capture_rejects_api_stop() {
        let mut cache = TraceCache::new();
        let id = cache.add_startup_profiling(
            "com.example",
            CpuProfilerConfiguration {
                profiler_type: crate::cpu::CpuProfilerType::Simpleperf,
                profiler_mode: crate::cpu::CpuProfilerMode::Sampled,
            },
            "/data/startup.trace".into(),
            10,
        );
        assert!(cache.startup_profiling("com.example").is_some());
        assert!(cache.has_pending_startup());
        assert_eq!(cache.promote_startup_profiling(77, "com.example"), Some(id));
        assert!(cache.startup_profiling("com.example").is_none());
        assert!(!cache.has_pending_startup());

        assert_eq!(
            cache.stop_api_trace(77, 20, id, vec![]),
            Err(TraceRejection::InitiationMismatch)
        );
        // API start 也被进行中的 startup capture 挡住
        assert_eq!(start(&mut cache, 77), TraceStartOutcome { allowed: false, trace_id: id });
    }
}
