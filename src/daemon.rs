// src/daemon.rs
//! # Daemon 核心
//!
//! 所有对会话、trace cache、agent 心跳表的修改都经由 `Daemon::execute`，
//! 在同一把 daemon 锁内串行执行。事件缓冲区有自己的锁，
//! sampler 追加事件时不会被慢命令拖住。
use std::collections::HashMap;
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::agent::{AgentAttacher, AgentStatus, AgentStatusChanged, AgentTracker, ShellAttacher};
use crate::clock::{Clock, SteadyClock};
use crate::command::{
    CommandFactory, CommandReply, CommandRequest, CommandType, StartupAgentConfig, default_registry,
};
use crate::config::Config;
use crate::cpu::TraceCache;
use crate::error::DaemonError;
use crate::event::{EventBuffer, EventGroup, EventWriter, GetEventGroupsRequest};
use crate::monitor::Metrics;
use crate::procfs::ProcFs;
use crate::sampler::SamplerContext;
use crate::session::SessionsManager;

/// daemon 锁保护的全部可变状态
pub struct DaemonState {
    pub sessions: SessionsManager,
    pub traces: TraceCache,
    pub agents: AgentTracker,
    /// app 包名 -> 启动前配置的 agent 参数
    pub startup_agents: HashMap<String, StartupAgentConfig>,
}

pub struct Daemon {
    clock: Arc<dyn Clock>,
    config: Config,
    buffer: Arc<EventBuffer>,
    procfs: ProcFs,
    state: Mutex<DaemonState>,
    commands: HashMap<CommandType, CommandFactory>,
    metrics: Arc<Metrics>,
}

/// 组装 daemon；测试里用来替换时钟、procfs 根目录和 agent 注入方式
pub struct DaemonBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    buffer: Option<Arc<EventBuffer>>,
    attacher: Option<Arc<dyn AgentAttacher>>,
    procfs: Option<ProcFs>,
    metrics: Option<Arc<Metrics>>,
    commands: HashMap<CommandType, CommandFactory>,
}

impl DaemonBuilder {
    pub fn new(config: Config) -> Self {
        DaemonBuilder {
            config,
            clock: None,
            buffer: None,
            attacher: None,
            procfs: None,
            metrics: None,
            commands: default_registry(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn buffer(mut self, buffer: Arc<EventBuffer>) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn attacher(mut self, attacher: Arc<dyn AgentAttacher>) -> Self {
        self.attacher = Some(attacher);
        self
    }

    pub fn procfs(mut self, procfs: ProcFs) -> Self {
        self.procfs = Some(procfs);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 注册（或覆盖）某个命令类型的工厂
    pub fn command(mut self, command_type: CommandType, factory: CommandFactory) -> Self {
        self.commands.insert(command_type, factory);
        self
    }

    pub fn build(self) -> Daemon {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SteadyClock::new()));
        let buffer = self
            .buffer
            .unwrap_or_else(|| Arc::new(EventBuffer::new(config.event_retention)));
        let attacher = self
            .attacher
            .unwrap_or_else(|| Arc::new(ShellAttacher::new(config.attach_program.clone())));
        let procfs = self.procfs.unwrap_or_default();

        let agents = AgentTracker::new(
            attacher,
            duration_ns(config.heartbeat_threshold()),
            duration_ns(config.agent_entry_ttl()),
        );
        let ctx = SamplerContext {
            buffer: buffer.clone(),
            clock: clock.clone(),
            procfs: procfs.clone(),
            agent_statuses: agents.status_map(),
            config: config.clone(),
        };
        let state = DaemonState {
            sessions: SessionsManager::new(ctx),
            traces: TraceCache::new(),
            agents,
            startup_agents: HashMap::new(),
        };

        Daemon {
            clock,
            config,
            buffer,
            procfs,
            state: Mutex::new(state),
            commands: self.commands,
            metrics: self.metrics.unwrap_or_default(),
        }
    }
}

fn duration_ns(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        DaemonBuilder::new(config).build()
    }

    pub fn builder(config: Config) -> DaemonBuilder {
        DaemonBuilder::new(config)
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn buffer(&self) -> &Arc<EventBuffer> {
        &self.buffer
    }

    pub fn procfs(&self) -> &ProcFs {
        &self.procfs
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// 执行一条命令；与其他 `execute` 调用互斥
    pub fn execute(&self, request: &CommandRequest) -> Result<CommandReply, DaemonError> {
        self.execute_with(request, |_| {})
    }

    /// 执行命令后，在释放 daemon 锁之前调用 `post`
    pub fn execute_with<F>(&self, request: &CommandRequest, post: F) -> Result<CommandReply, DaemonError>
    where
        F: FnOnce(&mut DaemonState),
    {
        let command_type = request.command_type;
        let result = self.run_locked(request, post);
        self.metrics.record_command(command_type.as_str(), result.is_ok());
        if let Err(e) = &result {
            warn!(command = %command_type, pid = request.pid, error = %e, "command failed");
        }
        result
    }

    fn run_locked<F>(&self, request: &CommandRequest, post: F) -> Result<CommandReply, DaemonError>
    where
        F: FnOnce(&mut DaemonState),
    {
        let factory = self
            .commands
            .get(&request.command_type)
            .ok_or(DaemonError::UnknownCommand(request.command_type))?;
        let command = factory(request)?;

        let mut state = self.state.lock();
        debug!(command = %command.command_type(), pid = request.pid, "executing command");
        let result = command.execute_on(self, &mut state);
        post(&mut state);
        self.metrics.set_active_sessions(state.sessions.active_count());
        result
    }

    /// 在 daemon 锁内只读查看状态
    pub fn inspect<R>(&self, f: impl FnOnce(&DaemonState) -> R) -> R {
        f(&self.state.lock())
    }

    pub fn get_event_groups(&self, request: &GetEventGroupsRequest) -> Vec<EventGroup> {
        self.buffer.get_event_groups(request)
    }

    /// 阻塞当前线程，持续把事件写给 `writer`
    pub fn write_events_to(&self, writer: &mut dyn EventWriter) {
        self.buffer.write_events_to(writer);
    }

    pub fn interrupt_write_events(&self) {
        self.buffer.interrupt_write_events();
    }

    pub fn get_agent_status(&self, pid: i32) -> AgentStatus {
        self.state.lock().agents.status(pid)
    }

    pub fn add_agent_status_changed_callback(&self, callback: AgentStatusChanged) {
        self.state.lock().agents.add_status_changed_callback(callback);
    }

    /// 扫描一次心跳表，返回本轮断开的 pid
    pub fn scan_agent_status(&self) -> Vec<i32> {
        let mut state = self.state.lock();
        let detached = state.agents.scan(self.clock.now_ns());
        for pid in &detached {
            info!(pid, "agent heartbeat lost");
        }
        detached
    }

    /// 启动后台心跳扫描线程；返回的句柄 drop 时停止线程
    pub fn start_status_thread(self: &Arc<Self>) -> Result<StatusThread> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let daemon = self.clone();
        let interval = self.config.status_scan_interval();

        let handle = thread::Builder::new()
            .name("agent-status".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            daemon.scan_agent_status();
                        }
                        _ => break,
                    }
                }
                debug!("agent status thread exited");
            })
            .context("spawning agent status thread")?;

        Ok(StatusThread { stop_tx: Some(stop_tx), handle: Some(handle) })
    }

    /// 结束所有仍活跃的会话并停止它们的 sampler
    pub fn shutdown(&self) -> usize {
        let mut state = self.state.lock();
        let ended = state.sessions.end_all(self.clock.now_ns());
        self.metrics.set_active_sessions(state.sessions.active_count());
        drop(state);
        self.buffer.interrupt_write_events();
        info!(ended, "daemon shut down");
        ended
    }
}

pub struct StatusThread {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StatusThread {
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("agent status thread panicked");
            }
        }
    }
}

impl Drop for StatusThread {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FakeClock, ms_to_ns};
    use crate::command::Command;
    use crate::event::{EventKind, EventPayload};
    use serde_json::json;

    struct NeverAttach;

    impl AgentAttacher for NeverAttach {
        fn attach(&self, _pid: i32, _app_name: &str, _lib_file: &str) -> bool {
            false
        }
    }

    fn daemon(clock: Arc<FakeClock>) -> Daemon {
        let config = Config { unified_pipeline: false, ..Config::default() };
        Daemon::builder(config)
            .clock(clock)
            .attacher(Arc::new(NeverAttach))
            .procfs(ProcFs::with_root("/nonexistent-proc"))
            .build()
    }

    fn begin(pid: i32, start: i64) -> CommandRequest {
        CommandRequest::new(CommandType::BeginSession, pid)
            .with_stream(1)
            .with_payload(&json!({"start_timestamp": start}))
    }

    #[test]
    fn test_begin_session_emits_event_and_updates_metrics() {
        let d = daemon(Arc::new(FakeClock::new(0)));
        let reply = d.execute(&begin(100, 1000)).unwrap();
        let CommandReply::Session(info) = reply else {
            panic!("unexpected reply {reply:?}");
        };
        assert_eq!(info.start_timestamp, 1000);

        let events = d.buffer().snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Session);
        assert_eq!(events[0].group_id, info.session_id);
        assert_eq!(d.metrics().active_sessions(), 1);
        assert_eq!(d.metrics().command_total("BEGIN_SESSION"), 1);
    }

    #[test]
    fn test_failed_command_leaves_state_unchanged() {
        let d = daemon(Arc::new(FakeClock::new(0)));
        d.execute(&begin(100, 1000)).unwrap();
        assert_eq!(
            d.execute(&begin(100, 2000)),
            Err(DaemonError::AlreadyActive { device_id: 1, pid: 100 })
        );
        assert_eq!(d.buffer().len(), 1);
        assert_eq!(d.inspect(|s| s.sessions.active_count()), 1);
        assert_eq!(d.metrics().command_errors(), 1);
    }

    #[test]
    fn test_factory_error_propagates() {
        fn noop(_: &CommandRequest) -> Result<Box<dyn Command>, DaemonError> {
            Err(DaemonError::UnknownCommand(CommandType::Echo))
        }
        let d = Daemon::builder(Config::default())
            .command(CommandType::Echo, noop)
            .build();
        assert_eq!(
            d.execute(&CommandRequest::new(CommandType::Echo, 1)),
            Err(DaemonError::UnknownCommand(CommandType::Echo))
        );
    }

    #[test]
    fn test_post_callback_runs_under_lock() {
        let d = daemon(Arc::new(FakeClock::new(0)));
        let mut seen = None;
        d.execute_with(&begin(100, 1000), |state| {
            seen = Some(state.sessions.active_count());
        })
        .unwrap();
        assert_eq!(seen, Some(1));
    }

    // 心跳使用 daemon 时钟；超过阈值后扫描一次切换为 Detached
    #[test]
    fn test_heartbeat_and_scan() {
        let clock = Arc::new(FakeClock::new(0));
        let d = daemon(clock.clone());
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = fired.clone();
        d.add_agent_status_changed_callback(Box::new(move |pid| sink.lock().push(pid)));

        let heartbeat = CommandRequest::new(CommandType::AgentHeartbeat, 42);
        d.execute(&heartbeat).unwrap();
        assert_eq!(d.get_agent_status(42), AgentStatus::Attached);

        clock.advance(ms_to_ns(400));
        assert!(d.scan_agent_status().is_empty());
        clock.advance(ms_to_ns(200));
        assert_eq!(d.scan_agent_status(), vec![42]);
        assert!(d.scan_agent_status().is_empty());
        assert_eq!(d.get_agent_status(42), AgentStatus::Detached);
        assert_eq!(*fired.lock(), vec![42, 42]);
    }

    #[test]
    fn test_status_thread_detaches_in_background() {
        let clock = Arc::new(FakeClock::new(0));
        let config = Config { unified_pipeline: false, status_scan_interval_ms: 5, ..Config::default() };
        let d = Arc::new(Daemon::builder(config).clock(clock.clone()).build());
        d.execute(&CommandRequest::new(CommandType::AgentHeartbeat, 7)).unwrap();
        clock.advance(ms_to_ns(1000));

        let mut status = d.start_status_thread().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while d.get_agent_status(7) != AgentStatus::Detached {
            assert!(std::time::Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        status.stop();
    }

    #[test]
    fn test_shutdown_ends_active_sessions() {
        let clock = Arc::new(FakeClock::new(5000));
        let d = daemon(clock);
        d.execute(&begin(100, 1000)).unwrap();
        d.execute(&begin(200, 1000)).unwrap();
        assert_eq!(d.shutdown(), 2);
        assert_eq!(d.inspect(|s| s.sessions.active_count()), 0);
        assert!(d.inspect(|s| s.sessions.sessions().all(|i| i.end_timestamp == 5000)));
        assert!(d.buffer().snapshot().iter().all(|e| matches!(
            e.payload,
            EventPayload::SessionStarted { .. }
        )));
    }
}
