// src/session/manager.rs

use std::collections::HashMap;

use tracing::{info, warn};

use super::{Session, SessionInfo, SESSION_ACTIVE, derive_session_id};
use crate::error::DaemonError;
use crate::sampler::{SamplerContext, SessionRef};

/// 创建、查找、结束会话；同一 (device_id, pid) 同时最多一个活跃会话
pub struct SessionsManager {
    ctx: SamplerContext,
    // session_id -> 会话（结束后保留，只是不再活跃）
    sessions: HashMap<i64, Session>,
    // (device_id, pid) -> 活跃会话 id
    active: HashMap<(i64, i32), i64>,
    // pid -> 该 pid 最近开始的会话 id
    by_pid: HashMap<i32, i64>,
}

impl SessionsManager {
    pub fn new(ctx: SamplerContext) -> Self {
        SessionsManager {
            ctx,
            sessions: HashMap::new(),
            active: HashMap::new(),
            by_pid: HashMap::new(),
        }
    }

    pub fn begin_session(
        &mut self,
        device_id: i64,
        pid: i32,
        start_timestamp: i64,
    ) -> Result<SessionInfo, DaemonError> {
        if self.active.contains_key(&(device_id, pid)) {
            warn!(device_id, pid, "begin session rejected, session already active");
            return Err(DaemonError::AlreadyActive { device_id, pid });
        }

        let mut session_id = derive_session_id(device_id, start_timestamp);
        while self.sessions.contains_key(&session_id) {
            warn!(session_id, "derived session id collides, probing next");
            session_id = session_id.wrapping_add(1);
        }

        let info = SessionInfo {
            session_id,
            device_id,
            pid,
            start_timestamp,
            end_timestamp: SESSION_ACTIVE,
        };
        let samplers = self.ctx.build_samplers(SessionRef { session_id, pid });
        let mut session = Session::new(info.clone(), samplers);
        session.start_samplers();

        self.sessions.insert(session_id, session);
        self.active.insert((device_id, pid), session_id);
        self.by_pid.insert(pid, session_id);
        info!(session_id, device_id, pid, "session started");
        Ok(info)
    }

    /// 会话不存在或已结束时返回 false，不做任何改动
    pub fn end_session(&mut self, session_id: i64, end_timestamp: i64) -> bool {
        let Some(session) = self.sessions.get_mut(&session_id) else {
            return false;
        };
        if !session.end(end_timestamp) {
            return false;
        }
        let key = (session.info().device_id, session.info().pid);
        self.active.remove(&key);
        info!(session_id, "session ended");
        true
    }

    /// 结束所有活跃会话（daemon 关闭时调用），返回结束的数量
    pub fn end_all(&mut self, end_timestamp: i64) -> usize {
        let ids: Vec<i64> = self.active.values().copied().collect();
        ids.into_iter()
            .filter(|id| self.end_session(*id, end_timestamp))
            .count()
    }

    pub fn get(&self, session_id: i64) -> Option<&Session> {
        self.sessions.get(&session_id)
    }

    /// pid 当前的活跃会话
    pub fn active_session_for_pid(&self, pid: i32) -> Option<&Session> {
        let id = self.by_pid.get(&pid)?;
        self.sessions.get(id).filter(|s| s.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionInfo> {
        self.sessions.values().map(Session::info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::config::Config;
    use crate::event::EventBuffer;
    use crate::procfs::ProcFs;
    use dashmap::DashMap;
    use std::sync::Arc;

    fn manager(unified_pipeline: bool) -> SessionsManager {
        let config = Config { unified_pipeline, cpu_usage_interval_ms: 10, ..Config::default() };
        SessionsManager::new(SamplerContext {
            buffer: Arc::new(EventBuffer::new(1024)),
            clock: Arc::new(FakeClock::new(0)),
            procfs: ProcFs::with_root("/nonexistent-proc"),
            agent_statuses: Arc::new(DashMap::new()),
            config,
        })
    }

    // 同一 pid 任意时刻最多一个活跃会话
    #[test]
    fn test_one_active_session_per_pid() {
        let mut m = manager(false);
        let s1 = m.begin_session(1, 100, 1000).unwrap();
        assert_eq!(
            m.begin_session(1, 100, 1500),
            Err(DaemonError::AlreadyActive { device_id: 1, pid: 100 })
        );
        assert_eq!(m.active_count(), 1);

        // 其他 pid 不受影响
        m.begin_session(1, 200, 1500).unwrap();
        assert_eq!(m.active_count(), 2);

        assert!(m.end_session(s1.session_id, 2000));
        let s2 = m.begin_session(1, 100, 3000).unwrap();
        assert_ne!(s1.session_id, s2.session_id);
        assert_eq!(m.active_session_for_pid(100).unwrap().info().session_id, s2.session_id);
    }

    #[test]
    fn test_end_unknown_or_inactive_returns_false() {
        let mut m = manager(false);
        assert!(!m.end_session(12345, 10));
        let s = m.begin_session(1, 100, 1000).unwrap();
        assert!(m.end_session(s.session_id, 2000));
        assert!(!m.end_session(s.session_id, 3000));
        assert_eq!(m.get(s.session_id).unwrap().info().end_timestamp, 2000);
        assert!(m.active_session_for_pid(100).is_none());
    }

    // 推导出的 id 冲突时顺延
    #[test]
    fn test_colliding_session_ids_step_forward() {
        let mut m = manager(false);
        let a = m.begin_session(1, 100, 1000).unwrap();
        let b = m.begin_session(1, 200, 1000).unwrap();
        assert_eq!(b.session_id, a.session_id + 1);
    }

    #[test]
    fn test_samplers_started_and_stopped() {
        let mut m = manager(true);
        let s = m.begin_session(1, 100, 1000).unwrap();
        let session = m.get(s.session_id).unwrap();
        assert_eq!(session.running_samplers(), 5);
        assert_eq!(
            session.sampler_names(),
            vec!["network-connections", "network-speed", "cpu-usage", "agent-status", "cpu-thread"]
        );
        assert_eq!(m.end_all(2000), 1);
        assert_eq!(m.get(s.session_id).unwrap().running_samplers(), 0);
        assert_eq!(m.active_count(), 0);
    }
}
