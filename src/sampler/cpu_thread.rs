// src/sampler/cpu_thread.rs

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{Sampler, SamplerContext, SessionRef};
use crate::clock::Clock;
use crate::event::{Event, EventBuffer, EventPayload, ThreadActivity, ThreadState};
use crate::procfs::ProcFs;

/// 只在线程状态变化时产出事件；消失的线程产出一条 Dead 结束事件
pub struct CpuThreadSampler {
    session: SessionRef,
    clock: Arc<dyn Clock>,
    buffer: Arc<EventBuffer>,
    procfs: ProcFs,
    // tid -> (name, 上次状态)
    previous: HashMap<i32, (String, ThreadState)>,
}

impl CpuThreadSampler {
    pub fn new(session: SessionRef, ctx: &SamplerContext) -> Self {
        CpuThreadSampler {
            session,
            clock: ctx.clock.clone(),
            buffer: ctx.buffer.clone(),
            procfs: ctx.procfs.clone(),
            previous: HashMap::new(),
        }
    }

    fn emit(&self, timestamp: i64, tid: i32, name: String, state: ThreadState) {
        let SessionRef { session_id, pid } = self.session;
        let mut event = Event::new(
            session_id,
            pid,
            tid as i64,
            timestamp,
            EventPayload::CpuThread(ThreadActivity { tid, name, state }),
        );
        if state == ThreadState::Dead {
            event = event.ended();
        }
        self.buffer.add(event);
    }
}

impl Sampler for CpuThreadSampler {
    fn name(&self) -> &'static str {
        "cpu-thread"
    }

    fn sample(&mut self) {
        let tasks = match self.procfs.threads(self.session.pid) {
            Ok(tasks) => tasks,
            Err(e) => {
                debug!(pid = self.session.pid, error = %e, "thread list read failed");
                return;
            }
        };
        let now = self.clock.now_ns();
        let mut current = HashMap::with_capacity(tasks.len());

        for task in tasks {
            let state = ThreadState::from_proc_char(task.state);
            let changed = self
                .previous
                .get(&task.tid)
                .is_none_or(|(_, prev)| *prev != state);
            if changed {
                self.emit(now, task.tid, task.name.clone(), state);
            }
            current.insert(task.tid, (task.name, state));
        }

        let mut gone: Vec<(i32, String)> = self
            .previous
            .iter()
            .filter(|(tid, _)| !current.contains_key(*tid))
            .map(|(tid, (name, _))| (*tid, name.clone()))
            .collect();
        gone.sort_by_key(|(tid, _)| *tid);
        for (tid, name) in gone {
            self.emit(now, tid, name, ThreadState::Dead);
        }

        self.previous = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::tests_support::{context, write_file};
    use std::fs;
    use tempfile::tempdir;

    fn task(root: &std::path::Path, tid: i32, name: &str, state: char) {
        write_file(
            root,
            &format!("5/task/{tid}/stat"),
            &format!("{tid} ({name}) {state} 1 1 0 0 -1 0 0 0 0 0 1 1 0 0 20 0 1 0"),
        );
    }

    fn states(ctx: &SamplerContext) -> Vec<(i32, ThreadState, bool)> {
        ctx.buffer
            .snapshot()
            .iter()
            .map(|e| match &e.payload {
                EventPayload::CpuThread(a) => (a.tid, a.state, e.ended),
                other => panic!("unexpected payload {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_only_changes_are_emitted() {
        let tmp = tempdir().unwrap();
        task(tmp.path(), 5, "main", 'R');
        task(tmp.path(), 6, "worker", 'S');
        let ctx = context(tmp.path());
        let mut sampler = CpuThreadSampler::new(SessionRef { session_id: 1, pid: 5 }, &ctx);

        sampler.sample();
        assert_eq!(
            states(&ctx),
            vec![(5, ThreadState::Running, false), (6, ThreadState::Sleeping, false)]
        );

        // 无变化，不产出事件
        sampler.sample();
        assert_eq!(ctx.buffer.len(), 2);

        // worker 状态变化，main 退出
        task(tmp.path(), 6, "worker", 'R');
        fs::remove_dir_all(tmp.path().join("5/task/5")).unwrap();
        sampler.sample();
        let all = states(&ctx);
        assert_eq!(
            all[2..].to_vec(),
            vec![(6, ThreadState::Running, false), (5, ThreadState::Dead, true)]
        );
    }
}
