// src/sampler/network.rs

use std::sync::Arc;

use tracing::debug;

use super::{Sampler, SamplerContext, SessionRef};
use crate::clock::Clock;
use crate::event::{Event, EventBuffer, EventPayload, SpeedDirection};
use crate::procfs::{NetBytes, ProcFs};

const NS_PER_SEC: i128 = 1_000_000_000;

/// 根据相邻两次的收发字节数计算速率（字节/秒）
pub struct NetworkSpeedSampler {
    session: SessionRef,
    clock: Arc<dyn Clock>,
    buffer: Arc<EventBuffer>,
    procfs: ProcFs,
    last: Option<(i64, NetBytes)>,
}

impl NetworkSpeedSampler {
    pub fn new(session: SessionRef, ctx: &SamplerContext) -> Self {
        NetworkSpeedSampler {
            session,
            clock: ctx.clock.clone(),
            buffer: ctx.buffer.clone(),
            procfs: ctx.procfs.clone(),
            last: None,
        }
    }

    fn emit(&self, timestamp: i64, direction: SpeedDirection, throughput: i64) {
        let SessionRef { session_id, pid } = self.session;
        self.buffer.add(Event::new(
            session_id,
            pid,
            direction.group_id(),
            timestamp,
            EventPayload::NetworkSpeed { direction, throughput },
        ));
    }
}

fn speed(prev: i64, now: i64, elapsed_ns: i64) -> i64 {
    // 计数器回绕或网卡重置时按 0 处理
    let delta = (now - prev).max(0) as i128;
    (delta * NS_PER_SEC / elapsed_ns as i128) as i64
}

impl Sampler for NetworkSpeedSampler {
    fn name(&self) -> &'static str {
        "network-speed"
    }

    fn sample(&mut self) {
        let bytes = match self.procfs.net_bytes(self.session.pid) {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(pid = self.session.pid, error = %e, "net/dev read failed");
                return;
            }
        };
        let now = self.clock.now_ns();

        // 第一轮只记录基线
        if let Some((last_ts, last_bytes)) = self.last {
            let elapsed = now - last_ts;
            if elapsed > 0 {
                self.emit(now, SpeedDirection::Rx, speed(last_bytes.rx, bytes.rx, elapsed));
                self.emit(now, SpeedDirection::Tx, speed(last_bytes.tx, bytes.tx, elapsed));
            }
        }
        self.last = Some((now, bytes));
    }
}

/// 统计进程 uid 名下的 TCP 连接数
pub struct NetworkConnectionCountSampler {
    session: SessionRef,
    clock: Arc<dyn Clock>,
    buffer: Arc<EventBuffer>,
    procfs: ProcFs,
    uid: Option<u32>,
}

impl NetworkConnectionCountSampler {
    pub fn new(session: SessionRef, ctx: &SamplerContext) -> Self {
        NetworkConnectionCountSampler {
            session,
            clock: ctx.clock.clone(),
            buffer: ctx.buffer.clone(),
            procfs: ctx.procfs.clone(),
            uid: None,
        }
    }

    fn uid(&mut self) -> Option<u32> {
        if self.uid.is_none() {
            match self.procfs.uid(self.session.pid) {
                Ok(uid) => self.uid = Some(uid),
                Err(e) => debug!(pid = self.session.pid, error = %e, "uid read failed"),
            }
        }
        self.uid
    }
}

impl Sampler for NetworkConnectionCountSampler {
    fn name(&self) -> &'static str {
        "network-connections"
    }

    fn sample(&mut self) {
        let Some(uid) = self.uid() else { return };
        match self.procfs.tcp_connections(self.session.pid, uid) {
            Ok(num_connections) => {
                let SessionRef { session_id, pid } = self.session;
                self.buffer.add(Event::new(
                    session_id,
                    pid,
                    pid as i64,
                    self.clock.now_ns(),
                    EventPayload::NetworkConnections { num_connections },
                ));
            }
            Err(e) => debug!(pid = self.session.pid, error = %e, "tcp table read failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FakeClock, NS_PER_MS};
    use crate::sampler::tests_support::{context_with_clock, write_file};
    use tempfile::tempdir;

    fn net_dev(rx: i64, tx: i64) -> String {
        format!("h1\nh2\n  eth0: {rx} 0 0 0 0 0 0 0 {tx} 0 0 0 0 0 0 0\n")
    }

    #[test]
    fn test_speed_between_samples() {
        let tmp = tempdir().unwrap();
        write_file(tmp.path(), "3/net/dev", &net_dev(1000, 500));
        let clock = Arc::new(FakeClock::new(0));
        let ctx = context_with_clock(tmp.path(), clock.clone());
        let mut sampler = NetworkSpeedSampler::new(SessionRef { session_id: 1, pid: 3 }, &ctx);

        sampler.sample();
        assert!(ctx.buffer.is_empty());

        write_file(tmp.path(), "3/net/dev", &net_dev(3000, 400));
        clock.advance(500 * NS_PER_MS);
        sampler.sample();

        let speeds: Vec<(i64, i64)> = ctx
            .buffer
            .snapshot()
            .iter()
            .map(|e| match &e.payload {
                EventPayload::NetworkSpeed { throughput, .. } => (e.group_id, *throughput),
                other => panic!("unexpected payload {:?}", other),
            })
            .collect();
        assert_eq!(speeds, vec![(0, 4000), (1, 0)]);
    }

    #[test]
    fn test_connection_count() {
        let tmp = tempdir().unwrap();
        write_file(tmp.path(), "4/status", "Uid:\t1000\t1000\t1000\t1000\n");
        write_file(
            tmp.path(),
            "4/net/tcp",
            "header\n 0: A:1 B:2 01 0:0 0:0 0 1000 0 1\n 1: A:1 B:2 01 0:0 0:0 0 2000 0 2\n",
        );
        write_file(tmp.path(), "4/net/tcp6", "header\n 0: A:1 B:2 01 0:0 0:0 0 1000 0 3\n");
        let ctx = context_with_clock(tmp.path(), Arc::new(FakeClock::new(0)));
        let mut sampler =
            NetworkConnectionCountSampler::new(SessionRef { session_id: 1, pid: 4 }, &ctx);
        sampler.sample();

        let events = ctx.buffer.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload, EventPayload::NetworkConnections { num_connections: 2 });
    }
}
