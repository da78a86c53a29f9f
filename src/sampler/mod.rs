// src/sampler/mod.rs
//! 周期采样框架
//!
//! 每个 sampler 只负责"读一次、产出零个或多个事件"；
//! `SamplerRunner` 为它提供独立的定时线程，负责启动与停止。
mod agent_status;
mod cpu_thread;
mod cpu_usage;
mod network;

pub use agent_status::AgentStatusSampler;
pub use cpu_thread::CpuThreadSampler;
pub use cpu_usage::CpuUsageSampler;
pub use network::{NetworkConnectionCountSampler, NetworkSpeedSampler};

use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::agent::AgentStatusMap;
use crate::clock::Clock;
use crate::config::Config;
use crate::event::EventBuffer;
use crate::procfs::ProcFs;

/// sampler 对所属 session 的只读引用，不延长 session 的生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRef {
    pub session_id: i64,
    pub pid: i32,
}

/// 一次采样：读取进程状态并把产出的事件追加到缓冲区。
/// 读取失败只意味着这一轮没有事件，不能阻塞，也不向上报错。
pub trait Sampler: Send {
    fn name(&self) -> &'static str;
    fn sample(&mut self);
}

struct Worker {
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// 为一个 sampler 驱动定时线程
pub struct SamplerRunner {
    name: &'static str,
    interval: Duration,
    sampler: Arc<Mutex<Box<dyn Sampler>>>,
    worker: Option<Worker>,
}

impl SamplerRunner {
    pub fn new(sampler: Box<dyn Sampler>, interval: Duration) -> Self {
        SamplerRunner {
            name: sampler.name(),
            interval,
            sampler: Arc::new(Mutex::new(sampler)),
            worker: None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// 启动定时线程，立即采样一次，之后每个周期采样一次；重复调用无效
    pub fn start(&mut self) {
        if self.worker.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let sampler = self.sampler.clone();
        let interval = self.interval;
        let name = self.name;

        let spawned = thread::Builder::new()
            .name(format!("sampler-{name}"))
            .spawn(move || {
                loop {
                    sampler.lock().sample();
                    match stop_rx.recv_timeout(interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        // 收到停止信号或发送端被丢弃
                        _ => break,
                    }
                }
                debug!(sampler = name, "sampler thread exited");
            });

        match spawned {
            Ok(handle) => self.worker = Some(Worker { stop_tx, handle }),
            Err(e) => warn!(sampler = name, error = %e, "failed to spawn sampler thread"),
        }
    }

    /// 停止并等待定时线程退出。正在进行的一次采样会先完成。
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            if worker.handle.join().is_err() {
                warn!(sampler = self.name, "sampler thread panicked");
            }
        }
    }
}

impl Drop for SamplerRunner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 创建 sampler 所需的共享依赖
#[derive(Clone)]
pub struct SamplerContext {
    pub buffer: Arc<EventBuffer>,
    pub clock: Arc<dyn Clock>,
    pub procfs: ProcFs,
    pub agent_statuses: AgentStatusMap,
    pub config: Config,
}

impl SamplerContext {
    /// 为 session 组装完整的 sampler 集合；未开启 unified_pipeline 时为空
    pub fn build_samplers(&self, session: SessionRef) -> Vec<SamplerRunner> {
        if !self.config.unified_pipeline {
            return Vec::new();
        }
        let ms = Duration::from_millis;
        vec![
            SamplerRunner::new(
                Box::new(NetworkConnectionCountSampler::new(session, self)),
                ms(self.config.network_interval_ms),
            ),
            SamplerRunner::new(
                Box::new(NetworkSpeedSampler::new(session, self)),
                ms(self.config.network_interval_ms),
            ),
            SamplerRunner::new(
                Box::new(CpuUsageSampler::new(session, self)),
                ms(self.config.cpu_usage_interval_ms),
            ),
            SamplerRunner::new(
                Box::new(AgentStatusSampler::new(session, self)),
                ms(self.config.agent_status_interval_ms),
            ),
            SamplerRunner::new(
                Box::new(CpuThreadSampler::new(session, self)),
                ms(self.config.cpu_thread_interval_ms),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct CountingSampler {
        count: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl Sampler for CountingSampler {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn sample(&mut self) {
            thread::sleep(self.delay);
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn runner(count: &Arc<AtomicUsize>, delay: Duration) -> SamplerRunner {
        let sampler = CountingSampler { count: count.clone(), delay };
        SamplerRunner::new(Box::new(sampler), Duration::from_millis(5))
    }

    #[test]
    fn test_runner_samples_periodically() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut r = runner(&count, Duration::ZERO);
        r.start();
        assert!(r.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) < 3 {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }
        r.stop();
        assert!(!r.is_running());
    }

    // stop 返回后不再有新的采样
    #[test]
    fn test_stop_quiesces_in_flight_sample() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut r = runner(&count, Duration::from_millis(20));
        r.start();
        thread::sleep(Duration::from_millis(10));

        // 从另一个线程停止，不会与正在进行的采样死锁
        let stopper = thread::spawn(move || {
            r.stop();
            r
        });
        let r = stopper.join().unwrap();
        let after_stop = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
        assert!(!r.is_running());
    }

    #[test]
    fn test_start_twice_and_stop_twice() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut r = runner(&count, Duration::ZERO);
        r.start();
        r.start();
        r.stop();
        r.stop();
        assert!(!r.is_running());
        // 线程启动后先采样一次再检查停止信号
        assert!(count.load(Ordering::SeqCst) >= 1);
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;
    use crate::clock::FakeClock;
    use dashmap::DashMap;
    use std::path::Path;

    pub fn write_file(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn context_with_clock(root: &Path, clock: Arc<dyn Clock>) -> SamplerContext {
        SamplerContext {
            buffer: Arc::new(EventBuffer::new(1024)),
            clock,
            procfs: ProcFs::with_root(root),
            agent_statuses: Arc::new(DashMap::new()),
            config: Config::default(),
        }
    }

    pub fn context(root: &Path) -> SamplerContext {
        context_with_clock(root, Arc::new(FakeClock::new(0)))
    }
}
