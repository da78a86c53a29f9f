// src/sampler/cpu_usage.rs

use std::sync::Arc;

use anyhow::Result;
use tracing::debug;

use super::{Sampler, SamplerContext, SessionRef};
use crate::clock::Clock;
use crate::event::{CpuUsageData, Event, EventBuffer, EventPayload};
use crate::procfs::{ProcFs, ticks_to_ms};

/// 每轮读取系统与进程的累计 CPU 时间
pub struct CpuUsageSampler {
    session: SessionRef,
    clock: Arc<dyn Clock>,
    buffer: Arc<EventBuffer>,
    procfs: ProcFs,
}

impl CpuUsageSampler {
    pub fn new(session: SessionRef, ctx: &SamplerContext) -> Self {
        CpuUsageSampler {
            session,
            clock: ctx.clock.clone(),
            buffer: ctx.buffer.clone(),
            procfs: ctx.procfs.clone(),
        }
    }

    fn read(&self) -> Result<CpuUsageData> {
        let system = self.procfs.system_cpu()?;
        let app_ticks = self.procfs.process_cpu_ticks(self.session.pid)?;
        Ok(CpuUsageData {
            elapsed_time_in_millisec: ticks_to_ms(system.total),
            system_cpu_time_in_millisec: ticks_to_ms(system.busy),
            app_cpu_time_in_millisec: ticks_to_ms(app_ticks),
            cores: self.procfs.cpu_cores()?,
        })
    }
}

impl Sampler for CpuUsageSampler {
    fn name(&self) -> &'static str {
        "cpu-usage"
    }

    fn sample(&mut self) {
        match self.read() {
            Ok(usage) => {
                let SessionRef { session_id, pid } = self.session;
                self.buffer.add(Event::new(
                    session_id,
                    pid,
                    pid as i64,
                    self.clock.now_ns(),
                    EventPayload::CpuUsage(usage),
                ));
            }
            Err(e) => debug!(pid = self.session.pid, error = %e, "cpu usage read failed"),
        }
    }
}
