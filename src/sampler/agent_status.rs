// src/sampler/agent_status.rs

use std::sync::Arc;

use super::{Sampler, SamplerContext, SessionRef};
use crate::agent::{AgentStatus, AgentStatusMap};
use crate::clock::Clock;
use crate::event::{Event, EventBuffer, EventPayload};

/// 读取 daemon 发布的 agent 状态，只在状态变化时产出事件
pub struct AgentStatusSampler {
    session: SessionRef,
    clock: Arc<dyn Clock>,
    buffer: Arc<EventBuffer>,
    statuses: AgentStatusMap,
    last: AgentStatus,
}

impl AgentStatusSampler {
    pub fn new(session: SessionRef, ctx: &SamplerContext) -> Self {
        AgentStatusSampler {
            session,
            clock: ctx.clock.clone(),
            buffer: ctx.buffer.clone(),
            statuses: ctx.agent_statuses.clone(),
            last: AgentStatus::Unspecified,
        }
    }
}

impl Sampler for AgentStatusSampler {
    fn name(&self) -> &'static str {
        "agent-status"
    }

    fn sample(&mut self) {
        let SessionRef { session_id, pid } = self.session;
        let status = self
            .statuses
            .get(&pid)
            .map(|s| *s)
            .unwrap_or(AgentStatus::Unspecified);
        if status == self.last {
            return;
        }
        self.last = status;
        self.buffer.add(Event::new(
            session_id,
            pid,
            pid as i64,
            self.clock.now_ns(),
            EventPayload::Agent { status },
        ));
    }
}
