// src/event/buffer.rs

use std::collections::{HashMap, VecDeque};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::{Event, EventGroup, GetEventGroupsRequest};

/// 流式读者的写出端；返回 false 表示下游已经断开，读取随之结束
pub trait EventWriter {
    fn write(&mut self, event: &Event) -> bool;
}

impl<F> EventWriter for F
where
    F: FnMut(&Event) -> bool,
{
    fn write(&mut self, event: &Event) -> bool {
        self(event)
    }
}

struct Inner {
    events: VecDeque<Event>,
    /// 下一个事件的序号，从 1 开始
    next_sequence: u64,
    readers: usize,
    /// 中断时刻的 next_sequence；读者把它之前的事件写完后退出
    interrupt_at: Option<u64>,
}

impl Inner {
    fn oldest_sequence(&self) -> u64 {
        self.next_sequence - self.events.len() as u64
    }
}

/// 追加式、线程安全的事件序列
///
/// `add` 从不阻塞在读者上；超出保留上限时丢弃最旧的事件。
pub struct EventBuffer {
    inner: Mutex<Inner>,
    cond: Condvar,
    capacity: usize,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        EventBuffer {
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                next_sequence: 1,
                readers: 0,
                interrupt_at: None,
            }),
            cond: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// 追加事件并唤醒读者，返回分配到的序号
    pub fn add(&self, mut event: Event) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.next_sequence;
        event.sequence = seq;
        inner.next_sequence += 1;
        inner.events.push_back(event);
        if inner.events.len() > self.capacity {
            inner.events.pop_front();
        }
        drop(inner);
        self.cond.notify_all();
        seq
    }

    /// 把已有的和之后新增的事件按追加顺序写给 `writer`。
    /// 阻塞直到 `interrupt_write_events` 被调用或 writer 返回 false。
    pub fn write_events_to(&self, writer: &mut dyn EventWriter) {
        let mut inner = self.inner.lock();
        inner.readers += 1;
        let mut cursor = inner.oldest_sequence();
        debug!(cursor, "event stream opened");

        loop {
            let limit = inner.interrupt_at.unwrap_or(inner.next_sequence);
            let oldest = inner.oldest_sequence();
            if cursor < oldest {
                warn!(skipped = oldest - cursor, "stream reader fell behind retention");
                cursor = oldest;
            }

            if cursor < limit {
                let start = (cursor - oldest) as usize;
                let end = (limit - oldest) as usize;
                let batch: Vec<Event> = inner.events.range(start..end).cloned().collect();
                cursor = limit;
                // 写出时不持有锁，add 不会被慢读者拖住
                let open = MutexGuard::unlocked(&mut inner, || {
                    batch.iter().all(|event| writer.write(event))
                });
                if !open {
                    debug!("event writer closed");
                    break;
                }
                continue;
            }

            if inner.interrupt_at.is_some() {
                inner.interrupt_at = None;
                break;
            }
            self.cond.wait(&mut inner);
        }

        inner.readers -= 1;
        if inner.readers == 0 {
            inner.interrupt_at = None;
        }
        debug!(cursor, "event stream closed");
    }

    /// 让正在阻塞的 `write_events_to` 返回；没有读者时什么也不做
    pub fn interrupt_write_events(&self) {
        let mut inner = self.inner.lock();
        if inner.readers == 0 {
            return;
        }
        if inner.interrupt_at.is_none() {
            inner.interrupt_at = Some(inner.next_sequence);
        }
        drop(inner);
        self.cond.notify_all();
    }

    /// 按 group_id 分组的只读快照，组顺序为首次出现顺序
    pub fn get_event_groups(&self, request: &GetEventGroupsRequest) -> Vec<EventGroup> {
        let inner = self.inner.lock();
        let mut groups: Vec<EventGroup> = Vec::new();
        let mut index: HashMap<i64, usize> = HashMap::new();

        for event in inner.events.iter().filter(|e| request.matches(e)) {
            let slot = *index.entry(event.group_id).or_insert_with(|| {
                groups.push(EventGroup { group_id: event.group_id, events: Vec::new() });
                groups.len() - 1
            });
            groups[slot].events.push(event.clone());
        }
        groups
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.inner.lock().events.iter().cloned().collect()
    }

    /// 当前保留的事件数
    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 自启动以来追加过的事件总数
    pub fn total_added(&self) -> u64 {
        self.inner.lock().next_sequence - 1
    }

    pub fn reader_count(&self) -> usize {
        self.inner.lock().readers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, EventPayload};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn echo(session_id: i64, group_id: i64, data: &str) -> Event {
        Event::new(session_id, 1, group_id, 0, EventPayload::Echo { data: data.to_string() })
    }

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    // 序号按追加顺序单调递增
    #[test]
    fn test_add_assigns_sequence() {
        let buffer = EventBuffer::new(16);
        assert_eq!(buffer.add(echo(1, 0, "a")), 1);
        assert_eq!(buffer.add(echo(1, 0, "b")), 2);
        let events = buffer.snapshot();
        assert_eq!(events.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(buffer.total_added(), 2);
    }

    // 超出保留上限丢弃最旧事件
    #[test]
    fn test_retention_drops_oldest() {
        let buffer = EventBuffer::new(3);
        for i in 0..5 {
            buffer.add(echo(1, 0, &i.to_string()));
        }
        let seqs: Vec<u64> = buffer.snapshot().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![3, 4, 5]);
        assert_eq!(buffer.total_added(), 5);
    }

    #[test]
    fn test_interrupt_without_reader_is_noop() {
        let buffer = Arc::new(EventBuffer::new(16));
        buffer.interrupt_write_events();
        buffer.add(echo(1, 0, "a"));

        // 之前的中断不会让后来的读者立即退出
        let reader = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                buffer.write_events_to(&mut |e: &Event| {
                    seen.push(e.sequence);
                    true
                });
                seen
            })
        };
        wait_until(|| buffer.reader_count() == 1);
        thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());

        buffer.interrupt_write_events();
        assert_eq!(reader.join().unwrap(), vec![1]);
        assert_eq!(buffer.reader_count(), 0);
    }

    // 中断前已排队但尚未送达的事件照常送达，中断之后追加的不再送达
    #[test]
    fn test_interrupt_keeps_queued_events() {
        let buffer = Arc::new(EventBuffer::new(16));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        buffer.add(echo(1, 0, "a"));

        let reader = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                buffer.write_events_to(&mut |e: &Event| {
                    if seen.is_empty() {
                        entered_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                    }
                    seen.push(e.sequence);
                    true
                });
                seen
            })
        };

        // 读者卡在第一个事件上，且不持有缓冲区的锁
        entered_rx.recv().unwrap();
        buffer.add(echo(1, 0, "b"));
        buffer.add(echo(1, 0, "c"));
        buffer.interrupt_write_events();
        buffer.add(echo(1, 0, "late"));
        release_tx.send(()).unwrap();

        assert_eq!(reader.join().unwrap(), vec![1, 2, 3]);
        assert_eq!(buffer.reader_count(), 0);
        assert_eq!(buffer.total_added(), 4);
    }

    // writer 返回 false 时读取结束
    #[test]
    fn test_writer_close_ends_stream() {
        let buffer = EventBuffer::new(16);
        buffer.add(echo(1, 0, "a"));
        buffer.add(echo(1, 0, "b"));
        let mut count = 0;
        buffer.write_events_to(&mut |_: &Event| {
            count += 1;
            false
        });
        assert_eq!(count, 1);
        assert_eq!(buffer.reader_count(), 0);
    }

    // N 个并发写者：每个事件恰好送达一次，且保持各写者内部顺序
    #[test]
    fn test_concurrent_producers_single_reader() {
        const PRODUCERS: i64 = 4;
        const PER_PRODUCER: usize = 250;
        let buffer = Arc::new(EventBuffer::new(10_000));
        let received = Arc::new(Mutex::new(Vec::<Event>::new()));

        let reader = {
            let buffer = buffer.clone();
            let received = received.clone();
            thread::spawn(move || {
                buffer.write_events_to(&mut |e: &Event| {
                    received.lock().push(e.clone());
                    true
                });
            })
        };

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let buffer = buffer.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        buffer.add(echo(1, p, &i.to_string()));
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let total = PRODUCERS as usize * PER_PRODUCER;
        wait_until(|| received.lock().len() == total);
        buffer.interrupt_write_events();
        reader.join().unwrap();

        let received = received.lock();
        assert_eq!(received.len(), total);
        for p in 0..PRODUCERS {
            let mine: Vec<String> = received
                .iter()
                .filter(|e| e.group_id == p)
                .map(|e| match &e.payload {
                    EventPayload::Echo { data } => data.clone(),
                    other => panic!("unexpected payload {:?}", other),
                })
                .collect();
            let expected: Vec<String> = (0..PER_PRODUCER).map(|i| i.to_string()).collect();
            assert_eq!(mine, expected);
        }
        let mut seqs: Vec<u64> = received.iter().map(|e| e.sequence).collect();
        let sorted = {
            let mut s = seqs.clone();
            s.sort();
            s
        };
        assert_eq!(seqs, sorted);
        seqs.dedup();
        assert_eq!(seqs.len(), total);
    }

    #[test]
    fn test_get_event_groups_filters_and_groups() {
        let buffer = EventBuffer::new(64);
        buffer.add(echo(1, 7, "a"));
        buffer.add(echo(2, 7, "other session"));
        buffer.add(echo(1, 3, "b"));
        buffer.add(echo(1, 7, "c"));
        buffer.add(Event::new(1, 1, 7, 0, EventPayload::SessionEnded { end_timestamp: 0 }));

        let groups = buffer.get_event_groups(&GetEventGroupsRequest::new(1, EventKind::Echo));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].group_id, 7);
        assert_eq!(groups[0].events.len(), 2);
        assert_eq!(groups[1].group_id, 3);
        assert_eq!(groups[1].events.len(), 1);
    }

    #[test]
    fn test_get_event_groups_time_range() {
        let buffer = EventBuffer::new(64);
        for ts in [10, 20, 30] {
            buffer.add(Event::new(1, 1, 0, ts, EventPayload::Echo { data: ts.to_string() }));
        }
        let mut request = GetEventGroupsRequest::new(1, EventKind::Echo);
        request.from_timestamp = 15;
        request.to_timestamp = 30;
        let groups = buffer.get_event_groups(&request);
        let stamps: Vec<i64> = groups[0].events.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![20, 30]);
    }
}
