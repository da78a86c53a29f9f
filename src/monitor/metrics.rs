// src/monitor/metrics.rs

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::event::EventBuffer;

#[derive(Default)]
pub struct Metrics {
    pub connected_clients: AtomicU64,
    pub total_connections: AtomicU64,
    pub command_count: AtomicU64,
    pub command_errors: AtomicU64,
    pub command_stats: DashMap<String, u64>,
    pub active_sessions: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub fn record_command(&self, command: &str, ok: bool) {
        self.command_count.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.command_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.command_stats.entry(command.to_string()).and_modify(|c| *c += 1).or_insert(1);
    }

    pub fn client_connected(&self) {
        self.connected_clients.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.connected_clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set_active_sessions(&self, n: usize) {
        self.active_sessions.store(n as u64, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn command_errors(&self) -> u64 {
        self.command_errors.load(Ordering::Relaxed)
    }

    pub fn command_total(&self, command: &str) -> u64 {
        self.command_stats.get(command).map(|c| *c).unwrap_or(0)
    }

    pub fn to_prometheus(&self, buffer: &EventBuffer) -> String {
        let mut output = String::new();

        let gauges = [
            ("connected_clients", "gauge", "Current number of client connections", self.connected_clients.load(Ordering::Relaxed)),
            ("total_connections", "counter", "Total connections since startup", self.total_connections.load(Ordering::Relaxed)),
            ("command_count", "counter", "Total commands executed", self.command_count.load(Ordering::Relaxed)),
            ("command_errors", "counter", "Commands that returned an error", self.command_errors()),
            ("active_sessions", "gauge", "Sessions currently being profiled", self.active_sessions()),
            ("events_total", "counter", "Events appended since startup", buffer.total_added()),
            ("events_retained", "gauge", "Events currently held in the buffer", buffer.len() as u64),
            ("stream_readers", "gauge", "Blocked event stream readers", buffer.reader_count() as u64),
        ];
        for (name, kind, help, value) in gauges {
            let _ = writeln!(output, "# HELP crab_perfd_{name} {help}");
            let _ = writeln!(output, "# TYPE crab_perfd_{name} {kind}");
            let _ = writeln!(output, "crab_perfd_{name} {value}");
        }

        output.push_str("# HELP crab_perfd_command_stats Command statistics\n");
        output.push_str("# TYPE crab_perfd_command_stats counter\n");
        let mut stats: Vec<(String, u64)> =
            self.command_stats.iter().map(|e| (e.key().clone(), *e.value())).collect();
        stats.sort();
        for (command, count) in stats {
            let _ = writeln!(output, "crab_perfd_command_stats{{command=\"{command}\"}} {count}");
        }

        output
    }
}
