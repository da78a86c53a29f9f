// src/monitor/client.rs

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use super::ClientInfo;

pub struct ClientTracker {
    clients: Mutex<HashMap<u64, ClientInfo>>,
    next_id: AtomicU64,
}

impl Default for ClientTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientTracker {
    pub fn new() -> Self {
        ClientTracker { clients: Mutex::new(HashMap::new()), next_id: AtomicU64::new(1) }
    }

    pub fn add_client(&self, addr: SocketAddr, listener: &'static str) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let now = Instant::now();
        self.clients.lock().insert(
            id,
            ClientInfo { addr, listener, connect_time: now, last_op: "None".to_string(), last_op_time: now },
        );
        id
    }

    pub fn remove_client(&self, id: u64) {
        self.clients.lock().remove(&id);
    }

    pub fn update_op(&self, id: u64, op: &str) {
        if let Some(client) = self.clients.lock().get_mut(&id) {
            client.last_op = op.to_string();
            client.last_op_time = Instant::now();
        }
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn list_clients(&self) -> String {
        let clients = self.clients.lock();
        let mut ids: Vec<&u64> = clients.keys().collect();
        ids.sort();
        let mut response = String::new();
        for id in ids {
            let client = &clients[id];
            response.push_str(&format!(
                "id={} addr={} listener={} age={}s idle={}s op={}\n",
                id,
                client.addr,
                client.listener,
                client.connect_time.elapsed().as_secs(),
                client.last_op_time.elapsed().as_secs(),
                client.last_op
            ));
        }
        response
    }
}
