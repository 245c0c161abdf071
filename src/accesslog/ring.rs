//! Fixed-capacity ring buffer backing the access-log pipeline's in-memory
//! store. Oldest entries fall off the back once capacity is reached.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use crate::model::AccessLog;

pub struct RingBuffer {
    capacity: usize,
    entries: VecDeque<AccessLog>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, log: AccessLog) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(log);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccessLog> {
        self.entries.iter()
    }

    /// Drops the oldest entries whose timestamp is at or before `cutoff`.
    /// Assumes entries are inserted in roughly chronological order, which
    /// holds because the pipeline's workers append in arrival order.
    pub fn retain_after(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|log| log.timestamp > cutoff);
        before - self.entries.len()
    }

    /// Drops the oldest `fraction` of entries (rounded up), used under
    /// memory pressure. Returns the number removed.
    pub fn evict_fraction(&mut self, fraction: f64) -> usize {
        let to_remove = ((self.entries.len() as f64) * fraction).ceil() as usize;
        let to_remove = to_remove.min(self.entries.len());
        for _ in 0..to_remove {
            self.entries.pop_front();
        }
        to_remove
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestType;
    use std::collections::HashMap;

    fn log_at(id: &str, timestamp: DateTime<Utc>) -> AccessLog {
        AccessLog {
            id: id.to_string(),
            timestamp,
            method: "GET".to_string(),
            target_host: "h".to_string(),
            target_path: "/".to_string(),
            status_code: 200,
            duration_ms: 1,
            request_type: RequestType::Http,
            client_ip: String::new(),
            user_agent: String::new(),
            proxy_info: None,
            request_headers: HashMap::new(),
            request_body: None,
            response_headers: HashMap::new(),
            response_body: None,
            request_size: 0,
            response_size: 0,
        }
    }

    #[test]
    fn push_evicts_oldest_beyond_capacity() {
        let mut buffer = RingBuffer::new(2);
        buffer.push(log_at("a", Utc::now()));
        buffer.push(log_at("b", Utc::now()));
        buffer.push(log_at("c", Utc::now()));
        assert_eq!(buffer.len(), 2);
        let ids: Vec<&str> = buffer.iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn evict_fraction_rounds_up() {
        let mut buffer = RingBuffer::new(10);
        for i in 0..9 {
            buffer.push(log_at(&format!("{i}"), Utc::now()));
        }
        let removed = buffer.evict_fraction(0.25);
        assert_eq!(removed, 3);
        assert_eq!(buffer.len(), 6);
    }
}
