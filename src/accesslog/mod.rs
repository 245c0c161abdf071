//! Access-log pipeline (C9): capture, bounded async enqueue, worker-pool
//! drain into a pre-allocated ring buffer, query, retention sweep, and
//! memory-pressure eviction.
//!
//! The record shape and content-type heuristics are grounded on the
//! reference proxy's request monitor; storage is deliberately NOT backed by
//! the reference's SQLite monitor (see DESIGN.md) — the concurrency shape
//! (bounded channel + worker pool + periodic background task) instead comes
//! from its `TokenManager::start_auto_cleanup` idiom.

mod capture;
mod ring;

pub use capture::classify_body;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::model::{AccessLog, LogFilter};
use ring::RingBuffer;

const CHANNEL_CAPACITY: usize = 1_000;
const DEFAULT_WORKER_COUNT: usize = 3;
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PipelineStats {
    pub stored_count: usize,
    pub dropped_count: u64,
    pub cleanup_count: u64,
    pub last_cleanup: Option<DateTime<Utc>>,
}

pub struct PipelineSettings {
    pub max_entries: usize,
    pub max_memory_mb: usize,
    pub retention_hours: i64,
}

pub struct AccessLogPipeline {
    sender: mpsc::Sender<AccessLog>,
    buffer: Arc<RwLock<RingBuffer>>,
    dropped_count: AtomicU64,
    cleanup_count: AtomicU64,
    last_cleanup: RwLock<Option<DateTime<Utc>>>,
    retention_hours: i64,
    max_memory_bytes: usize,
    cancel: CancellationToken,
}

impl AccessLogPipeline {
    pub fn new(settings: PipelineSettings) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        let pipeline = Arc::new(Self {
            sender,
            buffer: Arc::new(RwLock::new(RingBuffer::new(settings.max_entries))),
            dropped_count: AtomicU64::new(0),
            cleanup_count: AtomicU64::new(0),
            last_cleanup: RwLock::new(None),
            retention_hours: settings.retention_hours,
            max_memory_bytes: settings.max_memory_mb * 1024 * 1024,
            cancel: CancellationToken::new(),
        });
        pipeline.clone().spawn_workers(receiver, DEFAULT_WORKER_COUNT);
        pipeline.clone().spawn_sweeper();
        pipeline
    }

    fn spawn_workers(self: Arc<Self>, receiver: mpsc::Receiver<AccessLog>, worker_count: usize) {
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        for worker_id in 0..worker_count {
            let pipeline = self.clone();
            let receiver = receiver.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    let next = {
                        let mut guard = receiver.lock().await;
                        tokio::select! {
                            item = guard.recv() => item,
                            _ = cancel.cancelled() => None,
                        }
                    };
                    match next {
                        Some(log) => pipeline.store(log).await,
                        None => {
                            debug!(worker_id, "access-log worker exiting");
                            break;
                        }
                    }
                }
            });
        }
    }

    fn spawn_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.sweep_expired().await,
                    _ = self.cancel.cancelled() => break,
                }
            }
        });
    }

    async fn store(&self, log: AccessLog) {
        if !valid_record(&log) {
            warn!(id = %log.id, "dropping malformed access log record");
            return;
        }
        let mut buffer = self.buffer.write().await;
        if self.estimated_footprint(&buffer) + log.approx_size() > self.max_memory_bytes {
            let evicted = buffer.evict_fraction(0.25);
            if evicted > 0 {
                self.cleanup_count.fetch_add(1, Ordering::Relaxed);
                *self.last_cleanup.write().await = Some(Utc::now());
            }
        }
        buffer.push(log);
    }

    fn estimated_footprint(&self, buffer: &RingBuffer) -> usize {
        buffer.iter().map(AccessLog::approx_size).sum()
    }

    async fn sweep_expired(&self) {
        let cutoff = Utc::now() - chrono::Duration::hours(self.retention_hours);
        let mut buffer = self.buffer.write().await;
        let removed = buffer.retain_after(cutoff);
        if removed > 0 {
            self.cleanup_count.fetch_add(1, Ordering::Relaxed);
            *self.last_cleanup.write().await = Some(Utc::now());
            debug!(removed, "swept expired access log entries");
        }
    }

    /// Drop-on-full enqueue: never blocks the foreground request.
    pub fn enqueue(&self, log: AccessLog) {
        if self.sender.try_send(log).is_err() {
            self.dropped_count.fetch_add(1, Ordering::Relaxed);
            warn!("access-log channel full, dropping record");
        }
    }

    pub async fn query(&self, filter: &LogFilter) -> (Vec<AccessLog>, usize) {
        let buffer = self.buffer.read().await;
        let mut matching: Vec<AccessLog> =
            buffer.iter().filter(|log| filter.matches(log)).cloned().collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let total = matching.len();
        let (page, limit) = filter.normalized();
        let start = (page - 1) * limit;
        let page_items = matching.into_iter().skip(start).take(limit).collect();
        (page_items, total)
    }

    pub async fn stats(&self) -> PipelineStats {
        let buffer = self.buffer.read().await;
        PipelineStats {
            stored_count: buffer.len(),
            dropped_count: self.dropped_count.load(Ordering::Relaxed),
            cleanup_count: self.cleanup_count.load(Ordering::Relaxed),
            last_cleanup: *self.last_cleanup.read().await,
        }
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
    }
}

fn valid_record(log: &AccessLog) -> bool {
    !log.id.is_empty()
        && !log.method.is_empty()
        && !log.target_host.is_empty()
        && (100..=599).contains(&log.status_code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RequestType;
    use std::collections::HashMap;

    fn sample(id: &str, status: u16) -> AccessLog {
        AccessLog {
            id: id.to_string(),
            timestamp: Utc::now(),
            method: "GET".to_string(),
            target_host: "api.test".to_string(),
            target_path: "/x".to_string(),
            status_code: status,
            duration_ms: 1,
            request_type: RequestType::Http,
            client_ip: "1.2.3.4".to_string(),
            user_agent: "ua".to_string(),
            proxy_info: None,
            request_headers: HashMap::new(),
            request_body: None,
            response_headers: HashMap::new(),
            response_body: None,
            request_size: 0,
            response_size: 10,
        }
    }

    fn settings(max_entries: usize) -> PipelineSettings {
        PipelineSettings {
            max_entries,
            max_memory_mb: 50,
            retention_hours: 24,
        }
    }

    #[tokio::test]
    async fn enqueue_then_query_roundtrips() {
        let pipeline = AccessLogPipeline::new(settings(10));
        pipeline.enqueue(sample("a", 200));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let (items, total) = pipeline.query(&LogFilter::default()).await;
        assert_eq!(total, 1);
        assert_eq!(items[0].id, "a");
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_record_is_dropped_not_stored() {
        let pipeline = AccessLogPipeline::new(settings(10));
        pipeline.enqueue(sample("", 200));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = pipeline.stats().await;
        assert_eq!(stats.stored_count, 0);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn ring_buffer_never_exceeds_capacity() {
        let pipeline = AccessLogPipeline::new(settings(3));
        for i in 0..10 {
            pipeline.enqueue(sample(&format!("id-{i}"), 200));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = pipeline.stats().await;
        assert!(stats.stored_count <= 3);
        pipeline.shutdown().await;
    }
}
