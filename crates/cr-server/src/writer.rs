//! Durable Writer
//!
//! Raw broadcast payloads go into a bounded buffer. N workers each assemble a
//! private batch: drain what fits, parse it, and flush when the batch is full
//! or the flush interval has elapsed since the worker's last flush. A flush is
//! one transaction; a failed batch is counted and dropped, never retried.
//!
//! Shutdown clears the running flag. Workers keep draining until the buffer is
//! empty, then flush whatever remains in their batch exactly once and exit.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::server_metrics;
use crate::store::{MessageStore, PersistedRecord};

/// Destination for payloads that must be persisted
#[async_trait]
pub trait WriteSink: Send + Sync {
    /// Returns `false` if the payload was not accepted within the bounded wait.
    async fn enqueue(&self, raw: String) -> bool;
}

#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub workers: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub buffer_size: usize,
    pub enqueue_timeout: Duration,
    /// Sleep when a drain finds nothing
    pub idle_poll: Duration,
    pub shutdown_grace: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            batch_size: 1000,
            flush_interval: Duration::from_millis(500),
            buffer_size: 10_000,
            enqueue_timeout: Duration::from_millis(100),
            idle_poll: Duration::from_millis(10),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriterStats {
    pub written: u64,
    pub duplicates: u64,
    pub failed_rows: u64,
    pub failed_batches: u64,
    pub parse_failures: u64,
    pub rejected: u64,
    pub buffer_depth: usize,
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    duplicates: AtomicU64,
    failed_rows: AtomicU64,
    failed_batches: AtomicU64,
    parse_failures: AtomicU64,
    rejected: AtomicU64,
}

pub struct DurableWriter {
    config: WriterConfig,
    tx: mpsc::Sender<String>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Worker {
    index: usize,
    config: WriterConfig,
    store: Arc<dyn MessageStore>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl DurableWriter {
    /// Create the buffer and spawn the workers.
    pub fn start(store: Arc<dyn MessageStore>, config: WriterConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(Counters::default());

        let handles = (0..config.workers.max(1))
            .map(|index| {
                let worker = Worker {
                    index,
                    config: config.clone(),
                    store: store.clone(),
                    rx: rx.clone(),
                    running: running.clone(),
                    counters: counters.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            workers = config.workers,
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            buffer_size = config.buffer_size,
            "Durable writer started"
        );

        Arc::new(Self {
            config,
            tx,
            running,
            counters,
            workers: Mutex::new(handles),
        })
    }

    pub async fn enqueue(&self, raw: String) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            self.reject("writer stopped");
            return false;
        }

        match self.tx.send_timeout(raw, self.config.enqueue_timeout).await {
            Ok(()) => {
                server_metrics::set_write_buffer_depth(self.buffer_depth());
                true
            }
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                self.reject("buffer full");
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                self.reject("buffer closed");
                false
            }
        }
    }

    fn reject(&self, reason: &str) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        server_metrics::record_write_rejected();
        warn!(reason, depth = self.buffer_depth(), "Write buffer rejected payload");
    }

    pub fn buffer_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            written: self.counters.written.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            failed_rows: self.counters.failed_rows.load(Ordering::Relaxed),
            failed_batches: self.counters.failed_batches.load(Ordering::Relaxed),
            parse_failures: self.counters.parse_failures.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            buffer_depth: self.buffer_depth(),
        }
    }

    /// Stop accepting payloads, let workers drain and flush, abort stragglers
    /// after the grace period.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(depth = self.buffer_depth(), "Durable writer shutting down");

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let drained = tokio::time::timeout(self.config.shutdown_grace, futures::future::join_all(handles)).await;
        if drained.is_err() {
            warn!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                "Writer workers did not finish in time, aborting"
            );
            for abort in aborts {
                abort.abort();
            }
        }

        let stats = self.stats();
        info!(
            written = stats.written,
            duplicates = stats.duplicates,
            failed_rows = stats.failed_rows,
            parse_failures = stats.parse_failures,
            rejected = stats.rejected,
            "Durable writer stopped"
        );
    }
}

#[async_trait]
impl WriteSink for DurableWriter {
    async fn enqueue(&self, raw: String) -> bool {
        DurableWriter::enqueue(self, raw).await
    }
}

impl Worker {
    async fn run(self) {
        let mut batch: Vec<PersistedRecord> = Vec::with_capacity(self.config.batch_size);
        let mut last_flush = Instant::now();

        debug!(worker = self.index, "Writer worker started");

        loop {
            let raws = self.drain(self.config.batch_size.saturating_sub(batch.len())).await;
            let drained = raws.len();

            for raw in raws {
                match PersistedRecord::parse(&raw) {
                    Ok(record) => batch.push(record),
                    Err(e) => {
                        self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                        server_metrics::record_write_parse_failure();
                        warn!(worker = self.index, error = %e, "Dropping unparseable payload");
                    }
                }
            }

            let due = last_flush.elapsed() >= self.config.flush_interval;
            if batch.len() >= self.config.batch_size || (due && !batch.is_empty()) {
                self.flush(&mut batch).await;
                last_flush = Instant::now();
            }

            if drained == 0 {
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                tokio::time::sleep(self.config.idle_poll).await;
            }
        }

        if !batch.is_empty() {
            self.flush(&mut batch).await;
        }
        debug!(worker = self.index, "Writer worker stopped");
    }

    async fn drain(&self, max: usize) -> Vec<String> {
        let mut out = Vec::new();
        if max == 0 {
            return out;
        }
        let mut rx = self.rx.lock().await;
        while out.len() < max {
            match rx.try_recv() {
                Ok(raw) => out.push(raw),
                Err(_) => break,
            }
        }
        out
    }

    async fn flush(&self, batch: &mut Vec<PersistedRecord>) {
        let rows = batch.len();
        match self.store.insert_batch(batch).await {
            Ok(outcome) => {
                self.counters.written.fetch_add(outcome.inserted, Ordering::Relaxed);
                self.counters.duplicates.fetch_add(outcome.duplicates, Ordering::Relaxed);
                server_metrics::record_write_batch(true, outcome.inserted as usize);
                debug!(
                    worker = self.index,
                    inserted = outcome.inserted,
                    duplicates = outcome.duplicates,
                    "Flushed batch"
                );
            }
            Err(e) => {
                self.counters.failed_batches.fetch_add(1, Ordering::Relaxed);
                self.counters.failed_rows.fetch_add(rows as u64, Ordering::Relaxed);
                server_metrics::record_write_batch(false, rows);
                error!(worker = self.index, rows, error = %e, "Batch insert failed, batch dropped");
            }
        }
        batch.clear();
    }
}
