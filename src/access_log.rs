//! Deferred access logging
//!
//! Every decided request produces one entry. Entries are queued and written
//! by a background task so the response never waits on storage, and a
//! storage failure never changes a response that was already produced.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::store::AccessLogStore;

pub const DEFAULT_BODY_LIMIT_CHARS: usize = 1000;

/// A stored access log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub id: i64,
    pub client_id: Option<i64>,
    pub endpoint: String,
    pub method: String,
    pub ip_address: String,
    pub user_agent: String,
    pub request_body: String,
    pub status_code: u16,
    pub response_time_ms: f64,
    pub created_at: DateTime<Utc>,
}

/// Entry waiting to be written
#[derive(Debug, Clone, PartialEq)]
pub struct NewAccessLogEntry {
    /// Set only when the caller authenticated
    pub client_id: Option<i64>,
    pub endpoint: String,
    pub method: String,
    pub ip_address: String,
    pub user_agent: String,
    pub request_body: String,
    pub status_code: u16,
    pub response_time_ms: f64,
    pub created_at: DateTime<Utc>,
}

/// Decode a request body for storage, keeping at most `limit` characters
pub fn truncate_body(body: &[u8], limit: usize) -> String {
    String::from_utf8_lossy(body).chars().take(limit).collect()
}

enum LogCommand {
    Write(NewAccessLogEntry),
    Flush(oneshot::Sender<()>),
}

/// Counters for the logging pipeline
#[derive(Debug, Default)]
pub struct AccessLogStats {
    pub written: AtomicU64,
    pub dropped: AtomicU64,
    pub failed: AtomicU64,
}

/// Non-blocking access logger
pub struct AccessLogger {
    tx: mpsc::Sender<LogCommand>,
    stats: Arc<AccessLogStats>,
    worker: JoinHandle<()>,
}

impl AccessLogger {
    /// Spawn the writer task on the current tokio runtime
    pub fn spawn(store: Arc<dyn AccessLogStore>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(AccessLogStats::default());
        let worker = tokio::spawn(run_writer(store, rx, Arc::clone(&stats)));
        Self { tx, stats, worker }
    }

    /// Queue an entry without waiting. A full or closed queue drops it.
    pub fn record(&self, entry: NewAccessLogEntry) {
        match self.tx.try_send(LogCommand::Write(entry)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(LogCommand::Write(entry))) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Access log queue full, dropping entry for {} {}",
                    entry.method, entry.endpoint
                );
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Access log writer stopped, dropping entry");
            }
        }
    }

    /// Wait until everything queued before this call has been written
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    pub fn stats(&self) -> &AccessLogStats {
        &self.stats
    }

    /// Flush and stop the writer
    pub async fn shutdown(self) {
        self.flush().await;
        drop(self.tx);
        if let Err(e) = self.worker.await {
            error!("Access log writer task failed: {}", e);
        }
    }
}

async fn run_writer(
    store: Arc<dyn AccessLogStore>,
    mut rx: mpsc::Receiver<LogCommand>,
    stats: Arc<AccessLogStats>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            LogCommand::Write(entry) => match store.append(&entry).await {
                Ok(id) => {
                    stats.written.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Access log {}: {} {} -> {}",
                        id, entry.method, entry.endpoint, entry.status_code
                    );
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Failed to write access log for {} {}: {}",
                        entry.method, entry.endpoint, e
                    );
                }
            },
            LogCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Access log writer stopped");
}
