//! A small in-process tracker for broker reconnect activity, surfaced over
//! the existing structured logs rather than a metrics exporter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ReconnectStats {
    pub total_reconnects: u64,
    pub reconnects_last_hour: u64,
}

#[derive(Clone)]
pub struct ReconnectTracker {
    total: Arc<AtomicU64>,
    recent: Arc<RwLock<Vec<Instant>>>,
}

impl ReconnectTracker {
    pub fn new() -> Self {
        Self {
            total: Arc::new(AtomicU64::new(0)),
            recent: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn record_reconnect(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut recent = self.recent.write().await;
        recent.push(now);
        let one_hour_ago = now - Duration::from_secs(3600);
        recent.retain(|&t| t > one_hour_ago);
    }

    pub async fn stats(&self) -> ReconnectStats {
        ReconnectStats {
            total_reconnects: self.total.load(Ordering::Relaxed),
            reconnects_last_hour: self.recent.read().await.len() as u64,
        }
    }
}

impl Default for ReconnectTracker {
    fn default() -> Self {
        Self::new()
    }
}
