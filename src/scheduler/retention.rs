//! Retention manager for deleting old report days.

use crate::db::Store;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Periodically removes report days older than the retention window.
pub struct RetentionManager {
    store: Arc<Store>,
    retention_days: u32,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention_days: u32) -> Self {
        Self {
            store,
            retention_days: retention_days.max(1),
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the background task. The first cleanup runs immediately.
    pub async fn start(&self) {
        let mut stop = self.stop.lock().await;
        if stop.is_some() {
            return;
        }

        let (tx, mut rx) = tokio::sync::broadcast::channel(1);
        *stop = Some(tx);

        let store = self.store.clone();
        let days = self.retention_days;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETENTION_INTERVAL);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => process_retention(&store, days),
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        if let Some(tx) = self.stop.lock().await.take() {
            let _ = tx.send(());
        }
    }
}

fn process_retention(store: &Store, days: u32) {
    match store.cleanup_older_than(days) {
        Ok(0) => tracing::debug!("RetentionManager: nothing older than {} days", days),
        Ok(n) => tracing::info!("RetentionManager: removed {} reports older than {} days", n, days),
        Err(e) => tracing::error!("RetentionManager: cleanup failed: {}", e),
    }
}
