use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Compact one engine's WAL if enough commits accumulated since the last run.
/// Returns whether a compaction happened.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that periodically compacts a tenant's WAL.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    // The first tick fires immediately; skip it so a freshly replayed engine isn't compacted at once.
    interval.tick().await;
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AssetStatus;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("rentd_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let engine = Engine::new(test_wal_path("threshold.wal")).unwrap();
        let product = Ulid::new();
        engine.create_product(product, "Camera".into(), 5_000).await.unwrap();
        for i in 0..3 {
            engine
                .add_asset(Ulid::new(), product, format!("CAM-{i}"), AssetStatus::Available)
                .await
                .unwrap();
        }

        assert!(!compact_if_needed(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 4);

        assert!(compact_if_needed(&engine, 4).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.get_product_info(&product).await.unwrap().quantity, 3);
    }
}
