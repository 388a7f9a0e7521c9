use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::compactor;
use crate::engine::{AdmissionSettings, Engine};
use crate::limits::*;

/// Manages per-business engines. Each business gets its own Engine + WAL + compactor.
/// Business id = database name from the pgwire connection.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    admission: AdmissionSettings,
}

/// Keep only characters that are safe in a file name.
fn sanitize(tenant: &str) -> String {
    tenant
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
        .collect()
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, admission: AdmissionSettings) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            admission,
        }
    }

    pub fn admission(&self) -> &AdmissionSettings {
        &self.admission
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Get or lazily create the engine for a business.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        // Engines are keyed by the file-safe name: two spellings that map to
        // the same WAL file must share one engine.
        let safe_name = sanitize(tenant);
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        // Checked before taking the entry: len() locks every shard.
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        // Two first connections racing for the same business must share one engine:
        // a second engine would open a second writer on the same WAL.
        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(v) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path)?);
                v.insert(engine.clone());
                engine
            }
        };

        let compactor_engine = engine.clone();
        let threshold = self.compact_threshold;
        tokio::spawn(async move {
            compactor::run_compactor(compactor_engine, threshold).await;
        });

        tracing::info!("business {tenant}: engine loaded ({} products)", engine.product_count());
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BookingRequest;
    use crate::model::*;
    use std::fs;
    use ulid::Ulid;

    const JAN1: Ms = 1_767_225_600_000;
    const DAY: Ms = 86_400_000;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("rentd_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, AdmissionSettings::default())
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let dir = test_data_dir("isolation");
        let tm = manager(dir);

        let shop_a = tm.get_or_create("shop_a").unwrap();
        let shop_b = tm.get_or_create("shop_b").unwrap();

        // Same product id in both businesses, one unit each.
        let pid = Ulid::new();
        for engine in [&shop_a, &shop_b] {
            engine.create_product(pid, "Camera".into(), 10_000).await.unwrap();
            engine
                .add_asset(Ulid::new(), pid, "CAM-1".into(), AssetStatus::Available)
                .await
                .unwrap();
        }

        shop_a
            .create_booking_with(BookingRequest::new(pid, JAN1, JAN1 + DAY, 1), tm.admission())
            .await
            .unwrap();

        let a = shop_a.availability(pid, JAN1, JAN1 + DAY, 1).await.unwrap();
        let b = shop_b.availability(pid, JAN1, JAN1 + DAY, 1).await.unwrap();
        assert_eq!(a.remaining, 0);
        assert_eq!(b.remaining, 1);
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());

        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert!(entries.is_empty());
        assert!(tm.is_empty());

        let _eng = tm.get_or_create("my_shop").unwrap();
        assert!(dir.join("my_shop.wal").exists());
        assert_eq!(tm.len(), 1);
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let dir = test_data_dir("same_eng");
        let tm = manager(dir);

        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_first_connections_share_one_engine() {
        let dir = test_data_dir("race");
        let tm = Arc::new(manager(dir));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tm = tm.clone();
            handles.push(tokio::spawn(async move { tm.get_or_create("busy").unwrap() }));
        }
        let mut engines = Vec::new();
        for h in handles {
            engines.push(h.await.unwrap());
        }
        assert!(engines.iter().all(|e| Arc::ptr_eq(e, &engines[0])));
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        assert!(Arc::ptr_eq(&eng, &tm.get_or_create("evil").unwrap()));
        assert_eq!(tm.len(), 1);

        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let dir = test_data_dir("name_too_long");
        let tm = manager(dir);

        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));
    }

    #[tokio::test]
    async fn state_reloads_from_data_dir() {
        let dir = test_data_dir("reload");
        let pid = Ulid::new();
        {
            let tm = manager(dir.clone());
            let engine = tm.get_or_create("rentals").unwrap();
            engine.create_product(pid, "Tripod".into(), 2_500).await.unwrap();
        }
        let tm = manager(dir);
        let engine = tm.get_or_create("rentals").unwrap();
        assert_eq!(engine.get_product_info(&pid).await.unwrap().name, "Tripod");
    }
}
