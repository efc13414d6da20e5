use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// One engine, WAL and compactor per marketplace. The marketplace is the database
/// name given at connection startup.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    lock_timeout: Duration,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64, lock_timeout: Duration) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            lock_timeout,
        }
    }

    /// Get or lazily load the engine for `tenant`, replaying its WAL. Names that
    /// sanitize to the same file name share one engine.
    pub fn get_or_create(&self, tenant: &str) -> std::io::Result<Arc<Engine>> {
        if tenant.len() > MAX_TENANT_NAME_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "tenant name too long",
            ));
        }
        // Keep the WAL inside data_dir.
        let safe_name: String = tenant
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty tenant name",
            ));
        }

        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_TENANTS {
            return Err(std::io::Error::other("too many tenants"));
        }

        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let engine = Arc::new(Engine::new(wal_path, self.lock_timeout)?);
                tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
                slot.insert(engine.clone());
                engine
            }
        };
        tracing::info!(
            "loaded marketplace {safe_name} ({} professionals)",
            engine.professional_count()
        );
        metrics::gauge!(crate::observability::TENANTS_ACTIVE).set(self.engines.len() as f64);
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{AvailabilityRequest, Directory};
    use crate::model::UserRole;
    use std::fs;
    use ulid::Ulid;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn manager(dir: PathBuf) -> TenantManager {
        TenantManager::new(dir, 1000, Duration::from_secs(2))
    }

    #[tokio::test]
    async fn tenant_isolation() {
        let tm = manager(test_data_dir("isolation"));
        let eng_a = tm.get_or_create("market_a").unwrap();
        let eng_b = tm.get_or_create("market_b").unwrap();

        // Same ids registered in both marketplaces.
        let user = Ulid::new();
        let pid = Ulid::new();
        for eng in [&eng_a, &eng_b] {
            eng.register_user(user, UserRole::Professional).await.unwrap();
            eng.register_professional(pid, user, None).await.unwrap();
        }

        let pro = eng_a.resolve_caller(user).unwrap();
        eng_a
            .create_availability(
                &pro,
                AvailabilityRequest {
                    date: Some("2025-12-18".into()),
                    start: Some("09:00".into()),
                    end: Some("17:00".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(eng_a.list_availability(pid, None).await.unwrap().len(), 1);
        assert!(eng_b.list_availability(pid, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tenant_lazy_creation() {
        let dir = test_data_dir("lazy");
        let tm = manager(dir.clone());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let _eng = tm.get_or_create("my_db").unwrap();
        assert!(dir.join("my_db.wal").exists());
    }

    #[tokio::test]
    async fn tenant_same_engine_returned() {
        let tm = manager(test_data_dir("same_eng"));
        let eng1 = tm.get_or_create("foo").unwrap();
        let eng2 = tm.get_or_create("foo").unwrap();
        assert!(Arc::ptr_eq(&eng1, &eng2));
    }

    #[tokio::test]
    async fn tenant_reload_replays_wal() {
        let dir = test_data_dir("reload");
        let user = Ulid::new();
        {
            let tm = manager(dir.clone());
            let eng = tm.get_or_create("clinic").unwrap();
            eng.register_user(user, UserRole::User).await.unwrap();
        }
        let tm = manager(dir);
        let eng = tm.get_or_create("clinic").unwrap();
        assert!(eng.find_user_by_id(user).is_some());
    }

    #[tokio::test]
    async fn tenant_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = manager(dir.clone());

        let _eng = tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        assert!(tm.get_or_create("../..").is_err());
    }

    #[tokio::test]
    async fn tenant_aliases_share_one_engine() {
        let dir = test_data_dir("aliases");
        let tm = manager(dir.clone());
        let dotted = tm.get_or_create("shop.a").unwrap();
        let plain = tm.get_or_create("shopa").unwrap();
        assert!(Arc::ptr_eq(&dotted, &plain));

        let user = Ulid::new();
        dotted.register_user(user, UserRole::User).await.unwrap();
        assert!(plain.find_user_by_id(user).is_some());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn tenant_name_too_long() {
        let tm = manager(test_data_dir("name_too_long"));
        let long_name = "x".repeat(MAX_TENANT_NAME_LEN + 1);
        let err = tm.get_or_create(&long_name).err().unwrap();
        assert!(err.to_string().contains("tenant name too long"));

        let at_limit = "x".repeat(MAX_TENANT_NAME_LEN);
        assert!(tm.get_or_create(&at_limit).is_ok());
    }

    #[tokio::test]
    async fn tenant_count_limit() {
        let tm = manager(test_data_dir("count_limit"));
        for i in 0..MAX_TENANTS {
            tm.get_or_create(&format!("t{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many tenants"));
    }
}
