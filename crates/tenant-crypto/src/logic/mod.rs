// Tenant key lifecycle: provisioning, rotation, envelope encryption, caching
// and the audit trail of every operation.

pub mod cache;
pub mod crypto_services;
pub mod key_registry;
pub mod master_key;
pub mod purpose;
pub mod rotation;
pub mod stats;

pub use cache::*;
pub use crypto_services::*;
pub use key_registry::*;
pub use master_key::*;
pub use purpose::*;
pub use rotation::*;
pub use stats::*;

use shared::error::CommonError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TenantKeyEvent {
    TenantKeysCreated {
        tenant_id: String,
    },
    KeyRotated {
        tenant_id: String,
        purpose: EncryptionPurpose,
        from_version: i64,
        to_version: i64,
    },
    CacheCleared {
        tenant_id: String,
        purpose: Option<EncryptionPurpose>,
    },
}

pub type TenantKeyEventSender = tokio::sync::broadcast::Sender<TenantKeyEvent>;
pub type TenantKeyEventReceiver = tokio::sync::broadcast::Receiver<TenantKeyEvent>;

/// Broadcasts `event`. Having no subscribers is not an error.
pub(crate) fn publish_event(on_change_tx: &TenantKeyEventSender, event: TenantKeyEvent) {
    if on_change_tx.send(event).is_err() {
        tracing::trace!("no subscribers for tenant key event");
    }
}

pub(crate) fn validate_tenant_id(tenant_id: &str) -> Result<(), CommonError> {
    if tenant_id.trim().is_empty() {
        return Err(CommonError::invalid_request("tenant_id must not be empty"));
    }
    Ok(())
}

#[cfg(all(test, feature = "unit_test"))]
pub(crate) mod test_support {
    use super::*;
    use crate::repository::Repository;
    use shared::primitives::SqlMigrationLoader;
    use shared::test_utils::repository::setup_in_memory_database;

    /// In-memory repository, throwaway local master key and a fresh cache.
    pub struct Harness {
        pub repo: Repository,
        pub master_key: MasterKeyContents,
        pub cache: OperationCache,
        pub locks: RotationLocks,
        pub on_change_tx: TenantKeyEventSender,
        _db: libsql::Database,
        _key_dir: tempfile::TempDir,
    }

    impl Harness {
        pub async fn new() -> Self {
            Self::with_cache(CacheConfig::default()).await
        }

        pub async fn with_cache(config: CacheConfig) -> Self {
            let (db, conn) = setup_in_memory_database(vec![Repository::load_sql_migrations()])
                .await
                .unwrap();
            let key_dir = tempfile::tempdir().unwrap();
            let master_key =
                get_or_create_local_master_key(&key_dir.path().join("master.key")).unwrap();
            let (on_change_tx, _) = tokio::sync::broadcast::channel(64);

            Self {
                repo: Repository::new(conn),
                master_key,
                cache: OperationCache::new(config),
                locks: RotationLocks::new(),
                on_change_tx,
                _db: db,
                _key_dir: key_dir,
            }
        }

        pub async fn provision(&self, tenant_id: &str) {
            create_tenant_keys(&self.repo, &self.master_key, &self.on_change_tx, tenant_id)
                .await
                .unwrap();
        }

        pub async fn rotate(&self, tenant_id: &str, purpose: EncryptionPurpose) {
            let rotated = rotate_key(
                &self.repo,
                &self.master_key,
                &self.cache,
                &self.locks,
                &self.on_change_tx,
                RotateKeyParams {
                    tenant_id: tenant_id.to_string(),
                    purpose,
                    reason: "scheduled".to_string(),
                },
            )
            .await
            .unwrap();
            assert!(rotated);
        }
    }
}
