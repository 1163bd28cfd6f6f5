mod sqlite;

pub use sqlite::Repository;

use shared::{error::CommonError, primitives::WrappedChronoDateTime};

use crate::logic::{
    CryptoOperationLogEntry, CryptoStats, EncryptionPurpose, KeyRotationRecord, WrappedDataKey,
};

/// A stored key version. The current version of a pair is the one with the
/// highest `version`; rows are never deleted.
#[derive(Debug, Clone)]
pub struct TenantKeyVersion {
    pub tenant_id: String,
    pub purpose: EncryptionPurpose,
    pub version: i64,
    pub wrapped_key: WrappedDataKey,
    pub master_key_id: String,
    pub rotation_reason: Option<String>,
    pub created_at: WrappedChronoDateTime,
    pub retired_at: Option<WrappedChronoDateTime>,
}

#[derive(Debug, Clone)]
pub struct CreateTenantKeyVersion {
    pub tenant_id: String,
    pub purpose: EncryptionPurpose,
    pub version: i64,
    pub wrapped_key: WrappedDataKey,
    pub master_key_id: String,
    pub rotation_reason: Option<String>,
    pub created_at: WrappedChronoDateTime,
}

#[async_trait::async_trait]
pub trait TenantKeyRepositoryLike: Send + Sync {
    /// Inserts all rows in one statement. Any existing
    /// `(tenant_id, purpose, version)` fails the whole batch with
    /// `AlreadyExists`.
    async fn create_tenant_key_versions(
        &self,
        rows: &[CreateTenantKeyVersion],
    ) -> Result<(), CommonError>;

    /// Fails with `AlreadyExists` if the version is already stored.
    async fn insert_tenant_key_version(
        &self,
        row: &CreateTenantKeyVersion,
    ) -> Result<(), CommonError>;

    async fn tenant_has_keys(&self, tenant_id: &str) -> Result<bool, CommonError>;

    async fn get_current_tenant_key(
        &self,
        tenant_id: &str,
        purpose: EncryptionPurpose,
    ) -> Result<Option<TenantKeyVersion>, CommonError>;

    async fn get_tenant_key_version(
        &self,
        tenant_id: &str,
        purpose: EncryptionPurpose,
        version: i64,
    ) -> Result<Option<TenantKeyVersion>, CommonError>;

    async fn list_current_tenant_keys(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<TenantKeyVersion>, CommonError>;

    /// Current version of every pair of every tenant.
    async fn list_all_current_keys(&self) -> Result<Vec<TenantKeyVersion>, CommonError>;

    async fn retire_tenant_key_version(
        &self,
        tenant_id: &str,
        purpose: EncryptionPurpose,
        version: i64,
        retired_at: &WrappedChronoDateTime,
    ) -> Result<(), CommonError>;

    /// Oldest rotation first.
    async fn list_rotation_records(
        &self,
        tenant_id: &str,
        purpose: EncryptionPurpose,
    ) -> Result<Vec<KeyRotationRecord>, CommonError>;
}

#[async_trait::async_trait]
pub trait CryptoAuditRepositoryLike: Send + Sync {
    async fn insert_operation_log(&self, entry: &CryptoOperationLogEntry)
    -> Result<(), CommonError>;

    async fn insert_rotation_record(&self, record: &KeyRotationRecord) -> Result<(), CommonError>;

    /// Aggregates entries created at or after `since`, grouped by operation
    /// type and UTC day, newest day first.
    async fn get_crypto_stats(
        &self,
        tenant_id: &str,
        since: &WrappedChronoDateTime,
    ) -> Result<Vec<CryptoStats>, CommonError>;
}
