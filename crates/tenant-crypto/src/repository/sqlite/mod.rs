mod raw;
mod raw_impl;

use crate::logic::{CryptoOperationLogEntry, CryptoStats, EncryptionPurpose, KeyRotationRecord};
use crate::repository::{
    CreateTenantKeyVersion, CryptoAuditRepositoryLike, TenantKeyRepositoryLike, TenantKeyVersion,
};
use shared::error::CommonError;
use shared::libsql::is_unique_violation;
use shared::primitives::{SqlMigrationLoader, WrappedChronoDateTime};
use std::collections::BTreeMap;

#[derive(Clone)]
pub struct Repository {
    conn: shared::libsql::Connection,
}

impl Repository {
    pub fn new(conn: shared::libsql::Connection) -> Self {
        Self { conn }
    }
}

fn repository_error(context: &'static str) -> impl FnOnce(libsql::Error) -> CommonError {
    move |e| {
        let e = anyhow::Error::from(e).context(context);
        CommonError::Repository {
            msg: format!("{e:#}"),
            source: Some(e),
        }
    }
}

fn insert_error<'a>(
    context: &'static str,
    tenant_id: &'a str,
) -> impl FnOnce(libsql::Error) -> CommonError + 'a {
    move |e| {
        if is_unique_violation(&e) {
            CommonError::AlreadyExists {
                msg: format!("key version already exists for tenant {tenant_id}"),
                lookup_id: tenant_id.to_string(),
                source: Some(e.into()),
            }
        } else {
            repository_error(context)(e)
        }
    }
}

fn insert_params(row: &CreateTenantKeyVersion) -> raw::insert_tenant_key_params<'_> {
    raw::insert_tenant_key_params {
        tenant_id: &row.tenant_id,
        purpose: &row.purpose,
        version: &row.version,
        wrapped_key: &row.wrapped_key,
        master_key_id: &row.master_key_id,
        rotation_reason: &row.rotation_reason,
        created_at: &row.created_at,
    }
}

#[async_trait::async_trait]
impl TenantKeyRepositoryLike for Repository {
    async fn create_tenant_key_versions(
        &self,
        rows: &[CreateTenantKeyVersion],
    ) -> Result<(), CommonError> {
        let Some(first) = rows.first() else {
            return Ok(());
        };

        let params: Vec<_> = rows.iter().map(insert_params).collect();
        raw::insert_tenant_keys(&self.conn, &params)
            .await
            .map_err(insert_error("Failed to create tenant keys", &first.tenant_id))?;
        Ok(())
    }

    async fn insert_tenant_key_version(
        &self,
        row: &CreateTenantKeyVersion,
    ) -> Result<(), CommonError> {
        raw::insert_tenant_keys(&self.conn, &[insert_params(row)])
            .await
            .map_err(insert_error("Failed to insert tenant key version", &row.tenant_id))?;
        Ok(())
    }

    async fn tenant_has_keys(&self, tenant_id: &str) -> Result<bool, CommonError> {
        let count = raw::tenant_key_count(&self.conn, &tenant_id.to_string())
            .await
            .map_err(repository_error("Failed to count tenant keys"))?;
        Ok(count > 0)
    }

    async fn get_current_tenant_key(
        &self,
        tenant_id: &str,
        purpose: EncryptionPurpose,
    ) -> Result<Option<TenantKeyVersion>, CommonError> {
        let row = raw::get_current_tenant_key(&self.conn, &tenant_id.to_string(), &purpose)
            .await
            .map_err(repository_error("Failed to get current tenant key"))?;
        Ok(row.map(TenantKeyVersion::from))
    }

    async fn get_tenant_key_version(
        &self,
        tenant_id: &str,
        purpose: EncryptionPurpose,
        version: i64,
    ) -> Result<Option<TenantKeyVersion>, CommonError> {
        let row =
            raw::get_tenant_key_version(&self.conn, &tenant_id.to_string(), &purpose, &version)
                .await
                .map_err(repository_error("Failed to get tenant key version"))?;
        Ok(row.map(TenantKeyVersion::from))
    }

    async fn list_current_tenant_keys(
        &self,
        tenant_id: &str,
    ) -> Result<Vec<TenantKeyVersion>, CommonError> {
        let rows = raw::list_current_tenant_keys(&self.conn, &tenant_id.to_string())
            .await
            .map_err(repository_error("Failed to list current tenant keys"))?;
        Ok(rows.into_iter().map(TenantKeyVersion::from).collect())
    }

    async fn list_all_current_keys(&self) -> Result<Vec<TenantKeyVersion>, CommonError> {
        let rows = raw::list_all_current_keys(&self.conn)
            .await
            .map_err(repository_error("Failed to list current keys"))?;
        Ok(rows.into_iter().map(TenantKeyVersion::from).collect())
    }

    async fn retire_tenant_key_version(
        &self,
        tenant_id: &str,
        purpose: EncryptionPurpose,
        version: i64,
        retired_at: &WrappedChronoDateTime,
    ) -> Result<(), CommonError> {
        raw::retire_tenant_key(
            &self.conn,
            &tenant_id.to_string(),
            &purpose,
            &version,
            retired_at,
        )
        .await
        .map_err(repository_error("Failed to retire tenant key version"))?;
        Ok(())
    }

    async fn list_rotation_records(
        &self,
        tenant_id: &str,
        purpose: EncryptionPurpose,
    ) -> Result<Vec<KeyRotationRecord>, CommonError> {
        let rows = raw::list_rotation_records(&self.conn, &tenant_id.to_string(), &purpose)
            .await
            .map_err(repository_error("Failed to list key rotation records"))?;
        Ok(rows.into_iter().map(KeyRotationRecord::from).collect())
    }
}

#[async_trait::async_trait]
impl CryptoAuditRepositoryLike for Repository {
    async fn insert_operation_log(
        &self,
        entry: &CryptoOperationLogEntry,
    ) -> Result<(), CommonError> {
        raw::insert_operation_log(
            &self.conn,
            raw::insert_operation_log_params {
                tenant_id: &entry.tenant_id,
                operation_type: &entry.operation_type,
                purpose: &entry.purpose,
                success: &entry.success,
                performance_ms: &entry.performance_ms,
                error: &entry.error,
                table_name: &entry.table_name,
                field_name: &entry.field_name,
                created_at: &entry.created_at,
            },
        )
        .await
        .map_err(repository_error("Failed to insert crypto operation log entry"))?;
        Ok(())
    }

    async fn insert_rotation_record(&self, record: &KeyRotationRecord) -> Result<(), CommonError> {
        raw::insert_rotation_record(
            &self.conn,
            raw::insert_rotation_record_params {
                tenant_id: &record.tenant_id,
                purpose: &record.purpose,
                from_version: &record.from_version,
                to_version: &record.to_version,
                reason: &record.reason,
                rotated_at: &record.rotated_at,
            },
        )
        .await
        .map_err(repository_error("Failed to insert key rotation record"))?;
        Ok(())
    }

    async fn get_crypto_stats(
        &self,
        tenant_id: &str,
        since: &WrappedChronoDateTime,
    ) -> Result<Vec<CryptoStats>, CommonError> {
        let rows = raw::get_crypto_stats(&self.conn, &tenant_id.to_string(), since)
            .await
            .map_err(repository_error("Failed to aggregate crypto stats"))?;
        Ok(rows
            .into_iter()
            .map(|row| row.into_crypto_stats(tenant_id))
            .collect())
    }
}

macro_rules! sqlite_migration {
    ($file:literal) => {
        (
            $file,
            include_str!(concat!(
                env!("CARGO_MANIFEST_DIR"),
                "/dbs/tenant_crypto/migrations/sqlite/",
                $file
            )),
        )
    };
}

impl SqlMigrationLoader for Repository {
    fn load_sql_migrations() -> BTreeMap<&'static str, BTreeMap<&'static str, &'static str>> {
        BTreeMap::from([(
            "sqlite",
            BTreeMap::from([
                sqlite_migration!("20260101000000_tenant_keys.up.sql"),
                sqlite_migration!("20260101000000_tenant_keys.down.sql"),
                sqlite_migration!("20260101000100_crypto_audit.up.sql"),
                sqlite_migration!("20260101000100_crypto_audit.down.sql"),
            ]),
        )])
    }
}
