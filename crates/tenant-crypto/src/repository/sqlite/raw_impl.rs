use super::raw::{Row_crypto_stats, Row_key_rotation_log, Row_tenant_key};
use crate::logic::{CryptoStats, KeyRotationRecord};
use crate::repository::TenantKeyVersion;

impl From<Row_tenant_key> for TenantKeyVersion {
    fn from(row: Row_tenant_key) -> Self {
        TenantKeyVersion {
            tenant_id: row.tenant_id,
            purpose: row.purpose,
            version: row.version,
            wrapped_key: row.wrapped_key,
            master_key_id: row.master_key_id,
            rotation_reason: row.rotation_reason,
            created_at: row.created_at,
            retired_at: row.retired_at,
        }
    }
}

impl From<Row_key_rotation_log> for KeyRotationRecord {
    fn from(row: Row_key_rotation_log) -> Self {
        KeyRotationRecord {
            tenant_id: row.tenant_id,
            purpose: row.purpose,
            from_version: row.from_version,
            to_version: row.to_version,
            reason: row.reason,
            rotated_at: row.rotated_at,
        }
    }
}

impl Row_crypto_stats {
    pub fn into_crypto_stats(self, tenant_id: &str) -> CryptoStats {
        CryptoStats {
            tenant_id: tenant_id.to_string(),
            operation_type: self.operation_type,
            operation_date: self.operation_date,
            total_operations: self.total_operations,
            successful_operations: self.successful_operations,
            failed_operations: self.failed_operations,
            avg_performance_ms: self.avg_performance_ms,
            max_performance_ms: self.max_performance_ms,
        }
    }
}
