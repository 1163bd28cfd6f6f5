use std::time::Instant;

use serde::{Deserialize, Serialize};
use shared::{error::CommonError, primitives::WrappedChronoDateTime};
use tracing::info;
use utoipa::ToSchema;

use super::{
    CryptoOperationLogEntry, CryptoOperationType, DecryptedDataKey, EncryptionPurpose, KeyStatus,
    MasterKeyContents, RotationPolicy, TenantKeyEvent, TenantKeyEventSender, publish_event,
    record_operation, validate_tenant_id, wrap_data_key,
};
use crate::repository::{CreateTenantKeyVersion, CryptoAuditRepositoryLike, TenantKeyRepositoryLike};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TenantKeyInfo {
    pub purpose: EncryptionPurpose,
    pub version: i64,
    pub key_age_days: i64,
    pub status: KeyStatus,
    pub created_at: WrappedChronoDateTime,
}

pub type CreateTenantKeysResponse = bool;
pub type GetTenantKeyInfoResponse = Vec<TenantKeyInfo>;

async fn provision_tenant_keys<R: TenantKeyRepositoryLike + ?Sized>(
    repo: &R,
    master_key: &MasterKeyContents,
    tenant_id: &str,
) -> Result<(), CommonError> {
    validate_tenant_id(tenant_id)?;

    if repo.tenant_has_keys(tenant_id).await? {
        return Err(CommonError::already_exists(
            format!("keys already provisioned for tenant {tenant_id}"),
            tenant_id,
        ));
    }

    let now = WrappedChronoDateTime::now();
    let master_key_id = master_key.id();
    let mut rows = Vec::with_capacity(EncryptionPurpose::ALL.len());
    for purpose in EncryptionPurpose::ALL {
        let data_key = DecryptedDataKey::generate();
        rows.push(CreateTenantKeyVersion {
            tenant_id: tenant_id.to_string(),
            purpose,
            version: 1,
            wrapped_key: wrap_data_key(master_key, &data_key).await?,
            master_key_id: master_key_id.clone(),
            rotation_reason: None,
            created_at: now,
        });
    }

    // one statement: either all five purposes exist afterwards or none do
    repo.create_tenant_key_versions(&rows).await
}

/// Provisions version 1 of every purpose for a tenant. Rejected with
/// `AlreadyExists` if the tenant has any key already.
pub async fn create_tenant_keys<R>(
    repo: &R,
    master_key: &MasterKeyContents,
    on_change_tx: &TenantKeyEventSender,
    tenant_id: &str,
) -> Result<CreateTenantKeysResponse, CommonError>
where
    R: TenantKeyRepositoryLike + CryptoAuditRepositoryLike,
{
    let started = Instant::now();
    let result = provision_tenant_keys(repo, master_key, tenant_id).await;

    record_operation(
        repo,
        CryptoOperationLogEntry::new(
            tenant_id,
            CryptoOperationType::CreateKeys,
            None,
            started,
            result.as_ref().err().map(|e| e.to_string()),
        ),
    )
    .await;
    result?;

    info!(tenant_id, "provisioned tenant keys");
    publish_event(
        on_change_tx,
        TenantKeyEvent::TenantKeysCreated {
            tenant_id: tenant_id.to_string(),
        },
    );

    Ok(true)
}

/// Current version of each purpose with its age-derived status, in
/// [`EncryptionPurpose::ALL`] order. Empty when nothing is provisioned.
pub async fn get_tenant_key_info<R: TenantKeyRepositoryLike + ?Sized>(
    repo: &R,
    policy: &RotationPolicy,
    tenant_id: &str,
) -> Result<GetTenantKeyInfoResponse, CommonError> {
    validate_tenant_id(tenant_id)?;

    let now = WrappedChronoDateTime::now();
    let mut keys = repo.list_current_tenant_keys(tenant_id).await?;
    keys.sort_by_key(|k| EncryptionPurpose::ALL.iter().position(|p| *p == k.purpose));

    Ok(keys
        .into_iter()
        .map(|key| {
            let key_age_days = key.created_at.whole_days_until(&now);
            TenantKeyInfo {
                purpose: key.purpose,
                version: key.version,
                key_age_days,
                status: policy.status_for_age(key_age_days),
                created_at: key.created_at,
            }
        })
        .collect())
}
