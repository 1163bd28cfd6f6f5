use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shared::{error::CommonError, primitives::WrappedChronoDateTime};
use tokio::sync::Mutex;
use tracing::{info, warn};
use utoipa::ToSchema;

use super::{
    CryptoOperationLogEntry, CryptoOperationType, DecryptedDataKey, EncryptionPurpose,
    MasterKeyContents, OperationCache, TenantKeyEvent, TenantKeyEventSender, publish_event,
    record_operation, validate_tenant_id, wrap_data_key,
};
use crate::repository::{CreateTenantKeyVersion, CryptoAuditRepositoryLike, TenantKeyRepositoryLike};

pub const DEFAULT_ROTATION_WARNING_DAYS: i64 = 75;
pub const DEFAULT_ROTATION_MAX_DAYS: i64 = 90;
pub const AUTOMATIC_ROTATION_REASON: &str = "automatic rotation: key age exceeded policy";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyStatus {
    Ok,
    RotationWarning,
    RotationNeeded,
}

/// Age thresholds, in whole days, that drive [`KeyStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RotationPolicy {
    pub warning_age_days: i64,
    pub max_age_days: i64,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            warning_age_days: DEFAULT_ROTATION_WARNING_DAYS,
            max_age_days: DEFAULT_ROTATION_MAX_DAYS,
        }
    }
}

impl RotationPolicy {
    pub fn new(warning_age_days: i64, max_age_days: i64) -> Result<Self, CommonError> {
        if warning_age_days < 0 || max_age_days < 0 {
            return Err(CommonError::invalid_request(
                "rotation thresholds must not be negative",
            ));
        }
        if warning_age_days > max_age_days {
            return Err(CommonError::invalid_request(format!(
                "rotation warning age ({warning_age_days} days) exceeds max age ({max_age_days} days)"
            )));
        }
        Ok(Self {
            warning_age_days,
            max_age_days,
        })
    }

    pub fn status_for_age(&self, age_days: i64) -> KeyStatus {
        if age_days > self.max_age_days {
            KeyStatus::RotationNeeded
        } else if age_days >= self.warning_age_days {
            KeyStatus::RotationWarning
        } else {
            KeyStatus::Ok
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct KeyRotationRecord {
    pub tenant_id: String,
    pub purpose: EncryptionPurpose,
    pub from_version: i64,
    pub to_version: i64,
    pub reason: String,
    pub rotated_at: WrappedChronoDateTime,
}

/// One async mutex per `(tenant, purpose)`, so rotations of the same pair
/// queue up inside this process while different pairs proceed in parallel.
#[derive(Default)]
pub struct RotationLocks(DashMap<(String, EncryptionPurpose), Arc<Mutex<()>>>);

impl RotationLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, tenant_id: &str, purpose: EncryptionPurpose) -> Arc<Mutex<()>> {
        self.0
            .entry((tenant_id.to_string(), purpose))
            .or_default()
            .clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RotateKeyParams {
    pub tenant_id: String,
    pub purpose: EncryptionPurpose,
    pub reason: String,
}

pub type RotateKeyResponse = bool;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RotatedKey {
    pub tenant_id: String,
    pub purpose: EncryptionPurpose,
    pub new_version: i64,
}

pub type RotateOverdueKeysResponse = Vec<RotatedKey>;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GetRotationHistoryParams {
    pub tenant_id: String,
    pub purpose: EncryptionPurpose,
}

pub type GetRotationHistoryResponse = Vec<KeyRotationRecord>;

/// Creates version `n + 1` for the pair and makes it current.
///
/// The insert of the new row is the commit point: the primary key on
/// `(tenant_id, purpose, version)` lets exactly one rotator win even across
/// processes, and every earlier failure leaves version `n` untouched.
/// Older versions are never deleted and keep decrypting.
pub async fn rotate_key<R>(
    repo: &R,
    master_key: &MasterKeyContents,
    cache: &OperationCache,
    locks: &RotationLocks,
    on_change_tx: &TenantKeyEventSender,
    params: RotateKeyParams,
) -> Result<RotateKeyResponse, CommonError>
where
    R: TenantKeyRepositoryLike + CryptoAuditRepositoryLike,
{
    let started = Instant::now();
    let result = rotate_key_locked(
        repo,
        master_key,
        cache,
        locks,
        on_change_tx,
        &params,
        None,
    )
    .await;

    record_operation(
        repo,
        CryptoOperationLogEntry::new(
            &params.tenant_id,
            CryptoOperationType::Rotate,
            Some(params.purpose),
            started,
            result.as_ref().err().map(|e| e.to_string()),
        ),
    )
    .await;

    result.map(|new_version| new_version.is_some())
}

/// Returns the new version, or `None` when `only_if_current` was given and
/// the pair had already moved past it.
async fn rotate_key_locked<R>(
    repo: &R,
    master_key: &MasterKeyContents,
    cache: &OperationCache,
    locks: &RotationLocks,
    on_change_tx: &TenantKeyEventSender,
    params: &RotateKeyParams,
    only_if_current: Option<i64>,
) -> Result<Option<i64>, CommonError>
where
    R: TenantKeyRepositoryLike + CryptoAuditRepositoryLike,
{
    validate_tenant_id(&params.tenant_id)?;
    let reason = params.reason.trim();
    if reason.is_empty() {
        return Err(CommonError::invalid_request("rotation reason must not be empty"));
    }

    let lock = locks.lock_for(&params.tenant_id, params.purpose);
    let _guard = lock.lock().await;

    let current = repo
        .get_current_tenant_key(&params.tenant_id, params.purpose)
        .await?
        .ok_or_else(|| {
            CommonError::not_found(
                format!(
                    "no {} key provisioned for tenant {}",
                    params.purpose, params.tenant_id
                ),
                params.tenant_id.clone(),
            )
        })?;

    if only_if_current.is_some_and(|expected| expected != current.version) {
        return Ok(None);
    }

    let data_key = DecryptedDataKey::generate();
    let wrapped_key = wrap_data_key(master_key, &data_key).await?;
    let now = WrappedChronoDateTime::now();
    let new_version = current.version + 1;

    repo.insert_tenant_key_version(&CreateTenantKeyVersion {
        tenant_id: params.tenant_id.clone(),
        purpose: params.purpose,
        version: new_version,
        wrapped_key,
        master_key_id: master_key.id(),
        rotation_reason: Some(reason.to_string()),
        created_at: now,
    })
    .await?;

    // committed; everything below is bookkeeping
    if let Err(e) = repo
        .retire_tenant_key_version(&params.tenant_id, params.purpose, current.version, &now)
        .await
    {
        warn!(
            tenant_id = %params.tenant_id,
            purpose = %params.purpose,
            "failed to mark key version {} retired: {e}",
            current.version
        );
    }

    cache.invalidate_current(&params.tenant_id, params.purpose);
    cache.insert(
        &params.tenant_id,
        params.purpose,
        new_version,
        Arc::new(data_key),
    );

    let record = KeyRotationRecord {
        tenant_id: params.tenant_id.clone(),
        purpose: params.purpose,
        from_version: current.version,
        to_version: new_version,
        reason: reason.to_string(),
        rotated_at: now,
    };
    if let Err(e) = repo.insert_rotation_record(&record).await {
        warn!(
            tenant_id = %params.tenant_id,
            purpose = %params.purpose,
            "failed to record key rotation: {e}"
        );
    }

    info!(
        tenant_id = %params.tenant_id,
        purpose = %params.purpose,
        from_version = current.version,
        to_version = new_version,
        "rotated tenant key"
    );

    publish_event(
        on_change_tx,
        TenantKeyEvent::KeyRotated {
            tenant_id: params.tenant_id.clone(),
            purpose: params.purpose,
            from_version: current.version,
            to_version: new_version,
        },
    );

    Ok(Some(new_version))
}

/// Rotates every current key whose age is past the policy maximum. Pairs
/// rotated concurrently by someone else are skipped; individual failures are
/// logged and do not stop the sweep.
pub async fn rotate_overdue_keys<R>(
    repo: &R,
    master_key: &MasterKeyContents,
    cache: &OperationCache,
    locks: &RotationLocks,
    on_change_tx: &TenantKeyEventSender,
    policy: &RotationPolicy,
) -> Result<RotateOverdueKeysResponse, CommonError>
where
    R: TenantKeyRepositoryLike + CryptoAuditRepositoryLike,
{
    let now = WrappedChronoDateTime::now();
    let mut rotated = Vec::new();

    for key in repo.list_all_current_keys().await? {
        if policy.status_for_age(key.created_at.whole_days_until(&now)) != KeyStatus::RotationNeeded {
            continue;
        }

        let params = RotateKeyParams {
            tenant_id: key.tenant_id.clone(),
            purpose: key.purpose,
            reason: AUTOMATIC_ROTATION_REASON.to_string(),
        };

        let started = Instant::now();
        let result = rotate_key_locked(
            repo,
            master_key,
            cache,
            locks,
            on_change_tx,
            &params,
            Some(key.version),
        )
        .await;

        match result {
            Ok(Some(new_version)) => {
                record_operation(
                    repo,
                    CryptoOperationLogEntry::new(
                        &key.tenant_id,
                        CryptoOperationType::Rotate,
                        Some(key.purpose),
                        started,
                        None,
                    ),
                )
                .await;
                rotated.push(RotatedKey {
                    tenant_id: key.tenant_id,
                    purpose: key.purpose,
                    new_version,
                });
            }
            Ok(None) | Err(CommonError::AlreadyExists { .. }) => {
                info!(
                    tenant_id = %key.tenant_id,
                    purpose = %key.purpose,
                    "key already rotated elsewhere, skipping"
                );
            }
            Err(e) => {
                warn!(
                    tenant_id = %key.tenant_id,
                    purpose = %key.purpose,
                    "automatic key rotation failed: {e}"
                );
                record_operation(
                    repo,
                    CryptoOperationLogEntry::new(
                        &key.tenant_id,
                        CryptoOperationType::Rotate,
                        Some(key.purpose),
                        started,
                        Some(e.to_string()),
                    ),
                )
                .await;
            }
        }
    }

    Ok(rotated)
}

pub async fn get_rotation_history<R: TenantKeyRepositoryLike + ?Sized>(
    repo: &R,
    params: GetRotationHistoryParams,
) -> Result<GetRotationHistoryResponse, CommonError> {
    validate_tenant_id(&params.tenant_id)?;
    repo.list_rotation_records(&params.tenant_id, params.purpose)
        .await
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;

    #[test]
    fn test_status_boundaries_with_default_policy() {
        let policy = RotationPolicy::default();

        assert_eq!(policy.status_for_age(0), KeyStatus::Ok);
        assert_eq!(policy.status_for_age(74), KeyStatus::Ok);
        assert_eq!(policy.status_for_age(75), KeyStatus::RotationWarning);
        assert_eq!(policy.status_for_age(90), KeyStatus::RotationWarning);
        assert_eq!(policy.status_for_age(91), KeyStatus::RotationNeeded);
    }

    #[test]
    fn test_policy_rejects_inverted_thresholds() {
        assert!(RotationPolicy::new(30, 10).is_err());
        assert!(RotationPolicy::new(-1, 10).is_err());

        let policy = RotationPolicy::new(10, 10).unwrap();
        assert_eq!(policy.status_for_age(10), KeyStatus::RotationWarning);
        assert_eq!(policy.status_for_age(11), KeyStatus::RotationNeeded);
    }

    #[test]
    fn test_status_serializes_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&KeyStatus::RotationWarning).unwrap(),
            "\"ROTATION_WARNING\""
        );
        assert_eq!(serde_json::to_string(&KeyStatus::Ok).unwrap(), "\"OK\"");
    }

    #[tokio::test]
    async fn test_rotation_locks_are_per_pair() {
        let locks = RotationLocks::new();
        let a = locks.lock_for("t1", EncryptionPurpose::General);
        let b = locks.lock_for("t1", EncryptionPurpose::General);
        let c = locks.lock_for("t1", EncryptionPurpose::Pii);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let _held = a.lock().await;
        assert!(b.try_lock().is_err());
        assert!(c.try_lock().is_ok());
    }

    async fn insert_aged_key(
        h: &crate::logic::test_support::Harness,
        tenant_id: &str,
        purpose: EncryptionPurpose,
        age_days: i64,
    ) {
        let data_key = DecryptedDataKey::generate();
        h.repo
            .insert_tenant_key_version(&CreateTenantKeyVersion {
                tenant_id: tenant_id.to_string(),
                purpose,
                version: 1,
                wrapped_key: wrap_data_key(&h.master_key, &data_key).await.unwrap(),
                master_key_id: h.master_key.id(),
                rotation_reason: None,
                created_at: WrappedChronoDateTime::new(
                    chrono::Utc::now() - chrono::Duration::days(age_days),
                ),
            })
            .await
            .unwrap();
    }

    fn rotate_params(tenant_id: &str, purpose: EncryptionPurpose, reason: &str) -> RotateKeyParams {
        RotateKeyParams {
            tenant_id: tenant_id.to_string(),
            purpose,
            reason: reason.to_string(),
        }
    }

    #[tokio::test]
    async fn test_rotate_key_retires_previous_version_and_notifies() {
        shared::setup_test!();
        let h = crate::logic::test_support::Harness::new().await;
        h.provision("t1").await;
        let mut rx = h.on_change_tx.subscribe();

        let rotated = rotate_key(
            &h.repo,
            &h.master_key,
            &h.cache,
            &h.locks,
            &h.on_change_tx,
            rotate_params("t1", EncryptionPurpose::Audit, "suspected exposure"),
        )
        .await
        .unwrap();
        assert!(rotated);

        let old = h
            .repo
            .get_tenant_key_version("t1", EncryptionPurpose::Audit, 1)
            .await
            .unwrap()
            .unwrap();
        assert!(old.retired_at.is_some());

        let current = h
            .repo
            .get_current_tenant_key("t1", EncryptionPurpose::Audit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.rotation_reason.as_deref(), Some("suspected exposure"));

        assert_eq!(
            rx.recv().await.unwrap(),
            TenantKeyEvent::KeyRotated {
                tenant_id: "t1".to_string(),
                purpose: EncryptionPurpose::Audit,
                from_version: 1,
                to_version: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_rotate_key_without_keys_is_not_found() {
        shared::setup_test!();
        let h = crate::logic::test_support::Harness::new().await;

        let err = rotate_key(
            &h.repo,
            &h.master_key,
            &h.cache,
            &h.locks,
            &h.on_change_tx,
            rotate_params("ghost", EncryptionPurpose::General, "scheduled"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommonError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_rotate_key_requires_reason() {
        shared::setup_test!();
        let h = crate::logic::test_support::Harness::new().await;
        h.provision("t1").await;

        let err = rotate_key(
            &h.repo,
            &h.master_key,
            &h.cache,
            &h.locks,
            &h.on_change_tx,
            rotate_params("t1", EncryptionPurpose::General, "   "),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommonError::InvalidRequest { .. }));

        let current = h
            .repo
            .get_current_tenant_key("t1", EncryptionPurpose::General)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(current.version, 1);
    }

    #[tokio::test]
    async fn test_rotate_overdue_keys_only_touches_expired_pairs() {
        shared::setup_test!();
        let h = crate::logic::test_support::Harness::new().await;
        insert_aged_key(&h, "old", EncryptionPurpose::Pii, 120).await;
        insert_aged_key(&h, "old", EncryptionPurpose::General, 80).await;
        insert_aged_key(&h, "fresh", EncryptionPurpose::Pii, 3).await;

        let policy = RotationPolicy::default();
        let rotated = rotate_overdue_keys(
            &h.repo,
            &h.master_key,
            &h.cache,
            &h.locks,
            &h.on_change_tx,
            &policy,
        )
        .await
        .unwrap();
        assert_eq!(
            rotated,
            vec![RotatedKey {
                tenant_id: "old".to_string(),
                purpose: EncryptionPurpose::Pii,
                new_version: 2,
            }]
        );

        let history = get_rotation_history(
            &h.repo,
            GetRotationHistoryParams {
                tenant_id: "old".to_string(),
                purpose: EncryptionPurpose::Pii,
            },
        )
        .await
        .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, AUTOMATIC_ROTATION_REASON);

        // the new version is fresh, so a second sweep is a no-op
        let again = rotate_overdue_keys(
            &h.repo,
            &h.master_key,
            &h.cache,
            &h.locks,
            &h.on_change_tx,
            &policy,
        )
        .await
        .unwrap();
        assert!(again.is_empty());
    }
}
