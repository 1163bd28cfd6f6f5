use std::sync::Arc;
use std::time::Instant;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, Payload},
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use shared::error::CommonError;
use thiserror::Error;
use utoipa::ToSchema;

use super::{
    CryptoOperationLogEntry, CryptoOperationType, DecryptedDataKey, EncryptionPurpose,
    MasterKeyContents, NONCE_LEN, OperationCache, OperationContext, record_operation,
    unwrap_data_key,
};
use crate::repository::{CryptoAuditRepositoryLike, TenantKeyRepositoryLike};

/// Format tag leading every ciphertext produced here.
pub const CIPHERTEXT_PREFIX: &str = "tc1";
const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CryptoErrorKind {
    KeysNotProvisioned,
    UnknownKeyVersion,
    TenantMismatch,
    PurposeMismatch,
    MalformedCiphertext,
    CorruptCiphertext,
    KeyUnavailable,
    InvalidInput,
    Internal,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no {purpose} key provisioned for tenant {tenant_id}")]
    KeysNotProvisioned {
        tenant_id: String,
        purpose: EncryptionPurpose,
    },
    #[error("{purpose} key version {version} is not available for tenant {tenant_id}")]
    UnknownKeyVersion {
        tenant_id: String,
        purpose: EncryptionPurpose,
        version: i64,
    },
    #[error("ciphertext was sealed for a different tenant")]
    TenantMismatch,
    #[error("ciphertext was sealed for purpose {found}, expected {expected}")]
    PurposeMismatch {
        expected: EncryptionPurpose,
        found: EncryptionPurpose,
    },
    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(String),
    #[error("ciphertext failed authentication")]
    CorruptCiphertext,
    #[error("key material unavailable: {0}")]
    KeyUnavailable(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> CryptoErrorKind {
        match self {
            GatewayError::KeysNotProvisioned { .. } => CryptoErrorKind::KeysNotProvisioned,
            GatewayError::UnknownKeyVersion { .. } => CryptoErrorKind::UnknownKeyVersion,
            GatewayError::TenantMismatch => CryptoErrorKind::TenantMismatch,
            GatewayError::PurposeMismatch { .. } => CryptoErrorKind::PurposeMismatch,
            GatewayError::MalformedCiphertext(_) => CryptoErrorKind::MalformedCiphertext,
            GatewayError::CorruptCiphertext => CryptoErrorKind::CorruptCiphertext,
            GatewayError::KeyUnavailable(_) => CryptoErrorKind::KeyUnavailable,
            GatewayError::InvalidInput(_) => CryptoErrorKind::InvalidInput,
            GatewayError::Internal(_) => CryptoErrorKind::Internal,
        }
    }

    /// A missing version may still be replicating and key storage may come
    /// back; everything else fails the same way on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::UnknownKeyVersion { .. } | GatewayError::KeyUnavailable(_)
        )
    }
}

impl From<CommonError> for GatewayError {
    fn from(e: CommonError) -> Self {
        match e {
            CommonError::InvalidRequest { msg, .. } => GatewayError::InvalidInput(msg),
            CommonError::Unknown(inner) => GatewayError::KeyUnavailable(format!("{inner:#}")),
            other => GatewayError::KeyUnavailable(other.to_string()),
        }
    }
}

/// Outcome of encrypt/decrypt/reencrypt. Failures are carried in the value,
/// never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct CryptoOperationResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<CryptoErrorKind>,
}

impl CryptoOperationResult {
    fn from_result(result: &Result<String, GatewayError>) -> Self {
        match result {
            Ok(data) => Self {
                success: true,
                data: Some(data.clone()),
                error: None,
                error_kind: None,
            },
            Err(e) => Self {
                success: false,
                data: None,
                error: Some(e.to_string()),
                error_kind: Some(e.kind()),
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.error_kind,
            Some(CryptoErrorKind::UnknownKeyVersion | CryptoErrorKind::KeyUnavailable)
        )
    }
}

/// Parsed `tc1.<b64url(tenant)>.<purpose>.<version>.<b64url(nonce || ct)>`.
///
/// Everything before the last `.` is the header and is authenticated as
/// associated data, so tenant, purpose and version cannot be swapped without
/// failing decryption.
pub struct CiphertextEnvelope<'a> {
    pub tenant_id: String,
    pub purpose: EncryptionPurpose,
    pub version: i64,
    header: &'a str,
    payload: Vec<u8>,
}

impl std::fmt::Debug for CiphertextEnvelope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CiphertextEnvelope")
            .field("tenant_id", &self.tenant_id)
            .field("purpose", &self.purpose)
            .field("version", &self.version)
            .field("payload", &"************")
            .finish()
    }
}

fn envelope_header(tenant_id: &str, purpose: EncryptionPurpose, version: i64) -> String {
    format!(
        "{CIPHERTEXT_PREFIX}.{}.{purpose}.{version}",
        URL_SAFE_NO_PAD.encode(tenant_id.as_bytes())
    )
}

impl<'a> CiphertextEnvelope<'a> {
    pub fn parse(input: &'a str) -> Result<Self, GatewayError> {
        let malformed = |msg: &str| GatewayError::MalformedCiphertext(msg.to_string());

        let (header, payload) = input
            .rsplit_once('.')
            .ok_or_else(|| malformed("missing payload segment"))?;

        let parts: Vec<&str> = header.split('.').collect();
        let [prefix, tenant, purpose, version] = parts.as_slice() else {
            return Err(malformed("expected 5 dot-separated segments"));
        };
        if *prefix != CIPHERTEXT_PREFIX {
            return Err(malformed("unsupported ciphertext format"));
        }

        let tenant_id = URL_SAFE_NO_PAD
            .decode(tenant)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .ok_or_else(|| malformed("invalid tenant segment"))?;
        let purpose = purpose
            .parse::<EncryptionPurpose>()
            .map_err(|_| malformed("unknown purpose segment"))?;
        let version = version
            .parse::<i64>()
            .ok()
            .filter(|v| *v >= 1)
            .ok_or_else(|| malformed("invalid version segment"))?;

        let payload = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| malformed("payload is not base64url"))?;
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(malformed("payload too short"));
        }

        Ok(Self {
            tenant_id,
            purpose,
            version,
            header,
            payload,
        })
    }
}

fn data_cipher(key: &DecryptedDataKey) -> Result<Aes256Gcm, GatewayError> {
    Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| GatewayError::Internal(format!("invalid data key: {e}")))
}

fn seal(
    key: &DecryptedDataKey,
    tenant_id: &str,
    purpose: EncryptionPurpose,
    version: i64,
    plaintext: &[u8],
) -> Result<String, GatewayError> {
    let cipher = data_cipher(key)?;
    let header = envelope_header(tenant_id, purpose, version);

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: header.as_bytes(),
            },
        )
        .map_err(|e| GatewayError::Internal(format!("encryption failed: {e}")))?;

    let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    payload.extend_from_slice(&nonce_bytes);
    payload.extend_from_slice(&ciphertext);

    Ok(format!("{header}.{}", URL_SAFE_NO_PAD.encode(payload)))
}

fn open(key: &DecryptedDataKey, envelope: &CiphertextEnvelope<'_>) -> Result<String, GatewayError> {
    let cipher = data_cipher(key)?;
    let (nonce, ciphertext) = envelope.payload.split_at(NONCE_LEN);

    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: envelope.header.as_bytes(),
            },
        )
        .map_err(|_| GatewayError::CorruptCiphertext)?;

    String::from_utf8(plaintext)
        .map_err(|_| GatewayError::Internal("decrypted value is not valid UTF-8".to_string()))
}

fn check_tenant(tenant_id: &str) -> Result<(), GatewayError> {
    if tenant_id.trim().is_empty() {
        return Err(GatewayError::InvalidInput(
            "tenant_id must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Current key of a pair, from the cache when its current pointer is warm.
async fn resolve_current_key<R: TenantKeyRepositoryLike + ?Sized>(
    repo: &R,
    master_key: &MasterKeyContents,
    cache: &OperationCache,
    tenant_id: &str,
    purpose: EncryptionPurpose,
) -> Result<(i64, Arc<DecryptedDataKey>), GatewayError> {
    if let Some(version) = cache.current_version(tenant_id, purpose)
        && let Some(key) = cache.get(tenant_id, purpose, version)
    {
        return Ok((version, key));
    }

    let epoch = cache.epoch(tenant_id, purpose);
    let row = repo
        .get_current_tenant_key(tenant_id, purpose)
        .await?
        .ok_or_else(|| GatewayError::KeysNotProvisioned {
            tenant_id: tenant_id.to_string(),
            purpose,
        })?;

    let key = match cache.get(tenant_id, purpose, row.version) {
        Some(key) => key,
        None => {
            let key = Arc::new(
                unwrap_data_key(master_key, &row.master_key_id, &row.wrapped_key).await?,
            );
            cache.insert(tenant_id, purpose, row.version, key.clone());
            key
        }
    };
    cache.put_current(tenant_id, purpose, row.version, epoch);

    Ok((row.version, key))
}

async fn resolve_version_key<R: TenantKeyRepositoryLike + ?Sized>(
    repo: &R,
    master_key: &MasterKeyContents,
    cache: &OperationCache,
    tenant_id: &str,
    purpose: EncryptionPurpose,
    version: i64,
) -> Result<Arc<DecryptedDataKey>, GatewayError> {
    if let Some(key) = cache.get(tenant_id, purpose, version) {
        return Ok(key);
    }

    let row = repo
        .get_tenant_key_version(tenant_id, purpose, version)
        .await?
        .ok_or_else(|| GatewayError::UnknownKeyVersion {
            tenant_id: tenant_id.to_string(),
            purpose,
            version,
        })?;

    let key = Arc::new(unwrap_data_key(master_key, &row.master_key_id, &row.wrapped_key).await?);
    cache.insert(tenant_id, purpose, version, key.clone());
    Ok(key)
}

async fn encrypt_value<R: TenantKeyRepositoryLike + ?Sized>(
    repo: &R,
    master_key: &MasterKeyContents,
    cache: &OperationCache,
    tenant_id: &str,
    purpose: EncryptionPurpose,
    plaintext: &str,
) -> Result<String, GatewayError> {
    check_tenant(tenant_id)?;
    let (version, key) = resolve_current_key(repo, master_key, cache, tenant_id, purpose).await?;
    seal(&key, tenant_id, purpose, version, plaintext.as_bytes())
}

async fn decrypt_value<R: TenantKeyRepositoryLike + ?Sized>(
    repo: &R,
    master_key: &MasterKeyContents,
    cache: &OperationCache,
    tenant_id: &str,
    purpose: EncryptionPurpose,
    ciphertext: &str,
) -> Result<String, GatewayError> {
    check_tenant(tenant_id)?;
    let envelope = CiphertextEnvelope::parse(ciphertext)?;

    if envelope.tenant_id != tenant_id {
        return Err(GatewayError::TenantMismatch);
    }
    if envelope.purpose != purpose {
        return Err(GatewayError::PurposeMismatch {
            expected: purpose,
            found: envelope.purpose,
        });
    }

    let key = resolve_version_key(
        repo,
        master_key,
        cache,
        tenant_id,
        purpose,
        envelope.version,
    )
    .await?;
    open(&key, &envelope)
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct EncryptParams {
    pub tenant_id: String,
    pub plaintext: String,
    pub purpose: EncryptionPurpose,
    pub context: Option<OperationContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DecryptParams {
    pub tenant_id: String,
    pub ciphertext: String,
    pub purpose: EncryptionPurpose,
    pub context: Option<OperationContext>,
}

pub type ReencryptParams = DecryptParams;

async fn audit<R: CryptoAuditRepositoryLike + ?Sized>(
    repo: &R,
    tenant_id: &str,
    operation_type: CryptoOperationType,
    purpose: EncryptionPurpose,
    context: Option<&OperationContext>,
    started: Instant,
    result: &Result<String, GatewayError>,
) {
    record_operation(
        repo,
        CryptoOperationLogEntry::new(
            tenant_id,
            operation_type,
            Some(purpose),
            started,
            result.as_ref().err().map(|e| e.to_string()),
        )
        .with_context(context),
    )
    .await;
}

/// Seals `plaintext` under the current key version of the pair.
pub async fn encrypt<R>(
    repo: &R,
    master_key: &MasterKeyContents,
    cache: &OperationCache,
    params: EncryptParams,
) -> CryptoOperationResult
where
    R: TenantKeyRepositoryLike + CryptoAuditRepositoryLike,
{
    let started = Instant::now();
    let result = encrypt_value(
        repo,
        master_key,
        cache,
        &params.tenant_id,
        params.purpose,
        &params.plaintext,
    )
    .await;

    audit(
        repo,
        &params.tenant_id,
        CryptoOperationType::Encrypt,
        params.purpose,
        params.context.as_ref(),
        started,
        &result,
    )
    .await;
    CryptoOperationResult::from_result(&result)
}

/// Opens a ciphertext with whichever key version sealed it.
pub async fn decrypt<R>(
    repo: &R,
    master_key: &MasterKeyContents,
    cache: &OperationCache,
    params: DecryptParams,
) -> CryptoOperationResult
where
    R: TenantKeyRepositoryLike + CryptoAuditRepositoryLike,
{
    let started = Instant::now();
    let result = decrypt_value(
        repo,
        master_key,
        cache,
        &params.tenant_id,
        params.purpose,
        &params.ciphertext,
    )
    .await;

    audit(
        repo,
        &params.tenant_id,
        CryptoOperationType::Decrypt,
        params.purpose,
        params.context.as_ref(),
        started,
        &result,
    )
    .await;
    CryptoOperationResult::from_result(&result)
}

/// Moves a ciphertext onto the current key version. Recorded as a single
/// `reencrypt` operation.
pub async fn reencrypt<R>(
    repo: &R,
    master_key: &MasterKeyContents,
    cache: &OperationCache,
    params: ReencryptParams,
) -> CryptoOperationResult
where
    R: TenantKeyRepositoryLike + CryptoAuditRepositoryLike,
{
    let started = Instant::now();
    let result = async {
        let plaintext = decrypt_value(
            repo,
            master_key,
            cache,
            &params.tenant_id,
            params.purpose,
            &params.ciphertext,
        )
        .await?;
        encrypt_value(
            repo,
            master_key,
            cache,
            &params.tenant_id,
            params.purpose,
            &plaintext,
        )
        .await
    }
    .await;

    audit(
        repo,
        &params.tenant_id,
        CryptoOperationType::Reencrypt,
        params.purpose,
        params.context.as_ref(),
        started,
        &result,
    )
    .await;
    CryptoOperationResult::from_result(&result)
}
