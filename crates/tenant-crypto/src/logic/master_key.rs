// Master (key-encryption) key handling. Tenant data keys are never stored in
// the clear: they are sealed by the master key before they reach the database.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng},
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use shared::error::CommonError;
use std::path::Path;
use utoipa::ToSchema;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;

/// A tenant data key sealed by the master key, `base64(nonce || ct)` for a
/// local master key or the base64 KMS ciphertext blob.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, ToSchema)]
#[serde(transparent)]
pub struct WrappedDataKey(pub String);

impl std::fmt::Debug for WrappedDataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WrappedDataKey(************)")
    }
}

impl From<WrappedDataKey> for libsql::Value {
    fn from(value: WrappedDataKey) -> Self {
        libsql::Value::Text(value.0)
    }
}

/// Raw AES-256 data key. Wiped from memory on drop.
#[derive(Clone, PartialEq, Eq, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub struct DecryptedDataKey(pub Vec<u8>);

impl std::fmt::Debug for DecryptedDataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DecryptedDataKey({} bytes)", self.0.len())
    }
}

impl DecryptedDataKey {
    /// Fresh random 256-bit data key.
    pub fn generate() -> Self {
        let mut key_bytes = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key_bytes);
        DecryptedDataKey(key_bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Clone, zeroize::Zeroize, zeroize::ZeroizeOnDrop)]
pub enum MasterKeyContents {
    AwsKms { arn: String, region: String },
    Local { file_name: String, key_bytes: Vec<u8> },
}

impl std::fmt::Debug for MasterKeyContents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MasterKeyContents::AwsKms { arn, region } => f
                .debug_struct("AwsKms")
                .field("arn", arn)
                .field("region", region)
                .finish(),
            MasterKeyContents::Local { file_name, .. } => f
                .debug_struct("Local")
                .field("file_name", file_name)
                .field("key_bytes", &"************")
                .finish(),
        }
    }
}

impl MasterKeyContents {
    /// Identifier persisted next to every wrapped key.
    pub fn id(&self) -> String {
        match self {
            MasterKeyContents::AwsKms { arn, .. } => format!("aws_kms:{arn}"),
            MasterKeyContents::Local { file_name, .. } => format!("local:{file_name}"),
        }
    }

    pub fn from_kms_arn(arn: &str) -> Result<Self, CommonError> {
        Ok(MasterKeyContents::AwsKms {
            arn: arn.to_string(),
            region: extract_region_from_kms_arn(arn)?,
        })
    }
}

/// ARN format: `arn:aws:kms:REGION:ACCOUNT:key/KEY-ID` or
/// `arn:aws:kms:REGION:ACCOUNT:alias/ALIAS-NAME`
pub fn extract_region_from_kms_arn(arn: &str) -> Result<String, CommonError> {
    let parts: Vec<&str> = arn.split(':').collect();
    if parts.len() >= 6
        && parts[0] == "arn"
        && parts[1] == "aws"
        && parts[2] == "kms"
        && !parts[3].is_empty()
    {
        Ok(parts[3].to_string())
    } else {
        Err(CommonError::invalid_request(format!(
            "invalid KMS ARN format: {arn}"
        )))
    }
}

fn local_key_from_bytes(file_path: &Path, key_bytes: Vec<u8>) -> Result<MasterKeyContents, CommonError> {
    if key_bytes.len() != KEY_LEN {
        return Err(CommonError::Unknown(anyhow::anyhow!(
            "invalid master key length in file {}: expected {KEY_LEN} bytes, got {}",
            file_path.display(),
            key_bytes.len()
        )));
    }

    let file_name = file_path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            CommonError::Unknown(anyhow::anyhow!("invalid file path: {}", file_path.display()))
        })?
        .to_string();

    Ok(MasterKeyContents::Local {
        file_name,
        key_bytes,
    })
}

/// Loads an existing local master key. Fails if the file is missing.
pub fn get_local_master_key(file_path: &Path) -> Result<MasterKeyContents, CommonError> {
    if !file_path.exists() {
        return Err(CommonError::not_found(
            format!("master key file not found at {}", file_path.display()),
            file_path.display().to_string(),
        ));
    }

    let key_bytes = std::fs::read(file_path).map_err(|e| {
        CommonError::Unknown(anyhow::anyhow!(
            "failed to read master key file at {}: {e}",
            file_path.display()
        ))
    })?;

    local_key_from_bytes(file_path, key_bytes)
}

/// Loads the local master key, generating and persisting a random one on
/// first use.
pub fn get_or_create_local_master_key(file_path: &Path) -> Result<MasterKeyContents, CommonError> {
    if file_path.exists() {
        return get_local_master_key(file_path);
    }

    let mut key_bytes = vec![0u8; KEY_LEN];
    rand::thread_rng().fill_bytes(&mut key_bytes);

    if let Some(parent) = file_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| {
            CommonError::Unknown(anyhow::anyhow!(
                "failed to create parent directory for master key at {}: {e}",
                file_path.display()
            ))
        })?;
    }

    std::fs::write(file_path, &key_bytes).map_err(|e| {
        CommonError::Unknown(anyhow::anyhow!(
            "failed to write master key file at {}: {e}",
            file_path.display()
        ))
    })?;

    tracing::info!("generated new local master key at {}", file_path.display());

    local_key_from_bytes(file_path, key_bytes)
}

async fn kms_client(region: &str) -> aws_sdk_kms::Client {
    let config = aws_config::load_from_env()
        .await
        .to_builder()
        .region(aws_config::Region::new(region.to_string()))
        .build();
    aws_sdk_kms::Client::new(&config)
}

fn local_cipher(key_bytes: &[u8]) -> Result<Aes256Gcm, CommonError> {
    if key_bytes.len() != KEY_LEN {
        return Err(CommonError::Unknown(anyhow::anyhow!(
            "invalid local master key length: expected {KEY_LEN} bytes, got {}",
            key_bytes.len()
        )));
    }
    Ok(Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key_bytes)))
}

/// Seals a data key with the master key.
pub async fn wrap_data_key(
    master_key: &MasterKeyContents,
    data_key: &DecryptedDataKey,
) -> Result<WrappedDataKey, CommonError> {
    match master_key {
        MasterKeyContents::AwsKms { arn, region } => {
            let encrypt_output = kms_client(region)
                .await
                .encrypt()
                .key_id(arn)
                .plaintext(aws_sdk_kms::primitives::Blob::new(data_key.as_bytes()))
                .send()
                .await
                .map_err(|e| {
                    CommonError::Unknown(anyhow::anyhow!("failed to wrap data key with AWS KMS: {e}"))
                })?;

            let ciphertext_blob = encrypt_output.ciphertext_blob().ok_or_else(|| {
                CommonError::Unknown(anyhow::anyhow!(
                    "AWS KMS encrypt response did not contain a ciphertext blob"
                ))
            })?;

            Ok(WrappedDataKey(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                ciphertext_blob.as_ref(),
            )))
        }
        MasterKeyContents::Local { key_bytes, .. } => {
            let cipher = local_cipher(key_bytes)?;

            let mut nonce_bytes = [0u8; NONCE_LEN];
            OsRng.fill_bytes(&mut nonce_bytes);
            let nonce = Nonce::from_slice(&nonce_bytes);

            let ciphertext = cipher.encrypt(nonce, data_key.as_bytes()).map_err(|e| {
                CommonError::Unknown(anyhow::anyhow!("local data key wrapping failed: {e}"))
            })?;

            let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
            combined.extend_from_slice(&nonce_bytes);
            combined.extend_from_slice(&ciphertext);

            Ok(WrappedDataKey(base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                &combined,
            )))
        }
    }
}

/// Opens a wrapped data key. `stored_master_key_id` is the id persisted with
/// the key; a mismatch with the configured master key is reported as such
/// rather than as an opaque AEAD failure.
pub async fn unwrap_data_key(
    master_key: &MasterKeyContents,
    stored_master_key_id: &str,
    wrapped: &WrappedDataKey,
) -> Result<DecryptedDataKey, CommonError> {
    let configured = master_key.id();
    if configured != stored_master_key_id {
        return Err(CommonError::Unknown(anyhow::anyhow!(
            "data key was wrapped by master key {stored_master_key_id} but {configured} is configured"
        )));
    }

    let wrapped_bytes =
        base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &wrapped.0).map_err(
            |e| CommonError::Unknown(anyhow::anyhow!("failed to decode wrapped data key: {e}")),
        )?;

    let key = match master_key {
        MasterKeyContents::AwsKms { arn, region } => {
            let decrypt_output = kms_client(region)
                .await
                .decrypt()
                .key_id(arn)
                .ciphertext_blob(aws_sdk_kms::primitives::Blob::new(wrapped_bytes))
                .send()
                .await
                .map_err(|e| {
                    CommonError::Unknown(anyhow::anyhow!(
                        "failed to unwrap data key with AWS KMS: {e}"
                    ))
                })?;

            let plaintext = decrypt_output.plaintext().ok_or_else(|| {
                CommonError::Unknown(anyhow::anyhow!(
                    "AWS KMS decrypt response did not contain plaintext"
                ))
            })?;

            DecryptedDataKey(plaintext.as_ref().to_vec())
        }
        MasterKeyContents::Local { key_bytes, .. } => {
            let cipher = local_cipher(key_bytes)?;

            if wrapped_bytes.len() < NONCE_LEN {
                return Err(CommonError::Unknown(anyhow::anyhow!(
                    "invalid wrapped data key: missing nonce"
                )));
            }

            let (nonce, ciphertext) = wrapped_bytes.split_at(NONCE_LEN);
            let plaintext = cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|e| {
                    CommonError::Unknown(anyhow::anyhow!("local data key unwrapping failed: {e}"))
                })?;

            DecryptedDataKey(plaintext)
        }
    };

    if key.0.len() != KEY_LEN {
        return Err(CommonError::Unknown(anyhow::anyhow!(
            "unwrapped data key has length {}, expected {KEY_LEN}",
            key.0.len()
        )));
    }

    Ok(key)
}


#[cfg(all(test, feature = "integration_test"))]
mod integration_test {
    use super::*;

    const TEST_KMS_KEY_ARN_ENV: &str = "TENANT_CRYPTO_TEST_KMS_ARN";

    #[tokio::test]
    async fn test_kms_wrap_unwrap_roundtrip() {
        shared::setup_test!();

        let Ok(arn) = std::env::var(TEST_KMS_KEY_ARN_ENV) else {
            return;
        };
        let master = MasterKeyContents::from_kms_arn(&arn).unwrap();
        let data_key = DecryptedDataKey::generate();

        let wrapped = wrap_data_key(&master, &data_key).await.unwrap();
        let unwrapped = unwrap_data_key(&master, &master.id(), &wrapped)
            .await
            .unwrap();
        assert_eq!(unwrapped, data_key);
    }
}
