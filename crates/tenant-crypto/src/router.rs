use std::sync::Arc;

use axum::extract::{Json, Path, Query, State};
use serde::{Deserialize, Serialize};
use shared::{
    adapters::openapi::{API_VERSION_TAG, JsonResponse},
    error::CommonError,
};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::logic::{
    CacheConfig, CacheStats, CreateTenantKeysResponse, CryptoOperationResult, DecryptParams,
    EncryptParams, EncryptionPurpose, GetCryptoStatsParams, GetCryptoStatsResponse,
    GetRotationHistoryParams, GetRotationHistoryResponse, GetTenantKeyInfoResponse,
    MasterKeyContents, OperationCache, OperationContext, ReencryptParams, RotateKeyParams,
    RotateKeyResponse, RotateOverdueKeysResponse, RotationLocks, RotationPolicy, TenantKeyEvent,
    TenantKeyEventReceiver, TenantKeyEventSender, create_tenant_keys, decrypt, encrypt,
    get_crypto_stats, get_rotation_history, get_tenant_key_info, publish_event, reencrypt,
    rotate_key, rotate_overdue_keys,
};
use crate::repository::Repository;

pub const PATH_PREFIX: &str = "/api";
pub const API_VERSION_1: &str = "v1";
pub const SERVICE_ROUTE_KEY: &str = "tenant-crypto";

const DEFAULT_STATS_WINDOW_DAYS: i64 = 30;

pub fn create_router() -> OpenApiRouter<TenantCryptoService> {
    OpenApiRouter::new()
        // Key lifecycle endpoints
        .routes(routes!(route_create_tenant_keys, route_get_tenant_key_info))
        .routes(routes!(route_rotate_key))
        .routes(routes!(route_get_rotation_history))
        .routes(routes!(route_rotate_overdue_keys))
        .routes(routes!(route_get_rotation_policy))
        // Gateway endpoints
        .routes(routes!(route_encrypt))
        .routes(routes!(route_decrypt))
        .routes(routes!(route_reencrypt))
        // Cache and stats endpoints
        .routes(routes!(route_clear_cache))
        .routes(routes!(route_get_cache_stats))
        .routes(routes!(route_get_crypto_stats))
}

fn parse_purpose(purpose: &str) -> Result<EncryptionPurpose, CommonError> {
    purpose.parse()
}

// ============================================================================
// Key lifecycle endpoints
// ============================================================================

#[utoipa::path(
    post,
    path = format!("{}/{}/{}/tenants/{{tenant_id}}/keys", PATH_PREFIX, SERVICE_ROUTE_KEY, API_VERSION_1),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    params(
        ("tenant_id" = String, Path, description = "Tenant ID"),
    ),
    responses(
        (status = 200, description = "Provision tenant keys", body = CreateTenantKeysResponse),
        (status = 400, description = "Bad Request", body = CommonError),
        (status = 409, description = "Conflict", body = CommonError),
        (status = 500, description = "Internal Server Error", body = CommonError),
    ),
    summary = "Create tenant keys",
    description = "Provision version 1 of a key for every encryption purpose of a tenant",
    operation_id = "create-tenant-keys",
)]
async fn route_create_tenant_keys(
    State(ctx): State<TenantCryptoService>,
    Path(tenant_id): Path<String>,
) -> JsonResponse<CreateTenantKeysResponse, CommonError> {
    JsonResponse::from(ctx.create_tenant_keys(&tenant_id).await)
}

#[utoipa::path(
    get,
    path = format!("{}/{}/{}/tenants/{{tenant_id}}/keys", PATH_PREFIX, SERVICE_ROUTE_KEY, API_VERSION_1),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    params(
        ("tenant_id" = String, Path, description = "Tenant ID"),
    ),
    responses(
        (status = 200, description = "Current key of every purpose", body = GetTenantKeyInfoResponse),
        (status = 400, description = "Bad Request", body = CommonError),
        (status = 500, description = "Internal Server Error", body = CommonError),
    ),
    summary = "Get tenant key info",
    description = "Current version, age and rotation status of each purpose key of a tenant",
    operation_id = "get-tenant-key-info",
)]
async fn route_get_tenant_key_info(
    State(ctx): State<TenantCryptoService>,
    Path(tenant_id): Path<String>,
) -> JsonResponse<GetTenantKeyInfoResponse, CommonError> {
    JsonResponse::from(ctx.get_tenant_key_info(&tenant_id).await)
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct RotateKeyParamsRoute {
    pub reason: String,
}

#[utoipa::path(
    post,
    path = format!("{}/{}/{}/tenants/{{tenant_id}}/keys/{{purpose}}/rotate", PATH_PREFIX, SERVICE_ROUTE_KEY, API_VERSION_1),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    request_body = RotateKeyParamsRoute,
    params(
        ("tenant_id" = String, Path, description = "Tenant ID"),
        ("purpose" = EncryptionPurpose, Path, description = "Encryption purpose"),
    ),
    responses(
        (status = 200, description = "Rotate key", body = RotateKeyResponse),
        (status = 400, description = "Bad Request", body = CommonError),
        (status = 404, description = "Not Found", body = CommonError),
        (status = 409, description = "Conflict", body = CommonError),
        (status = 500, description = "Internal Server Error", body = CommonError),
    ),
    summary = "Rotate key",
    description = "Create a new current key version for a purpose. Older versions keep decrypting",
    operation_id = "rotate-key",
)]
async fn route_rotate_key(
    State(ctx): State<TenantCryptoService>,
    Path((tenant_id, purpose)): Path<(String, String)>,
    Json(params): Json<RotateKeyParamsRoute>,
) -> JsonResponse<RotateKeyResponse, CommonError> {
    let res = match parse_purpose(&purpose) {
        Ok(purpose) => {
            ctx.rotate_key(RotateKeyParams {
                tenant_id,
                purpose,
                reason: params.reason,
            })
            .await
        }
        Err(e) => Err(e),
    };
    JsonResponse::from(res)
}

#[utoipa::path(
    get,
    path = format!("{}/{}/{}/tenants/{{tenant_id}}/keys/{{purpose}}/rotations", PATH_PREFIX, SERVICE_ROUTE_KEY, API_VERSION_1),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    params(
        ("tenant_id" = String, Path, description = "Tenant ID"),
        ("purpose" = EncryptionPurpose, Path, description = "Encryption purpose"),
    ),
    responses(
        (status = 200, description = "Rotation history, oldest first", body = GetRotationHistoryResponse),
        (status = 400, description = "Bad Request", body = CommonError),
        (status = 500, description = "Internal Server Error", body = CommonError),
    ),
    summary = "Get rotation history",
    operation_id = "get-rotation-history",
)]
async fn route_get_rotation_history(
    State(ctx): State<TenantCryptoService>,
    Path((tenant_id, purpose)): Path<(String, String)>,
) -> JsonResponse<GetRotationHistoryResponse, CommonError> {
    let res = match parse_purpose(&purpose) {
        Ok(purpose) => {
            ctx.get_rotation_history(GetRotationHistoryParams { tenant_id, purpose })
                .await
        }
        Err(e) => Err(e),
    };
    JsonResponse::from(res)
}

#[utoipa::path(
    post,
    path = format!("{}/{}/{}/keys/rotate-overdue", PATH_PREFIX, SERVICE_ROUTE_KEY, API_VERSION_1),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    responses(
        (status = 200, description = "Keys rotated by this sweep", body = RotateOverdueKeysResponse),
        (status = 500, description = "Internal Server Error", body = CommonError),
    ),
    summary = "Rotate overdue keys",
    description = "Rotate every current key older than the rotation policy allows",
    operation_id = "rotate-overdue-keys",
)]
async fn route_rotate_overdue_keys(
    State(ctx): State<TenantCryptoService>,
) -> JsonResponse<RotateOverdueKeysResponse, CommonError> {
    JsonResponse::from(ctx.rotate_overdue_keys().await)
}

#[utoipa::path(
    get,
    path = format!("{}/{}/{}/policy", PATH_PREFIX, SERVICE_ROUTE_KEY, API_VERSION_1),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    responses(
        (status = 200, description = "Active rotation policy", body = RotationPolicy),
    ),
    summary = "Get rotation policy",
    operation_id = "get-rotation-policy",
)]
async fn route_get_rotation_policy(
    State(ctx): State<TenantCryptoService>,
) -> JsonResponse<RotationPolicy, CommonError> {
    JsonResponse::new_ok(*ctx.rotation_policy())
}

// ============================================================================
// Gateway endpoints
// ============================================================================

#[derive(Serialize, Deserialize, ToSchema)]
pub struct EncryptParamsRoute {
    pub plaintext: String,
    pub purpose: EncryptionPurpose,
    pub context: Option<OperationContext>,
}

#[derive(Serialize, Deserialize, ToSchema)]
pub struct DecryptParamsRoute {
    pub ciphertext: String,
    pub purpose: EncryptionPurpose,
    pub context: Option<OperationContext>,
}

#[utoipa::path(
    post,
    path = format!("{}/{}/{}/tenants/{{tenant_id}}/encrypt", PATH_PREFIX, SERVICE_ROUTE_KEY, API_VERSION_1),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    request_body = EncryptParamsRoute,
    params(
        ("tenant_id" = String, Path, description = "Tenant ID"),
    ),
    responses(
        (status = 200, description = "Encryption outcome; failures are reported in the body", body = CryptoOperationResult),
    ),
    summary = "Encrypt",
    description = "Encrypt a value under the tenant's current key for the purpose",
    operation_id = "encrypt",
)]
async fn route_encrypt(
    State(ctx): State<TenantCryptoService>,
    Path(tenant_id): Path<String>,
    Json(params): Json<EncryptParamsRoute>,
) -> JsonResponse<CryptoOperationResult, CommonError> {
    JsonResponse::new_ok(
        ctx.encrypt(EncryptParams {
            tenant_id,
            plaintext: params.plaintext,
            purpose: params.purpose,
            context: params.context,
        })
        .await,
    )
}

#[utoipa::path(
    post,
    path = format!("{}/{}/{}/tenants/{{tenant_id}}/decrypt", PATH_PREFIX, SERVICE_ROUTE_KEY, API_VERSION_1),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    request_body = DecryptParamsRoute,
    params(
        ("tenant_id" = String, Path, description = "Tenant ID"),
    ),
    responses(
        (status = 200, description = "Decryption outcome; failures are reported in the body", body = CryptoOperationResult),
    ),
    summary = "Decrypt",
    description = "Decrypt a value with whichever key version sealed it",
    operation_id = "decrypt",
)]
async fn route_decrypt(
    State(ctx): State<TenantCryptoService>,
    Path(tenant_id): Path<String>,
    Json(params): Json<DecryptParamsRoute>,
) -> JsonResponse<CryptoOperationResult, CommonError> {
    JsonResponse::new_ok(
        ctx.decrypt(DecryptParams {
            tenant_id,
            ciphertext: params.ciphertext,
            purpose: params.purpose,
            context: params.context,
        })
        .await,
    )
}

#[utoipa::path(
    post,
    path = format!("{}/{}/{}/tenants/{{tenant_id}}/reencrypt", PATH_PREFIX, SERVICE_ROUTE_KEY, API_VERSION_1),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    request_body = DecryptParamsRoute,
    params(
        ("tenant_id" = String, Path, description = "Tenant ID"),
    ),
    responses(
        (status = 200, description = "Re-encryption outcome; failures are reported in the body", body = CryptoOperationResult),
    ),
    summary = "Re-encrypt",
    description = "Move a ciphertext onto the tenant's current key version",
    operation_id = "reencrypt",
)]
async fn route_reencrypt(
    State(ctx): State<TenantCryptoService>,
    Path(tenant_id): Path<String>,
    Json(params): Json<DecryptParamsRoute>,
) -> JsonResponse<CryptoOperationResult, CommonError> {
    JsonResponse::new_ok(
        ctx.reencrypt(ReencryptParams {
            tenant_id,
            ciphertext: params.ciphertext,
            purpose: params.purpose,
            context: params.context,
        })
        .await,
    )
}

// ============================================================================
// Cache and stats endpoints
// ============================================================================

#[derive(Debug, Serialize, Deserialize, ToSchema, IntoParams)]
#[into_params(style = Form, parameter_in = Query)]
pub struct ClearCacheQuery {
    /// Only evict keys of this purpose.
    pub purpose: Option<EncryptionPurpose>,
}

#[utoipa::path(
    delete,
    path = format!("{}/{}/{}/tenants/{{tenant_id}}/cache", PATH_PREFIX, SERVICE_ROUTE_KEY, API_VERSION_1),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    params(
        ("tenant_id" = String, Path, description = "Tenant ID"),
        ClearCacheQuery
    ),
    responses(
        (status = 200, description = "Cache cleared"),
    ),
    summary = "Clear cache",
    description = "Evict cached keys of a tenant, optionally of one purpose only",
    operation_id = "clear-cache",
)]
async fn route_clear_cache(
    State(ctx): State<TenantCryptoService>,
    Path(tenant_id): Path<String>,
    Query(query): Query<ClearCacheQuery>,
) -> JsonResponse<(), CommonError> {
    ctx.clear_cache(&tenant_id, query.purpose);
    JsonResponse::new_ok(())
}

#[utoipa::path(
    get,
    path = format!("{}/{}/{}/cache/stats", PATH_PREFIX, SERVICE_ROUTE_KEY, API_VERSION_1),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    responses(
        (status = 200, description = "Cache statistics", body = CacheStats),
    ),
    summary = "Get cache stats",
    operation_id = "get-cache-stats",
)]
async fn route_get_cache_stats(
    State(ctx): State<TenantCryptoService>,
) -> JsonResponse<CacheStats, CommonError> {
    JsonResponse::new_ok(ctx.get_cache_stats())
}

#[derive(Debug, Serialize, Deserialize, ToSchema, IntoParams)]
#[into_params(style = Form, parameter_in = Query)]
pub struct CryptoStatsQuery {
    /// Trailing window in days, default 30.
    pub window_days: Option<i64>,
}

#[utoipa::path(
    get,
    path = format!("{}/{}/{}/tenants/{{tenant_id}}/stats", PATH_PREFIX, SERVICE_ROUTE_KEY, API_VERSION_1),
    tags = [SERVICE_ROUTE_KEY, API_VERSION_TAG],
    params(
        ("tenant_id" = String, Path, description = "Tenant ID"),
        CryptoStatsQuery
    ),
    responses(
        (status = 200, description = "Per-day operation statistics, newest day first", body = GetCryptoStatsResponse),
        (status = 400, description = "Bad Request", body = CommonError),
        (status = 500, description = "Internal Server Error", body = CommonError),
    ),
    summary = "Get crypto stats",
    operation_id = "get-crypto-stats",
)]
async fn route_get_crypto_stats(
    State(ctx): State<TenantCryptoService>,
    Path(tenant_id): Path<String>,
    Query(query): Query<CryptoStatsQuery>,
) -> JsonResponse<GetCryptoStatsResponse, CommonError> {
    let res = ctx
        .get_crypto_stats(GetCryptoStatsParams {
            tenant_id,
            window_days: query.window_days.unwrap_or(DEFAULT_STATS_WINDOW_DAYS),
        })
        .await;
    JsonResponse::from(res)
}

// ============================================================================
// Service
// ============================================================================

pub struct TenantCryptoServiceInner {
    repository: Repository,
    master_key: MasterKeyContents,
    cache: OperationCache,
    rotation_policy: RotationPolicy,
    rotation_locks: RotationLocks,
    on_change_tx: TenantKeyEventSender,
}

/// Entry point to the key lifecycle, gateway, cache and stats. Cheap to
/// clone; all clones share one cache and one set of rotation locks.
#[derive(Clone)]
pub struct TenantCryptoService(pub Arc<TenantCryptoServiceInner>);

impl TenantCryptoService {
    pub fn new(
        repository: Repository,
        master_key: MasterKeyContents,
        cache_config: CacheConfig,
        rotation_policy: RotationPolicy,
        on_change_tx: TenantKeyEventSender,
    ) -> Self {
        Self(Arc::new(TenantCryptoServiceInner {
            repository,
            master_key,
            cache: OperationCache::new(cache_config),
            rotation_policy,
            rotation_locks: RotationLocks::new(),
            on_change_tx,
        }))
    }

    pub fn repository(&self) -> &Repository {
        &self.0.repository
    }

    pub fn master_key(&self) -> &MasterKeyContents {
        &self.0.master_key
    }

    pub fn cache(&self) -> &OperationCache {
        &self.0.cache
    }

    pub fn rotation_policy(&self) -> &RotationPolicy {
        &self.0.rotation_policy
    }

    pub fn on_change_tx(&self) -> &TenantKeyEventSender {
        &self.0.on_change_tx
    }

    pub fn subscribe(&self) -> TenantKeyEventReceiver {
        self.0.on_change_tx.subscribe()
    }

    pub async fn create_tenant_keys(
        &self,
        tenant_id: &str,
    ) -> Result<CreateTenantKeysResponse, CommonError> {
        create_tenant_keys(self.repository(), self.master_key(), self.on_change_tx(), tenant_id).await
    }

    pub async fn get_tenant_key_info(
        &self,
        tenant_id: &str,
    ) -> Result<GetTenantKeyInfoResponse, CommonError> {
        get_tenant_key_info(self.repository(), self.rotation_policy(), tenant_id).await
    }

    pub async fn rotate_key(&self, params: RotateKeyParams) -> Result<RotateKeyResponse, CommonError> {
        rotate_key(
            self.repository(),
            self.master_key(),
            self.cache(),
            &self.0.rotation_locks,
            self.on_change_tx(),
            params,
        )
        .await
    }

    pub async fn rotate_overdue_keys(&self) -> Result<RotateOverdueKeysResponse, CommonError> {
        rotate_overdue_keys(
            self.repository(),
            self.master_key(),
            self.cache(),
            &self.0.rotation_locks,
            self.on_change_tx(),
            self.rotation_policy(),
        )
        .await
    }

    pub async fn get_rotation_history(
        &self,
        params: GetRotationHistoryParams,
    ) -> Result<GetRotationHistoryResponse, CommonError> {
        get_rotation_history(self.repository(), params).await
    }

    pub async fn encrypt(&self, params: EncryptParams) -> CryptoOperationResult {
        encrypt(self.repository(), self.master_key(), self.cache(), params).await
    }

    pub async fn decrypt(&self, params: DecryptParams) -> CryptoOperationResult {
        decrypt(self.repository(), self.master_key(), self.cache(), params).await
    }

    pub async fn reencrypt(&self, params: ReencryptParams) -> CryptoOperationResult {
        reencrypt(self.repository(), self.master_key(), self.cache(), params).await
    }

    pub fn clear_cache(&self, tenant_id: &str, purpose: Option<EncryptionPurpose>) {
        let evicted = self.cache().clear(tenant_id, purpose);
        tracing::debug!(tenant_id, ?purpose, evicted, "cleared key cache");
        publish_event(
            self.on_change_tx(),
            TenantKeyEvent::CacheCleared {
                tenant_id: tenant_id.to_string(),
                purpose,
            },
        );
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.cache().stats()
    }

    pub async fn get_crypto_stats(
        &self,
        params: GetCryptoStatsParams,
    ) -> Result<GetCryptoStatsResponse, CommonError> {
        get_crypto_stats(self.repository(), params).await
    }
}
