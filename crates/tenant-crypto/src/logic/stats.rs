use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use shared::{error::CommonError, primitives::WrappedChronoDateTime};
use tracing::warn;
use utoipa::ToSchema;

use super::{EncryptionPurpose, validate_tenant_id};
use crate::repository::CryptoAuditRepositoryLike;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CryptoOperationType {
    CreateKeys,
    Encrypt,
    Decrypt,
    Rotate,
    Reencrypt,
}

impl CryptoOperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CryptoOperationType::CreateKeys => "create_keys",
            CryptoOperationType::Encrypt => "encrypt",
            CryptoOperationType::Decrypt => "decrypt",
            CryptoOperationType::Rotate => "rotate",
            CryptoOperationType::Reencrypt => "reencrypt",
        }
    }
}

impl FromStr for CryptoOperationType {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create_keys" => Ok(CryptoOperationType::CreateKeys),
            "encrypt" => Ok(CryptoOperationType::Encrypt),
            "decrypt" => Ok(CryptoOperationType::Decrypt),
            "rotate" => Ok(CryptoOperationType::Rotate),
            "reencrypt" => Ok(CryptoOperationType::Reencrypt),
            _ => Err(CommonError::Unknown(anyhow::anyhow!(
                "invalid operation_type: {s}"
            ))),
        }
    }
}

impl From<CryptoOperationType> for libsql::Value {
    fn from(value: CryptoOperationType) -> Self {
        libsql::Value::Text(value.as_str().to_string())
    }
}

/// Table and field a value belongs to. Audit-only; it is not bound into the
/// ciphertext.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct OperationContext {
    pub table_name: Option<String>,
    pub field_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CryptoOperationLogEntry {
    pub tenant_id: String,
    pub operation_type: CryptoOperationType,
    pub purpose: Option<EncryptionPurpose>,
    pub success: bool,
    pub performance_ms: f64,
    pub error: Option<String>,
    pub table_name: Option<String>,
    pub field_name: Option<String>,
    pub created_at: WrappedChronoDateTime,
}

impl CryptoOperationLogEntry {
    pub fn new(
        tenant_id: &str,
        operation_type: CryptoOperationType,
        purpose: Option<EncryptionPurpose>,
        started: Instant,
        error: Option<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            operation_type,
            purpose,
            success: error.is_none(),
            performance_ms: started.elapsed().as_secs_f64() * 1000.0,
            error,
            table_name: None,
            field_name: None,
            created_at: WrappedChronoDateTime::now(),
        }
    }

    pub fn with_context(mut self, context: Option<&OperationContext>) -> Self {
        if let Some(context) = context {
            self.table_name = context.table_name.clone();
            self.field_name = context.field_name.clone();
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CryptoStats {
    pub tenant_id: String,
    pub operation_type: CryptoOperationType,
    /// `YYYY-MM-DD`, UTC
    pub operation_date: String,
    pub total_operations: i64,
    pub successful_operations: i64,
    pub failed_operations: i64,
    pub avg_performance_ms: f64,
    pub max_performance_ms: f64,
}

/// Appends one audit entry. A failing audit write is logged and swallowed so
/// it never changes the outcome of the operation being recorded.
pub async fn record_operation<R: CryptoAuditRepositoryLike + ?Sized>(
    repo: &R,
    entry: CryptoOperationLogEntry,
) {
    if let Err(e) = repo.insert_operation_log(&entry).await {
        warn!(
            tenant_id = %entry.tenant_id,
            operation = entry.operation_type.as_str(),
            "failed to record crypto operation: {e}"
        );
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GetCryptoStatsParams {
    pub tenant_id: String,
    pub window_days: i64,
}

pub type GetCryptoStatsResponse = Vec<CryptoStats>;

/// Per-day, per-operation aggregates over the trailing `window_days`, newest
/// day first.
pub async fn get_crypto_stats<R: CryptoAuditRepositoryLike + ?Sized>(
    repo: &R,
    params: GetCryptoStatsParams,
) -> Result<GetCryptoStatsResponse, CommonError> {
    validate_tenant_id(&params.tenant_id)?;
    if params.window_days < 1 {
        return Err(CommonError::invalid_request(format!(
            "window_days must be at least 1, got {}",
            params.window_days
        )));
    }

    repo.get_crypto_stats(&params.tenant_id, &window_start(params.window_days))
        .await
}

/// Start of a trailing window of `window_days`. Windows reaching past the
/// Unix epoch start there; no entry is older.
fn window_start(window_days: i64) -> WrappedChronoDateTime {
    let epoch = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
    let start = chrono::Duration::try_days(window_days)
        .and_then(|window| chrono::Utc::now().checked_sub_signed(window))
        .map_or(epoch, |start| start.max(epoch));
    WrappedChronoDateTime::new(start)
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use crate::repository::Repository;
    use shared::primitives::SqlMigrationLoader;
    use shared::test_utils::repository::setup_in_memory_database;

    async fn setup_repo() -> Repository {
        let (_db, conn) = setup_in_memory_database(vec![Repository::load_sql_migrations()])
            .await
            .unwrap();
        Repository::new(conn)
    }

    fn entry(
        tenant_id: &str,
        operation_type: CryptoOperationType,
        error: Option<&str>,
        performance_ms: f64,
        created_at: WrappedChronoDateTime,
    ) -> CryptoOperationLogEntry {
        CryptoOperationLogEntry {
            tenant_id: tenant_id.to_string(),
            operation_type,
            purpose: Some(EncryptionPurpose::General),
            success: error.is_none(),
            performance_ms,
            error: error.map(str::to_string),
            table_name: Some("patients".to_string()),
            field_name: Some("ssn".to_string()),
            created_at,
        }
    }

    #[tokio::test]
    async fn test_stats_count_successes_and_failures_per_operation() {
        shared::setup_test!();
        let repo = setup_repo().await;
        let now = WrappedChronoDateTime::now();

        record_operation(&repo, entry("t1", CryptoOperationType::Encrypt, None, 2.0, now)).await;
        record_operation(&repo, entry("t1", CryptoOperationType::Encrypt, None, 4.0, now)).await;
        record_operation(
            &repo,
            entry("t1", CryptoOperationType::Encrypt, Some("boom"), 6.0, now),
        )
        .await;
        record_operation(&repo, entry("t1", CryptoOperationType::Decrypt, None, 1.0, now)).await;
        record_operation(&repo, entry("other", CryptoOperationType::Decrypt, None, 1.0, now)).await;

        let stats = get_crypto_stats(
            &repo,
            GetCryptoStatsParams {
                tenant_id: "t1".to_string(),
                window_days: 7,
            },
        )
        .await
        .unwrap();

        assert_eq!(stats.len(), 2);
        let encrypt = stats
            .iter()
            .find(|s| s.operation_type == CryptoOperationType::Encrypt)
            .unwrap();
        assert_eq!(encrypt.total_operations, 3);
        assert_eq!(encrypt.successful_operations, 2);
        assert_eq!(encrypt.failed_operations, 1);
        assert!((encrypt.avg_performance_ms - 4.0).abs() < 1e-9);
        assert!((encrypt.max_performance_ms - 6.0).abs() < 1e-9);
        assert_eq!(
            encrypt.operation_date,
            now.get_inner().format("%Y-%m-%d").to_string()
        );

        let decrypt = stats
            .iter()
            .find(|s| s.operation_type == CryptoOperationType::Decrypt)
            .unwrap();
        assert_eq!(decrypt.total_operations, 1);
        assert_eq!(decrypt.tenant_id, "t1");
    }

    #[tokio::test]
    async fn test_stats_window_excludes_old_entries_and_orders_newest_first() {
        shared::setup_test!();
        let repo = setup_repo().await;
        let now = chrono::Utc::now();
        let two_days_ago = WrappedChronoDateTime::new(now - chrono::Duration::days(2));
        let long_ago = WrappedChronoDateTime::new(now - chrono::Duration::days(40));

        record_operation(
            &repo,
            entry("t1", CryptoOperationType::Encrypt, None, 1.0, WrappedChronoDateTime::new(now)),
        )
        .await;
        record_operation(&repo, entry("t1", CryptoOperationType::Encrypt, None, 1.0, two_days_ago)).await;
        record_operation(&repo, entry("t1", CryptoOperationType::Encrypt, None, 1.0, long_ago)).await;

        let stats = get_crypto_stats(
            &repo,
            GetCryptoStatsParams {
                tenant_id: "t1".to_string(),
                window_days: 30,
            },
        )
        .await
        .unwrap();

        assert_eq!(stats.len(), 2);
        assert!(stats[0].operation_date > stats[1].operation_date);
    }

    #[tokio::test]
    async fn test_stats_rejects_non_positive_window() {
        shared::setup_test!();
        let repo = setup_repo().await;

        let err = get_crypto_stats(
            &repo,
            GetCryptoStatsParams {
                tenant_id: "t1".to_string(),
                window_days: 0,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CommonError::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_stats_window_beyond_calendar_range_covers_all_entries() {
        shared::setup_test!();
        let repo = setup_repo().await;
        let old = WrappedChronoDateTime::try_from("2001-03-04 05:06:07.0").unwrap();
        record_operation(&repo, entry("t1", CryptoOperationType::Decrypt, None, 1.0, old)).await;
        record_operation(
            &repo,
            entry("t1", CryptoOperationType::Encrypt, None, 1.0, WrappedChronoDateTime::now()),
        )
        .await;

        for window_days in [100_000_000, i64::MAX] {
            let stats = get_crypto_stats(
                &repo,
                GetCryptoStatsParams {
                    tenant_id: "t1".to_string(),
                    window_days,
                },
            )
            .await
            .unwrap();
            assert_eq!(stats.len(), 2, "window_days = {window_days}");
            assert_eq!(stats[1].operation_date, "2001-03-04");
        }
    }

    #[test]
    fn test_window_start_clamps_to_unix_epoch() {
        let epoch = chrono::DateTime::<chrono::Utc>::UNIX_EPOCH;
        assert_eq!(*window_start(i64::MAX).get_inner(), epoch);
        assert_eq!(*window_start(100_000_000).get_inner(), epoch);

        let week = *window_start(7).get_inner();
        let expected = chrono::Utc::now() - chrono::Duration::days(7);
        assert!((expected - week).num_seconds().abs() < 5);
    }

    #[tokio::test]
    async fn test_stats_read_does_not_write() {
        shared::setup_test!();
        let repo = setup_repo().await;
        let params = || GetCryptoStatsParams {
            tenant_id: "t1".to_string(),
            window_days: 1,
        };

        assert!(get_crypto_stats(&repo, params()).await.unwrap().is_empty());
        assert!(get_crypto_stats(&repo, params()).await.unwrap().is_empty());
    }
}
