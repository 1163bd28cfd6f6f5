use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use shared::error::{CommonError, DynError};
use shared::libsql::{establish_db_connection, inject_auth_token_to_db_url};
use shared::primitives::SqlMigrationLoader;
use tenant_crypto::logic::{
    CacheConfig, MasterKeyContents, RotationPolicy, get_or_create_local_master_key,
};
use tenant_crypto::repository::Repository;
use tenant_crypto::router::TenantCryptoService;
use tokio_graceful_shutdown::{
    SubsystemBuilder, SubsystemHandle, Toplevel, errors::GracefulShutdownError,
};
use tracing::{error, info};
use url::Url;

use crate::server::{StartAxumServerParams, start_axum_server};
use crate::sweeper::run_rotation_sweeper;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Tenant key management server
#[derive(Debug, Parser)]
#[command(name = "tenant-crypto-server", version)]
pub struct StartParams {
    #[arg(long, env = "TENANT_CRYPTO_HOST", default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, env = "TENANT_CRYPTO_PORT", default_value = "3100")]
    pub port: u16,
    /// `libsql://<path>?mode=local`, `libsql://<host>?mode=remote` or
    /// `libsql://<host>?mode=remote_replica&path=<file>`
    #[arg(
        long,
        env = "TENANT_CRYPTO_DB_CONN_STRING",
        default_value = "libsql://./.data/tenant-crypto.db?mode=local"
    )]
    pub db_conn_string: Url,
    #[arg(long, env = "TENANT_CRYPTO_DB_AUTH_TOKEN")]
    pub db_auth_token: Option<String>,
    /// Local 32-byte master key, created on first start if missing.
    #[arg(
        long,
        env = "TENANT_CRYPTO_MASTER_KEY_FILE",
        conflicts_with = "master_key_kms_arn",
        required_unless_present = "master_key_kms_arn"
    )]
    pub master_key_file: Option<PathBuf>,
    /// AWS KMS key used as the master key instead of a local file.
    #[arg(long, env = "TENANT_CRYPTO_MASTER_KEY_KMS_ARN")]
    pub master_key_kms_arn: Option<String>,
    #[arg(long, env = "TENANT_CRYPTO_ROTATION_WARNING_DAYS", default_value = "75")]
    pub rotation_warning_days: i64,
    #[arg(long, env = "TENANT_CRYPTO_ROTATION_MAX_DAYS", default_value = "90")]
    pub rotation_max_days: i64,
    #[arg(long, env = "TENANT_CRYPTO_CACHE_CAPACITY", default_value = "1024")]
    pub cache_capacity: usize,
    /// Evict cached keys this long after they were loaded, e.g. `15m`.
    #[arg(long, env = "TENANT_CRYPTO_CACHE_TTL")]
    pub cache_ttl: Option<humantime::Duration>,
    #[arg(long, env = "TENANT_CRYPTO_CACHE_DISABLED")]
    pub cache_disabled: bool,
    /// How long a cached current key version is trusted before the database
    /// is consulted again.
    #[arg(long, env = "TENANT_CRYPTO_CACHE_CURRENT_TTL", default_value = "30s")]
    pub cache_current_ttl: humantime::Duration,
    /// How often overdue keys are rotated automatically; `0s` disables.
    #[arg(long, env = "TENANT_CRYPTO_ROTATION_SWEEP_INTERVAL", default_value = "1h")]
    pub rotation_sweep_interval: humantime::Duration,
}

impl StartParams {
    fn master_key(&self) -> Result<MasterKeyContents, CommonError> {
        match (&self.master_key_kms_arn, &self.master_key_file) {
            (Some(arn), _) => MasterKeyContents::from_kms_arn(arn),
            (None, Some(path)) => get_or_create_local_master_key(path),
            (None, None) => Err(CommonError::invalid_request(
                "either --master-key-file or --master-key-kms-arn is required",
            )),
        }
    }

    fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            enabled: !self.cache_disabled,
            capacity: self.cache_capacity,
            entry_ttl: self.cache_ttl.map(Into::into),
            current_ttl: self.cache_current_ttl.into(),
        }
    }
}

async fn build_service(params: &StartParams) -> Result<(TenantCryptoService, libsql::Database), CommonError> {
    let master_key = params.master_key()?;
    info!(master_key = %master_key.id(), "loaded master key");

    let policy = RotationPolicy::new(params.rotation_warning_days, params.rotation_max_days)?;

    let db_url = inject_auth_token_to_db_url(&params.db_conn_string, &params.db_auth_token)?;
    let (db, conn) =
        establish_db_connection(&db_url, Some(Repository::load_sql_migrations())).await?;

    let (on_change_tx, _) = tokio::sync::broadcast::channel(100);
    let service = TenantCryptoService::new(
        Repository::new(conn),
        master_key,
        params.cache_config(),
        policy,
        on_change_tx,
    );

    Ok((service, db))
}

pub async fn run_server(params: StartParams) -> Result<(), anyhow::Error> {
    let (service, _db) = build_service(&params).await?;
    let sweep_interval: Duration = params.rotation_sweep_interval.into();

    Toplevel::new(async move |subsys: SubsystemHandle| {
        let server_service = service.clone();
        let host = params.host.clone();
        let port = params.port;
        subsys.start(SubsystemBuilder::new(
            "axum-server",
            move |subsys: SubsystemHandle| async move {
                let (server_fut, handle, addr) = start_axum_server(StartAxumServerParams {
                    host,
                    port,
                    service: server_service,
                })?;
                info!("listening on {addr}");

                tokio::select! {
                    _ = subsys.on_shutdown_requested() => {
                        info!("shutting down axum server");
                        handle.graceful_shutdown(Some(SHUTDOWN_TIMEOUT));
                    }
                    res = server_fut => {
                        if let Err(e) = res {
                            error!("axum server stopped: {e}");
                        }
                        subsys.request_shutdown();
                    }
                }

                Ok::<(), CommonError>(())
            },
        ));

        if sweep_interval.is_zero() {
            info!("automatic key rotation disabled");
        } else {
            subsys.start(SubsystemBuilder::new(
                "rotation-sweeper",
                move |subsys: SubsystemHandle| async move {
                    tokio::select! {
                        _ = subsys.on_shutdown_requested() => {
                            info!("stopping rotation sweeper");
                        }
                        _ = run_rotation_sweeper(service, sweep_interval) => {}
                    }
                    Ok::<(), CommonError>(())
                },
            ));
        }
    })
    .catch_signals()
    .handle_shutdown_requests(SHUTDOWN_TIMEOUT)
    .await
    .map_err(|err: GracefulShutdownError<DynError>| {
        for sub_err in err.get_subsystem_errors() {
            error!("subsystem error: {:?}", sub_err);
        }
        anyhow::anyhow!(err)
    })
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;

    #[test]
    fn test_defaults() {
        let params =
            StartParams::try_parse_from(["tenant-crypto-server", "--master-key-file", "m.key"])
                .unwrap();

        assert_eq!(params.port, 3100);
        assert_eq!(params.rotation_warning_days, 75);
        assert_eq!(params.rotation_max_days, 90);
        assert_eq!(
            Duration::from(params.rotation_sweep_interval),
            Duration::from_secs(3600)
        );
        assert_eq!(params.cache_config(), CacheConfig::default());
    }

    #[test]
    fn test_master_key_sources_are_exclusive() {
        assert!(
            StartParams::try_parse_from([
                "tenant-crypto-server",
                "--master-key-file",
                "m.key",
                "--master-key-kms-arn",
                "arn:aws:kms:us-east-1:123456789012:key/abc",
            ])
            .is_err()
        );
    }

    #[test]
    fn test_cache_flags() {
        let params = StartParams::try_parse_from([
            "tenant-crypto-server",
            "--master-key-kms-arn",
            "arn:aws:kms:eu-west-1:123456789012:key/abc",
            "--cache-disabled",
            "--cache-ttl",
            "15m",
            "--cache-current-ttl",
            "5s",
            "--rotation-sweep-interval",
            "0s",
        ])
        .unwrap();

        let cache = params.cache_config();
        assert!(!cache.enabled);
        assert_eq!(cache.entry_ttl, Some(Duration::from_secs(900)));
        assert_eq!(cache.current_ttl, Duration::from_secs(5));
        assert!(Duration::from(params.rotation_sweep_interval).is_zero());
        let master_key = params.master_key().unwrap();
        assert!(matches!(
            &master_key,
            MasterKeyContents::AwsKms { region, .. } if region.as_str() == "eu-west-1"
        ));
    }
}
