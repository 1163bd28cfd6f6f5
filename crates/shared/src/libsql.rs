use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::path::{Path, PathBuf};

use crate::error::CommonError;
use libsql::params::IntoParams;
use libsql::{BatchRows, Database, Rows};
use tracing::info;
use url::Url;

#[derive(Debug, Clone)]
pub struct Connection(pub libsql::Connection);

impl Connection {
    pub fn new(connection: libsql::Connection) -> Self {
        Self(connection)
    }
}

impl Deref for Connection {
    type Target = libsql::Connection;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[macro_export]
macro_rules! execute_with_retry {
    ($operation:expr) => {
        execute_with_retry!($operation, 10)
    };
    ($operation:expr, $max_retries:expr) => {{
        async {
            let mut _retries = 0u32;
            let _max_retries: u32 = $max_retries;

            loop {
                match $operation.await {
                    Ok(result) => break Ok(result),
                    Err(err) => {
                        let err_str = err.to_string();
                        if err_str.contains("database is locked") || err_str.contains("SQLITE_BUSY")
                        {
                            tracing::warn!("Database is locked, retrying... {:?}", err);
                            if _retries >= _max_retries {
                                break Err(err);
                            }

                            _retries += 1;

                            let delay_us = 10_000 * (1 << _retries.min(6));
                            tokio::time::sleep(std::time::Duration::from_micros(delay_us)).await;
                        } else {
                            break Err(err);
                        }
                    }
                }
            }
        }
        .await
    }};
}

impl Connection {
    /// Execute a statement, retrying while the database reports it is busy.
    /// Returns the number of changed rows.
    pub async fn execute(&self, sql: &str, params: impl IntoParams) -> libsql::Result<u64> {
        tracing::trace!("executing `{}`", sql);
        let params = params.into_params()?;
        execute_with_retry!(self.0.execute(sql, params.clone()), 10)
    }

    /// Execute several `;`-separated statements, used for schema migrations.
    pub async fn execute_batch(&self, sql: &str) -> libsql::Result<BatchRows> {
        tracing::trace!("executing batch `{}`", sql);
        execute_with_retry!(self.0.execute_batch(sql), 10)
    }

    /// Run a query and return its [`Rows`], retrying while the database is busy.
    pub async fn query(&self, sql: &str, params: impl IntoParams) -> libsql::Result<Rows> {
        let stmt = self.prepare(sql).await?;
        let params = params.into_params()?;
        execute_with_retry!(stmt.query(params.clone()), 10)
    }
}

/// True when `err` is SQLite refusing a row because of a `UNIQUE` or
/// `PRIMARY KEY` constraint; both report as `UNIQUE constraint failed`.
pub fn is_unique_violation(err: &libsql::Error) -> bool {
    err.to_string().contains("UNIQUE constraint failed")
}

pub struct LocalConnectionParams {
    pub path_to_db_file: PathBuf,
}

pub struct RemoteReplicaConnectionParams {
    pub path_to_db_file: PathBuf,
    pub remote_url: String,
    pub auth_token: String,
}

pub struct RemoteConnectionParams {
    pub remote_url: String,
    pub auth_token: String,
}

/// Parsed form of a `libsql://...?mode=local|remote|remote_replica` string.
pub enum ConnectionType {
    Local(LocalConnectionParams),
    RemoteReplica(RemoteReplicaConnectionParams),
    Remote(RemoteConnectionParams),
}

fn get_libsql_path(url: &Url) -> String {
    if url.as_str().starts_with("libsql://./") {
        format!(".{}", url.path())
    } else {
        match url.host_str() {
            // libsql:///var/lib/x.db has no host; libsql://tmp/x.db keeps it
            Some(host) if !host.is_empty() => format!("/{host}{}", url.path()),
            _ => url.path().to_string(),
        }
    }
}

fn required_query_param(url: &Url, key: &str) -> Result<String, CommonError> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, value)| value.to_string())
        .ok_or_else(|| CommonError::invalid_request(format!("missing {key} query parameter")))
}

impl TryFrom<Url> for ConnectionType {
    type Error = CommonError;
    fn try_from(url: Url) -> Result<Self, Self::Error> {
        let mode = required_query_param(&url, "mode")?;

        match mode.as_str() {
            "local" => {
                if url.scheme() != "libsql" {
                    return Err(CommonError::invalid_request(format!(
                        "invalid scheme for local database: {}",
                        url.scheme()
                    )));
                }
                Ok(ConnectionType::Local(LocalConnectionParams {
                    path_to_db_file: PathBuf::from(get_libsql_path(&url)),
                }))
            }
            "remote_replica" => {
                let mut remote_url = url.clone();
                remote_url.set_query(None);

                Ok(ConnectionType::RemoteReplica(
                    RemoteReplicaConnectionParams {
                        path_to_db_file: PathBuf::from(required_query_param(&url, "path")?),
                        remote_url: remote_url.to_string(),
                        auth_token: required_query_param(&url, "auth")?,
                    },
                ))
            }
            "remote" => {
                let mut remote_url = url.clone();
                remote_url.set_query(None);

                Ok(ConnectionType::Remote(RemoteConnectionParams {
                    remote_url: remote_url.to_string(),
                    auth_token: required_query_param(&url, "auth")?,
                }))
            }
            _ => Err(CommonError::invalid_request(format!(
                "invalid database mode: {mode}"
            ))),
        }
    }
}

pub fn inject_auth_token_to_db_url(
    url: &Url,
    auth_token: &Option<String>,
) -> Result<Url, CommonError> {
    let mut conn_url = url.clone();
    if let Some(auth_token) = auth_token {
        conn_url.query_pairs_mut().append_pair("auth", auth_token);
    }
    Ok(conn_url)
}

pub type Migrations<'a> = BTreeMap<&'a str, BTreeMap<&'a str, &'a str>>;

pub fn merge_nested_migrations<'a>(mergable_migrations: Vec<Migrations<'a>>) -> Migrations<'a> {
    let mut target = Migrations::new();
    for other in mergable_migrations {
        for (outer_key, inner_map) in other {
            target
                .entry(outer_key)
                .and_modify(|existing_inner| {
                    for (inner_key, value) in inner_map.iter() {
                        existing_inner.insert(*inner_key, *value);
                    }
                })
                .or_insert(inner_map);
        }
    }
    target
}

const MIGRATIONS_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS _migrations (
    name TEXT PRIMARY KEY NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%f', 'now'))
)";

async fn applied_migrations(conn: &Connection) -> Result<BTreeSet<String>, CommonError> {
    let mut rows = conn.query("SELECT name FROM _migrations", ()).await?;
    let mut applied = BTreeSet::new();
    while let Some(row) = rows.next().await? {
        applied.insert(row.get::<String>(0)?);
    }
    Ok(applied)
}

/// Applies the `*.up.sql` migrations of the `sqlite` dialect in file-name
/// order. Applied names are recorded in `_migrations` and skipped on later
/// runs. Each migration and its record commit in one transaction.
pub async fn run_migrations(conn: &Connection, migrations: &Migrations<'_>) -> Result<(), CommonError> {
    let Some(sqlite_migrations) = migrations.get("sqlite") else {
        return Ok(());
    };

    conn.execute(MIGRATIONS_TABLE_SQL, ()).await?;
    let applied = applied_migrations(conn).await?;

    for (file_name, contents) in sqlite_migrations
        .iter()
        .filter(|(file_name, _)| file_name.contains(".up."))
    {
        if applied.contains(*file_name) {
            continue;
        }

        info!("applying migration {file_name}");
        let tx = conn.transaction().await?;
        tx.execute_batch(contents).await?;
        tx.execute(
            "INSERT INTO _migrations (name) VALUES (?)",
            libsql::params![file_name.to_string()],
        )
        .await?;
        tx.commit().await?;
    }

    Ok(())
}

fn create_db_file_parent_dir(parent_path: Option<&Path>) -> Result<(), CommonError> {
    if let Some(path) = parent_path
        && !path.as_os_str().is_empty()
        && !std::fs::exists(path)?
    {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

pub async fn establish_db_connection<'a>(
    connection_string: &Url,
    migrations: Option<Migrations<'a>>,
) -> Result<(Database, Connection), CommonError> {
    let connection_type = ConnectionType::try_from(connection_string.clone())?;

    let (db, conn) = match connection_type {
        ConnectionType::Local(params) => {
            info!(
                "establishing local connection to {}",
                params.path_to_db_file.display()
            );
            create_db_file_parent_dir(params.path_to_db_file.parent())?;
            let db = libsql::Builder::new_local(params.path_to_db_file.clone())
                .build()
                .await?;
            let conn = db.connect()?;
            (db, conn)
        }
        ConnectionType::RemoteReplica(params) => {
            info!("establishing remote replica connection");
            create_db_file_parent_dir(params.path_to_db_file.parent())?;
            let db = libsql::Builder::new_remote_replica(
                params.path_to_db_file.clone(),
                params.remote_url.clone(),
                params.auth_token.clone(),
            )
            .read_your_writes(true)
            .build()
            .await?;
            let conn = db.connect()?;
            (db, conn)
        }
        ConnectionType::Remote(params) => {
            info!("establishing remote connection");
            let db =
                libsql::Builder::new_remote(params.remote_url.clone(), params.auth_token.clone())
                    .build()
                    .await?;
            let conn = db.connect()?;
            (db, conn)
        }
    };

    let conn = Connection(conn);

    if let Some(migrations) = migrations {
        run_migrations(&conn, &migrations).await?;
    }

    Ok((db, conn))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_connection_strings() {
        let url = Url::parse("libsql:///var/lib/tenant-crypto/local.db?mode=local").unwrap();
        match ConnectionType::try_from(url).unwrap() {
            ConnectionType::Local(params) => assert_eq!(
                params.path_to_db_file,
                PathBuf::from("/var/lib/tenant-crypto/local.db")
            ),
            _ => panic!("expected a local connection"),
        }
    }

    #[test]
    fn rejects_missing_mode_and_auth() {
        let no_mode = Url::parse("libsql:///tmp/x.db").unwrap();
        assert!(ConnectionType::try_from(no_mode).is_err());

        let no_auth = Url::parse("libsql://db.example.com?mode=remote").unwrap();
        assert!(ConnectionType::try_from(no_auth).is_err());
    }

    #[test]
    fn merges_migrations_by_dialect() {
        let a: Migrations = BTreeMap::from([("sqlite", BTreeMap::from([("1.up.sql", "A")]))]);
        let b: Migrations = BTreeMap::from([("sqlite", BTreeMap::from([("2.up.sql", "B")]))]);
        let merged = merge_nested_migrations(vec![a, b]);
        assert_eq!(merged["sqlite"].len(), 2);
    }

    async fn memory_connection() -> (Database, Connection) {
        let db = libsql::Builder::new_local(":memory:").build().await.unwrap();
        let conn = Connection(db.connect().unwrap());
        (db, conn)
    }

    #[tokio::test]
    async fn applied_migrations_are_not_run_again() {
        let (_db, conn) = memory_connection().await;
        let migrations: Migrations = BTreeMap::from([(
            "sqlite",
            BTreeMap::from([
                ("0001_widget.up.sql", "CREATE TABLE widget (id INTEGER PRIMARY KEY);"),
                ("0001_widget.down.sql", "DROP TABLE widget;"),
                ("0002_widget_name.up.sql", "ALTER TABLE widget ADD COLUMN name TEXT;"),
            ]),
        )]);

        run_migrations(&conn, &migrations).await.unwrap();
        run_migrations(&conn, &migrations).await.unwrap();

        let mut rows = conn
            .query("SELECT name FROM _migrations ORDER BY name", ())
            .await
            .unwrap();
        let mut applied = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            applied.push(row.get::<String>(0).unwrap());
        }
        assert_eq!(applied, vec!["0001_widget.up.sql", "0002_widget_name.up.sql"]);

        conn.execute("INSERT INTO widget (id, name) VALUES (1, 'a')", ())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn failed_migration_is_not_recorded() {
        let (_db, conn) = memory_connection().await;
        let broken: Migrations = BTreeMap::from([(
            "sqlite",
            BTreeMap::from([(
                "0001_broken.up.sql",
                "CREATE TABLE t (id INTEGER); ALTER TABLE missing ADD COLUMN x TEXT;",
            )]),
        )]);
        assert!(run_migrations(&conn, &broken).await.is_err());

        let mut rows = conn
            .query("SELECT COUNT(*) FROM _migrations", ())
            .await
            .unwrap();
        let count: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn only_unique_conflicts_count_as_unique_violations() {
        let (_db, conn) = memory_connection().await;
        conn.execute(
            "CREATE TABLE item (a TEXT NOT NULL, b INTEGER NOT NULL, PRIMARY KEY (a, b))",
            (),
        )
        .await
        .unwrap();
        conn.execute("INSERT INTO item (a, b) VALUES ('x', 1)", ())
            .await
            .unwrap();

        let duplicate = conn
            .execute("INSERT INTO item (a, b) VALUES ('x', 1)", ())
            .await
            .unwrap_err();
        assert!(is_unique_violation(&duplicate));

        let not_null = conn
            .execute("INSERT INTO item (a, b) VALUES (NULL, 2)", ())
            .await
            .unwrap_err();
        assert!(!is_unique_violation(&not_null));
    }
}
