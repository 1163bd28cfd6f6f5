// Hand-written queries in the shape of the generated query layer: one params
// struct, one row struct and one async fn per statement.

#![allow(non_camel_case_types)]

use std::str::FromStr;

use shared::libsql::Connection;
use shared::primitives::WrappedChronoDateTime;

use crate::logic::{CryptoOperationType, EncryptionPurpose, WrappedDataKey};

fn positional(values: Vec<libsql::Value>) -> libsql::params::Params {
    libsql::params::Params::Positional(values)
}

// Domain columns are stored as text and decoded here; a value that does not
// parse is reported as a column type error.
fn purpose_column(row: &libsql::Row, idx: i32) -> Result<EncryptionPurpose, libsql::Error> {
    EncryptionPurpose::from_str(&row.get::<String>(idx)?)
        .map_err(|_e| libsql::Error::InvalidColumnType)
}

fn operation_type_column(
    row: &libsql::Row,
    idx: i32,
) -> Result<CryptoOperationType, libsql::Error> {
    CryptoOperationType::from_str(&row.get::<String>(idx)?)
        .map_err(|_e| libsql::Error::InvalidColumnType)
}

fn datetime_column(row: &libsql::Row, idx: i32) -> Result<WrappedChronoDateTime, libsql::Error> {
    WrappedChronoDateTime::try_from(row.get::<String>(idx)?)
        .map_err(|_e| libsql::Error::InvalidColumnType)
}

fn optional_datetime_column(
    row: &libsql::Row,
    idx: i32,
) -> Result<Option<WrappedChronoDateTime>, libsql::Error> {
    match row.get::<Option<String>>(idx)? {
        Some(value) => WrappedChronoDateTime::try_from(value)
            .map(Some)
            .map_err(|_e| libsql::Error::InvalidColumnType),
        None => Ok(None),
    }
}

const TENANT_KEY_COLUMNS: &str =
    "tenant_id, purpose, version, wrapped_key, master_key_id, rotation_reason, created_at, retired_at";

pub struct insert_tenant_key_params<'a> {
    pub tenant_id: &'a String,
    pub purpose: &'a EncryptionPurpose,
    pub version: &'a i64,
    pub wrapped_key: &'a WrappedDataKey,
    pub master_key_id: &'a String,
    pub rotation_reason: &'a Option<String>,
    pub created_at: &'a WrappedChronoDateTime,
}

fn push_tenant_key_values(values: &mut Vec<libsql::Value>, params: &insert_tenant_key_params<'_>) {
    values.push(libsql::Value::Text(params.tenant_id.clone()));
    values.push((*params.purpose).into());
    values.push(libsql::Value::Integer(*params.version));
    values.push(params.wrapped_key.clone().into());
    values.push(libsql::Value::Text(params.master_key_id.clone()));
    values.push(match params.rotation_reason {
        Some(reason) => libsql::Value::Text(reason.clone()),
        None => libsql::Value::Null,
    });
    values.push((*params.created_at).into());
}

/// Multi-row insert; SQLite applies a single statement atomically.
pub async fn insert_tenant_keys(
    conn: &Connection,
    params: &[insert_tenant_key_params<'_>],
) -> Result<u64, libsql::Error> {
    if params.is_empty() {
        return Ok(0);
    }

    let placeholders = vec!["(?, ?, ?, ?, ?, ?, ?, NULL)"; params.len()].join(", ");
    let sql = format!("INSERT INTO tenant_key ({TENANT_KEY_COLUMNS}) VALUES {placeholders}");

    let mut values = Vec::with_capacity(params.len() * 7);
    for row in params {
        push_tenant_key_values(&mut values, row);
    }

    conn.execute(&sql, positional(values)).await
}

#[derive(Debug)]
pub struct Row_tenant_key {
    pub tenant_id: String,
    pub purpose: EncryptionPurpose,
    pub version: i64,
    pub wrapped_key: WrappedDataKey,
    pub master_key_id: String,
    pub rotation_reason: Option<String>,
    pub created_at: WrappedChronoDateTime,
    pub retired_at: Option<WrappedChronoDateTime>,
}

impl Row_tenant_key {
    fn from_row(row: &libsql::Row) -> Result<Self, libsql::Error> {
        Ok(Self {
            tenant_id: row.get(0)?,
            purpose: purpose_column(row, 1)?,
            version: row.get(2)?,
            wrapped_key: WrappedDataKey(row.get(3)?),
            master_key_id: row.get(4)?,
            rotation_reason: row.get(5)?,
            created_at: datetime_column(row, 6)?,
            retired_at: optional_datetime_column(row, 7)?,
        })
    }
}

async fn query_tenant_keys(
    conn: &Connection,
    sql: &str,
    params: Vec<libsql::Value>,
) -> Result<Vec<Row_tenant_key>, libsql::Error> {
    let mut rows = conn.query(sql, positional(params)).await?;
    let mut items = Vec::new();
    while let Some(row) = rows.next().await? {
        items.push(Row_tenant_key::from_row(&row)?);
    }
    Ok(items)
}

pub async fn tenant_key_count(conn: &Connection, tenant_id: &String) -> Result<i64, libsql::Error> {
    let mut rows = conn
        .query(
            "SELECT COUNT(*) FROM tenant_key WHERE tenant_id = ?",
            libsql::params![tenant_id.clone()],
        )
        .await?;
    match rows.next().await? {
        Some(row) => row.get(0),
        None => Ok(0),
    }
}

pub async fn get_current_tenant_key(
    conn: &Connection,
    tenant_id: &String,
    purpose: &EncryptionPurpose,
) -> Result<Option<Row_tenant_key>, libsql::Error> {
    let sql = format!(
        "SELECT {TENANT_KEY_COLUMNS} FROM tenant_key
WHERE tenant_id = ? AND purpose = ?
ORDER BY version DESC
LIMIT 1"
    );
    let rows = query_tenant_keys(
        conn,
        &sql,
        vec![libsql::Value::Text(tenant_id.clone()), (*purpose).into()],
    )
    .await?;
    Ok(rows.into_iter().next())
}

pub async fn get_tenant_key_version(
    conn: &Connection,
    tenant_id: &String,
    purpose: &EncryptionPurpose,
    version: &i64,
) -> Result<Option<Row_tenant_key>, libsql::Error> {
    let sql = format!(
        "SELECT {TENANT_KEY_COLUMNS} FROM tenant_key
WHERE tenant_id = ? AND purpose = ? AND version = ?"
    );
    let rows = query_tenant_keys(
        conn,
        &sql,
        vec![
            libsql::Value::Text(tenant_id.clone()),
            (*purpose).into(),
            libsql::Value::Integer(*version),
        ],
    )
    .await?;
    Ok(rows.into_iter().next())
}

const CURRENT_KEYS_SQL: &str = "SELECT k.tenant_id, k.purpose, k.version, k.wrapped_key, k.master_key_id, k.rotation_reason, k.created_at, k.retired_at
FROM tenant_key k
JOIN (
    SELECT tenant_id, purpose, MAX(version) AS version
    FROM tenant_key
    GROUP BY tenant_id, purpose
) latest
ON latest.tenant_id = k.tenant_id AND latest.purpose = k.purpose AND latest.version = k.version";

pub async fn list_current_tenant_keys(
    conn: &Connection,
    tenant_id: &String,
) -> Result<Vec<Row_tenant_key>, libsql::Error> {
    let sql = format!("{CURRENT_KEYS_SQL}\nWHERE k.tenant_id = ?");
    query_tenant_keys(conn, &sql, vec![libsql::Value::Text(tenant_id.clone())]).await
}

pub async fn list_all_current_keys(conn: &Connection) -> Result<Vec<Row_tenant_key>, libsql::Error> {
    let sql = format!("{CURRENT_KEYS_SQL}\nORDER BY k.tenant_id, k.purpose");
    query_tenant_keys(conn, &sql, Vec::new()).await
}

pub async fn retire_tenant_key(
    conn: &Connection,
    tenant_id: &String,
    purpose: &EncryptionPurpose,
    version: &i64,
    retired_at: &WrappedChronoDateTime,
) -> Result<u64, libsql::Error> {
    conn.execute(
        "UPDATE tenant_key SET retired_at = ?
WHERE tenant_id = ? AND purpose = ? AND version = ? AND retired_at IS NULL",
        positional(vec![
            libsql::Value::from(*retired_at),
            libsql::Value::Text(tenant_id.clone()),
            (*purpose).into(),
            libsql::Value::Integer(*version),
        ]),
    )
    .await
}

pub struct insert_operation_log_params<'a> {
    pub tenant_id: &'a String,
    pub operation_type: &'a CryptoOperationType,
    pub purpose: &'a Option<EncryptionPurpose>,
    pub success: &'a bool,
    pub performance_ms: &'a f64,
    pub error: &'a Option<String>,
    pub table_name: &'a Option<String>,
    pub field_name: &'a Option<String>,
    pub created_at: &'a WrappedChronoDateTime,
}

fn optional_text(value: &Option<String>) -> libsql::Value {
    match value {
        Some(value) => libsql::Value::Text(value.clone()),
        None => libsql::Value::Null,
    }
}

pub async fn insert_operation_log(
    conn: &Connection,
    params: insert_operation_log_params<'_>,
) -> Result<u64, libsql::Error> {
    conn.execute(
        "INSERT INTO crypto_operation_log (tenant_id, operation_type, purpose, success, performance_ms, error, table_name, field_name, created_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        positional(vec![
            libsql::Value::Text(params.tenant_id.clone()),
            (*params.operation_type).into(),
            match params.purpose {
                Some(purpose) => (*purpose).into(),
                None => libsql::Value::Null,
            },
            libsql::Value::Integer(i64::from(*params.success)),
            libsql::Value::Real(*params.performance_ms),
            optional_text(params.error),
            optional_text(params.table_name),
            optional_text(params.field_name),
            (*params.created_at).into(),
        ]),
    )
    .await
}

#[derive(Debug)]
pub struct Row_crypto_stats {
    pub operation_type: CryptoOperationType,
    pub operation_date: String,
    pub total_operations: i64,
    pub successful_operations: i64,
    pub failed_operations: i64,
    pub avg_performance_ms: f64,
    pub max_performance_ms: f64,
}

pub async fn get_crypto_stats(
    conn: &Connection,
    tenant_id: &String,
    since: &WrappedChronoDateTime,
) -> Result<Vec<Row_crypto_stats>, libsql::Error> {
    let mut rows = conn
        .query(
            "SELECT operation_type,
    date(created_at) AS operation_date,
    COUNT(*) AS total_operations,
    SUM(CASE WHEN success = 1 THEN 1 ELSE 0 END) AS successful_operations,
    SUM(CASE WHEN success = 1 THEN 0 ELSE 1 END) AS failed_operations,
    CAST(AVG(performance_ms) AS REAL) AS avg_performance_ms,
    CAST(MAX(performance_ms) AS REAL) AS max_performance_ms
FROM crypto_operation_log
WHERE tenant_id = ? AND created_at >= ?
GROUP BY operation_type, date(created_at)
ORDER BY operation_date DESC, operation_type ASC",
            positional(vec![
                libsql::Value::Text(tenant_id.clone()),
                libsql::Value::from(*since),
            ]),
        )
        .await?;

    let mut items = Vec::new();
    while let Some(row) = rows.next().await? {
        items.push(Row_crypto_stats {
            operation_type: operation_type_column(&row, 0)?,
            operation_date: row.get(1)?,
            total_operations: row.get(2)?,
            successful_operations: row.get(3)?,
            failed_operations: row.get(4)?,
            avg_performance_ms: row.get(5)?,
            max_performance_ms: row.get(6)?,
        });
    }
    Ok(items)
}

pub struct insert_rotation_record_params<'a> {
    pub tenant_id: &'a String,
    pub purpose: &'a EncryptionPurpose,
    pub from_version: &'a i64,
    pub to_version: &'a i64,
    pub reason: &'a String,
    pub rotated_at: &'a WrappedChronoDateTime,
}

pub async fn insert_rotation_record(
    conn: &Connection,
    params: insert_rotation_record_params<'_>,
) -> Result<u64, libsql::Error> {
    conn.execute(
        "INSERT INTO key_rotation_log (tenant_id, purpose, from_version, to_version, reason, rotated_at)
VALUES (?, ?, ?, ?, ?, ?)",
        positional(vec![
            libsql::Value::Text(params.tenant_id.clone()),
            (*params.purpose).into(),
            libsql::Value::Integer(*params.from_version),
            libsql::Value::Integer(*params.to_version),
            libsql::Value::Text(params.reason.clone()),
            (*params.rotated_at).into(),
        ]),
    )
    .await
}

#[derive(Debug)]
pub struct Row_key_rotation_log {
    pub tenant_id: String,
    pub purpose: EncryptionPurpose,
    pub from_version: i64,
    pub to_version: i64,
    pub reason: String,
    pub rotated_at: WrappedChronoDateTime,
}

pub async fn list_rotation_records(
    conn: &Connection,
    tenant_id: &String,
    purpose: &EncryptionPurpose,
) -> Result<Vec<Row_key_rotation_log>, libsql::Error> {
    let mut rows = conn
        .query(
            "SELECT tenant_id, purpose, from_version, to_version, reason, rotated_at
FROM key_rotation_log
WHERE tenant_id = ? AND purpose = ?
ORDER BY to_version ASC, id ASC",
            positional(vec![
                libsql::Value::Text(tenant_id.clone()),
                (*purpose).into(),
            ]),
        )
        .await?;

    let mut items = Vec::new();
    while let Some(row) = rows.next().await? {
        items.push(Row_key_rotation_log {
            tenant_id: row.get(0)?,
            purpose: purpose_column(&row, 1)?,
            from_version: row.get(2)?,
            to_version: row.get(3)?,
            reason: row.get(4)?,
            rotated_at: datetime_column(&row, 5)?,
        });
    }
    Ok(items)
}
