use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Format SQLite uses for `datetime('now')`; rows written by this crate use the
/// same layout so that `date(created_at)` and range comparisons work in SQL.
const SQLITE_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
/// Fixed-width variant used for writes so stored values compare correctly as
/// text.
const SQLITE_DATETIME_WRITE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

pub type LoadSqlMigrationsCallback =
    fn() -> BTreeMap<&'static str, BTreeMap<&'static str, &'static str>>;

/// Implemented by repositories that ship their own schema. The outer map is
/// keyed by dialect (`"sqlite"`), the inner one by migration file name.
pub trait SqlMigrationLoader {
    fn load_sql_migrations() -> BTreeMap<&'static str, BTreeMap<&'static str, &'static str>>;
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct WrappedChronoDateTime(chrono::DateTime<chrono::Utc>);

impl WrappedChronoDateTime {
    pub fn get_inner(&self) -> &chrono::DateTime<chrono::Utc> {
        &self.0
    }

    pub fn new(value: chrono::DateTime<chrono::Utc>) -> Self {
        Self(value)
    }

    pub fn now() -> Self {
        Self(chrono::Utc::now())
    }

    /// Whole days elapsed between `self` and `now`, clamped at zero.
    pub fn whole_days_until(&self, now: &WrappedChronoDateTime) -> i64 {
        (now.0 - self.0).num_days().max(0)
    }

    pub fn to_sqlite_string(&self) -> String {
        self.0.format(SQLITE_DATETIME_WRITE_FORMAT).to_string()
    }

    fn parse(value: &str) -> Result<Self, anyhow::Error> {
        // SQLite datetime format first, then RFC3339
        let parsed = chrono::NaiveDateTime::parse_from_str(value, SQLITE_DATETIME_FORMAT)
            .map(|naive| naive.and_utc())
            .or_else(|_| chrono::DateTime::parse_from_rfc3339(value).map(|dt| dt.into()))
            .map_err(|_e| anyhow::anyhow!("invalid datetime value: {value}"))?;

        Ok(WrappedChronoDateTime::new(parsed))
    }
}

impl TryFrom<String> for WrappedChronoDateTime {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value.as_str())
    }
}

impl TryFrom<&str> for WrappedChronoDateTime {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl std::fmt::Display for WrappedChronoDateTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl From<chrono::DateTime<chrono::Utc>> for WrappedChronoDateTime {
    fn from(value: chrono::DateTime<chrono::Utc>) -> Self {
        Self(value)
    }
}

impl From<WrappedChronoDateTime> for chrono::DateTime<chrono::Utc> {
    fn from(value: WrappedChronoDateTime) -> Self {
        value.0
    }
}

impl From<WrappedChronoDateTime> for libsql::Value {
    fn from(value: WrappedChronoDateTime) -> Self {
        libsql::Value::Text(value.to_sqlite_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sqlite_and_rfc3339_formats() {
        let from_sqlite = WrappedChronoDateTime::try_from("2026-01-02 03:04:05.678").unwrap();
        let from_rfc = WrappedChronoDateTime::try_from("2026-01-02T03:04:05.678Z").unwrap();
        assert_eq!(from_sqlite, from_rfc);
    }

    #[test]
    fn whole_days_until_clamps_negative_spans() {
        let earlier = WrappedChronoDateTime::try_from("2026-01-01 00:00:00.0").unwrap();
        let later = WrappedChronoDateTime::try_from("2026-01-11 12:00:00.0").unwrap();
        assert_eq!(earlier.whole_days_until(&later), 10);
        assert_eq!(later.whole_days_until(&earlier), 0);
    }
}
