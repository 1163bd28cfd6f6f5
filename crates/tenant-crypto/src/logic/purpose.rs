use std::str::FromStr;

use serde::{Deserialize, Serialize};
use shared::error::CommonError;
use utoipa::ToSchema;

/// Category of data a key protects. Each tenant holds an independent key
/// lineage per purpose, and the purpose is authenticated inside every
/// ciphertext so data sealed for one purpose never opens under another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionPurpose {
    General,
    Pii,
    Financial,
    Audit,
    Compliance,
}

impl EncryptionPurpose {
    pub const ALL: [EncryptionPurpose; 5] = [
        EncryptionPurpose::General,
        EncryptionPurpose::Pii,
        EncryptionPurpose::Financial,
        EncryptionPurpose::Audit,
        EncryptionPurpose::Compliance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionPurpose::General => "general",
            EncryptionPurpose::Pii => "pii",
            EncryptionPurpose::Financial => "financial",
            EncryptionPurpose::Audit => "audit",
            EncryptionPurpose::Compliance => "compliance",
        }
    }
}

impl std::fmt::Display for EncryptionPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionPurpose {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" => Ok(EncryptionPurpose::General),
            "pii" => Ok(EncryptionPurpose::Pii),
            "financial" => Ok(EncryptionPurpose::Financial),
            "audit" => Ok(EncryptionPurpose::Audit),
            "compliance" => Ok(EncryptionPurpose::Compliance),
            _ => Err(CommonError::invalid_request(format!(
                "unknown encryption purpose: {s}"
            ))),
        }
    }
}

impl From<EncryptionPurpose> for libsql::Value {
    fn from(value: EncryptionPurpose) -> Self {
        libsql::Value::Text(value.as_str().to_string())
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;

    #[test]
    fn test_purpose_string_forms_agree() {
        for purpose in EncryptionPurpose::ALL {
            let parsed = EncryptionPurpose::from_str(purpose.as_str()).unwrap();
            assert_eq!(parsed, purpose);

            let json = serde_json::to_string(&purpose).unwrap();
            assert_eq!(json, format!("\"{}\"", purpose.as_str()));
        }
    }

    #[test]
    fn test_unknown_purpose_is_invalid_request() {
        let err = EncryptionPurpose::from_str("medical").unwrap_err();
        assert!(matches!(err, CommonError::InvalidRequest { .. }));
    }
}
