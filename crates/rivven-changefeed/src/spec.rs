//! Desired changefeed configuration
//!
//! [`ChangefeedSpec`] is what callers declare; every field except `tables`
//! is fixed once the job exists. Values end up interpolated into control
//! statements, so validation is strict and runs before any remote call.

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

use crate::error::{ChangefeedError, Result};

/// Format accepted for the `cursor` field
pub const CURSOR_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Maximum identifier length accepted for tables and connection names
const MAX_IDENTIFIER_LENGTH: usize = 255;

/// Regex for `table`, `schema.table` or `database.schema.table`
static TABLE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*(\.[A-Za-z_][A-Za-z0-9_$]*){0,2}$").unwrap()
});

/// Regex for external connection names
static CONNECTION_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*$").unwrap());

/// Identifier of a changefeed job, assigned by the database at creation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

impl JobId {
    /// Parse a job id; only decimal digits are accepted
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ChangefeedError::validation(format!(
                "invalid job id '{}': expected a decimal number",
                id
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The id as it appears in control statements
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = ChangefeedError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = ChangefeedError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.0
    }
}

/// Whether a full table scan precedes streaming
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitialScan {
    /// Snapshot the tables first
    Yes,
    /// Stream changes only
    #[default]
    No,
}

impl InitialScan {
    /// Value used in the `initial_scan` option
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Yes => "yes",
            Self::No => "no",
        }
    }
}

impl fmt::Display for InitialScan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InitialScan {
    type Err = ChangefeedError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "yes" => Ok(Self::Yes),
            "no" => Ok(Self::No),
            other => Err(ChangefeedError::validation(format!(
                "initial_scan must be 'yes' or 'no', got '{}'",
                other
            ))),
        }
    }
}

/// Desired configuration of a changefeed job
///
/// # Example
///
/// ```yaml
/// tables: [orders, customers]
/// sink: kafka_conn
/// schema_prefix: shop
/// registry: registry_conn
/// cursor: "2024-01-01 00:00:00"
/// initial_scan: "no"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ChangefeedSpec {
    /// Tables streamed by the job
    #[serde(default, alias = "table_list")]
    #[validate(
        length(min = 1, message = "at least one table is required"),
        custom(function = "validate_tables")
    )]
    pub tables: Vec<String>,

    /// External connection used as the delivery target
    #[serde(default, alias = "kafka_connection_name")]
    #[validate(custom(function = "validate_connection_name"))]
    pub sink: String,

    /// Avro schema prefix (the `_` delimiter is appended on encode)
    #[serde(default, alias = "avro_schema_prefix")]
    #[validate(custom(function = "validate_schema_prefix"))]
    pub schema_prefix: String,

    /// External connection of the schema registry
    #[serde(default, alias = "registry_connection_name")]
    #[validate(custom(function = "validate_connection_name"))]
    pub registry: String,

    /// Logical start point; streaming starts from "now" when absent
    #[serde(default, alias = "start_from", skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_cursor"))]
    pub cursor: Option<String>,

    /// Initial scan mode
    #[serde(default)]
    pub initial_scan: InitialScan,
}

impl ChangefeedSpec {
    /// Create a spec with the required fields
    pub fn new(
        tables: impl IntoIterator<Item = impl Into<String>>,
        sink: impl Into<String>,
        schema_prefix: impl Into<String>,
        registry: impl Into<String>,
    ) -> Self {
        Self {
            tables: tables.into_iter().map(Into::into).collect(),
            sink: sink.into(),
            schema_prefix: schema_prefix.into(),
            registry: registry.into(),
            cursor: None,
            initial_scan: InitialScan::No,
        }
    }

    /// Set the cursor
    pub fn with_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    /// Set the initial scan mode
    pub fn with_initial_scan(mut self, mode: InitialScan) -> Self {
        self.initial_scan = mode;
        self
    }

    /// Validate the spec, mapping failures to [`ChangefeedError::Validation`]
    pub fn check(&self) -> Result<()> {
        self.validate().map_err(ChangefeedError::from)
    }

    /// Load a spec from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Cursor value, treating an empty string as absent
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref().filter(|c| !c.is_empty())
    }
}

fn validate_tables(tables: &[String]) -> std::result::Result<(), ValidationError> {
    for table in tables {
        if table.len() > MAX_IDENTIFIER_LENGTH || !TABLE_REGEX.is_match(table) {
            return Err(ValidationError::new("invalid_table")
                .with_message(format!("'{}' is not a valid table name", table).into()));
        }
    }
    Ok(())
}

fn validate_connection_name(value: &str) -> std::result::Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::new("required")
            .with_message("connection name cannot be empty".into()));
    }
    if value.len() > MAX_IDENTIFIER_LENGTH || !CONNECTION_NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_connection_name")
            .with_message(format!("'{}' is not a valid connection name", value).into()));
    }
    Ok(())
}

fn validate_schema_prefix(value: &str) -> std::result::Result<(), ValidationError> {
    if value.is_empty() {
        return Err(
            ValidationError::new("required").with_message("schema prefix cannot be empty".into())
        );
    }
    if value.contains('\'') || value.contains('\\') {
        return Err(ValidationError::new("invalid_schema_prefix")
            .with_message("schema prefix cannot contain quotes or backslashes".into()));
    }
    Ok(())
}

fn validate_cursor(value: &str) -> std::result::Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    NaiveDateTime::parse_from_str(value, CURSOR_FORMAT)
        .map(|_| ())
        .map_err(|_| {
            ValidationError::new("invalid_cursor").with_message(
                format!(
                    "cursor must be a datetime in 'YYYY-MM-DD HH:MM:SS' format, got: {}",
                    value
                )
                .into(),
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ChangefeedSpec {
        ChangefeedSpec::new(["public.orders"], "kafka-conn", "shop", "registry-conn")
    }

    #[test]
    fn test_valid_spec() {
        assert!(spec().check().is_ok());
        assert!(spec().with_cursor("2023-12-31 23:59:59").check().is_ok());
    }

    #[test]
    fn test_empty_tables_rejected() {
        let mut s = spec();
        s.tables.clear();
        let err = s.check().unwrap_err();
        assert!(err.to_string().contains("at least one table"));
    }

    #[test]
    fn test_cursor_formats() {
        for valid in [
            "2023-01-01 00:00:00",
            "2023-12-31 23:59:59",
            "2000-06-15 12:30:45",
        ] {
            assert!(validate_cursor(valid).is_ok(), "{}", valid);
        }
        for invalid in ["not-a-date", "2023/01/01", "2023-01-01", "01:00:00"] {
            assert!(validate_cursor(invalid).is_err(), "{}", invalid);
        }
    }

    #[test]
    fn test_table_names() {
        assert!(validate_tables(&["orders".into(), "db.public.t_1".into()]).is_ok());
        assert!(validate_tables(&["orders; DROP TABLE users".into()]).is_err());
        assert!(validate_tables(&["a.b.c.d".into()]).is_err());
        assert!(validate_tables(&["".into()]).is_err());
    }

    #[test]
    fn test_schema_prefix_rejects_quotes() {
        let mut s = spec();
        s.schema_prefix = "x'; --".into();
        assert!(s.check().is_err());
        s.schema_prefix = String::new();
        assert!(s.check().is_err());
    }

    #[test]
    fn test_job_id() {
        assert_eq!(JobId::new("123").unwrap().as_str(), "123");
        assert_eq!(JobId::new(" 42 ").unwrap().as_str(), "42");
        assert!(JobId::new("").is_err());
        assert!(JobId::new("1; CANCEL JOB 2").is_err());
    }

    #[test]
    fn test_initial_scan_parse() {
        assert_eq!("yes".parse::<InitialScan>().unwrap(), InitialScan::Yes);
        assert_eq!("no".parse::<InitialScan>().unwrap(), InitialScan::No);
        assert!("maybe".parse::<InitialScan>().is_err());
        assert_eq!(InitialScan::default(), InitialScan::No);
    }

    #[test]
    fn test_spec_yaml_aliases() {
        let yaml = r#"
table_list: [table1, table2]
kafka_connection_name: kafka-conn
avro_schema_prefix: myprefix
registry_connection_name: registry-conn
start_from: "2023-01-01 00:00:00"
initial_scan: "yes"
"#;
        let s = ChangefeedSpec::from_yaml(yaml).unwrap();
        assert_eq!(s.tables, vec!["table1", "table2"]);
        assert_eq!(s.sink, "kafka-conn");
        assert_eq!(s.schema_prefix, "myprefix");
        assert_eq!(s.registry, "registry-conn");
        assert_eq!(s.cursor(), Some("2023-01-01 00:00:00"));
        assert_eq!(s.initial_scan, InitialScan::Yes);
    }
}
