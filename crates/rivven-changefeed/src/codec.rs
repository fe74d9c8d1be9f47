//! Control statements and description decoding
//!
//! Encoding turns a [`ChangefeedSpec`] into the `CREATE CHANGEFEED`
//! statement; [`ControlStatement`] renders every other administrative
//! statement the reconciler issues. Decoding goes the other way: the
//! database only reports creation options inside the free-text job
//! description, so [`DecodedConfig::parse`] pattern-matches them back out.

use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

use crate::spec::{ChangefeedSpec, InitialScan, JobId};

/// Delimiter appended to the schema prefix on encode
pub const SCHEMA_PREFIX_DELIMITER: &str = "_";

/// Scheme wrapping external connection references
pub const EXTERNAL_SCHEME: &str = "external://";

static SCHEMA_PREFIX_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bavro_schema_prefix\s*=\s*'([^']*)'").unwrap());

static REGISTRY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bconfluent_schema_registry\s*=\s*'external://([^']*)'").unwrap()
});

static INITIAL_SCAN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\binitial_scan\s*=\s*'([^']*)'").unwrap());

static CURSOR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bcursor\s*=\s*'([^']*)'").unwrap());

/// Build the statement that creates a changefeed for `spec`
///
/// The job always pauses on error and emits the `updated`/`diff` envelope
/// so downstream consumers can rebuild row state.
pub fn encode_create(spec: &ChangefeedSpec) -> String {
    let mut options = Vec::with_capacity(8);
    options.push(format!("initial_scan = '{}'", spec.initial_scan));
    options.push("updated".to_string());
    if let Some(cursor) = spec.cursor() {
        options.push(format!("cursor='{}'", cursor));
    }
    options.push("diff".to_string());
    options.push("on_error='pause'".to_string());
    options.push("format = avro".to_string());
    options.push(format!(
        "avro_schema_prefix='{}{}'",
        spec.schema_prefix, SCHEMA_PREFIX_DELIMITER
    ));
    options.push(format!(
        "confluent_schema_registry = '{}{}'",
        EXTERNAL_SCHEME, spec.registry
    ));

    format!(
        "CREATE CHANGEFEED FOR TABLE {} INTO \"{}{}\" WITH {}",
        spec.tables.join(", "),
        EXTERNAL_SCHEME,
        spec.sink,
        options.join(", ")
    )
}

/// Strip the `external://` scheme from a connection URI
pub fn strip_external(uri: &str) -> &str {
    uri.strip_prefix(EXTERNAL_SCHEME).unwrap_or(uri)
}

/// Administrative statements issued against an existing job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStatement<'a> {
    /// `PAUSE JOB <id>`
    Pause(&'a JobId),
    /// `RESUME JOB <id>`
    Resume(&'a JobId),
    /// `CANCEL JOB <id>`
    Cancel(&'a JobId),
    /// `ALTER CHANGEFEED <id> ADD <table>`
    AddTable(&'a JobId, &'a str),
    /// `ALTER CHANGEFEED <id> DROP <table>`
    DropTable(&'a JobId, &'a str),
    /// Sink, topics and description of the job
    Describe(&'a JobId),
    /// Current job status
    Status(&'a JobId),
    /// Job id if the job is running
    RunningCheck(&'a JobId),
}

impl ControlStatement<'_> {
    /// What the statement is meant to achieve, used as error context
    pub fn intent(&self) -> String {
        match self {
            Self::Pause(id) => format!("error pausing changefeed job {}", id),
            Self::Resume(id) => format!("error resuming changefeed job {}", id),
            Self::Cancel(id) => format!("could not cancel job {}", id),
            Self::AddTable(id, table) => {
                format!("error altering changefeed {} to add table {}", id, table)
            }
            Self::DropTable(id, table) => {
                format!("error altering changefeed {} to drop table {}", id, table)
            }
            Self::Describe(id) => format!("can't retrieve details of job {}", id),
            Self::Status(id) => format!("error querying status of job {}", id),
            Self::RunningCheck(id) => format!("error checking whether job {} is running", id),
        }
    }
}

impl fmt::Display for ControlStatement<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pause(id) => write!(f, "PAUSE JOB {}", id),
            Self::Resume(id) => write!(f, "RESUME JOB {}", id),
            Self::Cancel(id) => write!(f, "CANCEL JOB {}", id),
            Self::AddTable(id, table) => write!(f, "ALTER CHANGEFEED {} ADD {}", id, table),
            Self::DropTable(id, table) => write!(f, "ALTER CHANGEFEED {} DROP {}", id, table),
            Self::Describe(id) => write!(
                f,
                "select sink_uri,topics,description from [show changefeed job {}]",
                id
            ),
            Self::Status(id) => write!(f, "SELECT status FROM [SHOW JOB {}]", id),
            Self::RunningCheck(id) => write!(
                f,
                "SELECT job_id FROM [SHOW changefeed JOB {}] where status='running'",
                id
            ),
        }
    }
}

/// Configuration recovered from a job description
///
/// Every field is the raw extracted text and is empty when the option was
/// not found. Decoding never fails.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedConfig {
    /// Schema prefix without the trailing delimiter
    pub schema_prefix: String,
    /// Registry connection name without the `external://` wrapper
    pub registry: String,
    /// Raw `initial_scan` value
    pub initial_scan: String,
    /// Raw `cursor` value
    pub cursor: String,
}

impl DecodedConfig {
    /// Extract the configuration from a job description
    pub fn parse(description: &str) -> Self {
        let prefix = capture(&SCHEMA_PREFIX_REGEX, description);
        Self {
            schema_prefix: prefix
                .strip_suffix(SCHEMA_PREFIX_DELIMITER)
                .unwrap_or(prefix)
                .to_string(),
            registry: capture(&REGISTRY_REGEX, description).to_string(),
            initial_scan: capture(&INITIAL_SCAN_REGEX, description).to_string(),
            cursor: capture(&CURSOR_REGEX, description).to_string(),
        }
    }

    /// Scan mode; anything other than `yes` means `no`
    pub fn initial_scan_mode(&self) -> InitialScan {
        if self.initial_scan == "yes" {
            InitialScan::Yes
        } else {
            InitialScan::No
        }
    }

    /// Cursor, if one was found
    pub fn cursor(&self) -> Option<&str> {
        Some(self.cursor.as_str()).filter(|c| !c.is_empty())
    }

    /// True when nothing could be recovered
    pub fn is_empty(&self) -> bool {
        self.schema_prefix.is_empty()
            && self.registry.is_empty()
            && self.initial_scan.is_empty()
            && self.cursor.is_empty()
    }
}

fn capture<'t>(regex: &Regex, text: &'t str) -> &'t str {
    regex
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or_default()
}
