//! Changefeed lifecycle reconciler
//!
//! [`ChangefeedReconciler`] drives a changefeed job towards a desired
//! [`ChangefeedSpec`]: create, refresh from the database, change the table
//! set through pause → alter → resume, and cancel.
//!
//! The connection is passed into every call; the reconciler holds no
//! database state of its own. The caller owns the [`ChangefeedRecord`] and
//! persists it between calls.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_changefeed::prelude::*;
//!
//! let conn = rivven_changefeed::postgres::connect(&ConnectionConfig::new(url)).await?;
//! let reconciler = ChangefeedReconciler::new(ReconcilerConfig::default());
//!
//! let spec = ChangefeedSpec::new(["orders"], "kafka", "shop", "registry");
//! let mut record = reconciler.create(conn.as_ref(), &spec).await?;
//!
//! let desired = ChangefeedSpec { tables: vec!["orders".into(), "customers".into()], ..spec };
//! reconciler.update(conn.as_ref(), &mut record, &desired).await?;
//! ```

use std::future::Future;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::codec::{encode_create, strip_external, ControlStatement, DecodedConfig};
use crate::config::ReconcilerConfig;
use crate::connection::{Connection, TransactionScope};
use crate::differ::{parse_table_list, TableDiff};
use crate::error::{ChangefeedError, Result};
use crate::metrics::{Operation, ReconcilerMetrics};
use crate::poller::{JobStatusQuery, StatusPoller, StatusSource};
use crate::record::{ChangefeedRecord, DiscardRecords, RecordStore, UpdatePhase};
use crate::spec::{ChangefeedSpec, JobId};

/// Status a job reports once a pause took effect
pub const STATUS_PAUSED: &str = "paused";

/// Status a job reports between the pause statement and the pause
pub const STATUS_PAUSE_REQUESTED: &str = "pause-requested";

/// A field whose observed value differs from the record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDrift {
    /// Field name
    pub field: &'static str,
    /// Value in the record (kept)
    pub local: String,
    /// Value reported by the database
    pub remote: String,
}

/// What a refresh found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadReport {
    /// Tables the job currently streams
    pub observed_tables: Vec<String>,
    /// Changes needed to bring the job to the recorded tables
    pub pending_tables: Option<TableDiff>,
    /// Mismatches in fixed fields
    pub drift: Vec<FieldDrift>,
    /// The record was filled from the database
    pub imported: bool,
}

impl ReadReport {
    /// True when the job matches the record
    pub fn is_clean(&self) -> bool {
        self.pending_tables.is_none() && self.drift.is_empty()
    }
}

/// Result of [`ChangefeedReconciler::read`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The job is running and the record was refreshed
    Refreshed(ReadReport),
    /// The job was gone and has been created again
    Recreated {
        /// Id of the job that was no longer running
        previous: Option<JobId>,
        /// Id of the new job
        id: JobId,
    },
}

/// Result of [`ChangefeedReconciler::update`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Same table set, nothing was sent
    Unchanged,
    /// The job was altered (or an interrupted update was finished)
    Updated {
        /// Tables added and dropped
        diff: TableDiff,
        /// Refresh after the update
        read: ReadOutcome,
    },
}

/// Change required to bring a record to a desired spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// No job yet
    Create,
    /// A fixed field changed; the job must be replaced
    Recreate {
        /// Fields that differ
        fields: Vec<&'static str>,
    },
    /// Only the table set changed
    UpdateTables(TableDiff),
    /// Nothing to do
    Unchanged,
}

/// Result of [`ChangefeedReconciler::apply`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new job was created
    Created(JobId),
    /// The job was replaced
    Recreated {
        /// Cancelled job
        previous: JobId,
        /// Replacement job
        id: JobId,
        /// Fields that forced the replacement
        fields: Vec<&'static str>,
    },
    /// The table set was updated
    Updated(UpdateOutcome),
    /// Nothing was sent
    Unchanged,
}

/// A fixed field that differs between two specs
#[derive(Debug, Clone, PartialEq, Eq)]
struct FixedFieldChange {
    field: &'static str,
    current: String,
    desired: String,
}

/// Fixed-field differences between the record and a desired spec
///
/// An empty sink is unknown and skipped. Options decoded from the job
/// description are skipped when they could not be recovered.
fn fixed_field_changes(record: &ChangefeedRecord, desired: &ChangefeedSpec) -> Vec<FixedFieldChange> {
    let current = &record.spec;
    let mut changes = Vec::new();
    let mut compare = |field: &'static str, current: &str, desired: &str| {
        if current != desired {
            changes.push(FixedFieldChange {
                field,
                current: current.to_string(),
                desired: desired.to_string(),
            });
        }
    };
    if !current.sink.is_empty() {
        compare("sink", &current.sink, &desired.sink);
    }
    if record.options_unknown {
        return changes;
    }
    compare("schema_prefix", &current.schema_prefix, &desired.schema_prefix);
    compare("registry", &current.registry, &desired.registry);
    compare(
        "cursor",
        current.cursor().unwrap_or_default(),
        desired.cursor().unwrap_or_default(),
    );
    compare(
        "initial_scan",
        current.initial_scan.as_str(),
        desired.initial_scan.as_str(),
    );
    changes
}

/// Adopt `remote` into `local` when importing or unknown, else record drift
fn reconcile_field(
    field: &'static str,
    local: &mut String,
    remote: &str,
    adopt: bool,
    drift: &mut Vec<FieldDrift>,
) {
    if remote.is_empty() {
        return;
    }
    if adopt || local.is_empty() {
        *local = remote.to_string();
    } else if local != remote {
        drift.push(FieldDrift {
            field,
            local: local.clone(),
            remote: remote.to_string(),
        });
    }
}

fn is_paused(status: &str) -> bool {
    status.eq_ignore_ascii_case(STATUS_PAUSED) || status.eq_ignore_ascii_case(STATUS_PAUSE_REQUESTED)
}

/// Changefeed lifecycle reconciler
#[derive(Debug, Clone)]
pub struct ChangefeedReconciler {
    config: ReconcilerConfig,
    poller: StatusPoller,
    metrics: ReconcilerMetrics,
}

impl Default for ChangefeedReconciler {
    fn default() -> Self {
        Self::new(ReconcilerConfig::default())
    }
}

impl ChangefeedReconciler {
    /// Create a reconciler
    pub fn new(config: ReconcilerConfig) -> Self {
        let poller = StatusPoller::new(config.poll_interval(), config.wait_timeout());
        Self {
            config,
            poller,
            metrics: ReconcilerMetrics::new(),
        }
    }

    /// Replace the status poller
    pub fn with_poller(mut self, poller: StatusPoller) -> Self {
        self.poller = poller;
        self
    }

    /// Reconciler configuration
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Status poller in use
    pub fn poller(&self) -> &StatusPoller {
        &self.poller
    }

    async fn observe<T>(
        &self,
        operation: Operation,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        self.metrics.operation(operation);
        let result = fut.await;
        if result.is_err() {
            self.metrics.operation_error(operation);
        }
        result
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Create a changefeed job for `spec`
    ///
    /// The spec is validated before anything is sent. Returns a record
    /// holding the new id and the full spec.
    #[instrument(skip_all, fields(tables = ?spec.tables))]
    pub async fn create(
        &self,
        conn: &dyn Connection,
        spec: &ChangefeedSpec,
    ) -> Result<ChangefeedRecord> {
        self.observe(Operation::Create, self.create_job(conn, spec))
            .await
    }

    /// Refresh `record` from the database
    ///
    /// A job that no longer runs is created again from the record. With an
    /// empty table list the record is filled from the database (import);
    /// otherwise the record wins and differences are reported.
    #[instrument(skip_all, fields(job_id = %record.id_str()))]
    pub async fn read(
        &self,
        conn: &dyn Connection,
        record: &mut ChangefeedRecord,
    ) -> Result<ReadOutcome> {
        self.observe(Operation::Read, self.read_job(conn, record))
            .await
    }

    /// Adopt an existing running job
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn import(
        &self,
        conn: &dyn Connection,
        job_id: JobId,
    ) -> Result<(ChangefeedRecord, ReadReport)> {
        self.observe(Operation::Import, self.import_job(conn, job_id))
            .await
    }

    /// Bring the job's table set to `desired.tables`
    ///
    /// Fixed fields must match the record. An unchanged table set sends
    /// nothing. Otherwise the job is paused, altered and resumed, and the
    /// record is refreshed.
    ///
    /// The record is not saved between steps; use
    /// [`update_with_store`](Self::update_with_store) when the process may
    /// stop mid-update.
    pub async fn update(
        &self,
        conn: &dyn Connection,
        record: &mut ChangefeedRecord,
        desired: &ChangefeedSpec,
    ) -> Result<UpdateOutcome> {
        self.update_with_store(conn, record, desired, &DiscardRecords)
            .await
    }

    /// [`update`](Self::update), saving the record to `store` at every step
    #[instrument(skip_all, fields(job_id = %record.id_str(), phase = %record.phase))]
    pub async fn update_with_store(
        &self,
        conn: &dyn Connection,
        record: &mut ChangefeedRecord,
        desired: &ChangefeedSpec,
        store: &dyn RecordStore,
    ) -> Result<UpdateOutcome> {
        self.observe(
            Operation::Update,
            self.update_tables(conn, record, desired, store),
        )
        .await
    }

    /// Work out what [`apply`](Self::apply) would do
    pub fn plan(&self, record: &ChangefeedRecord, desired: &ChangefeedSpec) -> Result<Plan> {
        desired.check()?;
        if record.id.is_none() {
            return Ok(Plan::Create);
        }
        let changes = fixed_field_changes(record, desired);
        if !changes.is_empty() {
            return Ok(Plan::Recreate {
                fields: changes.iter().map(|c| c.field).collect(),
            });
        }
        let diff = TableDiff::compute(&record.spec.tables, &desired.tables);
        if diff.is_empty() && !record.phase.is_in_flight() {
            Ok(Plan::Unchanged)
        } else {
            Ok(Plan::UpdateTables(diff))
        }
    }

    /// Converge `record` to `desired`, replacing the job if a fixed field changed
    pub async fn apply(
        &self,
        conn: &dyn Connection,
        record: &mut ChangefeedRecord,
        desired: &ChangefeedSpec,
    ) -> Result<ApplyOutcome> {
        self.apply_with_store(conn, record, desired, &DiscardRecords)
            .await
    }

    /// [`apply`](Self::apply), saving the record to `store` whenever the job
    /// it points at or its update phase changes
    #[instrument(skip_all, fields(job_id = %record.id_str()))]
    pub async fn apply_with_store(
        &self,
        conn: &dyn Connection,
        record: &mut ChangefeedRecord,
        desired: &ChangefeedSpec,
        store: &dyn RecordStore,
    ) -> Result<ApplyOutcome> {
        self.observe(
            Operation::Apply,
            self.apply_plan(conn, record, desired, store),
        )
        .await
    }

    /// Cancel the job and clear the record's id
    #[instrument(skip_all, fields(job_id = %record.id_str()))]
    pub async fn delete(&self, conn: &dyn Connection, record: &mut ChangefeedRecord) -> Result<()> {
        self.observe(Operation::Delete, self.delete_job(conn, record))
            .await
    }

    /// Whether the job exists and is running
    #[instrument(skip_all, fields(job_id = %job_id))]
    pub async fn exists(&self, conn: &dyn Connection, job_id: &JobId) -> Result<bool> {
        self.observe(Operation::Exists, self.is_running(conn, job_id))
            .await
    }

    /// Wait until the job reports `target`
    pub async fn wait_for_status(
        &self,
        conn: &dyn Connection,
        job_id: &JobId,
        target: &str,
    ) -> Result<String> {
        self.wait(&JobStatusQuery::new(conn), job_id, target).await
    }

    // ------------------------------------------------------------------
    // Create / read
    // ------------------------------------------------------------------

    async fn create_job(
        &self,
        conn: &dyn Connection,
        spec: &ChangefeedSpec,
    ) -> Result<ChangefeedRecord> {
        spec.check()?;
        let sql = encode_create(spec);

        let scope = TransactionScope::begin(conn).await?;
        let outcome = self.create_in(&scope, &sql).await;
        let id = scope.finish(outcome).await?;

        info!(job_id = %id, tables = ?spec.tables, sink = %spec.sink, "changefeed created");
        Ok(ChangefeedRecord::created(id, spec.clone()))
    }

    async fn create_in(&self, scope: &TransactionScope, sql: &str) -> Result<JobId> {
        self.metrics.statement();
        let row = scope
            .query_one(sql)
            .await
            .map_err(|e| e.with_intent("error creating changefeed"))?
            .ok_or_else(|| ChangefeedError::query_with_sql("create returned no job id", sql))?;
        let id = row
            .get(0)
            .ok_or_else(|| ChangefeedError::query_with_sql("create returned a NULL job id", sql))?;
        JobId::new(id)
    }

    async fn read_job(
        &self,
        conn: &dyn Connection,
        record: &mut ChangefeedRecord,
    ) -> Result<ReadOutcome> {
        let live = match &record.id {
            Some(id) => self.is_live(conn, id, record.phase).await?,
            None => false,
        };
        let id = match record.id.clone() {
            Some(id) if live => id,
            previous => {
                warn!(job_id = record.id_str(), "changefeed job is not running, creating it again");
                let created = self.create_job(conn, &record.spec).await?;
                let id = created.id.clone().ok_or_else(|| {
                    ChangefeedError::not_found("created changefeed has no job id")
                })?;
                *record = created;
                return Ok(ReadOutcome::Recreated { previous, id });
            }
        };

        let report = self.refresh(conn, &id, record).await?;
        if report.is_clean() {
            debug!(tables = ?record.spec.tables, "changefeed matches record");
        }
        Ok(ReadOutcome::Refreshed(report))
    }

    /// Running, or paused by an update that has not finished
    async fn is_live(&self, conn: &dyn Connection, id: &JobId, phase: UpdatePhase) -> Result<bool> {
        if self.is_running(conn, id).await? {
            return Ok(true);
        }
        if !phase.is_in_flight() {
            return Ok(false);
        }
        match JobStatusQuery::new(conn).job_status(id).await {
            Ok(status) => Ok(is_paused(&status)),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_running(&self, conn: &dyn Connection, id: &JobId) -> Result<bool> {
        let statement = ControlStatement::RunningCheck(id);
        self.metrics.statement();
        let row = conn
            .query_one(&statement.to_string())
            .await
            .map_err(|e| e.with_intent(statement.intent()))?;
        Ok(match row {
            Some(row) => row.get(0).map(str::trim) == Some(id.as_str()),
            None => false,
        })
    }

    async fn describe(
        &self,
        conn: &dyn Connection,
        id: &JobId,
    ) -> Result<(String, Vec<String>, DecodedConfig)> {
        let statement = ControlStatement::Describe(id);
        self.metrics.statement();
        let row = conn
            .query_one(&statement.to_string())
            .await
            .map_err(|e| e.with_intent(statement.intent()))?
            .ok_or_else(|| ChangefeedError::not_found(id.as_str()))?;

        let sink = strip_external(row.get(0).unwrap_or_default()).to_string();
        let tables = parse_table_list(row.get(1).unwrap_or_default());
        let decoded = DecodedConfig::parse(row.get(2).unwrap_or_default());
        if decoded.is_empty() {
            warn!(job_id = %id, "no options could be recovered from the job description");
        }
        Ok((sink, tables, decoded))
    }

    async fn refresh(
        &self,
        conn: &dyn Connection,
        id: &JobId,
        record: &mut ChangefeedRecord,
    ) -> Result<ReadReport> {
        let (sink, observed_tables, decoded) = self.describe(conn, id).await?;
        let import = record.spec.tables.is_empty();
        let recovered = !decoded.is_empty();
        // options come from the description only; adopt them while unknown
        let adopt = import || (record.options_unknown && recovered);
        if adopt {
            record.options_unknown = !recovered;
        }
        let spec = &mut record.spec;
        let mut report = ReadReport {
            observed_tables: observed_tables.clone(),
            imported: import,
            ..Default::default()
        };

        if import {
            spec.tables = observed_tables;
        } else {
            let diff = TableDiff::compute(&observed_tables, &spec.tables);
            if !diff.is_empty() {
                warn!(
                    job_id = %id,
                    to_add = ?diff.to_add,
                    to_remove = ?diff.to_remove,
                    "changefeed tables differ from record"
                );
                report.pending_tables = Some(diff);
            }
        }

        reconcile_field("sink", &mut spec.sink, &sink, import, &mut report.drift);
        reconcile_field(
            "schema_prefix",
            &mut spec.schema_prefix,
            &decoded.schema_prefix,
            adopt,
            &mut report.drift,
        );
        reconcile_field(
            "registry",
            &mut spec.registry,
            &decoded.registry,
            adopt,
            &mut report.drift,
        );

        if !decoded.initial_scan.is_empty() {
            let remote = decoded.initial_scan_mode();
            if adopt {
                spec.initial_scan = remote;
            } else if remote != spec.initial_scan {
                report.drift.push(FieldDrift {
                    field: "initial_scan",
                    local: spec.initial_scan.to_string(),
                    remote: remote.to_string(),
                });
            }
        }

        if let Some(remote) = decoded.cursor() {
            let local = spec.cursor().unwrap_or_default().to_string();
            if adopt {
                spec.cursor = Some(remote.to_string());
            } else if local != remote {
                report.drift.push(FieldDrift {
                    field: "cursor",
                    local,
                    remote: remote.to_string(),
                });
            }
        }

        for drift in &report.drift {
            warn!(
                job_id = %id,
                field = drift.field,
                local = %drift.local,
                remote = %drift.remote,
                "changefeed option differs from record, keeping local value"
            );
        }
        Ok(report)
    }

    async fn import_job(
        &self,
        conn: &dyn Connection,
        job_id: JobId,
    ) -> Result<(ChangefeedRecord, ReadReport)> {
        if !self.is_running(conn, &job_id).await? {
            return Err(ChangefeedError::not_found(format!(
                "changefeed job {} is not running",
                job_id
            )));
        }
        let mut record = ChangefeedRecord::imported(job_id.clone());
        let report = self.refresh(conn, &job_id, &mut record).await?;
        if let Err(e) = record.spec.check() {
            warn!(error = %e, "imported changefeed is missing options");
        }
        info!(tables = ?record.spec.tables, "changefeed imported");
        Ok((record, report))
    }

    // ------------------------------------------------------------------
    // Update saga
    // ------------------------------------------------------------------

    async fn update_tables(
        &self,
        conn: &dyn Connection,
        record: &mut ChangefeedRecord,
        desired: &ChangefeedSpec,
        store: &dyn RecordStore,
    ) -> Result<UpdateOutcome> {
        desired.check()?;
        let id = record
            .id
            .clone()
            .ok_or_else(|| ChangefeedError::not_found("changefeed has no job id"))?;

        if let Some(change) = fixed_field_changes(record, desired).into_iter().next() {
            return Err(ChangefeedError::ImmutableField {
                field: change.field,
                current: change.current,
                desired: change.desired,
            });
        }

        let recovering = record.phase.is_in_flight();
        let current = if recovering {
            warn!(phase = %record.phase, "finishing interrupted table update");
            self.describe(conn, &id).await?.1
        } else {
            record.spec.tables.clone()
        };

        let diff = TableDiff::compute(&current, &desired.tables);
        if diff.is_empty() && !recovering {
            record.spec.tables = desired.tables.clone();
            debug!("table set unchanged");
            return Ok(UpdateOutcome::Unchanged);
        }

        let observed = if recovering {
            Some(JobStatusQuery::new(conn).job_status(&id).await?)
        } else {
            None
        };
        let already_paused = observed.as_deref().is_some_and(is_paused);

        if diff.is_empty() {
            // interrupted after the pause, nothing left to alter
            if already_paused {
                self.checkpoint(store, record, UpdatePhase::Resuming).await?;
                if !observed
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case(STATUS_PAUSED))
                {
                    self.wait(&JobStatusQuery::new(conn), &id, STATUS_PAUSED)
                        .await?;
                }
                self.in_transaction(conn, &[ControlStatement::Resume(&id)])
                    .await?;
            }
        } else {
            self.checkpoint(store, record, UpdatePhase::TablesChanged)
                .await?;
            if !already_paused {
                self.in_transaction(conn, &[ControlStatement::Pause(&id)])
                    .await?;
            }
            self.wait(&JobStatusQuery::new(conn), &id, STATUS_PAUSED)
                .await?;
            self.checkpoint(store, record, UpdatePhase::Paused).await?;
            info!(to_add = ?diff.to_add, to_remove = ?diff.to_remove, "changefeed paused, altering tables");

            self.checkpoint(store, record, UpdatePhase::Altering).await?;
            let altered = {
                let statements: Vec<ControlStatement<'_>> = diff
                    .to_add
                    .iter()
                    .map(|t| ControlStatement::AddTable(&id, t))
                    .chain(
                        diff.to_remove
                            .iter()
                            .map(|t| ControlStatement::DropTable(&id, t)),
                    )
                    .chain(std::iter::once(ControlStatement::Resume(&id)))
                    .collect();
                self.in_transaction(conn, &statements).await
            };
            if let Err(source) = altered {
                let err = self.compensate(conn, record, &id, source).await;
                if let Err(e) = store.save(record).await {
                    error!(error = %e, phase = %record.phase, "failed to save changefeed record");
                }
                return Err(err);
            }
        }

        record.spec.tables = desired.tables.clone();
        self.checkpoint(store, record, UpdatePhase::Done).await?;
        info!(tables = ?record.spec.tables, "changefeed tables updated");

        let read = self.read_job(conn, record).await?;
        Ok(UpdateOutcome::Updated { diff, read })
    }

    /// Move the record to `phase` and save it
    async fn checkpoint(
        &self,
        store: &dyn RecordStore,
        record: &mut ChangefeedRecord,
        phase: UpdatePhase,
    ) -> Result<()> {
        record.phase = phase;
        debug!(%phase, "update phase");
        store.save(record).await
    }

    /// Resume after a failed alter so the job keeps streaming its old tables
    async fn compensate(
        &self,
        conn: &dyn Connection,
        record: &mut ChangefeedRecord,
        id: &JobId,
        source: ChangefeedError,
    ) -> ChangefeedError {
        let resumed = if self.config.resume_on_failure {
            warn!(error = %source, "altering changefeed failed, resuming with previous tables");
            match self
                .in_transaction(conn, &[ControlStatement::Resume(id)])
                .await
            {
                Ok(()) => {
                    record.phase = UpdatePhase::Done;
                    true
                }
                Err(e) => {
                    error!(error = %e, "compensating resume failed, job left paused");
                    false
                }
            }
        } else {
            warn!(error = %source, "altering changefeed failed, job left paused");
            false
        };

        ChangefeedError::UpdateAborted {
            job_id: id.to_string(),
            phase: UpdatePhase::Altering,
            resumed,
            source: Box::new(source),
        }
    }

    async fn wait(&self, source: &dyn StatusSource, id: &JobId, target: &str) -> Result<String> {
        let start = Instant::now();
        let result = self.poller.wait_for_status(source, id, target).await;
        self.metrics.record_wait(start.elapsed());
        result
    }

    /// Run `statements` in one transaction
    async fn in_transaction(
        &self,
        conn: &dyn Connection,
        statements: &[ControlStatement<'_>],
    ) -> Result<()> {
        let scope = TransactionScope::begin(conn).await?;
        let outcome = self.run_all(&scope, statements).await;
        scope.finish(outcome).await
    }

    async fn run_all(
        &self,
        scope: &TransactionScope,
        statements: &[ControlStatement<'_>],
    ) -> Result<()> {
        for statement in statements {
            self.metrics.statement();
            scope
                .execute(&statement.to_string())
                .await
                .map_err(|e| e.with_intent(statement.intent()))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Apply / delete
    // ------------------------------------------------------------------

    async fn apply_plan(
        &self,
        conn: &dyn Connection,
        record: &mut ChangefeedRecord,
        desired: &ChangefeedSpec,
        store: &dyn RecordStore,
    ) -> Result<ApplyOutcome> {
        match self.plan(record, desired)? {
            Plan::Create => {
                let created = self.create_job(conn, desired).await?;
                let id = created
                    .id
                    .clone()
                    .ok_or_else(|| ChangefeedError::not_found("created changefeed has no job id"))?;
                *record = created;
                store.save(record).await?;
                Ok(ApplyOutcome::Created(id))
            }
            Plan::Recreate { fields } => {
                let previous = record
                    .id
                    .clone()
                    .ok_or_else(|| ChangefeedError::not_found("changefeed has no job id"))?;
                info!(?fields, "fixed option changed, replacing changefeed");
                let created = self.create_job(conn, desired).await?;
                let id = created
                    .id
                    .clone()
                    .ok_or_else(|| ChangefeedError::not_found("created changefeed has no job id"))?;
                *record = created;
                store.save(record).await?;
                self.in_transaction(conn, &[ControlStatement::Cancel(&previous)])
                    .await?;
                Ok(ApplyOutcome::Recreated {
                    previous,
                    id,
                    fields,
                })
            }
            Plan::UpdateTables(_) => Ok(ApplyOutcome::Updated(
                self.update_tables(conn, record, desired, store).await?,
            )),
            Plan::Unchanged => {
                record.spec.tables = desired.tables.clone();
                Ok(ApplyOutcome::Unchanged)
            }
        }
    }

    async fn delete_job(&self, conn: &dyn Connection, record: &mut ChangefeedRecord) -> Result<()> {
        let Some(id) = record.id.clone() else {
            debug!("changefeed has no job id, nothing to cancel");
            return Ok(());
        };
        self.in_transaction(conn, &[ControlStatement::Cancel(&id)])
            .await?;
        record.id = None;
        record.phase = UpdatePhase::Done;
        info!(job_id = %id, "changefeed cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::InitialScan;

    fn spec() -> ChangefeedSpec {
        ChangefeedSpec::new(["t1", "t2"], "kafka", "shop", "registry")
    }

    #[test]
    fn test_fixed_field_changes() {
        let current = ChangefeedRecord::created(JobId::from(7), spec());
        assert!(fixed_field_changes(&current, &spec()).is_empty());

        let mut desired = spec();
        desired.tables = vec!["t9".into()];
        assert!(fixed_field_changes(&current, &desired).is_empty());

        desired.sink = "other".into();
        desired.initial_scan = InitialScan::Yes;
        let fields: Vec<_> = fixed_field_changes(&current, &desired)
            .into_iter()
            .map(|c| c.field)
            .collect();
        assert_eq!(fields, vec!["sink", "initial_scan"]);
    }

    #[test]
    fn test_adding_or_removing_cursor_is_a_change() {
        let without = ChangefeedRecord::created(JobId::from(7), spec());
        let changes = fixed_field_changes(&without, &spec().with_cursor("2024-01-01 00:00:00"));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].field, "cursor");
        assert_eq!(changes[0].current, "");
        assert_eq!(changes[0].desired, "2024-01-01 00:00:00");

        let with = ChangefeedRecord::created(
            JobId::from(7),
            spec().with_cursor("2024-01-01 00:00:00"),
        );
        let fields: Vec<_> = fixed_field_changes(&with, &spec())
            .into_iter()
            .map(|c| c.field)
            .collect();
        assert_eq!(fields, vec!["cursor"]);
    }

    #[test]
    fn test_unrecovered_options_are_not_changes() {
        let mut record = ChangefeedRecord::imported(JobId::from(7));
        record.spec.tables = vec!["t1".into()];
        record.spec.sink = "kafka".into();
        record.options_unknown = true;

        let desired = spec()
            .with_cursor("2024-01-01 00:00:00")
            .with_initial_scan(InitialScan::Yes);
        assert!(fixed_field_changes(&record, &desired).is_empty());

        let mut moved = desired.clone();
        moved.sink = "kafka-west".into();
        let fields: Vec<_> = fixed_field_changes(&record, &moved)
            .into_iter()
            .map(|c| c.field)
            .collect();
        assert_eq!(fields, vec!["sink"]);
    }

    #[test]
    fn test_reconcile_field() {
        let mut drift = Vec::new();
        let mut local = String::from("a");
        reconcile_field("sink", &mut local, "b", false, &mut drift);
        assert_eq!(local, "a");
        assert_eq!(drift[0].remote, "b");

        let mut empty = String::new();
        reconcile_field("sink", &mut empty, "b", false, &mut drift);
        assert_eq!(empty, "b");

        reconcile_field("sink", &mut local, "", false, &mut drift);
        assert_eq!(drift.len(), 1);
    }

    #[test]
    fn test_plan() {
        let reconciler = ChangefeedReconciler::default();
        let pending = ChangefeedRecord::pending(spec());
        assert_eq!(reconciler.plan(&pending, &spec()).unwrap(), Plan::Create);

        let record = ChangefeedRecord::created(JobId::from(7), spec());
        assert_eq!(reconciler.plan(&record, &spec()).unwrap(), Plan::Unchanged);

        let reordered = ChangefeedSpec::new(["t2", "t1"], "kafka", "shop", "registry");
        assert_eq!(reconciler.plan(&record, &reordered).unwrap(), Plan::Unchanged);

        let grown = ChangefeedSpec::new(["t1", "t2", "t3"], "kafka", "shop", "registry");
        match reconciler.plan(&record, &grown).unwrap() {
            Plan::UpdateTables(diff) => assert_eq!(diff.to_add, vec!["t3"]),
            other => panic!("unexpected plan {other:?}"),
        }

        let moved = ChangefeedSpec::new(["t1"], "kafka", "shop2", "registry");
        assert_eq!(
            reconciler.plan(&record, &moved).unwrap(),
            Plan::Recreate {
                fields: vec!["schema_prefix"]
            }
        );
    }

    #[test]
    fn test_plan_rejects_invalid_spec() {
        let reconciler = ChangefeedReconciler::default();
        let record = ChangefeedRecord::created(JobId::from(7), spec());
        let bad = spec().with_cursor("2023/01/01");
        assert!(matches!(
            reconciler.plan(&record, &bad),
            Err(ChangefeedError::Validation(_))
        ));
    }

    #[test]
    fn test_paused_statuses() {
        assert!(is_paused("PAUSED"));
        assert!(is_paused("pause-requested"));
        assert!(!is_paused("running"));
    }
}
