use anyhow::{anyhow, Context, Result};
use orgscope_core::{
    external_key, stage_rows, CanonicalRecord, CanonicalRecordId, CommitSummary, ImportFilter,
    ImportJob, ImportJobId, ImportJobStatus, ImportJobType, ImportedRecord, ImportedRecordId,
    ImportedRecordStatus, MappingContent, MappingId, MappingStatus, MappingVersion,
    OrgAccessContext, OrgError, OrgScope, Row, RowFailure, UserId,
};
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Transaction,
    TransactionBehavior,
};
use serde::{Deserialize, Serialize};

use crate::mappings::load_mapping;
use crate::{
    now_rfc3339, parse_optional_rfc3339, parse_rfc3339, scope_columns, sha256_digest, stored,
    stored_scope, stored_user, ScopeColumns, ScopedWhere, SqliteStore,
};

/// Everything needed to open an import job over a batch of source rows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRequest {
    pub mapping_id: MappingId,
    pub job_type: ImportJobType,
    pub scope: OrgScope,
    pub uploaded_by: UserId,
    #[serde(default)]
    pub source_name: Option<String>,
    pub rows: Vec<Row>,
    #[serde(default)]
    pub filter: Option<ImportFilter>,
}

const JOB_COLUMNS: &str = "job_id, mapping_id, job_type, status, company_id, business_unit_id, \
                           location_id, uploaded_by, source_name, source_digest, filter_json, \
                           records_total, records_processed, records_failed, error, created_at, \
                           started_at, completed_at";

const RECORD_COLUMNS: &str = "record_id, job_id, row_index, source_json, target_json, source_hash, \
                              status, validation_errors_json, error, canonical_record_id, updated_at";

const CANONICAL_COLUMNS: &str = "canonical_record_id, entity_type, external_key, company_id, \
                                 business_unit_id, location_id, data_json, source_job_id, \
                                 source_record_id, created_by, created_at";

struct JobRow {
    job_id: String,
    mapping_id: String,
    job_type: String,
    status: String,
    company_id: Option<String>,
    business_unit_id: Option<String>,
    location_id: Option<String>,
    uploaded_by: String,
    source_name: Option<String>,
    source_digest: String,
    filter_json: Option<String>,
    records_total: i64,
    records_processed: i64,
    records_failed: i64,
    error: Option<String>,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

fn job_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobRow> {
    Ok(JobRow {
        job_id: row.get(0)?,
        mapping_id: row.get(1)?,
        job_type: row.get(2)?,
        status: row.get(3)?,
        company_id: row.get(4)?,
        business_unit_id: row.get(5)?,
        location_id: row.get(6)?,
        uploaded_by: row.get(7)?,
        source_name: row.get(8)?,
        source_digest: row.get(9)?,
        filter_json: row.get(10)?,
        records_total: row.get(11)?,
        records_processed: row.get(12)?,
        records_failed: row.get(13)?,
        error: row.get(14)?,
        created_at: row.get(15)?,
        started_at: row.get(16)?,
        completed_at: row.get(17)?,
    })
}

impl JobRow {
    fn into_job(self) -> Result<ImportJob> {
        Ok(ImportJob {
            job_id: stored(ImportJobId::parse(&self.job_id))?,
            mapping_id: stored(MappingId::parse(&self.mapping_id))?,
            job_type: ImportJobType::parse(&self.job_type)
                .ok_or_else(|| anyhow!("unknown stored job type: {}", self.job_type))?,
            status: ImportJobStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("unknown stored job status: {}", self.status))?,
            scope: stored_scope(
                self.company_id.as_deref(),
                self.business_unit_id.as_deref(),
                self.location_id.as_deref(),
            )?,
            uploaded_by: stored_user(&self.uploaded_by)?,
            source_name: self.source_name,
            source_digest: self.source_digest,
            filter: self
                .filter_json
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .with_context(|| format!("invalid stored filter for job {}", self.job_id))?,
            records_total: u64::try_from(self.records_total).context("negative records_total")?,
            records_processed: u64::try_from(self.records_processed)
                .context("negative records_processed")?,
            records_failed: u64::try_from(self.records_failed).context("negative records_failed")?,
            error: self.error,
            created_at: parse_rfc3339(&self.created_at)?,
            started_at: parse_optional_rfc3339(self.started_at.as_deref())?,
            completed_at: parse_optional_rfc3339(self.completed_at.as_deref())?,
        })
    }
}

struct RecordRow {
    record_id: String,
    job_id: String,
    row_index: i64,
    source_json: String,
    target_json: String,
    source_hash: String,
    status: String,
    validation_errors_json: String,
    error: Option<String>,
    canonical_record_id: Option<String>,
    updated_at: String,
}

fn record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        record_id: row.get(0)?,
        job_id: row.get(1)?,
        row_index: row.get(2)?,
        source_json: row.get(3)?,
        target_json: row.get(4)?,
        source_hash: row.get(5)?,
        status: row.get(6)?,
        validation_errors_json: row.get(7)?,
        error: row.get(8)?,
        canonical_record_id: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

impl RecordRow {
    fn into_record(self) -> Result<ImportedRecord> {
        Ok(ImportedRecord {
            record_id: stored(ImportedRecordId::parse(&self.record_id))?,
            job_id: stored(ImportJobId::parse(&self.job_id))?,
            row_index: u64::try_from(self.row_index).context("negative row_index")?,
            source_record: serde_json::from_str(&self.source_json)
                .with_context(|| format!("invalid stored source row {}", self.record_id))?,
            target_record: serde_json::from_str(&self.target_json)
                .with_context(|| format!("invalid stored target row {}", self.record_id))?,
            source_hash: self.source_hash,
            status: ImportedRecordStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("unknown stored record status: {}", self.status))?,
            validation_errors: serde_json::from_str(&self.validation_errors_json)
                .with_context(|| format!("invalid stored validation errors {}", self.record_id))?,
            error: self.error,
            canonical_record_id: self
                .canonical_record_id
                .as_deref()
                .map(|raw| stored(CanonicalRecordId::parse(raw)))
                .transpose()?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

struct CanonicalRow {
    canonical_record_id: String,
    entity_type: String,
    external_key: Option<String>,
    company_id: Option<String>,
    business_unit_id: Option<String>,
    location_id: Option<String>,
    data_json: String,
    source_job_id: String,
    source_record_id: String,
    created_by: String,
    created_at: String,
}

fn canonical_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CanonicalRow> {
    Ok(CanonicalRow {
        canonical_record_id: row.get(0)?,
        entity_type: row.get(1)?,
        external_key: row.get(2)?,
        company_id: row.get(3)?,
        business_unit_id: row.get(4)?,
        location_id: row.get(5)?,
        data_json: row.get(6)?,
        source_job_id: row.get(7)?,
        source_record_id: row.get(8)?,
        created_by: row.get(9)?,
        created_at: row.get(10)?,
    })
}

impl CanonicalRow {
    fn into_canonical(self) -> Result<CanonicalRecord> {
        Ok(CanonicalRecord {
            canonical_record_id: stored(CanonicalRecordId::parse(&self.canonical_record_id))?,
            entity_type: self.entity_type,
            external_key: self.external_key,
            scope: stored_scope(
                self.company_id.as_deref(),
                self.business_unit_id.as_deref(),
                self.location_id.as_deref(),
            )?,
            data: serde_json::from_str(&self.data_json).with_context(|| {
                format!("invalid stored canonical data {}", self.canonical_record_id)
            })?,
            source_job_id: stored(ImportJobId::parse(&self.source_job_id))?,
            source_record_id: stored(ImportedRecordId::parse(&self.source_record_id))?,
            created_by: stored_user(&self.created_by)?,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}

fn load_job(conn: &Connection, job_id: ImportJobId) -> Result<Option<ImportJob>> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM import_jobs WHERE job_id = ?1"),
        params![job_id.to_string()],
        job_row,
    )
    .optional()
    .with_context(|| format!("failed to load import job {job_id}"))?
    .map(JobRow::into_job)
    .transpose()
}

fn require_job(conn: &Connection, job_id: ImportJobId) -> Result<ImportJob> {
    load_job(conn, job_id)?
        .ok_or_else(|| OrgError::NotFound(format!("import job {job_id}")).into())
}

fn load_records(
    conn: &Connection,
    job_id: ImportJobId,
    status: Option<ImportedRecordStatus>,
) -> Result<Vec<ImportedRecord>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {RECORD_COLUMNS} FROM imported_records
             WHERE job_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY row_index ASC"
        ))
        .context("failed to prepare imported record listing")?;
    let rows = stmt.query_map(
        params![job_id.to_string(), status.map(ImportedRecordStatus::as_str)],
        record_row,
    )?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?.into_record()?);
    }
    Ok(records)
}

fn sql_int<T>(value: T) -> Result<i64>
where
    i64: TryFrom<T>,
{
    i64::try_from(value).map_err(|_| anyhow!("integer out of range for sqlite"))
}

/// Recompute a job's counters from its records and return how many remain failed.
fn refresh_counters(conn: &Connection, job_id: ImportJobId) -> Result<usize> {
    let (total, processed, failed) = conn
        .query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status IN ('committed', 'failed') THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
             FROM imported_records WHERE job_id = ?1",
            params![job_id.to_string()],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
        )
        .with_context(|| format!("failed to count records for job {job_id}"))?;
    conn.execute(
        "UPDATE import_jobs SET records_total = ?1, records_processed = ?2, records_failed = ?3
         WHERE job_id = ?4",
        params![total, processed, failed, job_id.to_string()],
    )
    .with_context(|| format!("failed to update counters for job {job_id}"))?;
    usize::try_from(failed).context("negative failed count")
}

fn ensure_usable(mapping: &MappingVersion, job_type: ImportJobType) -> Result<(), OrgError> {
    match (mapping.status, job_type) {
        (MappingStatus::Deprecated, _) => Err(OrgError::Validation(format!(
            "mapping version {} is deprecated and cannot be used for imports",
            mapping.version
        ))),
        (MappingStatus::Draft, ImportJobType::Import) => Err(OrgError::Validation(
            "import jobs require an approved mapping; use a dry run for drafts".to_string(),
        )),
        _ => Ok(()),
    }
}

fn materialize_error(err: &rusqlite::Error, content: &MappingContent, key: Option<&str>) -> String {
    match (err.sqlite_error_code(), key) {
        (Some(ErrorCode::ConstraintViolation), Some(key)) => {
            format!("{} record with key `{key}` already exists", content.entity_type)
        }
        _ => format!("failed to materialize canonical record: {err}"),
    }
}

/// Turn one staged record into a canonical record inside its own savepoint.
///
/// The outer `Err` aborts the whole commit; the inner one is a row failure.
fn materialize(
    tx: &mut Transaction<'_>,
    job: &ImportJob,
    content: &MappingContent,
    record: &ImportedRecord,
    now: &str,
) -> Result<Result<CanonicalRecordId, RowFailure>> {
    let failure = |message: String| RowFailure {
        record_id: record.record_id,
        row_index: record.row_index,
        message,
    };
    if !record.validation_errors.is_empty() {
        let message = format!("validation failed: {}", record.validation_errors.join("; "));
        return Ok(Err(failure(message)));
    }
    let key = match external_key(content, &record.target_record) {
        Ok(key) => key,
        Err(message) => return Ok(Err(failure(message))),
    };

    let data_json =
        serde_json::to_string(&record.target_record).context("failed to encode canonical data")?;
    let (company_id, business_unit_id, location_id) = scope_columns(&job.scope);
    let canonical_record_id = CanonicalRecordId::new();

    let savepoint = tx.savepoint().context("failed to open row savepoint")?;
    let inserted = savepoint.execute(
        &format!(
            "INSERT INTO canonical_records({CANONICAL_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ),
        params![
            canonical_record_id.to_string(),
            content.entity_type,
            key,
            company_id,
            business_unit_id,
            location_id,
            data_json,
            job.job_id.to_string(),
            record.record_id.to_string(),
            job.uploaded_by.as_str(),
            now,
        ],
    );
    if let Err(err) = inserted {
        drop(savepoint);
        return Ok(Err(failure(materialize_error(&err, content, key.as_deref()))));
    }

    savepoint
        .execute(
            "UPDATE imported_records
             SET status = 'committed', canonical_record_id = ?1, error = NULL, updated_at = ?2
             WHERE record_id = ?3",
            params![canonical_record_id.to_string(), now, record.record_id.to_string()],
        )
        .with_context(|| format!("failed to mark record {} committed", record.record_id))?;
    savepoint.commit().context("failed to release row savepoint")?;
    Ok(Ok(canonical_record_id))
}

impl SqliteStore {
    /// Create a job, transform every admitted row, and persist the results as staged
    /// records. Import jobs are committed straight away.
    ///
    /// A structural failure while staging is recorded on the job, which ends up
    /// `failed` with no staged rows; the job is still returned.
    ///
    /// # Errors
    /// Returns [`OrgError::NotFound`] for an unknown mapping and
    /// [`OrgError::Validation`] when the mapping status, filter, or scope is unusable.
    pub fn stage_import(&mut self, request: &StageRequest) -> Result<ImportJob> {
        let mapping = load_mapping(&self.conn, request.mapping_id)?.ok_or_else(|| {
            OrgError::NotFound(format!("mapping version {}", request.mapping_id))
        })?;
        ensure_usable(&mapping, request.job_type)?;
        mapping.content.validate()?;
        if let Some(filter) = &request.filter {
            filter.validate()?;
        }
        self.validate_scope(&request.scope)?;

        let job_id = self.open_job(request)?;
        match self.stage_records(job_id, request) {
            Ok(staged) => {
                tracing::info!(job_id = %job_id, mapping_id = %request.mapping_id, staged, "staged import rows");
            }
            Err(err) => {
                let message = format!("{err:#}");
                tracing::warn!(job_id = %job_id, error = %message, "import staging failed");
                self.conn
                    .execute(
                        "UPDATE import_jobs SET status = 'failed', error = ?1, completed_at = ?2
                         WHERE job_id = ?3",
                        params![message, now_rfc3339()?, job_id.to_string()],
                    )
                    .with_context(|| format!("failed to mark import job {job_id} failed"))?;
                return require_job(&self.conn, job_id);
            }
        }

        if request.job_type == ImportJobType::Import {
            self.commit_import(job_id)?;
        }
        require_job(&self.conn, job_id)
    }

    /// Insert the job row and move it to `processing`.
    fn open_job(&mut self, request: &StageRequest) -> Result<ImportJobId> {
        let job_id = ImportJobId::new();
        let source_digest = sha256_digest(
            &serde_json::to_vec(&request.rows).context("failed to encode source rows")?,
        );
        let filter_json = request
            .filter
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("failed to encode import filter")?;
        let (company_id, business_unit_id, location_id) = scope_columns(&request.scope);
        let created_at = now_rfc3339()?;
        self.conn
            .execute(
                &format!(
                    "INSERT INTO import_jobs({JOB_COLUMNS})
                     VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, 0, 0, NULL, ?11, NULL, NULL)"
                ),
                params![
                    job_id.to_string(),
                    request.mapping_id.to_string(),
                    request.job_type.as_str(),
                    company_id,
                    business_unit_id,
                    location_id,
                    request.uploaded_by.as_str(),
                    request.source_name,
                    source_digest,
                    filter_json,
                    created_at,
                ],
            )
            .context("failed to insert import job")?;
        self.conn
            .execute(
                "UPDATE import_jobs SET status = 'processing', started_at = ?1 WHERE job_id = ?2",
                params![now_rfc3339()?, job_id.to_string()],
            )
            .with_context(|| format!("failed to start import job {job_id}"))?;
        Ok(job_id)
    }

    /// Transform the admitted rows and write them as staged records. The mapping is
    /// re-read under the write lock so a concurrent deprecation cannot slip in.
    fn stage_records(&mut self, job_id: ImportJobId, request: &StageRequest) -> Result<usize> {
        let now = now_rfc3339()?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin staging transaction")?;
        let mapping = load_mapping(&tx, request.mapping_id)?.ok_or_else(|| {
            OrgError::NotFound(format!("mapping version {}", request.mapping_id))
        })?;
        ensure_usable(&mapping, request.job_type)?;
        let staged = stage_rows(&mapping.content, request.filter.as_ref(), &request.rows)?;
        {
            let mut insert = tx
                .prepare_cached(&format!(
                    "INSERT INTO imported_records({RECORD_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'staged', ?7, NULL, NULL, ?8)"
                ))
                .context("failed to prepare staged record insert")?;
            for row in &staged {
                let source_json = serde_json::to_string(&row.source_record)
                    .context("failed to encode source row")?;
                let target_json = serde_json::to_string(&row.target_record)
                    .context("failed to encode target row")?;
                let errors_json = serde_json::to_string(&row.validation_errors)
                    .context("failed to encode validation errors")?;
                insert
                    .execute(params![
                        ImportedRecordId::new().to_string(),
                        job_id.to_string(),
                        sql_int(row.row_index)?,
                        source_json,
                        target_json,
                        sha256_digest(source_json.as_bytes()),
                        errors_json,
                        now,
                    ])
                    .with_context(|| format!("failed to stage row {}", row.row_index))?;
            }
        }
        tx.execute(
            "UPDATE import_jobs
             SET status = 'pending_commit', records_total = ?1, records_processed = 0, records_failed = 0
             WHERE job_id = ?2",
            params![sql_int(staged.len())?, job_id.to_string()],
        )
        .with_context(|| format!("failed to finish staging job {job_id}"))?;
        tx.commit().context("failed to commit staging transaction")?;
        Ok(staged.len())
    }

    /// Materialize every staged record of `job_id`, one savepoint per row, and settle
    /// the job status from what remains failed.
    ///
    /// # Errors
    /// Returns [`OrgError::NotFound`] for an unknown job and [`OrgError::Validation`]
    /// when the job is not awaiting commit.
    pub fn commit_import(&mut self, job_id: ImportJobId) -> Result<CommitSummary> {
        let mut tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin commit transaction")?;
        let job = require_job(&tx, job_id)?;
        if !job.status.accepts_commit() {
            return Err(OrgError::Validation(format!(
                "import job {job_id} is {} and cannot be committed",
                job.status.as_str()
            ))
            .into());
        }
        let mapping = load_mapping(&tx, job.mapping_id)?
            .ok_or_else(|| anyhow!("mapping version {} of job {job_id} is missing", job.mapping_id))?;
        let candidates = load_records(&tx, job_id, Some(ImportedRecordStatus::Staged))?;
        let now = now_rfc3339()?;

        let mut outcomes = Vec::with_capacity(candidates.len());
        for record in &candidates {
            let outcome = materialize(&mut tx, &job, &mapping.content, record, &now)?;
            if let Err(failure) = &outcome {
                tx.execute(
                    "UPDATE imported_records SET status = 'failed', error = ?1, updated_at = ?2
                     WHERE record_id = ?3",
                    params![failure.message, now, failure.record_id.to_string()],
                )
                .with_context(|| format!("failed to mark record {} failed", failure.record_id))?;
                tracing::warn!(
                    job_id = %job_id,
                    row_index = failure.row_index,
                    error = %failure.message,
                    "import row failed"
                );
            }
            outcomes.push(outcome);
        }

        let summary = CommitSummary::from_outcomes(&outcomes);
        let remaining_failed = refresh_counters(&tx, job_id)?;
        let status = ImportJobStatus::after_commit(remaining_failed);
        tx.execute(
            "UPDATE import_jobs SET status = ?1, error = NULL, completed_at = ?2 WHERE job_id = ?3",
            params![status.as_str(), now, job_id.to_string()],
        )
        .with_context(|| format!("failed to settle import job {job_id}"))?;
        tx.commit().context("failed to commit import transaction")?;

        tracing::info!(
            job_id = %job_id,
            committed = summary.committed,
            failed = summary.failed,
            status = status.as_str(),
            "committed import job"
        );
        Ok(summary)
    }

    /// Discard every still-staged record and cancel the job. Committed and failed rows
    /// are left as they are.
    ///
    /// # Errors
    /// Returns [`OrgError::NotFound`] for an unknown job and [`OrgError::Validation`]
    /// for a job that failed during staging.
    pub fn discard_import(&mut self, job_id: ImportJobId) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin discard transaction")?;
        let job = require_job(&tx, job_id)?;
        if job.status == ImportJobStatus::Failed {
            return Err(OrgError::Validation(format!(
                "import job {job_id} failed during staging and has nothing to discard"
            ))
            .into());
        }

        let now = now_rfc3339()?;
        let discarded = tx
            .execute(
                "UPDATE imported_records SET status = 'discarded', updated_at = ?1
                 WHERE job_id = ?2 AND status = 'staged'",
                params![now, job_id.to_string()],
            )
            .with_context(|| format!("failed to discard records of job {job_id}"))?;
        refresh_counters(&tx, job_id)?;
        tx.execute(
            "UPDATE import_jobs SET status = 'cancelled', completed_at = ?1 WHERE job_id = ?2",
            params![now, job_id.to_string()],
        )
        .with_context(|| format!("failed to cancel import job {job_id}"))?;
        tx.commit().context("failed to commit discard transaction")?;

        tracing::info!(job_id = %job_id, discarded, "discarded staged import rows");
        Ok(discarded)
    }

    /// Put failed records back into `staged` so the next commit retries them. The
    /// transform is not re-run.
    ///
    /// # Errors
    /// Returns [`OrgError::NotFound`] for an unknown job and [`OrgError::Validation`]
    /// for failed or cancelled jobs.
    pub fn retry_failed_import(&mut self, job_id: ImportJobId) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin retry transaction")?;
        let job = require_job(&tx, job_id)?;
        if matches!(job.status, ImportJobStatus::Failed | ImportJobStatus::Cancelled) {
            return Err(OrgError::Validation(format!(
                "import job {job_id} is {} and cannot be retried",
                job.status.as_str()
            ))
            .into());
        }

        let reset = tx
            .execute(
                "UPDATE imported_records SET status = 'staged', error = NULL, updated_at = ?1
                 WHERE job_id = ?2 AND status = 'failed'",
                params![now_rfc3339()?, job_id.to_string()],
            )
            .with_context(|| format!("failed to reset failed records of job {job_id}"))?;
        if reset > 0 {
            refresh_counters(&tx, job_id)?;
            tx.execute(
                "UPDATE import_jobs SET status = 'pending_commit', completed_at = NULL
                 WHERE job_id = ?1",
                params![job_id.to_string()],
            )
            .with_context(|| format!("failed to reopen import job {job_id}"))?;
        }
        tx.commit().context("failed to commit retry transaction")?;

        tracing::info!(job_id = %job_id, reset, "reset failed import rows");
        Ok(reset)
    }

    /// Unfiltered fetch; callers run the access validator on the result.
    ///
    /// # Errors
    /// Returns an error when the lookup fails or stored values are corrupt.
    pub fn get_import_job(&self, job_id: ImportJobId) -> Result<Option<ImportJob>> {
        load_job(&self.conn, job_id)
    }

    /// # Errors
    /// Returns an error when the query fails or stored values are corrupt.
    pub fn list_import_jobs(&self, context: &OrgAccessContext) -> Result<Vec<ImportJob>> {
        let visible = ScopedWhere::for_listing(context, &ScopeColumns::DEFAULT, "uploaded_by");
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM import_jobs WHERE {}
                 ORDER BY created_at DESC, job_id DESC",
                visible.sql()
            ))
            .context("failed to prepare import job listing")?;
        let rows = stmt.query_map(params_from_iter(visible.params()), job_row)?;

        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_job()?);
        }
        Ok(jobs)
    }

    /// # Errors
    /// Returns an error when the query fails or stored values are corrupt.
    pub fn list_imported_records(&self, job_id: ImportJobId) -> Result<Vec<ImportedRecord>> {
        load_records(&self.conn, job_id, None)
    }

    /// # Errors
    /// Returns an error when the query fails or stored values are corrupt.
    pub fn list_canonical_records(&self, context: &OrgAccessContext) -> Result<Vec<CanonicalRecord>> {
        let visible = ScopedWhere::for_listing(context, &ScopeColumns::DEFAULT, "created_by");
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CANONICAL_COLUMNS} FROM canonical_records WHERE {}
                 ORDER BY entity_type ASC, external_key ASC, created_at ASC",
                visible.sql()
            ))
            .context("failed to prepare canonical record listing")?;
        let rows = stmt.query_map(params_from_iter(visible.params()), canonical_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_canonical()?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::thread;

    use orgscope_core::{
        FilterCondition, FilterMode, FilterOperator, MappingDraft, OrgRole, MAX_ROWS_PER_JOB,
    };
    use ulid::Ulid;

    use super::*;
    use crate::test_support::{member, sku_content, sku_row, store, user};

    fn approved_mapping(store: &mut SqliteStore, scope: OrgScope) -> Result<MappingId> {
        let author = user("maya");
        let mapping = store.create_mapping(
            &MappingDraft { name: "sku feed".to_string(), scope, content: sku_content(), notes: None },
            &author,
        )?;
        store.approve_mapping(mapping.mapping_id, &author)?;
        Ok(mapping.mapping_id)
    }

    fn request(mapping_id: MappingId, job_type: ImportJobType, rows: Vec<Row>) -> StageRequest {
        StageRequest {
            mapping_id,
            job_type,
            scope: OrgScope::default(),
            uploaded_by: user("uma"),
            source_name: Some("feed.csv".to_string()),
            rows,
            filter: None,
        }
    }

    fn statuses(records: &[ImportedRecord]) -> Vec<ImportedRecordStatus> {
        records.iter().map(|record| record.status).collect()
    }

    // Test IDs: TIMP-101
    #[test]
    fn partial_commit_isolates_the_failing_row() -> Result<()> {
        let mut store = store()?;
        let mapping_id = approved_mapping(&mut store, OrgScope::default())?;
        let seeded = store.stage_import(&request(
            mapping_id,
            ImportJobType::Import,
            vec![sku_row("k3", "1")],
        ))?;
        assert_eq!(seeded.status, ImportJobStatus::Completed);

        let rows = (0..10).map(|index| sku_row(&format!("k{index}"), "9.5")).collect();
        let job = store.stage_import(&request(mapping_id, ImportJobType::DryRun, rows))?;
        assert_eq!(job.status, ImportJobStatus::PendingCommit);
        assert_eq!(job.records_total, 10);
        assert!(job.source_digest.starts_with("sha256:"));

        let summary = store.commit_import(job.job_id)?;
        assert_eq!(summary, CommitSummary { committed: 9, failed: 1 });

        let records = store.list_imported_records(job.job_id)?;
        let failed = records
            .iter()
            .filter(|record| record.status == ImportedRecordStatus::Failed)
            .collect::<Vec<_>>();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].row_index, 3);
        assert_eq!(failed[0].error.as_deref(), Some("sku record with key `K3` already exists"));
        assert!(records
            .iter()
            .filter(|record| record.row_index != 3)
            .all(|record| record.canonical_record_id.is_some()));

        let job = store.get_import_job(job.job_id)?.unwrap_or_else(|| panic!("job vanished"));
        assert_eq!(job.status, ImportJobStatus::CompletedWithErrors);
        assert_eq!((job.records_processed, job.records_failed), (10, 1));
        assert!(job.completed_at.is_some());

        assert_eq!(store.retry_failed_import(job.job_id)?, 1);
        let reopened = store.get_import_job(job.job_id)?.unwrap_or_else(|| panic!("job vanished"));
        assert_eq!(reopened.status, ImportJobStatus::PendingCommit);
        assert_eq!(store.commit_import(job.job_id)?, CommitSummary { committed: 0, failed: 1 });
        Ok(())
    }

    // Test IDs: TIMP-102
    #[test]
    fn discard_only_touches_staged_rows() -> Result<()> {
        let mut store = store()?;
        let mapping_id = approved_mapping(&mut store, OrgScope::default())?;
        let rows = vec![sku_row("a", "1"), sku_row("", "2"), sku_row("c", "3")];
        let job = store.stage_import(&request(mapping_id, ImportJobType::DryRun, rows))?;

        assert_eq!(store.commit_import(job.job_id)?, CommitSummary { committed: 2, failed: 1 });
        assert_eq!(store.retry_failed_import(job.job_id)?, 1);
        assert_eq!(store.discard_import(job.job_id)?, 1);

        let records = store.list_imported_records(job.job_id)?;
        assert_eq!(
            statuses(&records),
            vec![
                ImportedRecordStatus::Committed,
                ImportedRecordStatus::Discarded,
                ImportedRecordStatus::Committed
            ]
        );
        let job = store.get_import_job(job.job_id)?.unwrap_or_else(|| panic!("job vanished"));
        assert_eq!(job.status, ImportJobStatus::Cancelled);

        let Err(err) = store.commit_import(job.job_id) else {
            panic!("expected commit on a cancelled job to fail");
        };
        assert!(matches!(err.downcast_ref::<OrgError>(), Some(OrgError::Validation(_))));
        assert!(store.retry_failed_import(job.job_id).is_err());
        Ok(())
    }

    // Test IDs: TIMP-103
    #[test]
    fn staging_validation_errors_fail_at_commit() -> Result<()> {
        let mut store = store()?;
        let mapping_id = approved_mapping(&mut store, OrgScope::default())?;
        let job = store.stage_import(&request(
            mapping_id,
            ImportJobType::Import,
            vec![sku_row("ok", "1"), sku_row("  ", "2")],
        ))?;

        assert_eq!(job.status, ImportJobStatus::CompletedWithErrors);
        let records = store.list_imported_records(job.job_id)?;
        assert_eq!(records[1].validation_errors, vec!["code is required".to_string()]);
        assert_eq!(records[1].error.as_deref(), Some("validation failed: code is required"));
        assert_eq!(records[0].target_record.get("code"), Some(&orgscope_core::FieldValue::Text("OK".to_string())));
        Ok(())
    }

    // Test IDs: TIMP-104
    #[test]
    fn mapping_status_gates_job_types() -> Result<()> {
        let mut store = store()?;
        let author = user("maya");
        let draft = store.create_mapping(
            &MappingDraft {
                name: "draft feed".to_string(),
                scope: OrgScope::default(),
                content: sku_content(),
                notes: None,
            },
            &author,
        )?;

        let Err(err) = store.stage_import(&request(draft.mapping_id, ImportJobType::Import, vec![]))
        else {
            panic!("expected an import job on a draft mapping to fail");
        };
        assert!(matches!(err.downcast_ref::<OrgError>(), Some(OrgError::Validation(_))));

        let dry_run =
            store.stage_import(&request(draft.mapping_id, ImportJobType::DryRun, vec![sku_row("a", "1")]))?;
        assert_eq!(dry_run.status, ImportJobStatus::PendingCommit);

        store.deprecate_mapping(draft.mapping_id)?;
        assert!(store
            .stage_import(&request(draft.mapping_id, ImportJobType::DryRun, vec![]))
            .is_err());
        Ok(())
    }

    // Test IDs: TIMP-105
    #[test]
    fn filter_skips_rows_and_keeps_indexes() -> Result<()> {
        let mut store = store()?;
        let mapping_id = approved_mapping(&mut store, OrgScope::default())?;
        let mut staged = request(
            mapping_id,
            ImportJobType::DryRun,
            vec![sku_row("a", "5"), sku_row("b", "50"), sku_row("c", "500")],
        );
        staged.filter = Some(ImportFilter {
            mode: FilterMode::All,
            conditions: vec![FilterCondition {
                field: "Price".to_string(),
                operator: FilterOperator::GreaterThan,
                value: Some("10".to_string()),
                value_end: None,
            }],
        });

        let job = store.stage_import(&staged)?;
        assert_eq!(job.records_total, 2);
        assert_eq!(job.filter, staged.filter);
        let indexes = store
            .list_imported_records(job.job_id)?
            .iter()
            .map(|record| record.row_index)
            .collect::<Vec<_>>();
        assert_eq!(indexes, vec![1, 2]);
        Ok(())
    }

    // Test IDs: TIMP-106
    #[test]
    fn oversized_batches_fail_the_job_without_rows() -> Result<()> {
        let mut store = store()?;
        let mapping_id = approved_mapping(&mut store, OrgScope::default())?;
        let rows = vec![Row::new(); MAX_ROWS_PER_JOB + 1];

        let job = store.stage_import(&request(mapping_id, ImportJobType::DryRun, rows))?;
        assert_eq!(job.status, ImportJobStatus::Failed);
        assert!(job.error.as_deref().is_some_and(|error| error.contains("at most")));
        assert!(store.list_imported_records(job.job_id)?.is_empty());
        assert!(store.discard_import(job.job_id).is_err());
        Ok(())
    }

    // Test IDs: TIMP-108
    #[test]
    fn staging_rechecks_the_mapping_under_the_write_lock() -> Result<()> {
        let mut store = store()?;
        let mapping_id = approved_mapping(&mut store, OrgScope::default())?;
        let staged = request(mapping_id, ImportJobType::DryRun, vec![sku_row("a", "1")]);

        let job_id = store.open_job(&staged)?;
        store.deprecate_mapping(mapping_id)?;

        let Err(err) = store.stage_records(job_id, &staged) else {
            panic!("expected staging against a deprecated mapping to fail");
        };
        assert!(matches!(err.downcast_ref::<OrgError>(), Some(OrgError::Validation(_))));
        assert!(store.list_imported_records(job_id)?.is_empty());

        let job = store.get_import_job(job_id)?.unwrap_or_else(|| panic!("job vanished"));
        assert_eq!(job.status, ImportJobStatus::Processing);
        assert_eq!(job.records_total, 0);
        Ok(())
    }

    // Test IDs: TIMP-107
    #[test]
    fn job_and_canonical_listings_respect_scope() -> Result<()> {
        let mut store = store()?;
        let acme = store.create_company("Acme")?;
        let globex = store.create_company("Globex")?;
        let mapping_id = approved_mapping(&mut store, OrgScope::default())?;

        let mut acme_job = request(mapping_id, ImportJobType::Import, vec![sku_row("a", "1")]);
        acme_job.scope = OrgScope::company(acme.company_id);
        store.stage_import(&acme_job)?;
        let mut globex_job = request(mapping_id, ImportJobType::Import, vec![sku_row("a", "1")]);
        globex_job.scope = OrgScope::company(globex.company_id);
        store.stage_import(&globex_job)?;

        let viewer = member(&mut store, "vic", OrgScope::company(acme.company_id), OrgRole::User)?;
        let jobs = store.list_import_jobs(&viewer)?;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].scope.company_id, Some(acme.company_id));
        assert_eq!(store.list_canonical_records(&viewer)?.len(), 1);

        let uploader = store.resolve_context(&user("uma"))?;
        assert_eq!(store.list_import_jobs(&uploader)?.len(), 2);
        let stranger = store.resolve_context(&user("sam"))?;
        assert!(store.list_import_jobs(&stranger)?.is_empty());
        Ok(())
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_commits_process_each_row_once() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("orgscope-concurrency-{}.sqlite3", Ulid::new()));
        let job_id = {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
            let mapping_id = approved_mapping(&mut init, OrgScope::default())?;
            let rows = (0..40).map(|index| sku_row(&format!("sku-{index}"), "1")).collect();
            init.stage_import(&request(mapping_id, ImportJobType::DryRun, rows))?.job_id
        };

        let mut handles = Vec::new();
        for _ in 0..4 {
            let path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<CommitSummary> {
                let mut store = SqliteStore::open(&path)?;
                store.commit_import(job_id)
            }));
        }

        let mut committed = 0;
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("commit thread panicked"));
            };
            let summary = thread_result?;
            assert_eq!(summary.failed, 0);
            committed += summary.committed;
        }
        assert_eq!(committed, 40);

        let store = SqliteStore::open(&db_path)?;
        let admin = OrgAccessContext { is_system_admin: true, ..OrgAccessContext::unassigned(user("root")) };
        assert_eq!(store.list_canonical_records(&admin)?.len(), 40);
        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        drop(store);

        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{suffix}", db_path.display()));
            if Path::new(&path).exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }
}
