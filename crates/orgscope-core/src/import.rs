use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    CanonicalRecordId, ImportFilter, ImportJobId, ImportedRecordId, MappingContent, MappingId,
    OrgError, OrgScope, Row, ScheduleId, ScopedResource, UserId,
};

/// Upper bound on rows accepted by one staging call.
pub const MAX_ROWS_PER_JOB: usize = 50_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ImportJobType {
    DryRun,
    Import,
}

impl ImportJobType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DryRun => "dry_run",
            Self::Import => "import",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dry_run" => Some(Self::DryRun),
            "import" => Some(Self::Import),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ImportJobStatus {
    Pending,
    Processing,
    PendingCommit,
    Completed,
    CompletedWithErrors,
    Failed,
    Cancelled,
}

impl ImportJobStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::PendingCommit => "pending_commit",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "pending_commit" => Some(Self::PendingCommit),
            "completed" => Some(Self::Completed),
            "completed_with_errors" => Some(Self::CompletedWithErrors),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Statuses from which staged rows may be committed or failed rows retried.
    #[must_use]
    pub fn accepts_commit(self) -> bool {
        matches!(self, Self::PendingCommit | Self::Completed | Self::CompletedWithErrors)
    }

    /// Job status after a commit pass, given how many rows remain failed.
    #[must_use]
    pub fn after_commit(remaining_failed: usize) -> Self {
        if remaining_failed == 0 {
            Self::Completed
        } else {
            Self::CompletedWithErrors
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ImportedRecordStatus {
    Staged,
    Committed,
    Failed,
    Discarded,
}

impl ImportedRecordStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staged => "staged",
            Self::Committed => "committed",
            Self::Failed => "failed",
            Self::Discarded => "discarded",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "staged" => Some(Self::Staged),
            "committed" => Some(Self::Committed),
            "failed" => Some(Self::Failed),
            "discarded" => Some(Self::Discarded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportJob {
    pub job_id: ImportJobId,
    pub mapping_id: MappingId,
    pub job_type: ImportJobType,
    pub status: ImportJobStatus,
    pub scope: OrgScope,
    pub uploaded_by: UserId,
    pub source_name: Option<String>,
    pub source_digest: String,
    pub filter: Option<ImportFilter>,
    pub records_total: u64,
    pub records_processed: u64,
    pub records_failed: u64,
    pub error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl ScopedResource for ImportJob {
    fn scope(&self) -> OrgScope {
        self.scope
    }

    fn created_by(&self) -> &UserId {
        &self.uploaded_by
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportedRecord {
    pub record_id: ImportedRecordId,
    pub job_id: ImportJobId,
    pub row_index: u64,
    pub source_record: Row,
    pub target_record: Row,
    pub source_hash: String,
    pub status: ImportedRecordStatus,
    pub validation_errors: Vec<String>,
    pub error: Option<String>,
    pub canonical_record_id: Option<CanonicalRecordId>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CanonicalRecord {
    pub canonical_record_id: CanonicalRecordId,
    pub entity_type: String,
    pub external_key: Option<String>,
    pub scope: OrgScope,
    pub data: Row,
    pub source_job_id: ImportJobId,
    pub source_record_id: ImportedRecordId,
    pub created_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ScopedResource for CanonicalRecord {
    fn scope(&self) -> OrgScope {
        self.scope
    }

    fn created_by(&self) -> &UserId {
        &self.created_by
    }
}

/// Per-row materialization failure. Captured on the record, never propagated.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RowFailure {
    pub record_id: ImportedRecordId,
    pub row_index: u64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct CommitSummary {
    pub committed: usize,
    pub failed: usize,
}

impl CommitSummary {
    /// Fold independent per-row outcomes into pass totals.
    #[must_use]
    pub fn from_outcomes<'a, I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = &'a Result<CanonicalRecordId, RowFailure>>,
    {
        outcomes.into_iter().fold(Self::default(), |summary, outcome| match outcome {
            Ok(_) => Self { committed: summary.committed + 1, ..summary },
            Err(_) => Self { failed: summary.failed + 1, ..summary },
        })
    }
}

/// A transformed row ready to be persisted as a staged record.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    pub row_index: u64,
    pub source_record: Row,
    pub target_record: Row,
    pub validation_errors: Vec<String>,
}

/// Filter and transform every source row.
///
/// Rows rejected by `filter` are skipped; surviving rows keep their original index.
///
/// # Errors
/// Returns [`OrgError::Validation`] when more than [`MAX_ROWS_PER_JOB`] rows are
/// submitted.
pub fn stage_rows(
    content: &MappingContent,
    filter: Option<&ImportFilter>,
    rows: &[Row],
) -> Result<Vec<StagedRow>, OrgError> {
    if rows.len() > MAX_ROWS_PER_JOB {
        return Err(OrgError::Validation(format!(
            "import accepts at most {MAX_ROWS_PER_JOB} rows; received {}",
            rows.len()
        )));
    }

    let staged = rows
        .iter()
        .zip(0_u64..)
        .filter(|(row, _)| filter.map_or(true, |filter| filter.admits(row)))
        .map(|(row, row_index)| {
            let outcome = content.transform_row(row);
            StagedRow {
                row_index,
                source_record: row.clone(),
                target_record: outcome.target_record,
                validation_errors: outcome.validation_errors,
            }
        })
        .collect();
    Ok(staged)
}

/// Natural key of a target row under `content`.
///
/// # Errors
/// Returns a message when the mapping declares a key field and the row leaves it empty.
pub fn external_key(content: &MappingContent, target_record: &Row) -> Result<Option<String>, String> {
    let Some(key_field) = &content.key_field else {
        return Ok(None);
    };
    match target_record.get(key_field).and_then(crate::FieldValue::as_text) {
        Some(key) if !key.trim().is_empty() => Ok(Some(key.trim().to_string())),
        _ => Err(format!("key field `{key_field}` is empty")),
    }
}

/// Stored schedule metadata for an external scheduler; nothing here runs imports.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSchedule {
    pub schedule_id: ScheduleId,
    pub mapping_id: MappingId,
    pub cron_expression: String,
    pub job_type: ImportJobType,
    pub scope: OrgScope,
    pub created_by: UserId,
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl ScopedResource for ImportSchedule {
    fn scope(&self) -> OrgScope {
        self.scope
    }

    fn created_by(&self) -> &UserId {
        &self.created_by
    }
}

/// Checks a standard five-field cron expression (minute, hour, day of month,
/// month, day of week). Named months and days such as `MON-FRI` are accepted.
///
/// # Errors
/// Returns [`OrgError::Validation`] when the field count is wrong or any field
/// is out of range or malformed.
pub fn validate_cron_expression(expression: &str) -> Result<(), OrgError> {
    let fields = expression.split_whitespace().collect::<Vec<_>>();
    if fields.len() != 5 {
        return Err(OrgError::Validation(format!(
            "cron_expression MUST have 5 fields; found {}",
            fields.len()
        )));
    }
    // The cron crate wants a leading seconds field.
    let with_seconds = format!("0 {}", fields.join(" "));
    with_seconds.parse::<cron::Schedule>().map(|_| ()).map_err(|err| {
        OrgError::Validation(format!("cron_expression `{expression}` is invalid: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{FieldRule, FieldTransform, FieldValue, FilterCondition, FilterMode, FilterOperator};

    fn content() -> MappingContent {
        MappingContent {
            entity_type: "sku".to_string(),
            key_field: Some("code".to_string()),
            rules: vec![FieldRule {
                target: "code".to_string(),
                transform: FieldTransform::Copy { source: "Code".to_string() },
                required: true,
            }],
        }
    }

    fn code_row(code: &str) -> Row {
        BTreeMap::from([("Code".to_string(), FieldValue::Text(code.to_string()))])
    }

    // Test IDs: TIMP-001
    #[test]
    fn commit_summary_folds_outcomes() {
        let outcomes = (0_u64..10)
            .map(|index| {
                if index == 3 {
                    Err(RowFailure {
                        record_id: ImportedRecordId::new(),
                        row_index: index,
                        message: "boom".to_string(),
                    })
                } else {
                    Ok(CanonicalRecordId::new())
                }
            })
            .collect::<Vec<_>>();

        let summary = CommitSummary::from_outcomes(&outcomes);
        assert_eq!(summary, CommitSummary { committed: 9, failed: 1 });
        assert_eq!(ImportJobStatus::after_commit(summary.failed), ImportJobStatus::CompletedWithErrors);
        assert_eq!(ImportJobStatus::after_commit(0), ImportJobStatus::Completed);
    }

    // Test IDs: TIMP-002
    #[test]
    fn stage_rows_keeps_original_indexes_after_filtering() -> Result<(), OrgError> {
        let filter = ImportFilter {
            mode: FilterMode::All,
            conditions: vec![FilterCondition {
                field: "Code".to_string(),
                operator: FilterOperator::NotEquals,
                value: Some("skip".to_string()),
                value_end: None,
            }],
        };
        let rows = vec![code_row("a"), code_row("skip"), code_row("")];

        let staged = stage_rows(&content(), Some(&filter), &rows)?;
        assert_eq!(staged.iter().map(|row| row.row_index).collect::<Vec<_>>(), vec![0, 2]);
        assert!(staged[0].validation_errors.is_empty());
        assert_eq!(staged[1].validation_errors, vec!["code is required".to_string()]);
        Ok(())
    }

    #[test]
    fn stage_rows_rejects_oversized_batches() {
        let rows = vec![Row::new(); MAX_ROWS_PER_JOB + 1];
        assert!(matches!(stage_rows(&content(), None, &rows), Err(OrgError::Validation(_))));
    }

    #[test]
    fn external_key_requires_populated_key_field() {
        let mapping = content();
        let target = BTreeMap::from([("code".to_string(), FieldValue::Text(" A1 ".to_string()))]);
        assert_eq!(external_key(&mapping, &target), Ok(Some("A1".to_string())));
        assert!(external_key(&mapping, &Row::new()).is_err());

        let keyless = MappingContent { key_field: None, ..mapping };
        assert_eq!(external_key(&keyless, &Row::new()), Ok(None));
    }

    #[test]
    fn cron_expressions_need_five_fields() {
        assert!(validate_cron_expression("0 2 * * 1-5").is_ok());
        assert!(validate_cron_expression("*/15 * * * *").is_ok());
        assert!(validate_cron_expression("0 2 * *").is_err());
        assert!(validate_cron_expression("0 0 2 * * *").is_err());
    }

    #[test]
    fn cron_expressions_reject_out_of_range_values() {
        for expression in ["99 99 99 99 99", "60 24 32 13 8", "0 25 * * *"] {
            assert!(
                matches!(validate_cron_expression(expression), Err(OrgError::Validation(_))),
                "{expression} should be rejected"
            );
        }
    }

    #[test]
    fn cron_expressions_reject_malformed_ranges() {
        for expression in ["5-- * * * *", "/,/ -,- * * *", "0 2 * * nightly"] {
            assert!(
                matches!(validate_cron_expression(expression), Err(OrgError::Validation(_))),
                "{expression} should be rejected"
            );
        }
    }

    #[test]
    fn cron_expressions_accept_named_days_and_months() {
        assert_eq!(validate_cron_expression("0 9 * * MON"), Ok(()));
        assert_eq!(validate_cron_expression("0 9 * * Mon,Wed,Fri"), Ok(()));
        assert_eq!(validate_cron_expression("0 0 1 May-Aug *"), Ok(()));
    }
}
