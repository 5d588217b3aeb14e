use anyhow::{anyhow, Context, Result};
use orgscope_core::{
    validate_cron_expression, ImportJobType, ImportSchedule, MappingId, OrgAccessContext,
    OrgError, OrgScope, ScheduleId, UserId,
};
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::mappings::load_mapping;
use crate::{
    parse_rfc3339, rfc3339, scope_columns, stored, stored_scope, stored_user, ScopeColumns,
    ScopedWhere, SqliteStore,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewSchedule {
    pub mapping_id: MappingId,
    pub cron_expression: String,
    pub job_type: ImportJobType,
    pub scope: OrgScope,
    pub created_by: UserId,
}

const SCHEDULE_COLUMNS: &str = "schedule_id, mapping_id, cron_expression, job_type, company_id, \
                                business_unit_id, location_id, created_by, enabled, created_at";

struct ScheduleRow {
    schedule_id: String,
    mapping_id: String,
    cron_expression: String,
    job_type: String,
    company_id: Option<String>,
    business_unit_id: Option<String>,
    location_id: Option<String>,
    created_by: String,
    enabled: bool,
    created_at: String,
}

fn schedule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduleRow> {
    Ok(ScheduleRow {
        schedule_id: row.get(0)?,
        mapping_id: row.get(1)?,
        cron_expression: row.get(2)?,
        job_type: row.get(3)?,
        company_id: row.get(4)?,
        business_unit_id: row.get(5)?,
        location_id: row.get(6)?,
        created_by: row.get(7)?,
        enabled: row.get(8)?,
        created_at: row.get(9)?,
    })
}

impl ScheduleRow {
    fn into_schedule(self) -> Result<ImportSchedule> {
        Ok(ImportSchedule {
            schedule_id: stored(ScheduleId::parse(&self.schedule_id))?,
            mapping_id: stored(MappingId::parse(&self.mapping_id))?,
            cron_expression: self.cron_expression,
            job_type: ImportJobType::parse(&self.job_type)
                .ok_or_else(|| anyhow!("unknown stored job type: {}", self.job_type))?,
            scope: stored_scope(
                self.company_id.as_deref(),
                self.business_unit_id.as_deref(),
                self.location_id.as_deref(),
            )?,
            created_by: stored_user(&self.created_by)?,
            enabled: self.enabled,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}

impl SqliteStore {
    /// Record an enabled schedule for an external runner. Nothing is executed here.
    ///
    /// # Errors
    /// Returns [`OrgError::Validation`] for a malformed cron expression or scope and
    /// [`OrgError::NotFound`] when the mapping does not exist.
    pub fn create_schedule(&mut self, input: &NewSchedule) -> Result<ImportSchedule> {
        validate_cron_expression(&input.cron_expression)?;
        if load_mapping(&self.conn, input.mapping_id)?.is_none() {
            return Err(OrgError::NotFound(format!("mapping version {}", input.mapping_id)).into());
        }
        self.validate_scope(&input.scope)?;

        let schedule = ImportSchedule {
            schedule_id: ScheduleId::new(),
            mapping_id: input.mapping_id,
            cron_expression: input.cron_expression.split_whitespace().collect::<Vec<_>>().join(" "),
            job_type: input.job_type,
            scope: input.scope,
            created_by: input.created_by.clone(),
            enabled: true,
            created_at: OffsetDateTime::now_utc(),
        };
        let (company_id, business_unit_id, location_id) = scope_columns(&schedule.scope);
        self.conn
            .execute(
                &format!(
                    "INSERT INTO import_schedules({SCHEDULE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    schedule.schedule_id.to_string(),
                    schedule.mapping_id.to_string(),
                    schedule.cron_expression,
                    schedule.job_type.as_str(),
                    company_id,
                    business_unit_id,
                    location_id,
                    schedule.created_by.as_str(),
                    schedule.enabled,
                    rfc3339(schedule.created_at)?
                ],
            )
            .context("failed to insert import schedule")?;
        tracing::info!(schedule_id = %schedule.schedule_id, cron = %schedule.cron_expression, "created import schedule");
        Ok(schedule)
    }

    /// # Errors
    /// Returns an error when the lookup fails or stored values are corrupt.
    pub fn get_schedule(&self, schedule_id: ScheduleId) -> Result<Option<ImportSchedule>> {
        self.conn
            .query_row(
                &format!("SELECT {SCHEDULE_COLUMNS} FROM import_schedules WHERE schedule_id = ?1"),
                params![schedule_id.to_string()],
                schedule_row,
            )
            .optional()
            .with_context(|| format!("failed to load schedule {schedule_id}"))?
            .map(ScheduleRow::into_schedule)
            .transpose()
    }

    /// # Errors
    /// Returns an error when the query fails or stored values are corrupt.
    pub fn list_schedules(&self, context: &OrgAccessContext) -> Result<Vec<ImportSchedule>> {
        let visible = ScopedWhere::for_listing(context, &ScopeColumns::DEFAULT, "created_by");
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM import_schedules WHERE {}
                 ORDER BY created_at ASC, schedule_id ASC",
                visible.sql()
            ))
            .context("failed to prepare schedule listing")?;
        let rows = stmt.query_map(params_from_iter(visible.params()), schedule_row)?;

        let mut schedules = Vec::new();
        for row in rows {
            schedules.push(row?.into_schedule()?);
        }
        Ok(schedules)
    }

    /// # Errors
    /// Returns [`OrgError::NotFound`] when the schedule does not exist.
    pub fn set_schedule_enabled(&mut self, schedule_id: ScheduleId, enabled: bool) -> Result<ImportSchedule> {
        let changed = self
            .conn
            .execute(
                "UPDATE import_schedules SET enabled = ?1 WHERE schedule_id = ?2",
                params![enabled, schedule_id.to_string()],
            )
            .with_context(|| format!("failed to update schedule {schedule_id}"))?;
        if changed == 0 {
            return Err(OrgError::NotFound(format!("schedule {schedule_id}")).into());
        }
        self.get_schedule(schedule_id)?
            .ok_or_else(|| anyhow!("schedule {schedule_id} vanished after update"))
    }
}
