use anyhow::{anyhow, Context, Result};
use orgscope_core::{
    approval_plan, ensure_deletable, ensure_deprecatable, resolve_lineage, revert_plan,
    sort_history, LineageSource, MappingContent, MappingDraft, MappingId, MappingPatch,
    MappingStatus, MappingVersion, OrgAccessContext, OrgError, UserId,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    count_rows, parse_optional_rfc3339, parse_rfc3339, rfc3339, scope_columns, stored,
    stored_scope, stored_user, ScopeColumns, ScopedWhere, SqliteStore,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalOutcome {
    pub approved: MappingVersion,
    pub deprecated: Vec<MappingId>,
}

const MAPPING_COLUMNS: &str = "mapping_id, parent_mapping_id, name, version, status, company_id, \
                               business_unit_id, location_id, content_json, notes, created_by, \
                               created_at, approved_by, approved_at";

struct MappingRow {
    mapping_id: String,
    parent_mapping_id: Option<String>,
    name: String,
    version: u32,
    status: String,
    company_id: Option<String>,
    business_unit_id: Option<String>,
    location_id: Option<String>,
    content_json: String,
    notes: Option<String>,
    created_by: String,
    created_at: String,
    approved_by: Option<String>,
    approved_at: Option<String>,
}

fn mapping_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MappingRow> {
    Ok(MappingRow {
        mapping_id: row.get(0)?,
        parent_mapping_id: row.get(1)?,
        name: row.get(2)?,
        version: row.get(3)?,
        status: row.get(4)?,
        company_id: row.get(5)?,
        business_unit_id: row.get(6)?,
        location_id: row.get(7)?,
        content_json: row.get(8)?,
        notes: row.get(9)?,
        created_by: row.get(10)?,
        created_at: row.get(11)?,
        approved_by: row.get(12)?,
        approved_at: row.get(13)?,
    })
}

impl MappingRow {
    fn into_version(self) -> Result<MappingVersion> {
        let content: MappingContent = serde_json::from_str(&self.content_json)
            .with_context(|| format!("invalid stored content for mapping {}", self.mapping_id))?;
        Ok(MappingVersion {
            mapping_id: stored(MappingId::parse(&self.mapping_id))?,
            parent_mapping_id: self
                .parent_mapping_id
                .as_deref()
                .map(|raw| stored(MappingId::parse(raw)))
                .transpose()?,
            name: self.name,
            version: self.version,
            status: MappingStatus::parse(&self.status)
                .ok_or_else(|| anyhow!("unknown stored mapping status: {}", self.status))?,
            scope: stored_scope(
                self.company_id.as_deref(),
                self.business_unit_id.as_deref(),
                self.location_id.as_deref(),
            )?,
            content,
            notes: self.notes,
            created_by: stored_user(&self.created_by)?,
            created_at: parse_rfc3339(&self.created_at)?,
            approved_by: self.approved_by.as_deref().map(stored_user).transpose()?,
            approved_at: parse_optional_rfc3339(self.approved_at.as_deref())?,
        })
    }
}

pub(crate) fn load_mapping(conn: &Connection, mapping_id: MappingId) -> Result<Option<MappingVersion>> {
    conn.query_row(
        &format!("SELECT {MAPPING_COLUMNS} FROM mapping_versions WHERE mapping_id = ?1"),
        params![mapping_id.to_string()],
        mapping_row,
    )
    .optional()
    .with_context(|| format!("failed to load mapping version {mapping_id}"))?
    .map(MappingRow::into_version)
    .transpose()
}

fn insert_mapping(conn: &Connection, mapping: &MappingVersion) -> Result<()> {
    let (company_id, business_unit_id, location_id) = scope_columns(&mapping.scope);
    let content_json =
        serde_json::to_string(&mapping.content).context("failed to encode mapping content")?;
    conn.execute(
        &format!(
            "INSERT INTO mapping_versions({MAPPING_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
        ),
        params![
            mapping.mapping_id.to_string(),
            mapping.parent_mapping_id.map(|id| id.to_string()),
            mapping.name,
            mapping.version,
            mapping.status.as_str(),
            company_id,
            business_unit_id,
            location_id,
            content_json,
            mapping.notes,
            mapping.created_by.as_str(),
            rfc3339(mapping.created_at)?,
            mapping.approved_by.as_ref().map(UserId::as_str),
            mapping.approved_at.map(rfc3339).transpose()?,
        ],
    )
    .with_context(|| format!("failed to insert mapping version {}", mapping.mapping_id))?;
    Ok(())
}

struct SqlLineage<'c> {
    conn: &'c Connection,
}

impl LineageSource for SqlLineage<'_> {
    type Error = anyhow::Error;

    fn parent_of(&mut self, id: MappingId) -> Result<Option<Option<MappingId>>> {
        let raw = self
            .conn
            .query_row(
                "SELECT parent_mapping_id FROM mapping_versions WHERE mapping_id = ?1",
                params![id.to_string()],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()
            .with_context(|| format!("failed to load parent of mapping version {id}"))?;
        raw.map(|parent| parent.as_deref().map(|raw| stored(MappingId::parse(raw))).transpose())
            .transpose()
    }

    fn children_of(&mut self, id: MappingId) -> Result<Vec<MappingId>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT mapping_id FROM mapping_versions WHERE parent_mapping_id = ?1
                 ORDER BY version ASC, created_at ASC, mapping_id ASC",
            )
            .context("failed to prepare child lookup")?;
        let rows = stmt.query_map(params![id.to_string()], |row| row.get::<_, String>(0))?;

        let mut children = Vec::new();
        for row in rows {
            children.push(stored(MappingId::parse(&row?))?);
        }
        Ok(children)
    }
}

/// Every version linked to `mapping_id`, root first.
fn load_lineage(conn: &Connection, mapping_id: MappingId) -> Result<Vec<MappingVersion>> {
    let ids = resolve_lineage(&mut SqlLineage { conn }, mapping_id)?;
    ids.into_iter()
        .map(|id| {
            load_mapping(conn, id)?
                .ok_or_else(|| anyhow!("mapping version {id} vanished during lineage load"))
        })
        .collect()
}

fn require_mapping(conn: &Connection, mapping_id: MappingId) -> Result<MappingVersion> {
    load_mapping(conn, mapping_id)?
        .ok_or_else(|| OrgError::NotFound(format!("mapping version {mapping_id}")).into())
}

impl SqliteStore {
    /// Create a new lineage root at version 1.
    ///
    /// # Errors
    /// Returns [`OrgError::Validation`] when the draft or its scope is invalid.
    pub fn create_mapping(&mut self, draft: &MappingDraft, created_by: &UserId) -> Result<MappingVersion> {
        draft.validate()?;
        self.validate_scope(&draft.scope)?;

        let mapping = MappingVersion {
            mapping_id: MappingId::new(),
            parent_mapping_id: None,
            name: draft.name.trim().to_string(),
            version: 1,
            status: MappingStatus::Draft,
            scope: draft.scope,
            content: draft.content.clone(),
            notes: draft.notes.clone(),
            created_by: created_by.clone(),
            created_at: OffsetDateTime::now_utc(),
            approved_by: None,
            approved_at: None,
        };
        insert_mapping(&self.conn, &mapping)?;
        tracing::info!(mapping_id = %mapping.mapping_id, name = %mapping.name, "created mapping");
        Ok(mapping)
    }

    /// Unfiltered fetch; callers run the access validator on the result.
    ///
    /// # Errors
    /// Returns an error when the lookup fails or stored values are corrupt.
    pub fn get_mapping(&self, mapping_id: MappingId) -> Result<Option<MappingVersion>> {
        load_mapping(&self.conn, mapping_id)
    }

    /// Branch a new draft off `parent_id`, inheriting anything `patch` leaves unset.
    ///
    /// # Errors
    /// Returns [`OrgError::NotFound`] when the parent is missing and
    /// [`OrgError::Validation`] when the resulting content is invalid.
    pub fn create_version(
        &mut self,
        parent_id: MappingId,
        patch: &MappingPatch,
        created_by: &UserId,
    ) -> Result<MappingVersion> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin mapping version transaction")?;
        let parent = require_mapping(&tx, parent_id)?;

        let content = patch.content.clone().unwrap_or_else(|| parent.content.clone());
        content.validate()?;
        let name = match &patch.name {
            Some(name) if name.trim().is_empty() => {
                return Err(OrgError::Validation("name MUST be provided".to_string()).into());
            }
            Some(name) => name.trim().to_string(),
            None => parent.name.clone(),
        };
        let version = parent
            .version
            .checked_add(1)
            .ok_or_else(|| OrgError::Validation("mapping version counter overflow".to_string()))?;

        let mapping = MappingVersion {
            mapping_id: MappingId::new(),
            parent_mapping_id: Some(parent.mapping_id),
            name,
            version,
            status: MappingStatus::Draft,
            scope: parent.scope,
            content,
            notes: patch.notes.clone().or_else(|| parent.notes.clone()),
            created_by: created_by.clone(),
            created_at: OffsetDateTime::now_utc(),
            approved_by: None,
            approved_at: None,
        };
        insert_mapping(&tx, &mapping)?;
        tx.commit().context("failed to commit mapping version transaction")?;
        tracing::info!(
            mapping_id = %mapping.mapping_id,
            parent_mapping_id = %parent_id,
            version = mapping.version,
            "created mapping version"
        );
        Ok(mapping)
    }

    /// Approve a draft and deprecate every other approved member of its lineage,
    /// all under one write lock.
    ///
    /// # Errors
    /// Returns [`OrgError::NotFound`] for an unknown version, [`OrgError::Validation`]
    /// when it is not a draft, and [`OrgError::System`] for a corrupt lineage.
    pub fn approve_mapping(&mut self, mapping_id: MappingId, approved_by: &UserId) -> Result<ApprovalOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin approval transaction")?;
        let lineage = load_lineage(&tx, mapping_id)?;
        let plan = approval_plan(&lineage, mapping_id)?;

        let approved_at = rfc3339(OffsetDateTime::now_utc())?;
        for deprecated in &plan.deprecate {
            tx.execute(
                "UPDATE mapping_versions SET status = 'deprecated' WHERE mapping_id = ?1",
                params![deprecated.to_string()],
            )
            .with_context(|| format!("failed to deprecate mapping version {deprecated}"))?;
        }
        tx.execute(
            "UPDATE mapping_versions SET status = 'approved', approved_by = ?1, approved_at = ?2
             WHERE mapping_id = ?3",
            params![approved_by.as_str(), approved_at, plan.approve.to_string()],
        )
        .with_context(|| format!("failed to approve mapping version {mapping_id}"))?;

        let approved = require_mapping(&tx, plan.approve)?;
        tx.commit().context("failed to commit approval transaction")?;
        tracing::info!(
            mapping_id = %mapping_id,
            approved_by = %approved_by,
            deprecated = plan.deprecate.len(),
            "approved mapping version"
        );
        Ok(ApprovalOutcome { approved, deprecated: plan.deprecate })
    }

    /// Move a draft or approved version straight to deprecated. Siblings are untouched.
    ///
    /// # Errors
    /// Returns [`OrgError::NotFound`] for an unknown version and
    /// [`OrgError::Validation`] when it is already deprecated.
    pub fn deprecate_mapping(&mut self, mapping_id: MappingId) -> Result<MappingVersion> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin deprecation transaction")?;
        let mut mapping = require_mapping(&tx, mapping_id)?;
        ensure_deprecatable(&mapping)?;

        tx.execute(
            "UPDATE mapping_versions SET status = 'deprecated' WHERE mapping_id = ?1",
            params![mapping_id.to_string()],
        )
        .with_context(|| format!("failed to deprecate mapping version {mapping_id}"))?;
        tx.commit().context("failed to commit deprecation transaction")?;

        mapping.status = MappingStatus::Deprecated;
        tracing::info!(mapping_id = %mapping_id, "deprecated mapping version");
        Ok(mapping)
    }

    /// Create a new draft under the lineage head carrying the content of
    /// `target_version`.
    ///
    /// # Errors
    /// Returns [`OrgError::NotFound`] when the lineage or target version is missing.
    pub fn revert_mapping(
        &mut self,
        mapping_id: MappingId,
        target_version: u32,
        created_by: &UserId,
    ) -> Result<MappingVersion> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin revert transaction")?;
        let lineage = load_lineage(&tx, mapping_id)?;
        let plan = revert_plan(&lineage, target_version)?;

        let mapping = MappingVersion {
            mapping_id: MappingId::new(),
            parent_mapping_id: Some(plan.head.mapping_id),
            name: plan.head.name.clone(),
            version: plan.next_version,
            status: MappingStatus::Draft,
            scope: plan.head.scope,
            content: plan.source.content.clone(),
            notes: Some(format!("Reverted from version {target_version}")),
            created_by: created_by.clone(),
            created_at: OffsetDateTime::now_utc(),
            approved_by: None,
            approved_at: None,
        };
        insert_mapping(&tx, &mapping)?;
        tx.commit().context("failed to commit revert transaction")?;
        tracing::info!(
            mapping_id = %mapping.mapping_id,
            source_mapping_id = %plan.source.mapping_id,
            version = mapping.version,
            "reverted mapping"
        );
        Ok(mapping)
    }

    /// Full lineage of `mapping_id`, newest version first.
    ///
    /// # Errors
    /// Returns [`OrgError::NotFound`] for an unknown version.
    pub fn mapping_history(&self, mapping_id: MappingId) -> Result<Vec<MappingVersion>> {
        let mut lineage = load_lineage(&self.conn, mapping_id)?;
        sort_history(&mut lineage);
        Ok(lineage)
    }

    /// # Errors
    /// Returns [`OrgError::Validation`] unless the version is a childless draft with no
    /// import jobs or schedules referring to it.
    pub fn delete_mapping_draft(&mut self, mapping_id: MappingId) -> Result<()> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to begin delete transaction")?;
        let mapping = require_mapping(&tx, mapping_id)?;
        let id = mapping_id.to_string();
        let children =
            count_rows(&tx, "SELECT COUNT(*) FROM mapping_versions WHERE parent_mapping_id = ?1", &id)?;
        ensure_deletable(&mapping, children)?;

        let jobs = count_rows(&tx, "SELECT COUNT(*) FROM import_jobs WHERE mapping_id = ?1", &id)?;
        let schedules =
            count_rows(&tx, "SELECT COUNT(*) FROM import_schedules WHERE mapping_id = ?1", &id)?;
        if jobs + schedules > 0 {
            return Err(OrgError::Validation(format!(
                "version {} is referenced by {jobs} import jobs and {schedules} schedules",
                mapping.version
            ))
            .into());
        }

        tx.execute("DELETE FROM mapping_versions WHERE mapping_id = ?1", params![id])
            .with_context(|| format!("failed to delete mapping version {mapping_id}"))?;
        tx.commit().context("failed to commit delete transaction")?;
        tracing::info!(mapping_id = %mapping_id, "deleted mapping draft");
        Ok(())
    }

    /// # Errors
    /// Returns an error when the query fails or stored values are corrupt.
    pub fn list_mappings(&self, context: &OrgAccessContext) -> Result<Vec<MappingVersion>> {
        let visible = ScopedWhere::for_listing(context, &ScopeColumns::DEFAULT, "created_by");
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {MAPPING_COLUMNS} FROM mapping_versions WHERE {}
                 ORDER BY name ASC, version DESC, created_at DESC",
                visible.sql()
            ))
            .context("failed to prepare mapping listing")?;
        let rows = stmt.query_map(params_from_iter(visible.params()), mapping_row)?;

        let mut mappings = Vec::new();
        for row in rows {
            mappings.push(row?.into_version()?);
        }
        Ok(mappings)
    }
}
