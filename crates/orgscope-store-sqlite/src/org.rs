use anyhow::{anyhow, Context, Result};
use orgscope_core::{
    AssignmentId, BusinessUnitId, CompanyId, LocationId, OrgAccessContext, OrgError, OrgRole,
    OrgScope, UserId,
};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    exists, now_rfc3339, parse_rfc3339, rfc3339, scope_columns, stored, stored_scope,
    stored_user, SqliteStore,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Company {
    pub company_id: CompanyId,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusinessUnit {
    pub business_unit_id: BusinessUnitId,
    pub company_id: CompanyId,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Location {
    pub location_id: LocationId,
    pub business_unit_id: BusinessUnitId,
    pub company_id: CompanyId,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserAccount {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub global_role: Option<OrgRole>,
    #[serde(default)]
    pub is_system_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewAssignment {
    pub user_id: UserId,
    pub scope: OrgScope,
    pub role: OrgRole,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OrgRoleAssignment {
    pub assignment_id: AssignmentId,
    pub user_id: UserId,
    pub scope: OrgScope,
    pub role: OrgRole,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

const ASSIGNMENT_COLUMNS: &str =
    "assignment_id, user_id, company_id, business_unit_id, location_id, role, created_at";

struct AssignmentRow {
    assignment_id: String,
    user_id: String,
    company_id: String,
    business_unit_id: Option<String>,
    location_id: Option<String>,
    role: String,
    created_at: String,
}

fn assignment_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AssignmentRow> {
    Ok(AssignmentRow {
        assignment_id: row.get(0)?,
        user_id: row.get(1)?,
        company_id: row.get(2)?,
        business_unit_id: row.get(3)?,
        location_id: row.get(4)?,
        role: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl AssignmentRow {
    fn into_assignment(self) -> Result<OrgRoleAssignment> {
        Ok(OrgRoleAssignment {
            assignment_id: stored(AssignmentId::parse(&self.assignment_id))?,
            user_id: stored_user(&self.user_id)?,
            scope: stored_scope(
                Some(&self.company_id),
                self.business_unit_id.as_deref(),
                self.location_id.as_deref(),
            )?,
            role: parse_role(&self.role)?,
            created_at: parse_rfc3339(&self.created_at)?,
        })
    }
}

fn parse_role(raw: &str) -> Result<OrgRole> {
    OrgRole::parse(raw).ok_or_else(|| anyhow!("unknown stored role: {raw}"))
}

impl SqliteStore {
    /// # Errors
    /// Returns an error when the name is blank or the insert fails.
    pub fn create_company(&mut self, name: &str) -> Result<Company> {
        let name = required_name(name)?;
        let company = Company {
            company_id: CompanyId::new(),
            name,
            created_at: OffsetDateTime::now_utc(),
        };
        self.conn
            .execute(
                "INSERT INTO companies(company_id, name, created_at) VALUES (?1, ?2, ?3)",
                params![company.company_id.to_string(), company.name, rfc3339(company.created_at)?],
            )
            .context("failed to insert company")?;
        Ok(company)
    }

    /// # Errors
    /// Returns [`OrgError::NotFound`] when the company does not exist.
    pub fn create_business_unit(&mut self, company_id: CompanyId, name: &str) -> Result<BusinessUnit> {
        let name = required_name(name)?;
        if !exists(
            &self.conn,
            "SELECT 1 FROM companies WHERE company_id = ?1",
            &company_id.to_string(),
        )? {
            return Err(OrgError::NotFound(format!("company {company_id}")).into());
        }

        let unit = BusinessUnit {
            business_unit_id: BusinessUnitId::new(),
            company_id,
            name,
            created_at: OffsetDateTime::now_utc(),
        };
        self.conn
            .execute(
                "INSERT INTO business_units(business_unit_id, company_id, name, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    unit.business_unit_id.to_string(),
                    unit.company_id.to_string(),
                    unit.name,
                    rfc3339(unit.created_at)?
                ],
            )
            .context("failed to insert business unit")?;
        Ok(unit)
    }

    /// Create a location under `business_unit_id`; the company is derived from the unit.
    ///
    /// # Errors
    /// Returns [`OrgError::NotFound`] when the business unit does not exist.
    pub fn create_location(&mut self, business_unit_id: BusinessUnitId, name: &str) -> Result<Location> {
        let name = required_name(name)?;
        let company_id = self
            .business_unit_company(business_unit_id)?
            .ok_or_else(|| OrgError::NotFound(format!("business unit {business_unit_id}")))?;

        let location = Location {
            location_id: LocationId::new(),
            business_unit_id,
            company_id,
            name,
            created_at: OffsetDateTime::now_utc(),
        };
        self.conn
            .execute(
                "INSERT INTO locations(location_id, business_unit_id, company_id, name, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    location.location_id.to_string(),
                    location.business_unit_id.to_string(),
                    location.company_id.to_string(),
                    location.name,
                    rfc3339(location.created_at)?
                ],
            )
            .context("failed to insert location")?;
        Ok(location)
    }

    /// # Errors
    /// Returns an error when the upsert fails.
    pub fn upsert_user(&mut self, account: &UserAccount) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO users(user_id, display_name, global_role, is_system_admin)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                   display_name = excluded.display_name,
                   global_role = excluded.global_role,
                   is_system_admin = excluded.is_system_admin",
                params![
                    account.user_id.as_str(),
                    account.display_name,
                    account.global_role.map(OrgRole::as_str),
                    account.is_system_admin,
                ],
            )
            .with_context(|| format!("failed to upsert user {}", account.user_id))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the lookup fails or stored values are corrupt.
    pub fn get_user(&self, user_id: &UserId) -> Result<Option<UserAccount>> {
        let raw = self
            .conn
            .query_row(
                "SELECT display_name, global_role, is_system_admin FROM users WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, bool>(2)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to load user {user_id}"))?;

        raw.map(|(display_name, global_role, is_system_admin)| {
            Ok(UserAccount {
                user_id: user_id.clone(),
                display_name,
                global_role: global_role.as_deref().map(parse_role).transpose()?,
                is_system_admin,
            })
        })
        .transpose()
    }

    /// Whether any account bypasses scoping, either as a system admin or through a
    /// global admin/owner role.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn has_bypass_user(&self) -> Result<bool> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM users
                 WHERE is_system_admin = 1 OR global_role IN ('admin', 'owner')",
                [],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count bypass users")?;
        Ok(count > 0)
    }

    /// Check that every id in `scope` exists and that narrower ids belong to the
    /// broader ones named alongside them.
    ///
    /// # Errors
    /// Returns [`OrgError::Validation`] for malformed or inconsistent scopes.
    pub fn validate_scope(&self, scope: &OrgScope) -> Result<()> {
        scope.validate()?;

        if let Some(company_id) = scope.company_id {
            if !exists(
                &self.conn,
                "SELECT 1 FROM companies WHERE company_id = ?1",
                &company_id.to_string(),
            )? {
                return Err(OrgError::Validation(format!("company {company_id} does not exist")).into());
            }
        }

        if let Some(business_unit_id) = scope.business_unit_id {
            let owner = self.business_unit_company(business_unit_id)?.ok_or_else(|| {
                OrgError::Validation(format!("business unit {business_unit_id} does not exist"))
            })?;
            if scope.company_id != Some(owner) {
                return Err(OrgError::Validation(format!(
                    "business unit {business_unit_id} does not belong to the given company"
                ))
                .into());
            }
        }

        if let Some(location_id) = scope.location_id {
            let parent = self
                .conn
                .query_row(
                    "SELECT business_unit_id FROM locations WHERE location_id = ?1",
                    params![location_id.to_string()],
                    |row| row.get::<_, String>(0),
                )
                .optional()
                .with_context(|| format!("failed to load location {location_id}"))?
                .ok_or_else(|| {
                    OrgError::Validation(format!("location {location_id} does not exist"))
                })?;
            if scope.business_unit_id.map(|id| id.to_string()) != Some(parent) {
                return Err(OrgError::Validation(format!(
                    "location {location_id} does not belong to the given business unit"
                ))
                .into());
            }
        }

        Ok(())
    }

    /// # Errors
    /// Returns [`OrgError::Validation`] when the scope lacks a company or is inconsistent,
    /// and [`OrgError::NotFound`] when the user is unknown.
    pub fn assign_role(&mut self, input: &NewAssignment) -> Result<OrgRoleAssignment> {
        let Some(company_id) = input.scope.company_id else {
            return Err(OrgError::Validation(
                "company_id MUST be provided for role assignments".to_string(),
            )
            .into());
        };
        self.validate_scope(&input.scope)?;
        if self.get_user(&input.user_id)?.is_none() {
            return Err(OrgError::NotFound(format!("user {}", input.user_id)).into());
        }

        let assignment = OrgRoleAssignment {
            assignment_id: AssignmentId::new(),
            user_id: input.user_id.clone(),
            scope: input.scope,
            role: input.role,
            created_at: OffsetDateTime::now_utc(),
        };
        let (_, business_unit_id, location_id) = scope_columns(&input.scope);
        self.conn
            .execute(
                "INSERT INTO org_role_assignments(
                   assignment_id, user_id, company_id, business_unit_id, location_id, role, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    assignment.assignment_id.to_string(),
                    assignment.user_id.as_str(),
                    company_id.to_string(),
                    business_unit_id,
                    location_id,
                    assignment.role.as_str(),
                    rfc3339(assignment.created_at)?
                ],
            )
            .context("failed to insert role assignment")?;
        Ok(assignment)
    }

    /// # Errors
    /// Returns an error when the lookup fails or stored values are corrupt.
    pub fn list_assignments(&self, user_id: &UserId) -> Result<Vec<OrgRoleAssignment>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ASSIGNMENT_COLUMNS} FROM org_role_assignments
                 WHERE user_id = ?1 ORDER BY created_at ASC, assignment_id ASC"
            ))
            .context("failed to prepare assignment listing")?;
        let rows = stmt.query_map(params![user_id.as_str()], assignment_row)?;

        let mut assignments = Vec::new();
        for row in rows {
            assignments.push(row?.into_assignment()?);
        }
        Ok(assignments)
    }

    /// Point `user_id`'s session at one of their own assignments.
    ///
    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the assignment is missing or belongs to
    /// someone else.
    pub fn activate_assignment(
        &mut self,
        user_id: &UserId,
        assignment_id: AssignmentId,
    ) -> Result<OrgRoleAssignment> {
        let assignment = self
            .conn
            .query_row(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM org_role_assignments
                     WHERE assignment_id = ?1 AND user_id = ?2"
                ),
                params![assignment_id.to_string(), user_id.as_str()],
                assignment_row,
            )
            .optional()
            .with_context(|| format!("failed to load assignment {assignment_id}"))?
            .ok_or(OrgError::AccessDenied)?
            .into_assignment()?;

        self.conn
            .execute(
                "INSERT INTO active_assignments(user_id, assignment_id, activated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                   assignment_id = excluded.assignment_id,
                   activated_at = excluded.activated_at",
                params![user_id.as_str(), assignment_id.to_string(), now_rfc3339()?],
            )
            .context("failed to activate assignment")?;
        tracing::info!(user_id = %user_id, assignment_id = %assignment_id, "activated role assignment");
        Ok(assignment)
    }

    /// Build the request-scoped access context for `user_id`.
    ///
    /// Unknown users resolve to a plain context with no privileges.
    ///
    /// # Errors
    /// Returns an error when lookups fail or stored values are corrupt.
    pub fn resolve_context(&self, user_id: &UserId) -> Result<OrgAccessContext> {
        let account = self.get_user(user_id)?;
        let mut context = OrgAccessContext {
            global_role: account.as_ref().and_then(|account| account.global_role),
            is_system_admin: account.as_ref().is_some_and(|account| account.is_system_admin),
            ..OrgAccessContext::unassigned(user_id.clone())
        };

        let active = self
            .conn
            .query_row(
                "SELECT a.assignment_id, a.user_id, a.company_id, a.business_unit_id,
                        a.location_id, a.role, a.created_at
                 FROM active_assignments p
                 JOIN org_role_assignments a ON a.assignment_id = p.assignment_id
                 WHERE p.user_id = ?1",
                params![user_id.as_str()],
                assignment_row,
            )
            .optional()
            .with_context(|| format!("failed to load active assignment for {user_id}"))?;

        if let Some(row) = active {
            let assignment = row.into_assignment()?;
            context.company_id = assignment.scope.company_id;
            context.business_unit_id = assignment.scope.business_unit_id;
            context.location_id = assignment.scope.location_id;
            context.context_role = Some(assignment.role);
        }

        tracing::debug!(
            user_id = %user_id,
            company_id = ?context.company_id,
            context_role = ?context.context_role,
            "resolved access context"
        );
        Ok(context)
    }

    /// Company that owns `business_unit_id`, if the unit exists.
    ///
    /// # Errors
    /// Returns an error when the lookup fails or stored values are corrupt.
    pub fn business_unit_company(&self, business_unit_id: BusinessUnitId) -> Result<Option<CompanyId>> {
        let raw = self
            .conn
            .query_row(
                "SELECT company_id FROM business_units WHERE business_unit_id = ?1",
                params![business_unit_id.to_string()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to load business unit {business_unit_id}"))?;
        raw.map(|company| stored(CompanyId::parse(&company))).transpose()
    }
}

fn required_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(OrgError::Validation("name MUST be provided".to_string()).into());
    }
    Ok(trimmed.to_string())
}
