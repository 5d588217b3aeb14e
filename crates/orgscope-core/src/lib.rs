use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use ulid::Ulid;

mod access;
mod filter;
mod import;
mod lineage;
mod mapping;

pub use access::{
    build_filter, edit_authority, validate_access, visibility_context, visibility_filter,
    AccessIntent, Authorized, OrgAccessContext, ScopeFilter, ScopedResource,
};
pub use filter::{FilterCondition, FilterMode, FilterOperator, ImportFilter};
pub use import::{
    external_key, stage_rows, validate_cron_expression, CanonicalRecord, CommitSummary,
    ImportJob, ImportJobStatus, ImportJobType, ImportSchedule, ImportedRecord,
    ImportedRecordStatus, RowFailure, StagedRow, MAX_ROWS_PER_JOB,
};
pub use lineage::{
    approval_plan, ensure_deletable, ensure_deprecatable, resolve_lineage, revert_plan,
    sort_history, ApprovalPlan, LineageSource, RevertPlan, MAX_LINEAGE_STEPS,
};
pub use mapping::{
    FieldRule, FieldTransform, FieldValue, MappingContent, MappingDraft, MappingPatch,
    MappingStatus, MappingVersion, Row, TransformOutcome,
};

/// Uniform message for every denied or unresolvable access attempt.
pub const ACCESS_DENIED_MESSAGE: &str = "Access denied";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum OrgError {
    #[error("Access denied")]
    AccessDenied,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("system error: {0}")]
    System(String),
}

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse an identifier from its canonical ULID text.
            ///
            /// # Errors
            /// Returns [`OrgError::Validation`] when `raw` is not a valid ULID.
            pub fn parse(raw: &str) -> Result<Self, OrgError> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    OrgError::Validation(format!("invalid {} `{raw}`: {err}", $label))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(CompanyId, "company_id");
ulid_id!(BusinessUnitId, "business_unit_id");
ulid_id!(LocationId, "location_id");
ulid_id!(AssignmentId, "assignment_id");
ulid_id!(ContractId, "contract_id");
ulid_id!(MappingId, "mapping_id");
ulid_id!(ImportJobId, "job_id");
ulid_id!(ImportedRecordId, "record_id");
ulid_id!(CanonicalRecordId, "canonical_record_id");
ulid_id!(ScheduleId, "schedule_id");

/// Opaque user identifier issued by the external authentication layer.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    /// # Errors
    /// Returns [`OrgError::Validation`] when the identifier is blank.
    pub fn parse(raw: &str) -> Result<Self, OrgError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(OrgError::Validation("user_id MUST be provided".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = OrgError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrgRole {
    User,
    Admin,
    Owner,
    CompanyAdmin,
}

impl OrgRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::Owner => "owner",
            Self::CompanyAdmin => "company_admin",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "admin" => Some(Self::Admin),
            "owner" => Some(Self::Owner),
            "company_admin" => Some(Self::CompanyAdmin),
            _ => None,
        }
    }

    /// Roles that widen company-level visibility to legacy rows, and that bypass
    /// scoping entirely when held as a global role.
    #[must_use]
    pub fn is_admin_or_owner(self) -> bool {
        matches!(self, Self::Admin | Self::Owner)
    }

    #[must_use]
    pub fn grants_edit(self) -> bool {
        matches!(self, Self::Admin | Self::Owner | Self::CompanyAdmin)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HierarchyLevel {
    Company,
    BusinessUnit,
    Location,
}

/// The three nullable tenancy columns carried by every scoped resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash, Default)]
pub struct OrgScope {
    #[serde(default)]
    pub company_id: Option<CompanyId>,
    #[serde(default)]
    pub business_unit_id: Option<BusinessUnitId>,
    #[serde(default)]
    pub location_id: Option<LocationId>,
}

impl OrgScope {
    #[must_use]
    pub fn company(company_id: CompanyId) -> Self {
        Self { company_id: Some(company_id), business_unit_id: None, location_id: None }
    }

    #[must_use]
    pub fn business_unit(company_id: CompanyId, business_unit_id: BusinessUnitId) -> Self {
        Self { company_id: Some(company_id), business_unit_id: Some(business_unit_id), location_id: None }
    }

    #[must_use]
    pub fn location(
        company_id: CompanyId,
        business_unit_id: BusinessUnitId,
        location_id: LocationId,
    ) -> Self {
        Self {
            company_id: Some(company_id),
            business_unit_id: Some(business_unit_id),
            location_id: Some(location_id),
        }
    }

    /// A legacy record predates hierarchy adoption and carries no company.
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.company_id.is_none()
    }

    #[must_use]
    pub fn level(&self) -> Option<HierarchyLevel> {
        if self.location_id.is_some() {
            Some(HierarchyLevel::Location)
        } else if self.business_unit_id.is_some() {
            Some(HierarchyLevel::BusinessUnit)
        } else if self.company_id.is_some() {
            Some(HierarchyLevel::Company)
        } else {
            None
        }
    }

    /// Check that narrower ids never appear without their enclosing ids.
    ///
    /// # Errors
    /// Returns [`OrgError::Validation`] when a location lacks its business unit or a
    /// business unit lacks its company.
    pub fn validate(&self) -> Result<(), OrgError> {
        if self.location_id.is_some() && self.business_unit_id.is_none() {
            return Err(OrgError::Validation(
                "business_unit_id MUST be provided with location_id".to_string(),
            ));
        }
        if self.business_unit_id.is_some() && self.company_id.is_none() {
            return Err(OrgError::Validation(
                "company_id MUST be provided with business_unit_id".to_string(),
            ));
        }
        Ok(())
    }
}
