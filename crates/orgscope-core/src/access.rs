use serde::{Deserialize, Serialize};

use crate::{BusinessUnitId, CompanyId, LocationId, OrgError, OrgRole, OrgScope, UserId};

/// Request-scoped view of who is asking and from which organizational position.
///
/// Built once per request from the caller's active role assignment and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct OrgAccessContext {
    pub user_id: UserId,
    pub company_id: Option<CompanyId>,
    pub business_unit_id: Option<BusinessUnitId>,
    pub location_id: Option<LocationId>,
    pub context_role: Option<OrgRole>,
    pub global_role: Option<OrgRole>,
    pub is_system_admin: bool,
}

impl OrgAccessContext {
    /// Context for a caller with no active assignment and no global privileges.
    #[must_use]
    pub fn unassigned(user_id: UserId) -> Self {
        Self {
            user_id,
            company_id: None,
            business_unit_id: None,
            location_id: None,
            context_role: None,
            global_role: None,
            is_system_admin: false,
        }
    }

    #[must_use]
    pub fn bypasses_scope(&self) -> bool {
        self.is_system_admin || self.global_role.is_some_and(OrgRole::is_admin_or_owner)
    }

    #[must_use]
    pub fn has_active_context(&self) -> bool {
        self.company_id.is_some()
            || self.business_unit_id.is_some()
            || self.location_id.is_some()
            || self.context_role.is_some()
    }

    #[must_use]
    pub fn scope(&self) -> OrgScope {
        OrgScope {
            company_id: self.company_id,
            business_unit_id: self.business_unit_id,
            location_id: self.location_id,
        }
    }
}

/// Row-visibility predicate over a resource's scope columns.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScopeFilter {
    Unrestricted,
    Location { location_id: LocationId },
    BusinessUnit { business_unit_id: BusinessUnitId },
    Company { company_id: CompanyId, include_legacy: bool },
    DenyAll,
}

impl ScopeFilter {
    #[must_use]
    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Self::Unrestricted)
    }

    #[must_use]
    pub fn matches(&self, scope: &OrgScope) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Location { location_id } => scope.location_id == Some(*location_id),
            Self::BusinessUnit { business_unit_id } => {
                scope.business_unit_id == Some(*business_unit_id)
            }
            Self::Company { company_id, include_legacy } => match scope.company_id {
                Some(row_company) => row_company == *company_id,
                None => *include_legacy,
            },
            Self::DenyAll => false,
        }
    }
}

/// Turn an access context into a visibility predicate.
///
/// Checks run in a fixed order and the first match wins; scope level is evaluated
/// before role, so a location admin still only sees that location.
///
/// A context with no assignment at all yields [`ScopeFilter::Unrestricted`]; callers
/// MUST pair that with an ownership constraint. A context carrying a role but no
/// organizational ids yields [`ScopeFilter::DenyAll`].
#[must_use]
pub fn build_filter(context: &OrgAccessContext) -> ScopeFilter {
    if context.bypasses_scope() {
        return ScopeFilter::Unrestricted;
    }

    if !context.has_active_context() {
        return ScopeFilter::Unrestricted;
    }

    if let Some(location_id) = context.location_id {
        return ScopeFilter::Location { location_id };
    }

    if let Some(business_unit_id) = context.business_unit_id {
        return ScopeFilter::BusinessUnit { business_unit_id };
    }

    if let Some(company_id) = context.company_id {
        let include_legacy = context.context_role.is_some_and(OrgRole::is_admin_or_owner);
        return ScopeFilter::Company { company_id, include_legacy };
    }

    ScopeFilter::DenyAll
}

/// Copy of `context` whose session role can no longer influence visibility.
#[must_use]
pub fn visibility_context(context: &OrgAccessContext) -> OrgAccessContext {
    OrgAccessContext { context_role: context.context_role.map(|_| OrgRole::User), ..context.clone() }
}

/// Visibility predicate decided purely by hierarchy level.
#[must_use]
pub fn visibility_filter(context: &OrgAccessContext) -> ScopeFilter {
    build_filter(&visibility_context(context))
}

/// Whether `context` may modify a resource originally created by `created_by`.
///
/// Uses the caller's original session role, never the downgraded one.
#[must_use]
pub fn edit_authority(context: &OrgAccessContext, created_by: &UserId) -> bool {
    if context.bypasses_scope() {
        return true;
    }
    context.context_role.is_some_and(OrgRole::grants_edit) || context.user_id == *created_by
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AccessIntent {
    Read,
    Write,
}

/// A resource carrying tenancy columns and an accountable creator.
pub trait ScopedResource {
    fn scope(&self) -> OrgScope;
    fn created_by(&self) -> &UserId;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Authorized<R> {
    pub resource: R,
    pub can_edit: bool,
}

/// Decide whether `context` may read, or write, one fetched resource.
///
/// `resource` is `None` when the lookup found nothing; that case is reported exactly
/// like an unauthorized one so callers cannot probe for existence.
///
/// # Errors
/// Returns [`OrgError::AccessDenied`] when the resource is missing, invisible to the
/// caller, or the intent is [`AccessIntent::Write`] without edit authority.
pub fn validate_access<R: ScopedResource>(
    resource: Option<R>,
    context: &OrgAccessContext,
    intent: AccessIntent,
) -> Result<Authorized<R>, OrgError> {
    let Some(resource) = resource else {
        return Err(OrgError::AccessDenied);
    };

    if !context.bypasses_scope() {
        if context.company_id.is_none() {
            return Err(OrgError::AccessDenied);
        }
        if !visibility_filter(context).matches(&resource.scope()) {
            return Err(OrgError::AccessDenied);
        }
    }

    let can_edit = edit_authority(context, resource.created_by());
    if intent == AccessIntent::Write && !can_edit {
        return Err(OrgError::AccessDenied);
    }

    Ok(Authorized { resource, can_edit })
}
