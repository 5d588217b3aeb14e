use orgscope_core::{build_filter, OrgAccessContext, ScopeFilter};
use rusqlite::types::Value;

/// Names of the three scope columns on one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeColumns {
    pub company: &'static str,
    pub business_unit: &'static str,
    pub location: &'static str,
}

impl ScopeColumns {
    pub const DEFAULT: Self =
        Self { company: "company_id", business_unit: "business_unit_id", location: "location_id" };
}

impl Default for ScopeColumns {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// A conjunction of SQL predicates and their positional parameters.
///
/// Org scoping is only ever combined with other predicates through `AND`, so a
/// resource-specific condition can never widen what the scope filter admits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopedWhere {
    clauses: Vec<String>,
    params: Vec<Value>,
}

impl ScopedWhere {
    /// Render `filter` against `columns`.
    #[must_use]
    pub fn for_filter(filter: &ScopeFilter, columns: &ScopeColumns) -> Self {
        let empty = Self::default();
        match *filter {
            ScopeFilter::Unrestricted => empty,
            ScopeFilter::DenyAll => empty.and("1 = 0", []),
            ScopeFilter::Location { location_id } => empty
                .and(format!("{} = ?", columns.location), [Value::Text(location_id.to_string())]),
            ScopeFilter::BusinessUnit { business_unit_id } => empty.and(
                format!("{} = ?", columns.business_unit),
                [Value::Text(business_unit_id.to_string())],
            ),
            ScopeFilter::Company { company_id, include_legacy: true } => empty.and(
                format!("({0} = ? OR {0} IS NULL)", columns.company),
                [Value::Text(company_id.to_string())],
            ),
            ScopeFilter::Company { company_id, include_legacy: false } => empty
                .and(format!("{} = ?", columns.company), [Value::Text(company_id.to_string())]),
        }
    }

    /// Listing visibility for `context`. Callers with no active assignment and no
    /// bypass only see rows they own through `owner_column`.
    #[must_use]
    pub fn for_listing(context: &OrgAccessContext, columns: &ScopeColumns, owner_column: &str) -> Self {
        let scoped = Self::for_filter(&build_filter(context), columns);
        if context.bypasses_scope() || context.has_active_context() {
            return scoped;
        }
        scoped.and(format!("{owner_column} = ?"), [Value::Text(context.user_id.to_string())])
    }

    #[must_use]
    pub fn and(mut self, clause: impl Into<String>, params: impl IntoIterator<Item = Value>) -> Self {
        self.clauses.push(clause.into());
        self.params.extend(params);
        self
    }

    #[must_use]
    pub fn sql(&self) -> String {
        if self.clauses.is_empty() {
            return "1 = 1".to_string();
        }
        self.clauses.join(" AND ")
    }

    #[must_use]
    pub fn params(&self) -> &[Value] {
        &self.params
    }
}
