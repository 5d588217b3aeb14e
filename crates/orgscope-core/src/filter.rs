use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{FieldValue, OrgError, Row};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    GreaterThan,
    LessThan,
    Between,
    In,
    NotIn,
    IsEmpty,
    IsNotEmpty,
}

impl FilterOperator {
    fn needs_value(self) -> bool {
        !matches!(self, Self::IsEmpty | Self::IsNotEmpty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FilterCondition {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub value_end: Option<String>,
}

/// Declarative pre-import predicate list combined by a single mode.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct ImportFilter {
    #[serde(default)]
    pub mode: FilterMode,
    #[serde(default)]
    pub conditions: Vec<FilterCondition>,
}

impl ImportFilter {
    /// # Errors
    /// Returns [`OrgError::Validation`] when a condition names no field, omits the
    /// comparison value its operator needs, or a `between` lacks `value_end`.
    pub fn validate(&self) -> Result<(), OrgError> {
        for condition in &self.conditions {
            if condition.field.trim().is_empty() {
                return Err(OrgError::Validation("filter field MUST be provided".to_string()));
            }
            if condition.operator.needs_value() && condition.value.is_none() {
                return Err(OrgError::Validation(format!(
                    "filter on `{}` MUST provide a value",
                    condition.field
                )));
            }
            if condition.operator == FilterOperator::Between && condition.value_end.is_none() {
                return Err(OrgError::Validation(format!(
                    "between filter on `{}` MUST provide value_end",
                    condition.field
                )));
            }
        }
        Ok(())
    }

    /// Whether `row` passes the filter. An empty condition list admits everything.
    #[must_use]
    pub fn admits(&self, row: &Row) -> bool {
        if self.conditions.is_empty() {
            return true;
        }
        match self.mode {
            FilterMode::All => self.conditions.iter().all(|condition| condition.holds(row)),
            FilterMode::Any => self.conditions.iter().any(|condition| condition.holds(row)),
        }
    }
}

impl FilterCondition {
    fn holds(&self, row: &Row) -> bool {
        let cell = row.get(&self.field).unwrap_or(&FieldValue::Null);
        let expected = self.value.as_deref().unwrap_or_default();

        match self.operator {
            FilterOperator::IsEmpty => cell.is_empty(),
            FilterOperator::IsNotEmpty => !cell.is_empty(),
            FilterOperator::Equals => compare(cell, expected) == Some(Ordering::Equal),
            FilterOperator::NotEquals => compare(cell, expected) != Some(Ordering::Equal),
            FilterOperator::Contains => folded(cell).contains(&expected.to_lowercase()),
            FilterOperator::NotContains => !folded(cell).contains(&expected.to_lowercase()),
            FilterOperator::StartsWith => folded(cell).starts_with(&expected.to_lowercase()),
            FilterOperator::GreaterThan => compare(cell, expected) == Some(Ordering::Greater),
            FilterOperator::LessThan => compare(cell, expected) == Some(Ordering::Less),
            FilterOperator::Between => {
                let end = self.value_end.as_deref().unwrap_or_default();
                matches!(compare(cell, expected), Some(Ordering::Greater | Ordering::Equal))
                    && matches!(compare(cell, end), Some(Ordering::Less | Ordering::Equal))
            }
            FilterOperator::In => in_set(cell, expected),
            FilterOperator::NotIn => !in_set(cell, expected),
        }
    }
}

fn folded(cell: &FieldValue) -> String {
    cell.as_text().unwrap_or_default().to_lowercase()
}

/// Numeric when both sides parse as numbers, case-insensitive text otherwise.
/// Null cells never compare.
fn compare(cell: &FieldValue, expected: &str) -> Option<Ordering> {
    if matches!(cell, FieldValue::Null) {
        return None;
    }
    let expected_number = expected.trim().parse::<f64>().ok();
    match (cell.as_number(), expected_number) {
        (Some(lhs), Some(rhs)) => lhs.partial_cmp(&rhs),
        _ => Some(folded(cell).trim().cmp(expected.to_lowercase().trim())),
    }
}

fn in_set(cell: &FieldValue, expected: &str) -> bool {
    expected.split(',').any(|member| compare(cell, member) == Some(Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(field: &str, operator: FilterOperator, value: Option<&str>) -> FilterCondition {
        FilterCondition {
            field: field.to_string(),
            operator,
            value: value.map(str::to_string),
            value_end: None,
        }
    }

    fn row(pairs: &[(&str, FieldValue)]) -> Row {
        pairs.iter().map(|(key, value)| ((*key).to_string(), value.clone())).collect()
    }

    fn text(value: &str) -> FieldValue {
        FieldValue::Text(value.to_string())
    }

    // Test IDs: TFLT-001
    #[test]
    fn all_mode_requires_every_condition() {
        let filter = ImportFilter {
            mode: FilterMode::All,
            conditions: vec![
                condition("region", FilterOperator::Equals, Some("north")),
                condition("amount", FilterOperator::GreaterThan, Some("100")),
            ],
        };

        assert!(filter.admits(&row(&[("region", text("North")), ("amount", text("150"))])));
        assert!(!filter.admits(&row(&[("region", text("North")), ("amount", text("99"))])));
        assert!(!filter.admits(&row(&[("amount", FieldValue::Number(500.0))])));
    }

    // Test IDs: TFLT-002
    #[test]
    fn any_mode_accepts_a_single_match() {
        let filter = ImportFilter {
            mode: FilterMode::Any,
            conditions: vec![
                condition("sku", FilterOperator::StartsWith, Some("ab")),
                condition("status", FilterOperator::In, Some("open, pending")),
            ],
        };

        assert!(filter.admits(&row(&[("sku", text("ABC-1"))])));
        assert!(filter.admits(&row(&[("status", text("Pending"))])));
        assert!(!filter.admits(&row(&[("sku", text("ZZ")), ("status", text("closed"))])));
    }

    // Test IDs: TFLT-003
    #[test]
    fn range_and_emptiness_operators() {
        let between = ImportFilter {
            mode: FilterMode::All,
            conditions: vec![FilterCondition {
                field: "qty".to_string(),
                operator: FilterOperator::Between,
                value: Some("10".to_string()),
                value_end: Some("20".to_string()),
            }],
        };
        assert!(between.admits(&row(&[("qty", FieldValue::Number(10.0))])));
        assert!(between.admits(&row(&[("qty", text("20"))])));
        assert!(!between.admits(&row(&[("qty", FieldValue::Number(21.0))])));
        assert!(!between.admits(&row(&[])));

        let empties = ImportFilter {
            mode: FilterMode::All,
            conditions: vec![
                condition("note", FilterOperator::IsEmpty, None),
                condition("name", FilterOperator::IsNotEmpty, None),
                condition("name", FilterOperator::NotContains, Some("test")),
                condition("name", FilterOperator::NotIn, Some("x,y")),
            ],
        };
        assert!(empties.admits(&row(&[("note", text("  ")), ("name", text("Acme"))])));
        assert!(!empties.admits(&row(&[("name", text("Acme Test"))])));
    }

    // Test IDs: TFLT-004
    #[test]
    fn validation_requires_operator_values() {
        let missing_value = ImportFilter {
            mode: FilterMode::All,
            conditions: vec![condition("a", FilterOperator::Contains, None)],
        };
        assert!(matches!(missing_value.validate(), Err(OrgError::Validation(_))));

        let missing_end = ImportFilter {
            mode: FilterMode::All,
            conditions: vec![condition("a", FilterOperator::Between, Some("1"))],
        };
        assert!(matches!(missing_end.validate(), Err(OrgError::Validation(_))));

        assert!(ImportFilter::default().validate().is_ok());
        assert!(ImportFilter::default().admits(&Row::new()));
    }
}
