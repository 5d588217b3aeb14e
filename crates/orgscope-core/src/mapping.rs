use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{MappingId, OrgError, OrgScope, ScopedResource, UserId};

/// One scalar cell of a decoded source or target row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// Render the value as text; `None` for null.
    #[must_use]
    pub fn as_text(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::Bool(value) => Some(value.to_string()),
            Self::Number(value) => Some(value.to_string()),
            Self::Text(value) => Some(value.clone()),
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(value) => value.trim().parse::<f64>().ok().filter(|parsed| parsed.is_finite()),
            Self::Null | Self::Bool(_) => None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Null => true,
            Self::Text(value) => value.trim().is_empty(),
            Self::Bool(_) | Self::Number(_) => false,
        }
    }
}

/// A decoded row keyed by column name.
pub type Row = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldTransform {
    Copy {
        source: String,
    },
    Constant {
        value: FieldValue,
    },
    Concat {
        sources: Vec<String>,
        #[serde(default)]
        separator: String,
    },
    Lookup {
        source: String,
        table: BTreeMap<String, String>,
        #[serde(default)]
        default: Option<String>,
    },
    Number {
        source: String,
    },
    TrimUpper {
        source: String,
    },
}

impl FieldTransform {
    fn sources(&self) -> Vec<&str> {
        match self {
            Self::Copy { source }
            | Self::Lookup { source, .. }
            | Self::Number { source }
            | Self::TrimUpper { source } => vec![source.as_str()],
            Self::Concat { sources, .. } => sources.iter().map(String::as_str).collect(),
            Self::Constant { .. } => Vec::new(),
        }
    }

    fn apply(&self, row: &Row) -> Result<FieldValue, String> {
        let source_value = |name: &str| row.get(name).cloned().unwrap_or(FieldValue::Null);

        match self {
            Self::Copy { source } => Ok(source_value(source)),
            Self::Constant { value } => Ok(value.clone()),
            Self::Concat { sources, separator } => {
                let parts = sources
                    .iter()
                    .filter_map(|name| source_value(name).as_text())
                    .filter(|part| !part.trim().is_empty())
                    .collect::<Vec<_>>();
                if parts.is_empty() {
                    Ok(FieldValue::Null)
                } else {
                    Ok(FieldValue::Text(parts.join(separator)))
                }
            }
            Self::Lookup { source, table, default } => {
                let value = source_value(source);
                let Some(key) = value.as_text() else {
                    return Ok(default.clone().map_or(FieldValue::Null, FieldValue::Text));
                };
                match table.get(key.trim()).or(default.as_ref()) {
                    Some(mapped) => Ok(FieldValue::Text(mapped.clone())),
                    None => Err(format!("no lookup entry for `{}` in `{source}`", key.trim())),
                }
            }
            Self::Number { source } => {
                let value = source_value(source);
                if value.is_empty() {
                    return Ok(FieldValue::Null);
                }
                value.as_number().map(FieldValue::Number).ok_or_else(|| {
                    format!("`{}` in `{source}` is not a number", value.as_text().unwrap_or_default())
                })
            }
            Self::TrimUpper { source } => Ok(source_value(source)
                .as_text()
                .map_or(FieldValue::Null, |text| FieldValue::Text(text.trim().to_uppercase()))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldRule {
    pub target: String,
    pub transform: FieldTransform,
    #[serde(default)]
    pub required: bool,
}

/// Typed mapping body: how one source row becomes one canonical target row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingContent {
    pub entity_type: String,
    #[serde(default)]
    pub key_field: Option<String>,
    pub rules: Vec<FieldRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformOutcome {
    pub target_record: Row,
    pub validation_errors: Vec<String>,
}

impl MappingContent {
    /// Parse and validate mapping content from JSON text.
    ///
    /// # Errors
    /// Returns [`OrgError::Validation`] when the JSON is malformed or fails
    /// [`MappingContent::validate`].
    pub fn from_json_str(raw: &str) -> Result<Self, OrgError> {
        let content: Self = serde_json::from_str(raw)
            .map_err(|err| OrgError::Validation(format!("invalid mapping content: {err}")))?;
        content.validate()?;
        Ok(content)
    }

    /// Validate the mapping at write time.
    ///
    /// # Errors
    /// Returns [`OrgError::Validation`] when the entity type is blank, no rules are
    /// declared, targets are blank or duplicated, a transform names no source, or the
    /// key field is not one of the declared targets.
    pub fn validate(&self) -> Result<(), OrgError> {
        if self.entity_type.trim().is_empty() {
            return Err(OrgError::Validation("entity_type MUST be provided".to_string()));
        }
        if self.rules.is_empty() {
            return Err(OrgError::Validation("mapping MUST declare at least one rule".to_string()));
        }

        let mut targets = BTreeSet::new();
        for rule in &self.rules {
            if rule.target.trim().is_empty() {
                return Err(OrgError::Validation("rule target MUST be non-empty".to_string()));
            }
            if !targets.insert(rule.target.as_str()) {
                return Err(OrgError::Validation(format!(
                    "rule target `{}` is declared more than once",
                    rule.target
                )));
            }
            if let FieldTransform::Concat { sources, .. } = &rule.transform {
                if sources.is_empty() {
                    return Err(OrgError::Validation(format!(
                        "concat rule for `{}` MUST name at least one source",
                        rule.target
                    )));
                }
            }
            if rule.transform.sources().iter().any(|source| source.trim().is_empty()) {
                return Err(OrgError::Validation(format!(
                    "rule for `{}` has an empty source column",
                    rule.target
                )));
            }
        }

        if let Some(key_field) = &self.key_field {
            if !targets.contains(key_field.as_str()) {
                return Err(OrgError::Validation(format!(
                    "key_field `{key_field}` MUST be one of the rule targets"
                )));
            }
        }

        Ok(())
    }

    /// Apply every rule to one source row.
    ///
    /// Rule failures never abort the row; they are collected as validation errors and
    /// the affected target field is left null.
    #[must_use]
    pub fn transform_row(&self, row: &Row) -> TransformOutcome {
        let mut target_record = Row::new();
        let mut validation_errors = Vec::new();

        for rule in &self.rules {
            let value = match rule.transform.apply(row) {
                Ok(value) => value,
                Err(message) => {
                    validation_errors.push(format!("{}: {message}", rule.target));
                    FieldValue::Null
                }
            };
            if rule.required && value.is_empty() {
                validation_errors.push(format!("{} is required", rule.target));
            }
            target_record.insert(rule.target.clone(), value);
        }

        TransformOutcome { target_record, validation_errors }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Draft,
    Approved,
    Deprecated,
}

impl MappingStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Approved => "approved",
            Self::Deprecated => "deprecated",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "approved" => Some(Self::Approved),
            "deprecated" => Some(Self::Deprecated),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingVersion {
    pub mapping_id: MappingId,
    pub parent_mapping_id: Option<MappingId>,
    pub name: String,
    pub version: u32,
    pub status: MappingStatus,
    pub scope: OrgScope,
    pub content: MappingContent,
    pub notes: Option<String>,
    pub created_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub approved_by: Option<UserId>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub approved_at: Option<OffsetDateTime>,
}

impl ScopedResource for MappingVersion {
    fn scope(&self) -> OrgScope {
        self.scope
    }

    fn created_by(&self) -> &UserId {
        &self.created_by
    }
}

/// Input for a new lineage root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MappingDraft {
    pub name: String,
    pub scope: OrgScope,
    pub content: MappingContent,
    #[serde(default)]
    pub notes: Option<String>,
}

impl MappingDraft {
    /// # Errors
    /// Returns [`OrgError::Validation`] when the name is blank or content is invalid.
    pub fn validate(&self) -> Result<(), OrgError> {
        if self.name.trim().is_empty() {
            return Err(OrgError::Validation("name MUST be provided".to_string()));
        }
        self.scope.validate()?;
        self.content.validate()
    }
}

/// Fields a new version may override; anything left `None` is inherited from the parent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MappingPatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content: Option<MappingContent>,
    #[serde(default)]
    pub notes: Option<String>,
}
