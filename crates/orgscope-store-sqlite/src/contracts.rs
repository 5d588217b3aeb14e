use anyhow::{Context, Result};
use orgscope_core::{ContractId, OrgAccessContext, OrgError, OrgScope, ScopedResource, UserId};
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{
    parse_rfc3339, rfc3339, scope_columns, stored, stored_scope, stored_user, ScopeColumns,
    ScopedWhere, SqliteStore,
};

/// The primary scoped business record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contract {
    pub contract_id: ContractId,
    pub title: String,
    pub counterparty: Option<String>,
    pub scope: OrgScope,
    pub created_by: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl ScopedResource for Contract {
    fn scope(&self) -> OrgScope {
        self.scope
    }

    fn created_by(&self) -> &UserId {
        &self.created_by
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewContract {
    pub title: String,
    #[serde(default)]
    pub counterparty: Option<String>,
    pub scope: OrgScope,
    pub created_by: UserId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ContractPatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub counterparty: Option<String>,
}

const CONTRACT_COLUMNS: &str = "contract_id, title, counterparty, company_id, business_unit_id, \
                                location_id, created_by, created_at, updated_at";

struct ContractRow {
    contract_id: String,
    title: String,
    counterparty: Option<String>,
    company_id: Option<String>,
    business_unit_id: Option<String>,
    location_id: Option<String>,
    created_by: String,
    created_at: String,
    updated_at: String,
}

fn contract_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ContractRow> {
    Ok(ContractRow {
        contract_id: row.get(0)?,
        title: row.get(1)?,
        counterparty: row.get(2)?,
        company_id: row.get(3)?,
        business_unit_id: row.get(4)?,
        location_id: row.get(5)?,
        created_by: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

impl ContractRow {
    fn into_contract(self) -> Result<Contract> {
        Ok(Contract {
            contract_id: stored(ContractId::parse(&self.contract_id))?,
            title: self.title,
            counterparty: self.counterparty,
            scope: stored_scope(
                self.company_id.as_deref(),
                self.business_unit_id.as_deref(),
                self.location_id.as_deref(),
            )?,
            created_by: stored_user(&self.created_by)?,
            created_at: parse_rfc3339(&self.created_at)?,
            updated_at: parse_rfc3339(&self.updated_at)?,
        })
    }
}

fn required_title(title: &str) -> Result<String> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(OrgError::Validation("title MUST be provided".to_string()).into());
    }
    Ok(trimmed.to_string())
}

impl SqliteStore {
    /// # Errors
    /// Returns [`OrgError::Validation`] for a blank title or an inconsistent scope.
    pub fn create_contract(&mut self, input: &NewContract) -> Result<Contract> {
        let title = required_title(&input.title)?;
        self.validate_scope(&input.scope)?;

        let now = OffsetDateTime::now_utc();
        let contract = Contract {
            contract_id: ContractId::new(),
            title,
            counterparty: input.counterparty.clone(),
            scope: input.scope,
            created_by: input.created_by.clone(),
            created_at: now,
            updated_at: now,
        };
        let (company_id, business_unit_id, location_id) = scope_columns(&contract.scope);
        self.conn
            .execute(
                &format!("INSERT INTO contracts({CONTRACT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
                params![
                    contract.contract_id.to_string(),
                    contract.title,
                    contract.counterparty,
                    company_id,
                    business_unit_id,
                    location_id,
                    contract.created_by.as_str(),
                    rfc3339(contract.created_at)?,
                    rfc3339(contract.updated_at)?
                ],
            )
            .context("failed to insert contract")?;
        Ok(contract)
    }

    /// Unfiltered fetch; callers run the access validator on the result.
    ///
    /// # Errors
    /// Returns an error when the lookup fails or stored values are corrupt.
    pub fn get_contract(&self, contract_id: ContractId) -> Result<Option<Contract>> {
        self.conn
            .query_row(
                &format!("SELECT {CONTRACT_COLUMNS} FROM contracts WHERE contract_id = ?1"),
                params![contract_id.to_string()],
                contract_row,
            )
            .optional()
            .with_context(|| format!("failed to load contract {contract_id}"))?
            .map(ContractRow::into_contract)
            .transpose()
    }

    /// # Errors
    /// Returns an error when the query fails or stored values are corrupt.
    pub fn list_contracts(&self, context: &OrgAccessContext) -> Result<Vec<Contract>> {
        let visible = ScopedWhere::for_listing(context, &ScopeColumns::DEFAULT, "created_by");
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {CONTRACT_COLUMNS} FROM contracts WHERE {}
                 ORDER BY created_at ASC, contract_id ASC",
                visible.sql()
            ))
            .context("failed to prepare contract listing")?;
        let rows = stmt.query_map(params_from_iter(visible.params()), contract_row)?;

        let mut contracts = Vec::new();
        for row in rows {
            contracts.push(row?.into_contract()?);
        }
        Ok(contracts)
    }

    /// # Errors
    /// Returns [`OrgError::NotFound`] when the contract does not exist.
    pub fn update_contract(&mut self, contract_id: ContractId, patch: &ContractPatch) -> Result<Contract> {
        let mut contract = self
            .get_contract(contract_id)?
            .ok_or_else(|| OrgError::NotFound(format!("contract {contract_id}")))?;
        if let Some(title) = &patch.title {
            contract.title = required_title(title)?;
        }
        if patch.counterparty.is_some() {
            contract.counterparty.clone_from(&patch.counterparty);
        }
        contract.updated_at = OffsetDateTime::now_utc();

        self.conn
            .execute(
                "UPDATE contracts SET title = ?1, counterparty = ?2, updated_at = ?3
                 WHERE contract_id = ?4",
                params![
                    contract.title,
                    contract.counterparty,
                    rfc3339(contract.updated_at)?,
                    contract_id.to_string()
                ],
            )
            .with_context(|| format!("failed to update contract {contract_id}"))?;
        Ok(contract)
    }
}
