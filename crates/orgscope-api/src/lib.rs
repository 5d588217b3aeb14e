use std::path::{Path, PathBuf};

use anyhow::Result;
use orgscope_core::{
    build_filter, validate_access, AccessIntent, AssignmentId, Authorized, BusinessUnitId,
    CanonicalRecord, CommitSummary, CompanyId, ContractId, ImportFilter, ImportJob, ImportJobId,
    ImportJobType, ImportSchedule, ImportedRecord, MappingContent, MappingDraft, MappingId,
    MappingPatch, MappingVersion, OrgAccessContext, OrgError, OrgScope, Row, ScheduleId,
    ScopedResource, UserId,
};
use orgscope_store_sqlite::{
    ApprovalOutcome, BusinessUnit, Company, Contract, ContractPatch, IntegrityReport, Location,
    NewAssignment, NewContract, NewSchedule, OrgRoleAssignment, SchemaStatus, SqliteStore,
    StageRequest, UserAccount,
};
use serde::{Deserialize, Serialize};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateContractRequest {
    pub title: String,
    #[serde(default)]
    pub counterparty: Option<String>,
    #[serde(default)]
    pub scope: Option<OrgScope>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateMappingRequest {
    pub name: String,
    pub content: MappingContent,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub scope: Option<OrgScope>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageImportRequest {
    pub mapping_id: MappingId,
    pub job_type: ImportJobType,
    #[serde(default)]
    pub source_name: Option<String>,
    pub rows: Vec<Row>,
    #[serde(default)]
    pub filter: Option<ImportFilter>,
    #[serde(default)]
    pub scope: Option<OrgScope>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CreateScheduleRequest {
    pub mapping_id: MappingId,
    pub cron_expression: String,
    pub job_type: ImportJobType,
    #[serde(default)]
    pub scope: Option<OrgScope>,
}

/// How a failed call should be surfaced to an outer boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorClass {
    /// Unauthorized and missing resources alike.
    AccessDenied,
    Validation(String),
    Internal,
}

/// Classify `err` by the domain error it carries, looking through any context layers.
#[must_use]
pub fn classify_error(err: &anyhow::Error) -> ErrorClass {
    match err.downcast_ref::<OrgError>() {
        Some(OrgError::AccessDenied | OrgError::NotFound(_)) => ErrorClass::AccessDenied,
        Some(OrgError::Validation(message)) => ErrorClass::Validation(message.clone()),
        Some(OrgError::System(_)) | None => ErrorClass::Internal,
    }
}

/// Scope for a row the caller is about to create.
///
/// Defaults to the caller's own position. Callers without a scope bypass must sit in
/// a company and may only create rows their own listing filter would show them.
fn resolve_write_scope(
    context: &OrgAccessContext,
    requested: Option<OrgScope>,
) -> Result<OrgScope, OrgError> {
    let scope = requested.unwrap_or_else(|| context.scope());
    if context.bypasses_scope() {
        return Ok(scope);
    }
    if context.company_id.is_none() || scope.company_id.is_none() {
        return Err(OrgError::AccessDenied);
    }
    if !build_filter(context).matches(&scope) {
        return Err(OrgError::AccessDenied);
    }
    Ok(scope)
}

/// Org structure changes need a bypass or an editing role held at company level.
fn require_company_admin(context: &OrgAccessContext, company_id: CompanyId) -> Result<(), OrgError> {
    if context.bypasses_scope() {
        return Ok(());
    }
    let company_level = context.company_id == Some(company_id)
        && context.business_unit_id.is_none()
        && context.location_id.is_none();
    if company_level && context.context_role.is_some_and(orgscope_core::OrgRole::grants_edit) {
        return Ok(());
    }
    Err(OrgError::AccessDenied)
}

fn authorize<R: ScopedResource>(
    resource: Option<R>,
    context: &OrgAccessContext,
    intent: AccessIntent,
) -> Result<Authorized<R>> {
    validate_access(resource, context, intent).map_err(|err| {
        tracing::warn!(user_id = %context.user_id, ?intent, "access denied");
        anyhow::Error::from(err)
    })
}

#[derive(Debug, Clone)]
pub struct OrgScopeApi {
    db_path: PathBuf,
}

impl OrgScopeApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db_path)
    }

    /// Open and migrate the store, then resolve who `caller` is acting as.
    fn session(&self, caller: &UserId) -> Result<(SqliteStore, OrgAccessContext)> {
        let mut store = self.open_store()?;
        store.migrate()?;
        let context = store.resolve_context(caller)?;
        Ok((store, context))
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.backup_database(out_file)
    }

    /// The access context `caller` currently acts under.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened or queried.
    pub fn resolve_context(&self, caller: &UserId) -> Result<OrgAccessContext> {
        let (_, context) = self.session(caller)?;
        Ok(context)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] unless the caller bypasses scoping.
    pub fn create_company(&self, caller: &UserId, name: &str) -> Result<Company> {
        let (mut store, context) = self.session(caller)?;
        if !context.bypasses_scope() {
            return Err(OrgError::AccessDenied.into());
        }
        store.create_company(name)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] unless the caller administers the company.
    pub fn create_business_unit(
        &self,
        caller: &UserId,
        company_id: CompanyId,
        name: &str,
    ) -> Result<BusinessUnit> {
        let (mut store, context) = self.session(caller)?;
        require_company_admin(&context, company_id)?;
        store.create_business_unit(company_id, name)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] unless the caller administers the owning company.
    pub fn create_location(
        &self,
        caller: &UserId,
        business_unit_id: BusinessUnitId,
        name: &str,
    ) -> Result<Location> {
        let (mut store, context) = self.session(caller)?;
        let company_id =
            store.business_unit_company(business_unit_id)?.ok_or(OrgError::AccessDenied)?;
        require_company_admin(&context, company_id)?;
        store.create_location(business_unit_id, name)
    }

    /// Create or update a user account.
    ///
    /// Open to anyone until the first account that bypasses scoping exists (a system
    /// admin or a global admin/owner), so a fresh database can be bootstrapped.
    ///
    /// # Errors
    /// Returns [`OrgError::AccessDenied`] once such an account exists and the caller does
    /// not bypass scoping.
    pub fn upsert_user(&self, caller: &UserId, account: &UserAccount) -> Result<UserAccount> {
        let (mut store, context) = self.session(caller)?;
        if !context.bypasses_scope() && store.has_bypass_user()? {
            return Err(OrgError::AccessDenied.into());
        }
        store.upsert_user(account)?;
        tracing::info!(user_id = %account.user_id, "upserted user account");
        Ok(account.clone())
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] unless the caller administers the target company.
    pub fn assign_role(&self, caller: &UserId, input: &NewAssignment) -> Result<OrgRoleAssignment> {
        let (mut store, context) = self.session(caller)?;
        let company_id = input.scope.company_id.ok_or_else(|| {
            OrgError::Validation("company_id MUST be provided for role assignments".to_string())
        })?;
        require_company_admin(&context, company_id)?;
        store.assign_role(input)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the assignment is not the caller's own.
    pub fn activate_assignment(
        &self,
        caller: &UserId,
        assignment_id: AssignmentId,
    ) -> Result<OrgRoleAssignment> {
        let (mut store, _) = self.session(caller)?;
        store.activate_assignment(caller, assignment_id)
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or queried.
    pub fn list_assignments(&self, caller: &UserId) -> Result<Vec<OrgRoleAssignment>> {
        let (store, _) = self.session(caller)?;
        store.list_assignments(caller)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the caller may not create rows at the
    /// requested scope.
    pub fn create_contract(&self, caller: &UserId, input: CreateContractRequest) -> Result<Contract> {
        let (mut store, context) = self.session(caller)?;
        let scope = resolve_write_scope(&context, input.scope)?;
        store.create_contract(&NewContract {
            title: input.title,
            counterparty: input.counterparty,
            scope,
            created_by: caller.clone(),
        })
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or queried.
    pub fn list_contracts(&self, caller: &UserId) -> Result<Vec<Contract>> {
        let (store, context) = self.session(caller)?;
        store.list_contracts(&context)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the contract is missing or not visible.
    pub fn get_contract(&self, caller: &UserId, contract_id: ContractId) -> Result<Authorized<Contract>> {
        let (store, context) = self.session(caller)?;
        authorize(store.get_contract(contract_id)?, &context, AccessIntent::Read)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the caller may not edit the contract.
    pub fn update_contract(
        &self,
        caller: &UserId,
        contract_id: ContractId,
        patch: &ContractPatch,
    ) -> Result<Contract> {
        let (mut store, context) = self.session(caller)?;
        authorize(store.get_contract(contract_id)?, &context, AccessIntent::Write)?;
        store.update_contract(contract_id, patch)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] for a forbidden scope and
    /// [`OrgError::Validation`] for invalid content.
    pub fn create_mapping(&self, caller: &UserId, input: CreateMappingRequest) -> Result<MappingVersion> {
        let (mut store, context) = self.session(caller)?;
        let scope = resolve_write_scope(&context, input.scope)?;
        store.create_mapping(
            &MappingDraft { name: input.name, scope, content: input.content, notes: input.notes },
            caller,
        )
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the version is missing or not visible.
    pub fn get_mapping(&self, caller: &UserId, mapping_id: MappingId) -> Result<Authorized<MappingVersion>> {
        let (store, context) = self.session(caller)?;
        authorize(store.get_mapping(mapping_id)?, &context, AccessIntent::Read)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the caller may not edit the parent.
    pub fn create_mapping_version(
        &self,
        caller: &UserId,
        parent_id: MappingId,
        patch: &MappingPatch,
    ) -> Result<MappingVersion> {
        let (mut store, context) = self.session(caller)?;
        authorize(store.get_mapping(parent_id)?, &context, AccessIntent::Write)?;
        store.create_version(parent_id, patch, caller)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the caller may not edit the version and
    /// [`OrgError::Validation`] when it is not a draft.
    pub fn approve_mapping(&self, caller: &UserId, mapping_id: MappingId) -> Result<ApprovalOutcome> {
        let (mut store, context) = self.session(caller)?;
        authorize(store.get_mapping(mapping_id)?, &context, AccessIntent::Write)?;
        store.approve_mapping(mapping_id, caller)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the caller may not edit the version.
    pub fn deprecate_mapping(&self, caller: &UserId, mapping_id: MappingId) -> Result<MappingVersion> {
        let (mut store, context) = self.session(caller)?;
        authorize(store.get_mapping(mapping_id)?, &context, AccessIntent::Write)?;
        store.deprecate_mapping(mapping_id)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the caller may not edit the version.
    pub fn revert_mapping(
        &self,
        caller: &UserId,
        mapping_id: MappingId,
        target_version: u32,
    ) -> Result<MappingVersion> {
        let (mut store, context) = self.session(caller)?;
        authorize(store.get_mapping(mapping_id)?, &context, AccessIntent::Write)?;
        store.revert_mapping(mapping_id, target_version, caller)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the version is missing or not visible.
    pub fn mapping_history(&self, caller: &UserId, mapping_id: MappingId) -> Result<Vec<MappingVersion>> {
        let (store, context) = self.session(caller)?;
        authorize(store.get_mapping(mapping_id)?, &context, AccessIntent::Read)?;
        store.mapping_history(mapping_id)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the caller may not edit the version and
    /// [`OrgError::Validation`] unless it is a deletable draft.
    pub fn delete_mapping_draft(&self, caller: &UserId, mapping_id: MappingId) -> Result<()> {
        let (mut store, context) = self.session(caller)?;
        authorize(store.get_mapping(mapping_id)?, &context, AccessIntent::Write)?;
        store.delete_mapping_draft(mapping_id)
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or queried.
    pub fn list_mappings(&self, caller: &UserId) -> Result<Vec<MappingVersion>> {
        let (store, context) = self.session(caller)?;
        store.list_mappings(&context)
    }

    /// Stage rows against a mapping the caller can see. Import jobs commit immediately.
    ///
    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the mapping or requested scope is out of
    /// reach and [`OrgError::Validation`] when the mapping cannot run this job type.
    pub fn stage_import(&self, caller: &UserId, input: StageImportRequest) -> Result<ImportJob> {
        let (mut store, context) = self.session(caller)?;
        authorize(store.get_mapping(input.mapping_id)?, &context, AccessIntent::Read)?;
        let scope = resolve_write_scope(&context, input.scope)?;
        store.stage_import(&StageRequest {
            mapping_id: input.mapping_id,
            job_type: input.job_type,
            scope,
            uploaded_by: caller.clone(),
            source_name: input.source_name,
            rows: input.rows,
            filter: input.filter,
        })
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the caller may not edit the job.
    pub fn commit_import(&self, caller: &UserId, job_id: ImportJobId) -> Result<CommitSummary> {
        let (mut store, context) = self.session(caller)?;
        authorize(store.get_import_job(job_id)?, &context, AccessIntent::Write)?;
        store.commit_import(job_id)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the caller may not edit the job.
    pub fn discard_import(&self, caller: &UserId, job_id: ImportJobId) -> Result<usize> {
        let (mut store, context) = self.session(caller)?;
        authorize(store.get_import_job(job_id)?, &context, AccessIntent::Write)?;
        store.discard_import(job_id)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the caller may not edit the job.
    pub fn retry_failed_import(&self, caller: &UserId, job_id: ImportJobId) -> Result<usize> {
        let (mut store, context) = self.session(caller)?;
        authorize(store.get_import_job(job_id)?, &context, AccessIntent::Write)?;
        store.retry_failed_import(job_id)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the job is missing or not visible.
    pub fn get_import_job(&self, caller: &UserId, job_id: ImportJobId) -> Result<Authorized<ImportJob>> {
        let (store, context) = self.session(caller)?;
        authorize(store.get_import_job(job_id)?, &context, AccessIntent::Read)
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or queried.
    pub fn list_import_jobs(&self, caller: &UserId) -> Result<Vec<ImportJob>> {
        let (store, context) = self.session(caller)?;
        store.list_import_jobs(&context)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the job is missing or not visible.
    pub fn list_imported_records(&self, caller: &UserId, job_id: ImportJobId) -> Result<Vec<ImportedRecord>> {
        let (store, context) = self.session(caller)?;
        authorize(store.get_import_job(job_id)?, &context, AccessIntent::Read)?;
        store.list_imported_records(job_id)
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or queried.
    pub fn list_canonical_records(&self, caller: &UserId) -> Result<Vec<CanonicalRecord>> {
        let (store, context) = self.session(caller)?;
        store.list_canonical_records(&context)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the mapping or scope is out of reach and
    /// [`OrgError::Validation`] for a malformed cron expression.
    pub fn create_schedule(&self, caller: &UserId, input: CreateScheduleRequest) -> Result<ImportSchedule> {
        let (mut store, context) = self.session(caller)?;
        authorize(store.get_mapping(input.mapping_id)?, &context, AccessIntent::Read)?;
        let scope = resolve_write_scope(&context, input.scope)?;
        store.create_schedule(&NewSchedule {
            mapping_id: input.mapping_id,
            cron_expression: input.cron_expression,
            job_type: input.job_type,
            scope,
            created_by: caller.clone(),
        })
    }

    /// # Errors
    /// Returns an error when the store cannot be opened or queried.
    pub fn list_schedules(&self, caller: &UserId) -> Result<Vec<ImportSchedule>> {
        let (store, context) = self.session(caller)?;
        store.list_schedules(&context)
    }

    /// # Errors
    /// Returns [`OrgError::AccessDenied`] when the caller may not edit the schedule.
    pub fn set_schedule_enabled(
        &self,
        caller: &UserId,
        schedule_id: ScheduleId,
        enabled: bool,
    ) -> Result<ImportSchedule> {
        let (mut store, context) = self.session(caller)?;
        authorize(store.get_schedule(schedule_id)?, &context, AccessIntent::Write)?;
        store.set_schedule_enabled(schedule_id, enabled)
    }
}

#[cfg(test)]
mod tests {
    use orgscope_core::{
        FieldRule, FieldTransform, FieldValue, ImportJobStatus, MappingStatus, OrgRole,
    };

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("orgscope-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = std::fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    fn user(raw: &str) -> UserId {
        match UserId::parse(raw) {
            Ok(id) => id,
            Err(err) => panic!("invalid fixture user `{raw}`: {err}"),
        }
    }

    struct Fixture {
        api: OrgScopeApi,
        db_path: PathBuf,
        root: UserId,
        acme: Company,
        globex: Company,
    }

    /// Bootstrap a system admin and two companies.
    fn fixture() -> Result<Fixture> {
        let db_path = unique_temp_db_path();
        let api = OrgScopeApi::new(db_path.clone());
        let root = user("root");
        api.upsert_user(
            &root,
            &UserAccount {
                user_id: root.clone(),
                display_name: "Root".to_string(),
                global_role: None,
                is_system_admin: true,
            },
        )?;
        let acme = api.create_company(&root, "Acme")?;
        let globex = api.create_company(&root, "Globex")?;
        Ok(Fixture { api, db_path, root, acme, globex })
    }

    impl Fixture {
        fn member(&self, name: &str, scope: OrgScope, role: OrgRole) -> Result<UserId> {
            let user_id = user(name);
            self.api.upsert_user(
                &self.root,
                &UserAccount {
                    user_id: user_id.clone(),
                    display_name: name.to_string(),
                    global_role: None,
                    is_system_admin: false,
                },
            )?;
            let assignment = self.api.assign_role(
                &self.root,
                &NewAssignment { user_id: user_id.clone(), scope, role },
            )?;
            self.api.activate_assignment(&user_id, assignment.assignment_id)?;
            Ok(user_id)
        }
    }

    fn content() -> MappingContent {
        MappingContent {
            entity_type: "customer".to_string(),
            key_field: Some("email".to_string()),
            rules: vec![
                FieldRule {
                    target: "email".to_string(),
                    transform: FieldTransform::Copy { source: "Email".to_string() },
                    required: true,
                },
                FieldRule {
                    target: "tier".to_string(),
                    transform: FieldTransform::Constant { value: FieldValue::Text("gold".to_string()) },
                    required: false,
                },
            ],
        }
    }

    fn email_row(email: &str) -> Row {
        Row::from([("Email".to_string(), FieldValue::Text(email.to_string()))])
    }

    // Test IDs: TAPI-001
    #[test]
    fn missing_and_foreign_contracts_are_denied_alike() -> Result<()> {
        let fx = fixture()?;
        let alice = fx.member("alice", OrgScope::company(fx.acme.company_id), OrgRole::User)?;
        let gary = fx.member("gary", OrgScope::company(fx.globex.company_id), OrgRole::Admin)?;

        let contract = fx.api.create_contract(
            &alice,
            CreateContractRequest { title: "MSA".to_string(), counterparty: None, scope: None },
        )?;
        assert_eq!(contract.scope, OrgScope::company(fx.acme.company_id));

        let Err(foreign) = fx.api.get_contract(&gary, contract.contract_id) else {
            panic!("expected a foreign contract to be denied");
        };
        let Err(missing) = fx.api.get_contract(&gary, ContractId::new()) else {
            panic!("expected a missing contract to be denied");
        };
        assert_eq!(classify_error(&foreign), ErrorClass::AccessDenied);
        assert_eq!(classify_error(&missing), ErrorClass::AccessDenied);
        assert_eq!(foreign.to_string(), missing.to_string());

        let own = fx.api.get_contract(&alice, contract.contract_id)?;
        assert!(own.can_edit);

        cleanup(&fx.db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn edit_authority_follows_original_role_or_ownership() -> Result<()> {
        let fx = fixture()?;
        let company = OrgScope::company(fx.acme.company_id);
        let author = fx.member("author", company, OrgRole::User)?;
        let reader = fx.member("reader", company, OrgRole::User)?;
        let admin = fx.member("boss", company, OrgRole::CompanyAdmin)?;

        let contract = fx.api.create_contract(
            &author,
            CreateContractRequest { title: "NDA".to_string(), counterparty: None, scope: None },
        )?;
        let patch = ContractPatch { title: Some("NDA v2".to_string()), counterparty: None };

        let view = fx.api.get_contract(&reader, contract.contract_id)?;
        assert!(!view.can_edit);
        let Err(err) = fx.api.update_contract(&reader, contract.contract_id, &patch) else {
            panic!("expected a non-owner user edit to be denied");
        };
        assert_eq!(classify_error(&err), ErrorClass::AccessDenied);

        assert_eq!(fx.api.update_contract(&admin, contract.contract_id, &patch)?.title, "NDA v2");
        assert!(fx.api.update_contract(&author, contract.contract_id, &ContractPatch::default()).is_ok());

        cleanup(&fx.db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn write_scope_must_sit_inside_the_callers_filter() -> Result<()> {
        let fx = fixture()?;
        let alice = fx.member("alice", OrgScope::company(fx.acme.company_id), OrgRole::Admin)?;

        let foreign = fx.api.create_contract(
            &alice,
            CreateContractRequest {
                title: "Sneaky".to_string(),
                counterparty: None,
                scope: Some(OrgScope::company(fx.globex.company_id)),
            },
        );
        let Err(err) = foreign else {
            panic!("expected a foreign-company write to be denied");
        };
        assert_eq!(classify_error(&err), ErrorClass::AccessDenied);

        let legacy = fx.api.create_contract(
            &alice,
            CreateContractRequest {
                title: "Legacy".to_string(),
                counterparty: None,
                scope: Some(OrgScope::default()),
            },
        );
        assert!(legacy.is_err());

        let unassigned = user("drifter");
        let Err(err) = fx.api.create_contract(
            &unassigned,
            CreateContractRequest { title: "Orphan".to_string(), counterparty: None, scope: None },
        ) else {
            panic!("expected a companyless write to be denied");
        };
        assert_eq!(classify_error(&err), ErrorClass::AccessDenied);

        cleanup(&fx.db_path);
        Ok(())
    }

    // Test IDs: TAPI-004
    #[test]
    fn mapping_lifecycle_and_import_through_the_facade() -> Result<()> {
        let fx = fixture()?;
        let owner = fx.member("olga", OrgScope::company(fx.acme.company_id), OrgRole::Owner)?;
        let outsider = fx.member("otto", OrgScope::company(fx.globex.company_id), OrgRole::Owner)?;

        let v1 = fx.api.create_mapping(
            &owner,
            CreateMappingRequest { name: "crm".to_string(), content: content(), notes: None, scope: None },
        )?;
        let Err(err) = fx.api.stage_import(
            &owner,
            StageImportRequest {
                mapping_id: v1.mapping_id,
                job_type: ImportJobType::Import,
                source_name: None,
                rows: vec![email_row("a@example.com")],
                filter: None,
                scope: None,
            },
        ) else {
            panic!("expected an import on a draft mapping to fail");
        };
        assert!(matches!(classify_error(&err), ErrorClass::Validation(_)));

        let outcome = fx.api.approve_mapping(&owner, v1.mapping_id)?;
        assert_eq!(outcome.approved.status, MappingStatus::Approved);
        assert!(fx.api.approve_mapping(&outsider, v1.mapping_id).is_err());

        let job = fx.api.stage_import(
            &owner,
            StageImportRequest {
                mapping_id: v1.mapping_id,
                job_type: ImportJobType::Import,
                source_name: Some("crm.csv".to_string()),
                rows: vec![email_row("a@example.com"), email_row("b@example.com")],
                filter: None,
                scope: None,
            },
        )?;
        assert_eq!(job.status, ImportJobStatus::Completed);
        assert_eq!(fx.api.list_canonical_records(&owner)?.len(), 2);
        assert!(fx.api.list_canonical_records(&outsider)?.is_empty());
        assert_eq!(fx.api.list_imported_records(&owner, job.job_id)?.len(), 2);

        let Err(err) = fx.api.list_imported_records(&outsider, job.job_id) else {
            panic!("expected a foreign job to be denied");
        };
        assert_eq!(classify_error(&err), ErrorClass::AccessDenied);

        let v2 = fx.api.create_mapping_version(&owner, v1.mapping_id, &MappingPatch::default())?;
        let reverted = fx.api.revert_mapping(&owner, v2.mapping_id, 1)?;
        assert_eq!(reverted.version, 3);
        let history = fx.api.mapping_history(&owner, v1.mapping_id)?;
        assert_eq!(history.iter().map(|member| member.version).collect::<Vec<_>>(), vec![3, 2, 1]);

        cleanup(&fx.db_path);
        Ok(())
    }

    // Test IDs: TAPI-005
    #[test]
    fn org_administration_requires_privileges() -> Result<()> {
        let fx = fixture()?;
        let plain = fx.member("pat", OrgScope::company(fx.acme.company_id), OrgRole::User)?;
        let admin = fx.member("ada", OrgScope::company(fx.acme.company_id), OrgRole::Admin)?;

        assert!(fx.api.create_company(&admin, "Rogue").is_err());
        assert!(fx.api.create_business_unit(&plain, fx.acme.company_id, "Ops").is_err());
        assert!(fx.api.create_business_unit(&admin, fx.globex.company_id, "Ops").is_err());

        let unit = fx.api.create_business_unit(&admin, fx.acme.company_id, "Ops")?;
        let location = fx.api.create_location(&admin, unit.business_unit_id, "Oslo")?;
        assert_eq!(location.company_id, fx.acme.company_id);

        let Err(err) = fx.api.upsert_user(
            &plain,
            &UserAccount {
                user_id: plain.clone(),
                display_name: "Pat".to_string(),
                global_role: Some(OrgRole::Owner),
                is_system_admin: true,
            },
        ) else {
            panic!("expected self-promotion to be denied");
        };
        assert_eq!(classify_error(&err), ErrorClass::AccessDenied);

        cleanup(&fx.db_path);
        Ok(())
    }

    // Test IDs: TAPI-006
    #[test]
    fn bootstrap_closes_once_a_global_owner_exists() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = OrgScopeApi::new(db_path.clone());
        let first = user("first");
        api.upsert_user(
            &first,
            &UserAccount {
                user_id: first.clone(),
                display_name: "First".to_string(),
                global_role: Some(OrgRole::Owner),
                is_system_admin: false,
            },
        )?;

        let intruder = user("intruder");
        let Err(err) = api.upsert_user(
            &intruder,
            &UserAccount {
                user_id: intruder.clone(),
                display_name: "Intruder".to_string(),
                global_role: Some(OrgRole::Owner),
                is_system_admin: false,
            },
        ) else {
            panic!("expected a second anonymous upsert to be denied");
        };
        assert_eq!(classify_error(&err), ErrorClass::AccessDenied);
        assert!(!api.resolve_context(&intruder)?.bypasses_scope());

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn classify_error_sees_through_context() {
        let denied = anyhow::Error::from(OrgError::NotFound("x".to_string())).context("loading x");
        assert_eq!(classify_error(&denied), ErrorClass::AccessDenied);

        let invalid = anyhow::Error::from(OrgError::Validation("bad".to_string()));
        assert_eq!(classify_error(&invalid), ErrorClass::Validation("bad".to_string()));

        assert_eq!(classify_error(&anyhow::anyhow!("disk on fire")), ErrorClass::Internal);
        assert_eq!(
            classify_error(&anyhow::Error::from(OrgError::System("cycle".to_string()))),
            ErrorClass::Internal
        );
    }
}
