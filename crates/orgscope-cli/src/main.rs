use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use orgscope_api::{
    classify_error, CreateContractRequest, CreateMappingRequest, CreateScheduleRequest,
    ErrorClass, OrgScopeApi, StageImportRequest,
};
use orgscope_core::{
    AssignmentId, BusinessUnitId, CompanyId, ContractId, ImportFilter, ImportJobId, ImportJobType,
    LocationId, MappingContent, MappingId, MappingPatch, OrgRole, OrgScope, Row, ScheduleId,
    UserId, ACCESS_DENIED_MESSAGE,
};
use orgscope_store_sqlite::{ContractPatch, NewAssignment, UserAccount};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "osc")]
#[command(about = "OrgScope CLI")]
struct Cli {
    #[arg(long, env = "ORGSCOPE_DB", default_value = "./orgscope.sqlite3")]
    db: PathBuf,

    /// Identity the command acts as.
    #[arg(long, env = "ORGSCOPE_USER")]
    user: Option<String>,

    #[arg(long, env = "ORGSCOPE_LOG", default_value = "warn")]
    log: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Org {
        #[command(subcommand)]
        command: Box<OrgCommand>,
    },
    Contract {
        #[command(subcommand)]
        command: Box<ContractCommand>,
    },
    Mapping {
        #[command(subcommand)]
        command: Box<MappingCommand>,
    },
    Import {
        #[command(subcommand)]
        command: Box<ImportCommand>,
    },
    Schedule {
        #[command(subcommand)]
        command: Box<ScheduleCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum OrgCommand {
    CompanyCreate(NameArgs),
    UnitCreate(UnitCreateArgs),
    LocationCreate(LocationCreateArgs),
    UserUpsert(UserUpsertArgs),
    Assign(AssignArgs),
    Assignments,
    Activate(ActivateArgs),
    Context,
}

#[derive(Debug, Args)]
struct NameArgs {
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
struct UnitCreateArgs {
    #[arg(long)]
    company_id: String,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
struct LocationCreateArgs {
    #[arg(long)]
    business_unit_id: String,
    #[arg(long)]
    name: String,
}

#[derive(Debug, Args)]
struct UserUpsertArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long)]
    display_name: String,
    #[arg(long, value_enum)]
    global_role: Option<RoleArg>,
    #[arg(long, default_value_t = false)]
    system_admin: bool,
}

#[derive(Debug, Args)]
struct AssignArgs {
    #[arg(long)]
    user_id: String,
    #[arg(long, value_enum)]
    role: RoleArg,
    #[command(flatten)]
    scope: ScopeArgs,
}

#[derive(Debug, Args)]
struct ActivateArgs {
    #[arg(long)]
    assignment_id: String,
}

/// Optional target scope; omitted entirely means the caller's own position.
#[derive(Debug, Args)]
struct ScopeArgs {
    #[arg(long)]
    company_id: Option<String>,
    #[arg(long)]
    business_unit_id: Option<String>,
    #[arg(long)]
    location_id: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ContractCommand {
    Create(ContractCreateArgs),
    List,
    Show(ContractIdArgs),
    Update(ContractUpdateArgs),
}

#[derive(Debug, Args)]
struct ContractCreateArgs {
    #[arg(long)]
    title: String,
    #[arg(long)]
    counterparty: Option<String>,
    #[command(flatten)]
    scope: ScopeArgs,
}

#[derive(Debug, Args)]
struct ContractIdArgs {
    #[arg(long)]
    contract_id: String,
}

#[derive(Debug, Args)]
struct ContractUpdateArgs {
    #[arg(long)]
    contract_id: String,
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    counterparty: Option<String>,
}

#[derive(Debug, Subcommand)]
enum MappingCommand {
    Create(MappingCreateArgs),
    List,
    Show(MappingIdArgs),
    NewVersion(MappingVersionArgs),
    Approve(MappingIdArgs),
    Deprecate(MappingIdArgs),
    Revert(MappingRevertArgs),
    History(MappingIdArgs),
    Delete(MappingIdArgs),
}

#[derive(Debug, Args)]
struct MappingCreateArgs {
    #[arg(long)]
    name: String,
    /// JSON file holding the mapping content.
    #[arg(long)]
    content_file: PathBuf,
    #[arg(long)]
    notes: Option<String>,
    #[command(flatten)]
    scope: ScopeArgs,
}

#[derive(Debug, Args)]
struct MappingIdArgs {
    #[arg(long)]
    mapping_id: String,
}

#[derive(Debug, Args)]
struct MappingVersionArgs {
    #[arg(long)]
    mapping_id: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    content_file: Option<PathBuf>,
    #[arg(long)]
    notes: Option<String>,
}

#[derive(Debug, Args)]
struct MappingRevertArgs {
    #[arg(long)]
    mapping_id: String,
    #[arg(long)]
    target_version: u32,
}

#[derive(Debug, Subcommand)]
enum ImportCommand {
    Stage(ImportStageArgs),
    List,
    Show(JobIdArgs),
    Commit(JobIdArgs),
    Discard(JobIdArgs),
    Retry(JobIdArgs),
    Records(JobIdArgs),
    Canonical,
}

#[derive(Debug, Args)]
struct ImportStageArgs {
    #[arg(long)]
    mapping_id: String,
    #[arg(long, value_enum)]
    job_type: JobTypeArg,
    /// JSON array of source rows.
    #[arg(long)]
    rows_file: PathBuf,
    #[arg(long)]
    filter_file: Option<PathBuf>,
    #[arg(long)]
    source_name: Option<String>,
    #[command(flatten)]
    scope: ScopeArgs,
}

#[derive(Debug, Args)]
struct JobIdArgs {
    #[arg(long)]
    job_id: String,
}

#[derive(Debug, Subcommand)]
enum ScheduleCommand {
    Create(ScheduleCreateArgs),
    List,
    Enable(ScheduleIdArgs),
    Disable(ScheduleIdArgs),
}

#[derive(Debug, Args)]
struct ScheduleCreateArgs {
    #[arg(long)]
    mapping_id: String,
    #[arg(long)]
    cron: String,
    #[arg(long, value_enum)]
    job_type: JobTypeArg,
    #[command(flatten)]
    scope: ScopeArgs,
}

#[derive(Debug, Args)]
struct ScheduleIdArgs {
    #[arg(long)]
    schedule_id: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    User,
    Admin,
    Owner,
    CompanyAdmin,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum JobTypeArg {
    DryRun,
    Import,
}

impl From<RoleArg> for OrgRole {
    fn from(value: RoleArg) -> Self {
        match value {
            RoleArg::User => Self::User,
            RoleArg::Admin => Self::Admin,
            RoleArg::Owner => Self::Owner,
            RoleArg::CompanyAdmin => Self::CompanyAdmin,
        }
    }
}

impl From<JobTypeArg> for ImportJobType {
    fn from(value: JobTypeArg) -> Self {
        match value {
            JobTypeArg::DryRun => Self::DryRun,
            JobTypeArg::Import => Self::Import,
        }
    }
}

impl ScopeArgs {
    fn to_scope(&self) -> Result<Option<OrgScope>> {
        if self.company_id.is_none() && self.business_unit_id.is_none() && self.location_id.is_none()
        {
            return Ok(None);
        }
        Ok(Some(OrgScope {
            company_id: self.company_id.as_deref().map(CompanyId::parse).transpose()?,
            business_unit_id: self
                .business_unit_id
                .as_deref()
                .map(BusinessUnitId::parse)
                .transpose()?,
            location_id: self.location_id.as_deref().map(LocationId::parse).transpose()?,
        }))
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: serde::Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value)?)
}

fn read_json_file<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read {what} file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {what} file {}", path.display()))
}

fn read_content_file(path: &Path) -> Result<MappingContent> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read content file {}", path.display()))?;
    Ok(MappingContent::from_json_str(&raw)?)
}

fn caller(user: Option<&str>) -> Result<UserId> {
    let raw = user.ok_or_else(|| anyhow!("--user (or ORGSCOPE_USER) is required"))?;
    Ok(UserId::parse(raw)?)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log)?)
        .with_writer(std::io::stderr)
        .init();

    run(cli).map_err(|err| match classify_error(&err) {
        ErrorClass::AccessDenied => anyhow!(ACCESS_DENIED_MESSAGE),
        ErrorClass::Validation(_) | ErrorClass::Internal => err,
    })
}

fn run(cli: Cli) -> Result<()> {
    tracing::debug!(db = %cli.db.display(), user = ?cli.user, "running osc command");
    let api = OrgScopeApi::new(cli.db);
    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Org { command } => run_org(*command, &api, &caller(cli.user.as_deref())?),
        Command::Contract { command } => {
            run_contract(*command, &api, &caller(cli.user.as_deref())?)
        }
        Command::Mapping { command } => run_mapping(*command, &api, &caller(cli.user.as_deref())?),
        Command::Import { command } => run_import(*command, &api, &caller(cli.user.as_deref())?),
        Command::Schedule { command } => {
            run_schedule(*command, &api, &caller(cli.user.as_deref())?)
        }
    }
}

fn run_db(command: DbCommand, api: &OrgScopeApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&api.migrate(args.dry_run)?),
        DbCommand::Backup(args) => {
            api.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::IntegrityCheck => emit(&api.integrity_check()?),
    }
}

fn run_org(command: OrgCommand, api: &OrgScopeApi, user: &UserId) -> Result<()> {
    match command {
        OrgCommand::CompanyCreate(args) => emit(&api.create_company(user, &args.name)?),
        OrgCommand::UnitCreate(args) => {
            let company_id = CompanyId::parse(&args.company_id)?;
            emit(&api.create_business_unit(user, company_id, &args.name)?)
        }
        OrgCommand::LocationCreate(args) => {
            let business_unit_id = BusinessUnitId::parse(&args.business_unit_id)?;
            emit(&api.create_location(user, business_unit_id, &args.name)?)
        }
        OrgCommand::UserUpsert(args) => {
            let account = UserAccount {
                user_id: UserId::parse(&args.user_id)?,
                display_name: args.display_name,
                global_role: args.global_role.map(OrgRole::from),
                is_system_admin: args.system_admin,
            };
            emit(&api.upsert_user(user, &account)?)
        }
        OrgCommand::Assign(args) => {
            let scope = args.scope.to_scope()?.unwrap_or_default();
            let assignment = NewAssignment {
                user_id: UserId::parse(&args.user_id)?,
                scope,
                role: args.role.into(),
            };
            emit(&api.assign_role(user, &assignment)?)
        }
        OrgCommand::Assignments => {
            let assignments = api.list_assignments(user)?;
            emit_json(serde_json::json!({ "assignments": assignments }))
        }
        OrgCommand::Activate(args) => {
            let assignment_id = AssignmentId::parse(&args.assignment_id)?;
            emit(&api.activate_assignment(user, assignment_id)?)
        }
        OrgCommand::Context => emit(&api.resolve_context(user)?),
    }
}

fn run_contract(command: ContractCommand, api: &OrgScopeApi, user: &UserId) -> Result<()> {
    match command {
        ContractCommand::Create(args) => {
            let request = CreateContractRequest {
                title: args.title,
                counterparty: args.counterparty,
                scope: args.scope.to_scope()?,
            };
            emit(&api.create_contract(user, request)?)
        }
        ContractCommand::List => {
            let contracts = api.list_contracts(user)?;
            emit_json(serde_json::json!({ "contracts": contracts }))
        }
        ContractCommand::Show(args) => {
            let contract_id = ContractId::parse(&args.contract_id)?;
            emit(&api.get_contract(user, contract_id)?)
        }
        ContractCommand::Update(args) => {
            let contract_id = ContractId::parse(&args.contract_id)?;
            let patch = ContractPatch { title: args.title, counterparty: args.counterparty };
            emit(&api.update_contract(user, contract_id, &patch)?)
        }
    }
}

fn run_mapping(command: MappingCommand, api: &OrgScopeApi, user: &UserId) -> Result<()> {
    match command {
        MappingCommand::Create(args) => {
            let request = CreateMappingRequest {
                name: args.name,
                content: read_content_file(&args.content_file)?,
                notes: args.notes,
                scope: args.scope.to_scope()?,
            };
            emit(&api.create_mapping(user, request)?)
        }
        MappingCommand::List => {
            let mappings = api.list_mappings(user)?;
            emit_json(serde_json::json!({ "mappings": mappings }))
        }
        MappingCommand::Show(args) => {
            emit(&api.get_mapping(user, MappingId::parse(&args.mapping_id)?)?)
        }
        MappingCommand::NewVersion(args) => {
            let patch = MappingPatch {
                name: args.name,
                content: args.content_file.as_deref().map(read_content_file).transpose()?,
                notes: args.notes,
            };
            emit(&api.create_mapping_version(user, MappingId::parse(&args.mapping_id)?, &patch)?)
        }
        MappingCommand::Approve(args) => {
            emit(&api.approve_mapping(user, MappingId::parse(&args.mapping_id)?)?)
        }
        MappingCommand::Deprecate(args) => {
            emit(&api.deprecate_mapping(user, MappingId::parse(&args.mapping_id)?)?)
        }
        MappingCommand::Revert(args) => {
            let mapping_id = MappingId::parse(&args.mapping_id)?;
            emit(&api.revert_mapping(user, mapping_id, args.target_version)?)
        }
        MappingCommand::History(args) => {
            let history = api.mapping_history(user, MappingId::parse(&args.mapping_id)?)?;
            emit_json(serde_json::json!({ "history": history }))
        }
        MappingCommand::Delete(args) => {
            let mapping_id = MappingId::parse(&args.mapping_id)?;
            api.delete_mapping_draft(user, mapping_id)?;
            emit_json(serde_json::json!({ "mapping_id": mapping_id, "deleted": true }))
        }
    }
}

fn run_import(command: ImportCommand, api: &OrgScopeApi, user: &UserId) -> Result<()> {
    match command {
        ImportCommand::Stage(args) => {
            let rows: Vec<Row> = read_json_file(&args.rows_file, "rows")?;
            let filter: Option<ImportFilter> = args
                .filter_file
                .as_deref()
                .map(|path| read_json_file(path, "filter"))
                .transpose()?;
            let request = StageImportRequest {
                mapping_id: MappingId::parse(&args.mapping_id)?,
                job_type: args.job_type.into(),
                source_name: args.source_name.or_else(|| {
                    args.rows_file.file_name().map(|name| name.to_string_lossy().into_owned())
                }),
                rows,
                filter,
                scope: args.scope.to_scope()?,
            };
            emit(&api.stage_import(user, request)?)
        }
        ImportCommand::List => {
            let jobs = api.list_import_jobs(user)?;
            emit_json(serde_json::json!({ "jobs": jobs }))
        }
        ImportCommand::Show(args) => emit(&api.get_import_job(user, ImportJobId::parse(&args.job_id)?)?),
        ImportCommand::Commit(args) => {
            let job_id = ImportJobId::parse(&args.job_id)?;
            let summary = api.commit_import(user, job_id)?;
            emit_json(serde_json::json!({
                "job_id": job_id,
                "committed": summary.committed,
                "failed": summary.failed
            }))
        }
        ImportCommand::Discard(args) => {
            let job_id = ImportJobId::parse(&args.job_id)?;
            let discarded = api.discard_import(user, job_id)?;
            emit_json(serde_json::json!({ "job_id": job_id, "discarded": discarded }))
        }
        ImportCommand::Retry(args) => {
            let job_id = ImportJobId::parse(&args.job_id)?;
            let requeued = api.retry_failed_import(user, job_id)?;
            emit_json(serde_json::json!({ "job_id": job_id, "requeued": requeued }))
        }
        ImportCommand::Records(args) => {
            let records = api.list_imported_records(user, ImportJobId::parse(&args.job_id)?)?;
            emit_json(serde_json::json!({ "records": records }))
        }
        ImportCommand::Canonical => {
            let records = api.list_canonical_records(user)?;
            emit_json(serde_json::json!({ "records": records }))
        }
    }
}

fn run_schedule(command: ScheduleCommand, api: &OrgScopeApi, user: &UserId) -> Result<()> {
    match command {
        ScheduleCommand::Create(args) => {
            let request = CreateScheduleRequest {
                mapping_id: MappingId::parse(&args.mapping_id)?,
                cron_expression: args.cron,
                job_type: args.job_type.into(),
                scope: args.scope.to_scope()?,
            };
            emit(&api.create_schedule(user, request)?)
        }
        ScheduleCommand::List => {
            let schedules = api.list_schedules(user)?;
            emit_json(serde_json::json!({ "schedules": schedules }))
        }
        ScheduleCommand::Enable(args) => {
            emit(&api.set_schedule_enabled(user, ScheduleId::parse(&args.schedule_id)?, true)?)
        }
        ScheduleCommand::Disable(args) => {
            emit(&api.set_schedule_enabled(user, ScheduleId::parse(&args.schedule_id)?, false)?)
        }
    }
}
