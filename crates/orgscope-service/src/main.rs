use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use orgscope_api::{
    classify_error, CreateContractRequest, CreateMappingRequest, CreateScheduleRequest,
    ErrorClass, OrgScopeApi, StageImportRequest, API_CONTRACT_VERSION,
};
use orgscope_core::{
    AssignmentId, Authorized, BusinessUnitId, CanonicalRecord, CommitSummary, CompanyId,
    ContractId, ImportJob, ImportJobId, ImportSchedule, ImportedRecord, MappingId, MappingPatch,
    MappingVersion, OrgAccessContext, OrgError, ScheduleId, UserId, ACCESS_DENIED_MESSAGE,
};
use orgscope_store_sqlite::{
    ApprovalOutcome, BusinessUnit, Company, Contract, ContractPatch, IntegrityReport, Location,
    NewAssignment, OrgRoleAssignment, SchemaStatus, UserAccount,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

/// Identity asserted by the upstream authentication layer.
const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Clone)]
struct ServiceState {
    api: OrgScopeApi,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: String,
}

type ServiceResult<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct NameRequest {
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RevertRequest {
    target_version: u32,
}

#[derive(Debug, Clone, Deserialize)]
struct EnabledRequest {
    enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
struct DeletedResponse {
    mapping_id: MappingId,
    deleted: bool,
}

#[derive(Debug, Clone, Serialize)]
struct RecordsAffected {
    job_id: ImportJobId,
    records_affected: usize,
}

#[derive(Debug, Parser)]
#[command(name = "orgscope-service")]
#[command(about = "Local HTTP service for OrgScope")]
struct Args {
    #[arg(long, env = "ORGSCOPE_DB", default_value = "./orgscope.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "ORGSCOPE_BIND", default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Tracing filter directive, e.g. `info` or `orgscope_store_sqlite=debug`.
    #[arg(long, env = "ORGSCOPE_LOG", default_value = "info")]
    log: String,
}

impl ServiceError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, service_contract_version: SERVICE_CONTRACT_VERSION, error: message.into() }
    }

    fn denied() -> Self {
        Self::new(StatusCode::FORBIDDEN, ACCESS_DENIED_MESSAGE)
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        match classify_error(&err) {
            ErrorClass::AccessDenied => Self::denied(),
            ErrorClass::Validation(message) => Self::new(StatusCode::BAD_REQUEST, message),
            ErrorClass::Internal => {
                tracing::error!(error = %format!("{err:#}"), "request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        }
    }
}

impl From<OrgError> for ServiceError {
    fn from(err: OrgError) -> Self {
        anyhow::Error::from(err).into()
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

#[allow(clippy::unnecessary_wraps)]
fn respond<T: Serialize>(data: T) -> ServiceResult<T> {
    Ok(Json(envelope(data)))
}

/// A request without a usable identity is treated like any other denial.
fn caller(headers: &HeaderMap) -> Result<UserId, ServiceError> {
    let raw = headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(ServiceError::denied)?;
    UserId::parse(raw).map_err(|_| ServiceError::denied())
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .route("/v1/db/integrity-check", post(db_integrity_check))
        .route("/v1/me/context", get(me_context))
        .route("/v1/me/assignments", get(me_assignments))
        .route("/v1/me/assignments/:assignment_id/activate", post(me_activate))
        .route("/v1/org/users", post(org_upsert_user))
        .route("/v1/org/assignments", post(org_assign_role))
        .route("/v1/org/companies", post(org_create_company))
        .route("/v1/org/companies/:company_id/business-units", post(org_create_business_unit))
        .route("/v1/org/business-units/:business_unit_id/locations", post(org_create_location))
        .route("/v1/contracts", get(contract_list).post(contract_create))
        .route("/v1/contracts/:contract_id", get(contract_show).patch(contract_update))
        .route("/v1/mappings", get(mapping_list).post(mapping_create))
        .route("/v1/mappings/:mapping_id", get(mapping_show).delete(mapping_delete))
        .route("/v1/mappings/:mapping_id/versions", post(mapping_new_version))
        .route("/v1/mappings/:mapping_id/approve", post(mapping_approve))
        .route("/v1/mappings/:mapping_id/deprecate", post(mapping_deprecate))
        .route("/v1/mappings/:mapping_id/revert", post(mapping_revert))
        .route("/v1/mappings/:mapping_id/history", get(mapping_history))
        .route("/v1/imports", get(import_list).post(import_stage))
        .route("/v1/imports/:job_id", get(import_show))
        .route("/v1/imports/:job_id/commit", post(import_commit))
        .route("/v1/imports/:job_id/discard", post(import_discard))
        .route("/v1/imports/:job_id/retry", post(import_retry))
        .route("/v1/imports/:job_id/records", get(import_records))
        .route("/v1/canonical-records", get(canonical_list))
        .route("/v1/schedules", get(schedule_list).post(schedule_create))
        .route("/v1/schedules/:schedule_id/enabled", post(schedule_set_enabled))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log)?)
        .with_writer(std::io::stderr)
        .init();

    let state = ServiceState { api: OrgScopeApi::new(args.db.clone()) };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    tracing::info!(bind = %args.bind, db = %args.db.display(), "orgscope service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn db_schema_version(State(state): State<ServiceState>) -> ServiceResult<SchemaStatus> {
    respond(state.api.schema_status()?)
}

async fn db_migrate(
    State(state): State<ServiceState>,
    Json(request): Json<MigrateRequest>,
) -> ServiceResult<orgscope_api::MigrateResult> {
    respond(state.api.migrate(request.dry_run)?)
}

async fn db_integrity_check(State(state): State<ServiceState>) -> ServiceResult<IntegrityReport> {
    respond(state.api.integrity_check()?)
}

async fn me_context(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> ServiceResult<OrgAccessContext> {
    let user = caller(&headers)?;
    respond(state.api.resolve_context(&user)?)
}

async fn me_assignments(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> ServiceResult<Vec<OrgRoleAssignment>> {
    let user = caller(&headers)?;
    respond(state.api.list_assignments(&user)?)
}

async fn me_activate(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(assignment_id): Path<String>,
) -> ServiceResult<OrgRoleAssignment> {
    let user = caller(&headers)?;
    let assignment_id = AssignmentId::parse(&assignment_id)?;
    respond(state.api.activate_assignment(&user, assignment_id)?)
}

async fn org_upsert_user(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<UserAccount>,
) -> ServiceResult<UserAccount> {
    let user = caller(&headers)?;
    respond(state.api.upsert_user(&user, &request)?)
}

async fn org_assign_role(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<NewAssignment>,
) -> ServiceResult<OrgRoleAssignment> {
    let user = caller(&headers)?;
    respond(state.api.assign_role(&user, &request)?)
}

async fn org_create_company(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<NameRequest>,
) -> ServiceResult<Company> {
    let user = caller(&headers)?;
    respond(state.api.create_company(&user, &request.name)?)
}

async fn org_create_business_unit(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(company_id): Path<String>,
    Json(request): Json<NameRequest>,
) -> ServiceResult<BusinessUnit> {
    let user = caller(&headers)?;
    let company_id = CompanyId::parse(&company_id)?;
    respond(state.api.create_business_unit(&user, company_id, &request.name)?)
}

async fn org_create_location(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(business_unit_id): Path<String>,
    Json(request): Json<NameRequest>,
) -> ServiceResult<Location> {
    let user = caller(&headers)?;
    let business_unit_id = BusinessUnitId::parse(&business_unit_id)?;
    respond(state.api.create_location(&user, business_unit_id, &request.name)?)
}

async fn contract_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> ServiceResult<Vec<Contract>> {
    let user = caller(&headers)?;
    respond(state.api.list_contracts(&user)?)
}

async fn contract_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<CreateContractRequest>,
) -> ServiceResult<Contract> {
    let user = caller(&headers)?;
    respond(state.api.create_contract(&user, request)?)
}

async fn contract_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(contract_id): Path<String>,
) -> ServiceResult<Authorized<Contract>> {
    let user = caller(&headers)?;
    let contract_id = ContractId::parse(&contract_id)?;
    respond(state.api.get_contract(&user, contract_id)?)
}

async fn contract_update(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(contract_id): Path<String>,
    Json(patch): Json<ContractPatch>,
) -> ServiceResult<Contract> {
    let user = caller(&headers)?;
    let contract_id = ContractId::parse(&contract_id)?;
    respond(state.api.update_contract(&user, contract_id, &patch)?)
}

async fn mapping_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> ServiceResult<Vec<MappingVersion>> {
    let user = caller(&headers)?;
    respond(state.api.list_mappings(&user)?)
}

async fn mapping_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<CreateMappingRequest>,
) -> ServiceResult<MappingVersion> {
    let user = caller(&headers)?;
    respond(state.api.create_mapping(&user, request)?)
}

async fn mapping_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(mapping_id): Path<String>,
) -> ServiceResult<Authorized<MappingVersion>> {
    let user = caller(&headers)?;
    let mapping_id = MappingId::parse(&mapping_id)?;
    respond(state.api.get_mapping(&user, mapping_id)?)
}

async fn mapping_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(mapping_id): Path<String>,
) -> ServiceResult<DeletedResponse> {
    let user = caller(&headers)?;
    let mapping_id = MappingId::parse(&mapping_id)?;
    state.api.delete_mapping_draft(&user, mapping_id)?;
    respond(DeletedResponse { mapping_id, deleted: true })
}

async fn mapping_new_version(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(mapping_id): Path<String>,
    Json(patch): Json<MappingPatch>,
) -> ServiceResult<MappingVersion> {
    let user = caller(&headers)?;
    let mapping_id = MappingId::parse(&mapping_id)?;
    respond(state.api.create_mapping_version(&user, mapping_id, &patch)?)
}

async fn mapping_approve(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(mapping_id): Path<String>,
) -> ServiceResult<ApprovalOutcome> {
    let user = caller(&headers)?;
    let mapping_id = MappingId::parse(&mapping_id)?;
    respond(state.api.approve_mapping(&user, mapping_id)?)
}

async fn mapping_deprecate(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(mapping_id): Path<String>,
) -> ServiceResult<MappingVersion> {
    let user = caller(&headers)?;
    let mapping_id = MappingId::parse(&mapping_id)?;
    respond(state.api.deprecate_mapping(&user, mapping_id)?)
}

async fn mapping_revert(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(mapping_id): Path<String>,
    Json(request): Json<RevertRequest>,
) -> ServiceResult<MappingVersion> {
    let user = caller(&headers)?;
    let mapping_id = MappingId::parse(&mapping_id)?;
    respond(state.api.revert_mapping(&user, mapping_id, request.target_version)?)
}

async fn mapping_history(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(mapping_id): Path<String>,
) -> ServiceResult<Vec<MappingVersion>> {
    let user = caller(&headers)?;
    let mapping_id = MappingId::parse(&mapping_id)?;
    respond(state.api.mapping_history(&user, mapping_id)?)
}

async fn import_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> ServiceResult<Vec<ImportJob>> {
    let user = caller(&headers)?;
    respond(state.api.list_import_jobs(&user)?)
}

async fn import_stage(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<StageImportRequest>,
) -> ServiceResult<ImportJob> {
    let user = caller(&headers)?;
    respond(state.api.stage_import(&user, request)?)
}

async fn import_show(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ServiceResult<Authorized<ImportJob>> {
    let user = caller(&headers)?;
    let job_id = ImportJobId::parse(&job_id)?;
    respond(state.api.get_import_job(&user, job_id)?)
}

async fn import_commit(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ServiceResult<CommitSummary> {
    let user = caller(&headers)?;
    let job_id = ImportJobId::parse(&job_id)?;
    respond(state.api.commit_import(&user, job_id)?)
}

async fn import_discard(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ServiceResult<RecordsAffected> {
    let user = caller(&headers)?;
    let job_id = ImportJobId::parse(&job_id)?;
    let records_affected = state.api.discard_import(&user, job_id)?;
    respond(RecordsAffected { job_id, records_affected })
}

async fn import_retry(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ServiceResult<RecordsAffected> {
    let user = caller(&headers)?;
    let job_id = ImportJobId::parse(&job_id)?;
    let records_affected = state.api.retry_failed_import(&user, job_id)?;
    respond(RecordsAffected { job_id, records_affected })
}

async fn import_records(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ServiceResult<Vec<ImportedRecord>> {
    let user = caller(&headers)?;
    let job_id = ImportJobId::parse(&job_id)?;
    respond(state.api.list_imported_records(&user, job_id)?)
}

async fn canonical_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> ServiceResult<Vec<CanonicalRecord>> {
    let user = caller(&headers)?;
    respond(state.api.list_canonical_records(&user)?)
}

async fn schedule_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> ServiceResult<Vec<ImportSchedule>> {
    let user = caller(&headers)?;
    respond(state.api.list_schedules(&user)?)
}

async fn schedule_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Json(request): Json<CreateScheduleRequest>,
) -> ServiceResult<ImportSchedule> {
    let user = caller(&headers)?;
    respond(state.api.create_schedule(&user, request)?)
}

async fn schedule_set_enabled(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(schedule_id): Path<String>,
    Json(request): Json<EnabledRequest>,
) -> ServiceResult<ImportSchedule> {
    let user = caller(&headers)?;
    let schedule_id = ScheduleId::parse(&schedule_id)?;
    respond(state.api.set_schedule_enabled(&user, schedule_id, request.enabled)?)
}
