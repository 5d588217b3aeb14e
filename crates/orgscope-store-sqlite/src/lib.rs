use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use orgscope_core::{BusinessUnitId, CompanyId, LocationId, OrgError, OrgScope, UserId};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

mod contracts;
mod imports;
mod mappings;
mod org;
mod schedules;
mod scope_sql;

pub use contracts::{Contract, ContractPatch, NewContract};
pub use imports::StageRequest;
pub use mappings::ApprovalOutcome;
pub use org::{BusinessUnit, Company, Location, NewAssignment, OrgRoleAssignment, UserAccount};
pub use schedules::NewSchedule;
pub use scope_sql::{ScopeColumns, ScopedWhere};

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS users (
  user_id TEXT PRIMARY KEY,
  display_name TEXT NOT NULL,
  global_role TEXT CHECK (global_role IN ('user', 'admin', 'owner', 'company_admin')),
  is_system_admin INTEGER NOT NULL DEFAULT 0 CHECK (is_system_admin IN (0, 1))
);

CREATE TABLE IF NOT EXISTS companies (
  company_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS business_units (
  business_unit_id TEXT PRIMARY KEY,
  company_id TEXT NOT NULL REFERENCES companies(company_id),
  name TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS locations (
  location_id TEXT PRIMARY KEY,
  business_unit_id TEXT NOT NULL REFERENCES business_units(business_unit_id),
  company_id TEXT NOT NULL REFERENCES companies(company_id),
  name TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS org_role_assignments (
  assignment_id TEXT PRIMARY KEY,
  user_id TEXT NOT NULL REFERENCES users(user_id),
  company_id TEXT NOT NULL REFERENCES companies(company_id),
  business_unit_id TEXT REFERENCES business_units(business_unit_id),
  location_id TEXT REFERENCES locations(location_id),
  role TEXT NOT NULL CHECK (role IN ('user', 'admin', 'owner', 'company_admin')),
  created_at TEXT NOT NULL,
  CHECK (location_id IS NULL OR business_unit_id IS NOT NULL)
);

CREATE TABLE IF NOT EXISTS active_assignments (
  user_id TEXT PRIMARY KEY REFERENCES users(user_id),
  assignment_id TEXT NOT NULL REFERENCES org_role_assignments(assignment_id),
  activated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS contracts (
  contract_id TEXT PRIMARY KEY,
  title TEXT NOT NULL,
  counterparty TEXT,
  company_id TEXT REFERENCES companies(company_id),
  business_unit_id TEXT REFERENCES business_units(business_unit_id),
  location_id TEXT REFERENCES locations(location_id),
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mapping_versions (
  mapping_id TEXT PRIMARY KEY,
  parent_mapping_id TEXT REFERENCES mapping_versions(mapping_id),
  name TEXT NOT NULL,
  version INTEGER NOT NULL CHECK (version >= 1),
  status TEXT NOT NULL CHECK (status IN ('draft', 'approved', 'deprecated')),
  company_id TEXT REFERENCES companies(company_id),
  business_unit_id TEXT REFERENCES business_units(business_unit_id),
  location_id TEXT REFERENCES locations(location_id),
  content_json TEXT NOT NULL,
  notes TEXT,
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  approved_by TEXT,
  approved_at TEXT
);

CREATE TABLE IF NOT EXISTS import_jobs (
  job_id TEXT PRIMARY KEY,
  mapping_id TEXT NOT NULL REFERENCES mapping_versions(mapping_id),
  job_type TEXT NOT NULL CHECK (job_type IN ('dry_run', 'import')),
  status TEXT NOT NULL CHECK (status IN (
    'pending', 'processing', 'pending_commit', 'completed',
    'completed_with_errors', 'failed', 'cancelled'
  )),
  company_id TEXT REFERENCES companies(company_id),
  business_unit_id TEXT REFERENCES business_units(business_unit_id),
  location_id TEXT REFERENCES locations(location_id),
  uploaded_by TEXT NOT NULL,
  source_name TEXT,
  source_digest TEXT NOT NULL,
  filter_json TEXT,
  records_total INTEGER NOT NULL DEFAULT 0,
  records_processed INTEGER NOT NULL DEFAULT 0,
  records_failed INTEGER NOT NULL DEFAULT 0,
  error TEXT,
  created_at TEXT NOT NULL,
  started_at TEXT,
  completed_at TEXT
);

CREATE TABLE IF NOT EXISTS imported_records (
  record_id TEXT PRIMARY KEY,
  job_id TEXT NOT NULL REFERENCES import_jobs(job_id) ON DELETE CASCADE,
  row_index INTEGER NOT NULL CHECK (row_index >= 0),
  source_json TEXT NOT NULL,
  target_json TEXT NOT NULL,
  source_hash TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('staged', 'committed', 'failed', 'discarded')),
  validation_errors_json TEXT NOT NULL,
  error TEXT,
  canonical_record_id TEXT,
  updated_at TEXT NOT NULL,
  UNIQUE(job_id, row_index)
);

CREATE TABLE IF NOT EXISTS canonical_records (
  canonical_record_id TEXT PRIMARY KEY,
  entity_type TEXT NOT NULL,
  external_key TEXT,
  company_id TEXT REFERENCES companies(company_id),
  business_unit_id TEXT REFERENCES business_units(business_unit_id),
  location_id TEXT REFERENCES locations(location_id),
  data_json TEXT NOT NULL,
  source_job_id TEXT NOT NULL REFERENCES import_jobs(job_id),
  source_record_id TEXT NOT NULL REFERENCES imported_records(record_id),
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_business_units_company ON business_units(company_id);
CREATE INDEX IF NOT EXISTS idx_locations_business_unit ON locations(business_unit_id);
CREATE INDEX IF NOT EXISTS idx_assignments_user ON org_role_assignments(user_id);
CREATE INDEX IF NOT EXISTS idx_contracts_scope ON contracts(company_id, business_unit_id, location_id);
CREATE INDEX IF NOT EXISTS idx_mapping_versions_parent ON mapping_versions(parent_mapping_id);
CREATE INDEX IF NOT EXISTS idx_mapping_versions_scope ON mapping_versions(company_id, business_unit_id, location_id);
CREATE INDEX IF NOT EXISTS idx_import_jobs_scope ON import_jobs(company_id, business_unit_id, location_id);
CREATE INDEX IF NOT EXISTS idx_import_jobs_mapping ON import_jobs(mapping_id);
CREATE INDEX IF NOT EXISTS idx_imported_records_job_status ON imported_records(job_id, status, row_index);
CREATE UNIQUE INDEX IF NOT EXISTS idx_canonical_records_natural_key
  ON canonical_records(entity_type, COALESCE(company_id, ''), external_key)
  WHERE external_key IS NOT NULL;
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS import_schedules (
  schedule_id TEXT PRIMARY KEY,
  mapping_id TEXT NOT NULL REFERENCES mapping_versions(mapping_id),
  cron_expression TEXT NOT NULL,
  job_type TEXT NOT NULL CHECK (job_type IN ('dry_run', 'import')),
  company_id TEXT REFERENCES companies(company_id),
  business_unit_id TEXT REFERENCES business_units(business_unit_id),
  location_id TEXT REFERENCES locations(location_id),
  created_by TEXT NOT NULL,
  enabled INTEGER NOT NULL DEFAULT 1 CHECK (enabled IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_import_schedules_mapping ON import_schedules(mapping_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed org store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when the database carries org tables without migration records,
    /// or when any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            if table_exists(&self.conn, "companies")? {
                return Err(anyhow!(
                    "database schema is invalid: org tables exist without migration records"
                ));
            }
            apply_migration(&mut self.conn, 1, MIGRATION_001_SQL)?;
            version = 1;
        }

        if version < 2 {
            apply_migration(&mut self.conn, 2, MIGRATION_002_SQL)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }
}

fn apply_migration(conn: &mut Connection, version: i64, sql: &str) -> Result<()> {
    let tx = conn.transaction().context("failed to begin migration transaction")?;
    tx.execute_batch(sql).with_context(|| format!("failed to apply migration {version}"))?;
    record_schema_version(&tx, version)?;
    tx.commit().with_context(|| format!("failed to commit migration {version}"))?;
    tracing::info!(version, "applied schema migration");
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_optional_rfc3339(value: Option<&str>) -> Result<Option<OffsetDateTime>> {
    value.map(parse_rfc3339).transpose()
}

/// Lift a parse of a persisted column into the store's error type. Bad stored data is a
/// system fault, never a caller validation error.
fn stored<T>(parsed: std::result::Result<T, OrgError>) -> Result<T> {
    parsed.map_err(|err| anyhow!("corrupt stored value: {err}"))
}

fn stored_user(raw: &str) -> Result<UserId> {
    stored(UserId::parse(raw))
}

fn stored_scope(
    company_id: Option<&str>,
    business_unit_id: Option<&str>,
    location_id: Option<&str>,
) -> Result<OrgScope> {
    Ok(OrgScope {
        company_id: company_id.map(|raw| stored(CompanyId::parse(raw))).transpose()?,
        business_unit_id: business_unit_id
            .map(|raw| stored(BusinessUnitId::parse(raw)))
            .transpose()?,
        location_id: location_id.map(|raw| stored(LocationId::parse(raw))).transpose()?,
    })
}

/// Scope ids as bindable text columns, in company, business unit, location order.
fn scope_columns(scope: &OrgScope) -> (Option<String>, Option<String>, Option<String>) {
    (
        scope.company_id.map(|id| id.to_string()),
        scope.business_unit_id.map(|id| id.to_string()),
        scope.location_id.map(|id| id.to_string()),
    )
}

fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

fn count_rows(conn: &Connection, sql: &str, id: &str) -> Result<usize> {
    let count = conn
        .query_row(sql, params![id], |row| row.get::<_, i64>(0))
        .with_context(|| format!("failed to count rows for {id}"))?;
    usize::try_from(count).context("row count out of range")
}

fn exists(conn: &Connection, sql: &str, id: &str) -> Result<bool> {
    Ok(conn
        .query_row(sql, params![id], |_| Ok(()))
        .optional()
        .with_context(|| format!("failed to look up {id}"))?
        .is_some())
}
