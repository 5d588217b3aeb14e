use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_osc<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_osc"))
        .env_remove("ORGSCOPE_DB")
        .env_remove("ORGSCOPE_USER")
        .env_remove("ORGSCOPE_LOG")
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute osc binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_osc(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "osc command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

/// Run a command that must fail and return the final stderr line, which carries the error.
fn run_failure<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_osc(args);
    assert!(
        !output.status.success(),
        "osc command unexpectedly succeeded:\n{}",
        String::from_utf8_lossy(&output.stdout)
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    stderr.lines().last().unwrap_or_default().trim().to_string()
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn array_len(value: &Value, key: &str) -> usize {
    value
        .get(key)
        .and_then(Value::as_array)
        .map(Vec::len)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_file(path: &Path, body: &str) {
    fs::write(path, body)
        .unwrap_or_else(|err| panic!("failed to write fixture {}: {err}", path.display()));
}

/// Bootstrap `root` as system admin and return the id of a new company.
fn bootstrap(db: &str, company: &str) -> String {
    let _root = run_json([
        "--db",
        db,
        "--user",
        "root",
        "org",
        "user-upsert",
        "--user-id",
        "root",
        "--display-name",
        "Root",
        "--system-admin",
    ]);
    create_company(db, company)
}

fn create_company(db: &str, name: &str) -> String {
    let company = run_json(["--db", db, "--user", "root", "org", "company-create", "--name", name]);
    as_str(&company, "company_id").to_string()
}

/// Create `user`, give them `role` at company level and activate it.
fn seat(db: &str, user: &str, company_id: &str, role: &str) {
    let _account = run_json([
        "--db",
        db,
        "--user",
        "root",
        "org",
        "user-upsert",
        "--user-id",
        user,
        "--display-name",
        user,
    ]);
    let assignment = run_json([
        "--db",
        db,
        "--user",
        "root",
        "org",
        "assign",
        "--user-id",
        user,
        "--company-id",
        company_id,
        "--role",
        role,
    ]);
    let assignment_id = as_str(&assignment, "assignment_id").to_string();
    let _active = run_json([
        "--db",
        db,
        "--user",
        user,
        "org",
        "activate",
        "--assignment-id",
        &assignment_id,
    ]);
}

// Test IDs: TCLI-001
#[test]
fn db_commands_cover_migrate_integrity_and_backup() {
    let sandbox = unique_temp_dir("orgscope-cli-db");
    let db = sandbox.join("org.sqlite3");
    let backup_file = sandbox.join("backup.sqlite3");

    let schema_before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&schema_before, "current_version"), 0);
    assert_eq!(as_str(&schema_before, "contract_version"), "cli.v1");

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(array_len(&dry_run, "would_apply_versions"), 2);
    let still_empty = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&still_empty, "current_version"), 0);

    let migrate = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&migrate, "after_version"), 2);

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert!(integrity.get("quick_check_ok").and_then(Value::as_bool).unwrap_or(false));
    assert_eq!(array_len(&integrity, "foreign_key_violations"), 0);

    let backup =
        run_json(["--db", path_str(&db), "db", "backup", "--out", path_str(&backup_file)]);
    assert_eq!(as_str(&backup, "status"), "ok");
    assert!(backup_file.exists());

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-002
#[test]
fn scoped_commands_require_an_identity() {
    let sandbox = unique_temp_dir("orgscope-cli-identity");
    let db = sandbox.join("org.sqlite3");

    let stderr = run_failure(["--db", path_str(&db), "contract", "list"]);
    assert!(stderr.contains("--user"), "unexpected stderr: {stderr}");

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-003
#[test]
fn foreign_and_missing_contracts_fail_identically() {
    let sandbox = unique_temp_dir("orgscope-cli-contracts");
    let db_path = sandbox.join("org.sqlite3");
    let db = path_str(&db_path);
    let acme = bootstrap(db, "Acme");
    let globex = create_company(db, "Globex");
    seat(db, "alice", &acme, "user");
    seat(db, "gary", &globex, "owner");

    let contract = run_json([
        "--db",
        db,
        "--user",
        "alice",
        "contract",
        "create",
        "--title",
        "Master services agreement",
    ]);
    let contract_id = as_str(&contract, "contract_id").to_string();
    assert_eq!(
        contract.get("scope").and_then(|scope| scope.get("company_id")).and_then(Value::as_str),
        Some(acme.as_str())
    );

    let shown = run_json(["--db", db, "--user", "alice", "contract", "show", "--contract-id", &contract_id]);
    assert_eq!(shown.get("can_edit").and_then(Value::as_bool), Some(true));

    let foreign =
        run_failure(["--db", db, "--user", "gary", "contract", "show", "--contract-id", &contract_id]);
    let missing = run_failure([
        "--db",
        db,
        "--user",
        "gary",
        "contract",
        "show",
        "--contract-id",
        "01J00000000000000000000000",
    ]);
    assert!(foreign.contains("Access denied"), "unexpected stderr: {foreign}");
    assert_eq!(foreign, missing);

    let listed = run_json(["--db", db, "--user", "gary", "contract", "list"]);
    assert_eq!(array_len(&listed, "contracts"), 0);

    let _ = fs::remove_dir_all(&sandbox);
}

// Test IDs: TCLI-004
#[allow(clippy::too_many_lines)]
#[test]
fn mapping_lineage_and_staged_import_flow() {
    let sandbox = unique_temp_dir("orgscope-cli-imports");
    let db_path = sandbox.join("org.sqlite3");
    let db = path_str(&db_path);
    let content_file = sandbox.join("content.json");
    let rows_file = sandbox.join("rows.json");
    let filter_file = sandbox.join("filter.json");
    write_file(
        &content_file,
        r#"{
  "entity_type": "customer",
  "key_field": "email",
  "rules": [
    {"target": "email", "transform": {"kind": "copy", "source": "Email"}, "required": true},
    {"target": "region", "transform": {"kind": "trim_upper", "source": "Region"}}
  ]
}"#,
    );
    write_file(
        &rows_file,
        r#"[
  {"Email": "a@example.com", "Region": " emea "},
  {"Email": "b@example.com", "Region": "apac"},
  {"Email": "", "Region": "emea"},
  {"Email": "c@example.com", "Region": "test"}
]"#,
    );
    write_file(
        &filter_file,
        r#"{"mode": "all", "conditions": [{"field": "Region", "operator": "not_equals", "value": "test"}]}"#,
    );

    let acme = bootstrap(db, "Acme");
    seat(db, "olga", &acme, "owner");

    let v1 = run_json([
        "--db",
        db,
        "--user",
        "olga",
        "mapping",
        "create",
        "--name",
        "crm customers",
        "--content-file",
        path_str(&content_file),
    ]);
    let v1_id = as_str(&v1, "mapping_id").to_string();
    assert_eq!(as_str(&v1, "status"), "draft");

    let approved = run_json(["--db", db, "--user", "olga", "mapping", "approve", "--mapping-id", &v1_id]);
    assert_eq!(
        approved.get("approved").and_then(|version| version.get("status")).and_then(Value::as_str),
        Some("approved")
    );

    let staged = run_json([
        "--db",
        db,
        "--user",
        "olga",
        "import",
        "stage",
        "--mapping-id",
        &v1_id,
        "--job-type",
        "dry-run",
        "--rows-file",
        path_str(&rows_file),
        "--filter-file",
        path_str(&filter_file),
    ]);
    assert_eq!(as_str(&staged, "status"), "pending_commit");
    assert_eq!(as_i64(&staged, "records_total"), 3);
    assert_eq!(as_str(&staged, "source_name"), "rows.json");
    let job_id = as_str(&staged, "job_id").to_string();

    let committed = run_json(["--db", db, "--user", "olga", "import", "commit", "--job-id", &job_id]);
    assert_eq!(as_i64(&committed, "committed"), 2);
    assert_eq!(as_i64(&committed, "failed"), 1);

    let job = run_json(["--db", db, "--user", "olga", "import", "show", "--job-id", &job_id]);
    assert_eq!(
        job.get("resource").and_then(|job| job.get("status")).and_then(Value::as_str),
        Some("completed_with_errors")
    );

    let canonical = run_json(["--db", db, "--user", "olga", "import", "canonical"]);
    assert_eq!(array_len(&canonical, "records"), 2);

    let v2 = run_json(["--db", db, "--user", "olga", "mapping", "new-version", "--mapping-id", &v1_id]);
    let v2_id = as_str(&v2, "mapping_id").to_string();
    assert_eq!(as_i64(&v2, "version"), 2);

    let reverted = run_json([
        "--db",
        db,
        "--user",
        "olga",
        "mapping",
        "revert",
        "--mapping-id",
        &v2_id,
        "--target-version",
        "1",
    ]);
    assert_eq!(as_i64(&reverted, "version"), 3);
    assert_eq!(as_str(&reverted, "notes"), "Reverted from version 1");

    let history = run_json(["--db", db, "--user", "olga", "mapping", "history", "--mapping-id", &v1_id]);
    assert_eq!(array_len(&history, "history"), 3);

    let bad_cron = run_failure([
        "--db",
        db,
        "--user",
        "olga",
        "schedule",
        "create",
        "--mapping-id",
        &v1_id,
        "--cron",
        "nightly",
        "--job-type",
        "import",
    ]);
    assert!(bad_cron.contains("cron_expression"), "unexpected stderr: {bad_cron}");

    let schedule = run_json([
        "--db",
        db,
        "--user",
        "olga",
        "schedule",
        "create",
        "--mapping-id",
        &v1_id,
        "--cron",
        "0 2 * * *",
        "--job-type",
        "import",
    ]);
    let schedule_id = as_str(&schedule, "schedule_id").to_string();
    let disabled = run_json([
        "--db",
        db,
        "--user",
        "olga",
        "schedule",
        "disable",
        "--schedule-id",
        &schedule_id,
    ]);
    assert_eq!(disabled.get("enabled").and_then(Value::as_bool), Some(false));

    let _ = fs::remove_dir_all(&sandbox);
}
