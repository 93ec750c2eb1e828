#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn pfb_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_pfb") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/pfb");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "phone-field-bonus-cli", "--bin", "pfb"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build pfb binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_db_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("pfb-cli-test-{}-{}.sqlite3", name, Ulid::new()))
}

fn pfb_output(db_path: &Path, args: &[&str]) -> Output {
    let mut command = Command::new(pfb_binary_path());
    command.arg("--db").arg(db_path);
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run pfb command {:?}: {err}", args),
    }
}

fn pfb_json(db_path: &Path, args: &[&str]) -> Value {
    let output = pfb_output(db_path, args);
    assert!(
        output.status.success(),
        "pfb {:?} failed\nstderr={}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn enable(db_path: &Path) {
    pfb_json(
        db_path,
        &["settings", "set", "--name", "phone_field_bonus_enabled", "--value", "true"],
    );
}

fn set_phone(db_path: &Path, user_id: &str, phone: &str) {
    pfb_json(
        db_path,
        &["user", "set-field", "--user-id", user_id, "--field-id", "1", "--value", phone],
    );
}

fn trigger(db_path: &Path, user_id: &str) -> Value {
    let outcomes = pfb_json(db_path, &["trigger", "--kind", "user-updated", "--user-id", user_id]);
    match outcomes.as_array().map(Vec::as_slice) {
        Some([single]) => single.clone(),
        _ => panic!("expected one dispatch outcome, got {outcomes}"),
    }
}

#[test]
fn help_lists_operator_commands() {
    let output = match Command::new(pfb_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in [
        "trigger",
        "recheck",
        "diagnose",
        "rate-limit",
        "health",
        "stats",
        "jobs",
        "cache",
        "settings",
        "user",
    ] {
        assert!(stdout.contains(required), "help output missing {required}");
    }
}

#[test]
fn disabled_trigger_is_a_no_op() {
    let db = temp_db_path("disabled");
    set_phone(&db, "1", "+1 (555) 123-4567");

    let outcome = trigger(&db, "1");
    assert_eq!(outcome["dispatch"], "disabled");

    let health = pfb_json(&db, &["health"]);
    assert_eq!(health["enabled"], false);
    assert_eq!(health["active_rate_limits"], 0);
    assert_eq!(health["active_locks"], 0);
}

#[test]
fn valid_phone_is_awarded_once() {
    let db = temp_db_path("award");
    enable(&db);
    set_phone(&db, "1", "+1 (555) 123-4567");

    let first = trigger(&db, "1");
    assert_eq!(first["dispatch"], "checked");
    assert_eq!(first["detail"]["outcome"], "awarded");
    assert_eq!(first["detail"]["points"], 10);
    assert_eq!(first["detail"]["backend"], "fallback_counter");

    let second = trigger(&db, "1");
    assert_eq!(second["detail"]["outcome"], "already_awarded");

    let user = pfb_json(&db, &["user", "show", "--user-id", "1"]);
    assert_eq!(user["custom_fields"]["phone_field_bonus_awarded"], "true");
    assert_eq!(user["custom_fields"]["phone_field_bonus_points"], "10");

    let stats = pfb_json(&db, &["stats", "show"]);
    assert_eq!(stats[0]["success"], 1);
}

#[test]
fn short_phone_is_ineligible() {
    let db = temp_db_path("ineligible");
    enable(&db);
    set_phone(&db, "2", "12345");

    let outcome = trigger(&db, "2");
    assert_eq!(outcome["detail"]["outcome"], "ineligible");

    let diagnosis = pfb_json(&db, &["diagnose", "--user-id", "2"]);
    assert_eq!(diagnosis["phone"], "12345");
    assert_eq!(diagnosis["phone_digits"], 5);
    assert_eq!(diagnosis["phone_valid"], false);
    assert_eq!(diagnosis["awarded"], false);
    assert_eq!(diagnosis["locked"], false);
    assert_eq!(diagnosis["rate_limit"]["checks"], 1);
}

#[test]
fn rate_limit_can_be_inspected_and_cleared() {
    let db = temp_db_path("rate-limit");
    enable(&db);
    set_phone(&db, "3", "123");
    for _ in 0..6 {
        trigger(&db, "3");
    }

    let status = pfb_json(&db, &["rate-limit", "status", "--user-id", "3"]);
    assert_eq!(status["checks"], 5);
    assert_eq!(status["limited"], true);
    let limited = trigger(&db, "3");
    assert_eq!(limited["detail"]["outcome"], "rate_limited");

    let cleared = pfb_json(&db, &["rate-limit", "clear"]);
    assert_eq!(cleared["cleared"], 1);
    let status = pfb_json(&db, &["rate-limit", "status", "--user-id", "3"]);
    assert_eq!(status["limited"], false);
}

#[test]
fn async_awards_debounce_then_run_as_jobs() {
    let db = temp_db_path("async");
    enable(&db);
    pfb_json(
        &db,
        &["settings", "set", "--name", "phone_field_bonus_async_awards", "--value", "true"],
    );
    set_phone(&db, "4", "0612345678");

    let queued = trigger(&db, "4");
    assert_eq!(queued["dispatch"], "queued");
    let debounced = trigger(&db, "4");
    assert_eq!(debounced["dispatch"], "debounced");

    let listed = pfb_json(&db, &["jobs", "list"]);
    assert_eq!(listed.as_array().map(Vec::len), Some(1));
    assert_eq!(listed[0]["status"], "pending");

    let report = pfb_json(&db, &["jobs", "run"]);
    assert_eq!(report["claimed"], 1);
    assert_eq!(report["completed"], 1);

    let user = pfb_json(&db, &["user", "show", "--user-id", "4"]);
    assert_eq!(user["custom_fields"]["phone_field_bonus_awarded"], "true");
    let stats = pfb_json(&db, &["stats", "show"]);
    assert_eq!(stats[0]["processed"], 1);
}

#[test]
fn gamification_plugin_receives_score_event() {
    let db = temp_db_path("plugin");
    let conn = match Connection::open(&db) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to open fixture db: {err}"),
    };
    if let Err(err) = conn.execute_batch(
        "CREATE TABLE gamification_score_events (
           id INTEGER PRIMARY KEY AUTOINCREMENT,
           user_id INTEGER NOT NULL,
           date TEXT NOT NULL,
           points INTEGER NOT NULL,
           description TEXT,
           created_at TEXT NOT NULL
         );",
    ) {
        panic!("failed to create plugin table: {err}");
    }

    enable(&db);
    pfb_json(&db, &["settings", "set", "--name", "phone_field_bonus_points", "--value", "25"]);
    set_phone(&db, "5", "+44 20 7946 0958");

    let health = pfb_json(&db, &["health"]);
    assert_eq!(health["backend"], "gamification_plugin");

    let outcome = trigger(&db, "5");
    assert_eq!(outcome["detail"]["backend"], "gamification_plugin");

    let row = conn.query_row(
        "SELECT user_id, points, description FROM gamification_score_events",
        [],
        |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, String>(2)?)),
    );
    match row {
        Ok(values) => assert_eq!(values, (5, 25, "phone_field_completed".to_string())),
        Err(err) => panic!("expected one score event: {err}"),
    }
}

#[test]
fn recheck_all_awards_pending_users() {
    let db = temp_db_path("recheck");
    set_phone(&db, "6", "0612345678");
    set_phone(&db, "7", "0698765432");
    set_phone(&db, "8", "12");
    enable(&db);

    let report = pfb_json(&db, &["recheck", "all", "--batch-size", "2"]);
    assert_eq!(report["scanned"], 3);
    assert_eq!(report["awarded"], 2);
    assert_eq!(report["outcomes"]["ineligible"], 1);

    let again = pfb_json(&db, &["recheck", "user", "--user-id", "6"]);
    assert_eq!(again["outcome"], "already_awarded");
}

#[test]
fn invalid_settings_are_rejected() {
    let db = temp_db_path("settings");
    let output = pfb_output(
        &db,
        &["settings", "set", "--name", "phone_field_bonus_points", "--value", "0"],
    );
    assert!(!output.status.success());

    let output = pfb_output(
        &db,
        &["settings", "set", "--name", "phone_field_bonus_debounce_secs", "--value", "45"],
    );
    assert!(!output.status.success());

    let settings = pfb_json(&db, &["settings", "show"]);
    assert_eq!(settings["effective"]["points"], 10);
    assert_eq!(settings["effective"]["debounce_secs"], 10);
}

#[test]
fn out_of_range_windows_fail_cleanly() {
    let db = temp_db_path("ranges");
    for args in [
        vec!["stats", "show", "--days", "4294967295"],
        vec!["stats", "cleanup", "--days-to-keep", "4294967295"],
        vec![
            "settings",
            "set",
            "--name",
            "phone_field_bonus_stats_retention_days",
            "--value",
            "4294967295",
        ],
    ] {
        let output = pfb_output(&db, &args);
        assert!(!output.status.success(), "pfb {:?} unexpectedly succeeded", args);
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(!stderr.contains("panicked"), "pfb {:?} panicked: {stderr}", args);
    }

    let cleanup = pfb_json(&db, &["stats", "cleanup"]);
    assert_eq!(cleanup["deleted"], 0);
}

#[test]
fn stats_cleanup_reports_deleted_keys() {
    let db = temp_db_path("stats-cleanup");
    let cleanup = pfb_json(&db, &["stats", "cleanup"]);
    assert_eq!(cleanup["deleted"], 0);

    let purge = pfb_json(&db, &["cache", "purge"]);
    assert_eq!(purge["purged"], 0);
}
