#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use rusqlite::Connection;
use serde_json::Value;
use ulid::Ulid;

fn sq_binary_path() -> PathBuf {
    match std::env::var("CARGO_BIN_EXE_sq") {
        Ok(value) => PathBuf::from(value),
        Err(_) => {
            let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../target/debug/sq");
            if !path.exists() {
                let status = Command::new("cargo")
                    .args(["build", "-p", "squad-sync-cli", "--bin", "sq"])
                    .status();
                match status {
                    Ok(value) if value.success() => {}
                    Ok(value) => panic!("failed to build sq binary (status={value})"),
                    Err(err) => panic!("failed to invoke cargo build: {err}"),
                }
            }
            path
        }
    }
}

fn temp_db(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("sq-{label}-{}.sqlite3", Ulid::new()))
}

fn sq_output(db_path: &Path, actor: Option<&str>, args: &[&str]) -> Output {
    let mut command = Command::new(sq_binary_path());
    command.env_remove("SQ_ACTOR").arg("--db").arg(db_path);
    if let Some(actor) = actor {
        command.arg("--actor").arg(actor);
    }
    for arg in args {
        command.arg(arg);
    }

    match command.output() {
        Ok(output) => output,
        Err(err) => panic!("failed to run sq command {:?}: {err}", args),
    }
}

fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

fn ok_json(db_path: &Path, actor: Option<&str>, args: &[&str]) -> Value {
    let output = sq_output(db_path, actor, args);
    assert!(
        output.status.success(),
        "command {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    stdout_json(&output)
}

fn str_field<'a>(value: &'a Value, field: &str) -> &'a str {
    match value[field].as_str() {
        Some(text) => text,
        None => panic!("expected string field {field} in {value}"),
    }
}

#[test]
fn help_contract_lists_expected_subcommands() {
    let output = match Command::new(sq_binary_path()).arg("--help").output() {
        Ok(value) => value,
        Err(err) => panic!("failed to run help command: {err}"),
    };

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for required in ["reactions", "comments", "votes", "feed"] {
        assert!(
            stdout.contains(required),
            "expected help output to contain subcommand {required}; output={stdout}"
        );
    }
}

#[test]
fn reaction_toggle_adds_then_removes() {
    let db_path = temp_db("toggle");
    let args = ["reactions", "toggle", "--photo", "photo-1", "--emoji", "👍"];

    let first = ok_json(&db_path, Some("alice"), &args);
    assert_eq!(first["scope"], Value::from("reaction:photo-1"));
    assert_eq!(first["report"]["outcomes"][0]["outcome"], Value::from("confirmed"));
    assert_eq!(first["groups"][0]["emoji"], Value::from("👍"));
    assert_eq!(first["groups"][0]["count"], Value::from(1));
    assert_eq!(first["groups"][0]["actor_acted"], Value::from(true));

    let listed = ok_json(
        &db_path,
        Some("bob"),
        &["reactions", "list", "--photo", "photo-1"],
    );
    assert_eq!(listed["total"], Value::from(1));
    assert_eq!(listed["groups"][0]["actor_acted"], Value::from(false));

    let second = ok_json(&db_path, Some("alice"), &args);
    assert_eq!(second["report"]["outcomes"][0]["outcome"], Value::from("removed"));
    assert_eq!(second["groups"].as_array().map(Vec::len), Some(0));

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn reactors_lists_every_actor_for_an_emoji() {
    let db_path = temp_db("reactors");
    for actor in ["alice", "bob"] {
        ok_json(
            &db_path,
            Some(actor),
            &["reactions", "toggle", "--photo", "photo-2", "--emoji", "🔥"],
        );
    }
    ok_json(
        &db_path,
        Some("carol"),
        &["reactions", "toggle", "--photo", "photo-2", "--emoji", "🎉"],
    );

    let output = ok_json(
        &db_path,
        None,
        &["reactions", "reactors", "--photo", "photo-2", "--emoji", "🔥"],
    );
    assert_eq!(output["actors"], serde_json::json!(["alice", "bob"]));

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn reaction_outside_palette_is_rejected() {
    let db_path = temp_db("palette");
    let output = sq_output(
        &db_path,
        Some("alice"),
        &["reactions", "toggle", "--photo", "photo-1", "--emoji", "🦀"],
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("palette"), "stderr={stderr}");

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn mutations_without_actor_fail() {
    let db_path = temp_db("anonymous");
    let output = sq_output(
        &db_path,
        None,
        &["comments", "post", "--photo", "photo-1", "--text", "hi"],
    );
    assert!(!output.status.success());

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn actor_falls_back_to_environment() {
    let db_path = temp_db("env-actor");
    let output = match Command::new(sq_binary_path())
        .env("SQ_ACTOR", "dana")
        .arg("--db")
        .arg(&db_path)
        .args(["comments", "post", "--photo", "photo-1", "--text", "from env"])
        .output()
    {
        Ok(value) => value,
        Err(err) => panic!("failed to run sq: {err}"),
    };
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value["thread"][0]["actor_id"], Value::from("dana"));

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn comments_post_list_and_delete() {
    let db_path = temp_db("comments");
    ok_json(
        &db_path,
        Some("alice"),
        &["comments", "post", "--photo", "photo-1", "--text", "  first!  "],
    );
    ok_json(
        &db_path,
        Some("bob"),
        &["comments", "post", "--photo", "photo-1", "--text", "second"],
    );

    let listed = ok_json(&db_path, None, &["comments", "list", "--photo", "photo-1"]);
    let thread = match listed["thread"].as_array() {
        Some(entries) => entries.clone(),
        None => panic!("thread missing: {listed}"),
    };
    assert_eq!(thread.len(), 2);
    assert_eq!(thread[0]["text"], Value::from("first!"));
    assert_eq!(thread[0]["pending"], Value::from(false));
    let alice_comment = str_field(&thread[0], "id").to_string();

    let foreign = sq_output(
        &db_path,
        Some("bob"),
        &["comments", "delete", "--photo", "photo-1", "--id", &alice_comment],
    );
    assert!(!foreign.status.success());

    let deleted = ok_json(
        &db_path,
        Some("alice"),
        &["comments", "delete", "--photo", "photo-1", "--id", &alice_comment],
    );
    assert_eq!(deleted["report"]["outcomes"][0]["outcome"], Value::from("removed"));
    assert_eq!(deleted["thread"].as_array().map(Vec::len), Some(1));
    assert_eq!(deleted["thread"][0]["text"], Value::from("second"));

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn votes_tally_reports_shares_and_winner() {
    let db_path = temp_db("votes");
    let pizza = ok_json(
        &db_path,
        None,
        &["votes", "option-add", "--event", "event-1", "--label", "Pizza"],
    );
    let tacos = ok_json(
        &db_path,
        None,
        &["votes", "option-add", "--event", "event-1", "--label", " Tacos "],
    );
    assert_eq!(tacos["label"], Value::from("Tacos"));
    let pizza_id = str_field(&pizza, "id").to_string();
    let tacos_id = str_field(&tacos, "id").to_string();

    for (actor, option) in [("alice", &pizza_id), ("bob", &pizza_id), ("carol", &tacos_id)] {
        let cast = ok_json(
            &db_path,
            Some(actor),
            &["votes", "cast", "--event", "event-1", "--option", option],
        );
        assert_eq!(cast["report"]["outcomes"][0]["outcome"], Value::from("confirmed"));
    }

    let repeat = ok_json(
        &db_path,
        Some("alice"),
        &["votes", "cast", "--event", "event-1", "--option", &pizza_id],
    );
    assert_eq!(repeat["report"]["noop"], Value::from("already_voted"));

    let tally = ok_json(
        &db_path,
        Some("alice"),
        &[
            "votes",
            "tally",
            "--event",
            "event-1",
            "--closes-at",
            "2026-03-01T18:00:00Z",
            "--as-of",
            "2026-03-01T12:00:00Z",
        ],
    );
    assert_eq!(tally["total_votes"], Value::from(3));
    assert_eq!(tally["options"][0]["percentage"], Value::from(67));
    assert_eq!(tally["options"][1]["percentage"], Value::from(33));
    assert_eq!(tally["winner"]["label"], Value::from("Pizza"));
    assert_eq!(tally["ranked"][0]["vote_count"], Value::from(2));
    assert_eq!(tally["closed"], Value::from(false));
    assert_eq!(tally["unvoted"][0]["label"], Value::from("Tacos"));
    assert_eq!(tally["voters"][&pizza_id], serde_json::json!(["alice", "bob"]));

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn vote_for_unknown_option_fails() {
    let db_path = temp_db("unknown-option");
    ok_json(
        &db_path,
        None,
        &["votes", "option-add", "--event", "event-1", "--label", "Pizza"],
    );
    let stranger = Ulid::new().to_string();
    let output = sq_output(
        &db_path,
        Some("alice"),
        &["votes", "cast", "--event", "event-1", "--option", &stranger],
    );
    assert!(!output.status.success());

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn feed_tail_replays_committed_changes() {
    let db_path = temp_db("feed");
    let args = ["reactions", "toggle", "--photo", "photo-1", "--emoji", "❤️"];
    ok_json(&db_path, Some("alice"), &args);
    ok_json(&db_path, Some("alice"), &args);

    let feed = ok_json(&db_path, None, &["feed", "tail"]);
    let ops: Vec<&str> = match feed.as_array() {
        Some(entries) => entries
            .iter()
            .filter_map(|entry| entry["notification"]["op"].as_str())
            .collect(),
        None => panic!("feed is not an array: {feed}"),
    };
    assert_eq!(ops, vec!["created", "deleted"]);

    let after_first = ok_json(&db_path, None, &["feed", "tail", "--after", "1"]);
    assert_eq!(after_first.as_array().map(Vec::len), Some(1));

    let conn = match Connection::open(&db_path) {
        Ok(conn) => conn,
        Err(err) => panic!("failed to open db: {err}"),
    };
    let counted = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0));
    let remaining: i64 = match counted {
        Ok(count) => count,
        Err(err) => panic!("failed to count records: {err}"),
    };
    assert_eq!(remaining, 0);

    let _ = std::fs::remove_file(db_path);
}

#[test]
fn invalid_config_file_is_rejected() {
    let db_path = temp_db("config");
    let config_path = std::env::temp_dir().join(format!("sq-config-{}.json", Ulid::new()));
    if let Err(err) = std::fs::write(&config_path, r#"{"max_comment_chars": 0}"#) {
        panic!("failed to write config: {err}");
    }

    let output = Command::new(sq_binary_path())
        .env_remove("SQ_ACTOR")
        .arg("--db")
        .arg(&db_path)
        .arg("--config")
        .arg(&config_path)
        .args(["comments", "list", "--photo", "photo-1"])
        .output();
    let output = match output {
        Ok(value) => value,
        Err(err) => panic!("failed to run sq: {err}"),
    };
    assert!(!output.status.success());

    let _ = std::fs::remove_file(db_path);
    let _ = std::fs::remove_file(config_path);
}
