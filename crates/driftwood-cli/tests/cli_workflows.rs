//! Integration tests for the CLI binary.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn cli() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("driftwood"))
}

fn table_root(tmp: &TempDir) -> PathBuf {
    tmp.path().join("table")
}

fn arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn write_jsonl(path: &Path, keys: std::ops::Range<u32>, partition: &str) -> TestResult {
    let lines: Vec<String> = keys
        .map(|k| format!(r#"{{"key":"k{k:03}","partition":"{partition}","value":{{"n":{k}}}}}"#))
        .collect();
    std::fs::write(path, lines.join("\n") + "\n")?;
    Ok(())
}

fn init(table: &Path, table_type: &str) {
    cli()
        .args(["init", "--table", &arg(table), "--type", table_type])
        .assert()
        .success()
        .stdout(contains("Created table"));
}

#[test]
fn init_ingest_and_list_slices() -> TestResult {
    let tmp = TempDir::new()?;
    let table = table_root(&tmp);
    let input = tmp.path().join("batch.jsonl");
    write_jsonl(&input, 0..10, "P")?;

    init(&table, "cow");
    cli()
        .args(["ingest", "--table", &arg(&table), "--input", &arg(&input)])
        .assert()
        .success()
        .stdout(contains("Committed instant").and(contains("(10 records)")));

    cli()
        .args(["timeline", "--table", &arg(&table)])
        .assert()
        .success()
        .stdout(contains("\tcommit\t"));

    cli()
        .args(["slices", "--table", &arg(&table), "--partition", "P"])
        .assert()
        .success()
        .stdout(contains(".base.jsonl").and(contains("logs=0")));
    Ok(())
}

#[test]
fn init_twice_fails() -> TestResult {
    let tmp = TempDir::new()?;
    let table = table_root(&tmp);
    init(&table, "cow");

    cli()
        .args(["init", "--table", &arg(&table)])
        .assert()
        .failure()
        .stderr(contains("Failed to create table"));
    Ok(())
}

#[test]
fn commands_on_missing_table_fail() -> TestResult {
    let tmp = TempDir::new()?;
    cli()
        .args(["timeline", "--table", &arg(&table_root(&tmp))])
        .assert()
        .failure()
        .stderr(contains("Failed to open table"));
    Ok(())
}

#[test]
fn streaming_ingest_records_checkpoint_and_skips_replays() -> TestResult {
    let tmp = TempDir::new()?;
    let table = table_root(&tmp);
    let input = tmp.path().join("batch.jsonl");
    write_jsonl(&input, 0..5, "P")?;
    init(&table, "mor");

    let ingest = |batch: &str| {
        cli()
            .args([
                "ingest",
                "--table",
                &arg(&table),
                "--input",
                &arg(&input),
                "--writer",
                "id1",
                "--batch",
                batch,
            ])
            .assert()
            .success()
    };
    ingest("0").stdout(contains("Committed instant"));
    ingest("0").stdout(contains("already committed"));

    cli()
        .args(["checkpoint", "--table", &arg(&table), "--writer", "id1"])
        .assert()
        .success()
        .stdout(contains("0"));
    cli()
        .args(["checkpoint", "--table", &arg(&table), "--writer", "id2"])
        .assert()
        .success()
        .stdout(contains("No checkpoint"));
    Ok(())
}

#[test]
fn writer_without_batch_is_rejected() -> TestResult {
    let tmp = TempDir::new()?;
    let table = table_root(&tmp);
    let input = tmp.path().join("batch.jsonl");
    write_jsonl(&input, 0..1, "P")?;
    init(&table, "cow");

    cli()
        .args([
            "ingest",
            "--table",
            &arg(&table),
            "--input",
            &arg(&input),
            "--writer",
            "id1",
        ])
        .assert()
        .failure();
    Ok(())
}

#[test]
fn compact_merges_log_files() -> TestResult {
    let tmp = TempDir::new()?;
    let table = table_root(&tmp);
    let input = tmp.path().join("batch.jsonl");
    write_jsonl(&input, 0..4, "P")?;
    init(&table, "mor");

    cli()
        .args(["ingest", "--table", &arg(&table), "--input", &arg(&input)])
        .assert()
        .success();
    cli()
        .args(["slices", "--table", &arg(&table), "--partition", "P"])
        .assert()
        .success()
        .stdout(contains("logs=1"));

    cli()
        .args(["compact", "--table", &arg(&table)])
        .assert()
        .success()
        .stdout(contains("Completed compaction"));
    cli()
        .args(["slices", "--table", &arg(&table), "--partition", "P"])
        .assert()
        .success()
        .stdout(contains("logs=0"));

    cli()
        .args(["compact", "--table", &arg(&table)])
        .assert()
        .success()
        .stdout(contains("No compaction needed"));
    Ok(())
}

#[test]
fn cluster_rewrites_groups_and_shows_replace() -> TestResult {
    let tmp = TempDir::new()?;
    let table = table_root(&tmp);
    let first = tmp.path().join("a.jsonl");
    let second = tmp.path().join("b.jsonl");
    write_jsonl(&first, 0..3, "P")?;
    write_jsonl(&second, 3..6, "P")?;
    init(&table, "cow");

    for input in [&first, &second] {
        cli()
            .args([
                "ingest",
                "--table",
                &arg(&table),
                "--input",
                &arg(input),
                "--operation",
                "insert",
            ])
            .assert()
            .success();
    }

    cli()
        .args(["cluster", "--table", &arg(&table), "--max-commits", "2"])
        .assert()
        .success()
        .stdout(contains("Completed replacecommit"));
    cli()
        .args(["timeline", "--table", &arg(&table)])
        .assert()
        .success()
        .stdout(contains("\treplacecommit\t"));

    let out = cli()
        .args(["slices", "--table", &arg(&table), "--partition", "P"])
        .output()?;
    assert!(out.status.success());
    assert_eq!(String::from_utf8(out.stdout)?.lines().count(), 1);
    Ok(())
}

#[test]
fn timeline_rejects_malformed_range() -> TestResult {
    let tmp = TempDir::new()?;
    let table = table_root(&tmp);
    init(&table, "cow");

    cli()
        .args(["timeline", "--table", &arg(&table), "--range", "yesterday"])
        .assert()
        .failure()
        .stderr(contains("Invalid --range"));
    cli()
        .args([
            "timeline",
            "--table",
            &arg(&table),
            "--range",
            "..29991231235959999",
        ])
        .assert()
        .success();
    Ok(())
}

#[test]
fn archive_reports_count() -> TestResult {
    let tmp = TempDir::new()?;
    let table = table_root(&tmp);
    let input = tmp.path().join("batch.jsonl");
    write_jsonl(&input, 0..2, "P")?;
    init(&table, "cow");
    for _ in 0..4 {
        cli()
            .args(["ingest", "--table", &arg(&table), "--input", &arg(&input)])
            .assert()
            .success();
    }

    cli()
        .args([
            "archive",
            "--table",
            &arg(&table),
            "--min-to-keep",
            "1",
            "--max-to-keep",
            "2",
        ])
        .assert()
        .success()
        .stdout(contains("Archived 3 instants"));
    Ok(())
}
