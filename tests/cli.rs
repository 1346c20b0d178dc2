//! CLI test cases.
//!
//! The `parse` and `migrate` subcommands need live PostgreSQL and remote OCR
//! credentials, so they are exercised by the ignored database tests instead.
//! Everything here runs offline.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    Command::cargo_bin("coi-pipeline").unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_schema_parse_result() {
    cmd()
        .arg("schema")
        .arg("ParseResult")
        .assert()
        .success()
        .stdout(predicate::str::contains("acordLikely"));
}

#[test]
fn test_schema_parse_document_response() {
    cmd()
        .arg("schema")
        .arg("ParseDocumentResponse")
        .assert()
        .success()
        .stdout(predicate::str::contains("snapshot_version"));
}

#[test]
fn test_parse_text_sample_certificate() {
    cmd()
        .arg("parse-text")
        .arg("tests/fixtures/acord_sample.txt")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"acordLikely\": true"))
        .stdout(predicate::str::contains("\"auto_liability_limit\": 1000000"))
        .stdout(predicate::str::contains("\"cargo_limit\": 100000"));
}

#[test]
fn test_parse_text_missing_file_fails() {
    cmd()
        .arg("parse-text")
        .arg("tests/fixtures/no-such-file.txt")
        .assert()
        .failure();
}

#[test]
fn test_parse_requires_database_url() {
    cmd()
        .env_remove("DATABASE_URL")
        .arg("parse")
        .arg("--document-id")
        .arg("1")
        .assert()
        .failure()
        .stderr(predicate::str::contains("DATABASE_URL"));
}
