//! Tests for check-uploads, recovery, checksum.

use super::parse;
use crate::cli::CliCommand;
use std::path::Path;

#[test]
fn cli_parse_check_uploads() {
    match parse(&[
        "dstage",
        "check-uploads",
        "--job-id",
        "J3",
        "--session-dir",
        "/ws/J3",
    ]) {
        CliCommand::CheckUploads {
            job_id,
            session_dir,
            started_secs_ago,
        } => {
            assert_eq!(job_id, "J3");
            assert_eq!(session_dir, Path::new("/ws/J3"));
            assert_eq!(started_secs_ago, 0);
        }
        _ => panic!("expected CheckUploads"),
    }
}

#[test]
fn cli_parse_check_uploads_started() {
    match parse(&[
        "dstage",
        "check-uploads",
        "--job-id",
        "J3",
        "--session-dir",
        "/ws/J3",
        "--started-secs-ago",
        "700",
    ]) {
        CliCommand::CheckUploads {
            started_secs_ago, ..
        } => assert_eq!(started_secs_ago, 700),
        _ => panic!("expected CheckUploads"),
    }
}

#[test]
fn cli_parse_recovery() {
    match parse(&["dstage", "recovery"]) {
        CliCommand::Recovery => {}
        _ => panic!("expected Recovery"),
    }
}

#[test]
fn cli_parse_checksum() {
    match parse(&["dstage", "checksum", "/tmp/out.dat"]) {
        CliCommand::Checksum { path } => assert_eq!(path, "/tmp/out.dat"),
        _ => panic!("expected Checksum"),
    }
}

#[test]
fn session_user_prefers_explicit_ids() {
    let dir = tempfile::tempdir().unwrap();
    let user = crate::cli::commands::session_user(dir.path(), Some(4242), Some(77));
    assert_eq!((user.uid, user.gid), (4242, 77));
}
