use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
struct GradeCli {
    #[command(flatten)]
    config: autograder::ConfigArgs,
    #[command(flatten)]
    grade: autograder::GradeArgs,
}

#[test]
fn grade_args_use_root_and_defaults() {
    let cli = GradeCli::try_parse_from([
        "autograder-grade",
        "--course",
        "course101",
        "--assignment",
        "hw0",
        "--submission",
        "/tmp/sub",
    ])
    .expect("parse");

    assert_eq!(cli.grade.course, "course101");
    assert_eq!(cli.grade.assignment, "hw0");
    assert_eq!(cli.grade.submission, PathBuf::from("/tmp/sub"));
    assert_eq!(cli.grade.user, "root");
    assert!(cli.grade.message.is_empty());
    assert!(!cli.grade.allow_late);
    assert!(!cli.grade.no_store);
    assert!(cli.config.config_dir.is_none());
    assert!(cli.config.overrides.is_empty());
}

#[test]
fn config_overrides_and_files_accumulate() {
    let cli = GradeCli::try_parse_from([
        "autograder-grade",
        "-c",
        "db.type=memory",
        "--config",
        "docker.disable=true",
        "--config-file",
        "a.json",
        "--config-file",
        "b.json",
        "--config-dir",
        "/etc/autograder",
        "--course",
        "c",
        "--assignment",
        "a",
        "--submission",
        ".",
        "--allow-late",
        "--no-store",
    ])
    .expect("parse");

    assert_eq!(cli.config.overrides, vec!["db.type=memory", "docker.disable=true"]);
    assert_eq!(cli.config.config_files, vec![PathBuf::from("a.json"), PathBuf::from("b.json")]);
    assert_eq!(cli.config.config_dir, Some(PathBuf::from("/etc/autograder")));
    assert!(cli.grade.allow_late);
    assert!(cli.grade.no_store);
}

#[test]
fn grade_args_require_a_submission() {
    let err = GradeCli::try_parse_from(["autograder-grade", "--course", "c", "--assignment", "a"])
        .expect_err("missing submission");
    assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
}
