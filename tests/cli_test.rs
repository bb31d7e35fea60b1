//! Command-line tests for the `cartage` binary

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn cartage(data_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("cartage").unwrap();
    cmd.args([
        "--data-dir",
        data_dir.path().to_str().unwrap(),
        "--log-level",
        "warn",
    ]);
    cmd
}

#[test]
fn test_help_lists_subcommands() {
    Command::cargo_bin("cartage")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("import"))
        .stdout(predicate::str::contains("authorize"))
        .stdout(predicate::str::contains("fetch"));
}

#[test]
fn test_import_then_authorize() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.bin");
    std::fs::write(&input, vec![42u8; 300_000]).unwrap();

    let output = cartage(&dir)
        .args(["import", input.to_str().unwrap()])
        .assert()
        .success()
        .stdout(predicate::str::contains("file size: 300000"))
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8(output).unwrap();
    let root = stdout
        .lines()
        .find_map(|line| line.strip_prefix("root: "))
        .unwrap()
        .to_string();

    cartage(&dir)
        .args(["authorize", &root, "--client", "client-1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("token: "))
        .stdout(predicate::str::contains("Authorization: Basic "));
}

#[test]
fn test_authorize_unknown_root_fails() {
    let dir = TempDir::new().unwrap();
    cartage(&dir)
        .args([
            "authorize",
            "bafkreigh2akiscaildcqabsyg3dfr6chu3fgpregiymsck7e7aqa4s52zy",
            "--client",
            "client-1",
        ])
        .assert()
        .failure();
}

#[test]
fn test_invalid_max_links_is_rejected() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("input.bin");
    std::fs::write(&input, b"payload").unwrap();

    cartage(&dir)
        .args(["import", input.to_str().unwrap(), "--max-links", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("max_links"));
}
