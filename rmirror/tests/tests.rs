use assert_cmd::Command;
use predicates::prelude::*;

fn rmirror() -> Command {
    Command::cargo_bin("rmirror").unwrap()
}

fn populate(root: &std::path::Path) {
    std::fs::create_dir_all(root.join("docs").join("empty")).unwrap();
    std::fs::create_dir_all(root.join("tmp")).unwrap();
    std::fs::write(root.join("a.txt"), "alpha").unwrap();
    std::fs::write(root.join("docs").join("b.txt"), "beta").unwrap();
    std::fs::write(root.join("tmp").join("scratch"), "scratch").unwrap();
}

#[test]
fn check_help() {
    rmirror().arg("--help").assert().success();
}

#[test]
fn check_version() {
    rmirror()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("rmirror"));
}

#[test]
fn progress_type_accepts_both_spellings() {
    for value in ["auto", "Auto", "ProgressBar", "progress-bar", "TextUpdates", "text-updates"] {
        rmirror()
            .args(["--progress-type", value, "--help"])
            .assert()
            .success();
    }
    rmirror()
        .args(["--progress-type", "fancy", "--help"])
        .assert()
        .failure();
}

#[test]
fn missing_arguments_are_rejected() {
    rmirror().assert().failure();
    rmirror().arg("/only/source").assert().failure();
}

#[test]
fn mirrors_and_then_has_nothing_to_do() {
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let dst = tmp.path().join("dst");
    populate(&src);
    rmirror()
        .arg(&src)
        .arg(&dst)
        .args(["--ignore", "^tmp$", "--summary"])
        .assert()
        .success()
        .stdout(predicate::str::contains("files copied: 2"));
    assert_eq!(std::fs::read_to_string(dst.join("a.txt")).unwrap(), "alpha");
    assert_eq!(
        std::fs::read_to_string(dst.join("docs").join("b.txt")).unwrap(),
        "beta"
    );
    assert!(dst.join("docs").join("empty").is_dir());
    assert!(!dst.join("tmp").exists());
    assert!(dst.join(".rmirror_cache.bin").is_file());
    assert!(!dst.join(".rmirror.lock").exists());
    rmirror()
        .arg(&src)
        .arg(&dst)
        .args(["--ignore", "^tmp$", "--summary"])
        .assert()
        .success()
        .stdout(predicate::str::contains("files copied: 0"))
        .stdout(predicate::str::contains("files deleted: 0"));
}

#[test]
fn missing_source_fails() {
    let tmp = tempfile::tempdir().unwrap();
    rmirror()
        .arg(tmp.path().join("nope"))
        .arg(tmp.path().join("dst"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("1 of 1 mirrors failed"));
}

#[test]
fn batch_keeps_going_after_a_failed_mirror() {
    let tmp = tempfile::tempdir().unwrap();
    let good = tmp.path().join("good");
    populate(&good);
    let config = serde_json::json!({
        "mirrors": [
            {
                "title": "broken",
                "source": tmp.path().join("missing"),
                "destination": tmp.path().join("broken-copy"),
            },
            {
                "title": "good",
                "source": &good,
                "destination": tmp.path().join("good-copy"),
                "ignore": "^tmp$; .txt$",
            },
        ]
    });
    let config_path = tmp.path().join("mirrors.json");
    std::fs::write(&config_path, config.to_string()).unwrap();
    let log_path = tmp.path().join("rmirror.log");
    rmirror()
        .arg("--config")
        .arg(&config_path)
        .arg("--log")
        .arg(&log_path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("1 of 2 mirrors failed"));
    let copy = tmp.path().join("good-copy");
    assert!(copy.join("docs").join("empty").is_dir());
    assert!(!copy.join("a.txt").exists());
    assert!(!copy.join("tmp").exists());
    let log = std::fs::read_to_string(&log_path).unwrap();
    assert!(log.contains("[INFO] good finished"));
    assert!(log.contains("[ERROR] broken"));
}

#[test]
fn config_conflicts_with_paths() {
    rmirror()
        .args(["--config", "mirrors.json", "/src", "/dst"])
        .assert()
        .failure();
}
