use predicates::prelude::*;

#[test]
fn help_lists_both_services() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("postcount");
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("post-service"))
        .stdout(predicate::str::contains("user-service"));
}

#[test]
fn version_flag_prints_version() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("postcount");
    cmd.arg("--version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("postcount"));
}

#[test]
fn missing_subcommand_is_a_usage_error() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("postcount");
    cmd.assert().failure().code(2);
}

#[test]
fn unknown_delivery_mode_is_rejected() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("postcount");
    cmd.args(["post-service", "--counter-delivery", "carrier-pigeon"]);
    cmd.assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("--counter-delivery"));
}

#[test]
fn unreadable_data_dir_fails_startup() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::write(data_dir.join("users.json"), b"{ \"schema_version\": 99 }").unwrap();

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("postcount");
    cmd.env("RUST_LOG", "off");
    cmd.args([
        "user-service",
        "--bind",
        "127.0.0.1:0",
        "--data-dir",
        data_dir.to_str().unwrap(),
    ]);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("schema_version mismatch"));
}
