use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const SCHEMA: &str = "[entity.Person]\n\n[[entity.Person.attribute]]\nname = \"name\"\ntype = \"String\"\nrequired = true\nmaxsize = 64\n";

fn write(path: &Path, text: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, text).unwrap();
}

/// An instance directory with a single `people` cube.
fn instance_dir() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    write(
        &tmp.path().join("cubes/people/cube.toml"),
        "[cube]\nname = \"people\"\nversion = \"1.0.0\"\n",
    );
    write(&tmp.path().join("cubes/people/schema.toml"), SCHEMA);
    let config = tmp.path().join("instance.toml");
    write(
        &config,
        "[instance]\nname = \"demo\"\ncubes = [\"people\"]\n\n[database]\ndriver = \"sqlite\"\npath = \"demo.sqlite\"\nuser = \"cw\"\n\n[migration]\ninteractive = false\nbackup = \"never\"\n",
    );
    (tmp, config)
}

fn ctl(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("cubicweb-ctl").unwrap();
    cmd.arg("--instance").arg(config).env_remove("CW_INSTANCE").env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_lists_commands() {
    Command::cargo_bin("cubicweb-ctl")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("upgrade"))
        .stdout(predicate::str::contains("check-indexes"));
}

#[test]
fn missing_configuration_exits_with_4() {
    let tmp = TempDir::new().unwrap();
    ctl(&tmp.path().join("nope.toml"))
        .arg("deps")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("Cannot load instance"));
}

#[test]
fn create_then_check() {
    let (tmp, config) = instance_dir();
    ctl(&config)
        .arg("create")
        .assert()
        .success()
        .stdout(predicate::str::contains("Instance demo created"));
    assert!(tmp.path().join("demo.sqlite").exists());

    ctl(&config)
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("violation(s)"));
    ctl(&config).arg("check-indexes").assert().code(0);
    ctl(&config)
        .arg("upgrade")
        .assert()
        .success()
        .stdout(predicate::str::contains("up to date"));

    ctl(&config).arg("create").assert().code(4);
}

#[test]
fn commands_need_a_database() {
    let (_tmp, config) = instance_dir();
    ctl(&config)
        .arg("check")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("cubicweb-ctl create"));
}

#[test]
fn schema_sql_with_grant() {
    let (_tmp, config) = instance_dir();
    ctl(&config)
        .args(["schema-sql", "--dialect", "postgres", "--grant"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cw_name varchar(64)"))
        .stdout(predicate::str::contains("GRANT ALL ON cw_Person TO cw;"));
}

#[test]
fn shell_exit_status_is_the_process_status() {
    let (tmp, config) = instance_dir();
    ctl(&config).arg("create").assert().success();
    let script = tmp.path().join("stop.mig");
    write(&script, "exit 3\n");
    ctl(&config).arg("shell").arg(&script).arg("--yes").assert().code(3);
}

#[test]
fn deps_reports_unsatisfied_constraints() {
    let (tmp, config) = instance_dir();
    write(
        &tmp.path().join("cubes/people/cube.toml"),
        "[cube]\nname = \"people\"\nversion = \"1.0.0\"\n\n[depends]\ntag = \">= 2.0.0\"\n",
    );
    write(
        &tmp.path().join("cubes/tag/cube.toml"),
        "[cube]\nname = \"tag\"\nversion = \"1.0.0\"\n",
    );
    ctl(&config)
        .arg("deps")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("update cube tag"));
}

#[test]
fn backup_and_restore() {
    let (tmp, config) = instance_dir();
    ctl(&config).arg("create").assert().success();
    let output = ctl(&config)
        .args(["backup", "--format", "portable"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let archive = PathBuf::from(String::from_utf8(output).unwrap().trim());
    assert!(archive.starts_with(tmp.path().join("backup")));

    ctl(&config)
        .arg("restore")
        .arg(&archive)
        .assert()
        .success()
        .stdout(predicate::str::contains("people"));
}
