use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("hotspotctl");
    Command::new(path)
}

fn scrubbed(mut cmd: Command) -> Command {
    cmd.env_remove("HOTSPOT_REEXEC")
        .env_remove("HOTSPOT_SRC_DIR")
        .env_remove("HOTSPOT_INSTALL_ROOT")
        .env_remove("SUDO_USER")
        .env_remove("SUDO_COMMAND");
    cmd
}

// Lay out a controller + daemon pair in a scratch directory so the binary
// classifies as a direct invocation instead of whatever shape the build
// tree happens to have.
fn stage_binaries(dir: &Path) -> (PathBuf, PathBuf) {
    let bin_dir = dir.join("bin");
    fs::create_dir_all(&bin_dir).unwrap();
    let controller = bin_dir.join("hotspotctl");
    let source: PathBuf = assert_cmd::cargo::cargo_bin!("hotspotctl").into();
    fs::copy(&source, &controller).unwrap();
    let daemon = bin_dir.join("hotspotd");
    fs::write(&daemon, "#!/bin/sh\nexit 0\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&controller, fs::Permissions::from_mode(0o755)).unwrap();
        fs::set_permissions(&daemon, fs::Permissions::from_mode(0o755)).unwrap();
    }
    (controller, daemon)
}

fn entry_count(dir: &Path) -> usize {
    fs::read_dir(dir).map(|it| it.count()).unwrap_or(0)
}

#[test]
fn help_prints_usage_and_exits_zero() {
    bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("Usage"))
        .stdout(contains("--dry-run"))
        .stdout(contains("--log-level"));
}

#[test]
fn version_flag_prints_version() {
    bin()
        .arg("-v")
        .assert()
        .success()
        .stdout(contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn unknown_flag_exits_one() {
    bin().arg("--definitely-not-a-flag").assert().code(1);
}

#[test]
fn reexec_generation_short_circuits_without_writes() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("root");
    fs::create_dir_all(&root).unwrap();

    scrubbed(bin())
        .env("HOTSPOT_REEXEC", "1")
        .env("HOTSPOT_INSTALL_ROOT", &root)
        .assert()
        .success()
        .stdout(contains("bootstrap complete"));

    assert_eq!(entry_count(&root), 0);
}

#[test]
fn reexec_generation_accepts_carried_source_dir() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("root");
    fs::create_dir_all(&root).unwrap();

    scrubbed(bin())
        .env("HOTSPOT_REEXEC", "true")
        .env("HOTSPOT_SRC_DIR", dir.path())
        .env("HOTSPOT_INSTALL_ROOT", &root)
        .assert()
        .success()
        .stdout(contains("handing off to controller"));
}

#[test]
fn log_file_flag_writes_log_lines() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("root");
    fs::create_dir_all(&root).unwrap();
    let log_path = dir.path().join("bootstrap.log");

    scrubbed(bin())
        .env("HOTSPOT_REEXEC", "1")
        .env("HOTSPOT_INSTALL_ROOT", &root)
        .arg("--log-file")
        .arg(&log_path)
        .arg("--log-level")
        .arg("DEBUG")
        .assert()
        .success();

    let content = fs::read_to_string(&log_path).unwrap();
    assert!(content.contains("re-exec generation detected"));
}

#[test]
fn privilege_failure_is_fatal_with_trace() {
    let dir = tempdir().unwrap();
    let (controller, _daemon) = stage_binaries(dir.path());
    let root = dir.path().join("root");
    fs::create_dir_all(&root).unwrap();

    let mut cmd = scrubbed(Command::new(&controller));
    cmd.env("HOTSPOT_INSTALL_ROOT", &root)
        .assert()
        .code(1)
        .stderr(contains("privilege error"))
        .stderr(contains("trace:"));

    assert_eq!(entry_count(&root), 0);
}

#[test]
fn dry_run_direct_simulates_replacement() {
    let dir = tempdir().unwrap();
    let (controller, _daemon) = stage_binaries(dir.path());
    let root = dir.path().join("root");
    fs::create_dir_all(&root).unwrap();

    let mut cmd = scrubbed(Command::new(&controller));
    cmd.env("HOTSPOT_INSTALL_ROOT", &root)
        .arg("--dry-run")
        .assert()
        .success()
        .stdout(contains("would replace process with"))
        .stdout(contains("HOTSPOT_REEXEC=1"))
        .stdout(contains("\"simulated\": true"));

    // Simulation must leave the install root untouched.
    assert_eq!(entry_count(&root), 0);
}

#[test]
fn dry_run_reports_canonical_controller_target() {
    let dir = tempdir().unwrap();
    let (controller, _daemon) = stage_binaries(dir.path());
    let root = dir.path().join("root");
    fs::create_dir_all(&root).unwrap();

    let expected = root.join("usr/sbin/hotspotctl");
    let mut cmd = scrubbed(Command::new(&controller));
    cmd.env("HOTSPOT_INSTALL_ROOT", &root)
        .arg("--dry-run")
        .arg("--terse")
        .assert()
        .success()
        .stdout(contains(expected.display().to_string()));
}
