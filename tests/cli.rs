use std::{
    ffi::OsStr,
    fs,
    path::Path,
    process::{Command, Output},
};

use serde_json::Value;
use tempfile::tempdir;

const RECORDINGS: &str = "1=DriverOpen\t1:nil
2=ConnQuery\t2:\"SELECT 1\"\t1:nil
3=ConnQuery\t2:\"SELECT 2\"\t1:nil
4=RowsColumns\t9:[\"n\"]

\"TestOne\"=1,2
\"TestTwo\"=1,3
";

fn write_config(path: &Path, recording_path: &Path) {
    let config = format!(
        r#"
[recording]
path = "{}"

[logging]
level = "warn"
"#,
        recording_path.display()
    );
    fs::write(path, config).expect("config should be written");
}

fn run_sqlreplay<I, S>(args: I, cwd: &Path, home: &Path) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_sqlreplay"))
        .args(args)
        .env("HOME", home)
        .env_remove("SQLREPLAY_LOG")
        .current_dir(cwd)
        .output()
        .expect("sqlreplay command should execute")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "expected success\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn config_discovery_prefers_project_then_home_then_override() {
    let sandbox = tempdir().expect("tempdir should be created");
    let project_dir = sandbox.path().join("project");
    let home_dir = sandbox.path().join("home");
    fs::create_dir_all(&project_dir).expect("project dir should be created");
    fs::create_dir_all(home_dir.join(".sqlreplay")).expect("home config dir should be created");

    let project_recordings = sandbox.path().join("project.txt");
    let home_recordings = sandbox.path().join("home.txt");
    let override_recordings = sandbox.path().join("override.txt");
    fs::write(&project_recordings, "1=DriverOpen\t1:nil\n\n\"FromProject\"=1\n")
        .expect("project recordings should be written");
    fs::write(&home_recordings, "1=DriverOpen\t1:nil\n\n\"FromHome\"=1\n")
        .expect("home recordings should be written");
    fs::write(&override_recordings, "1=DriverOpen\t1:nil\n\n\"FromOverride\"=1\n")
        .expect("override recordings should be written");

    let project_config = project_dir.join("sqlreplay.toml");
    let home_config = home_dir.join(".sqlreplay").join("config.toml");
    let override_config = sandbox.path().join("override.toml");

    write_config(&project_config, &project_recordings);
    fs::write(
        &home_config,
        r#"
[recording]
unknown_key = "invalid"
"#,
    )
    .expect("home config should be written");

    let prefers_project = run_sqlreplay(["list"], &project_dir, &home_dir);
    assert_success(&prefers_project);
    assert_eq!(stdout(&prefers_project), "FromProject\t1\n");

    fs::remove_file(&project_config).expect("project config should be removed");
    write_config(&home_config, &home_recordings);

    let falls_back_to_home = run_sqlreplay(["list"], &project_dir, &home_dir);
    assert_success(&falls_back_to_home);
    assert_eq!(stdout(&falls_back_to_home), "FromHome\t1\n");

    fs::write(
        &project_config,
        r#"
[recording]
max_recording_size = "huge"
"#,
    )
    .expect("project config should be rewritten as invalid");
    write_config(&override_config, &override_recordings);

    let without_override = run_sqlreplay(["list"], &project_dir, &home_dir);
    assert!(
        !without_override.status.success(),
        "expected failure without override\nstdout:\n{}\nstderr:\n{}",
        stdout(&without_override),
        String::from_utf8_lossy(&without_override.stderr)
    );
    assert!(
        String::from_utf8_lossy(&without_override.stderr).contains("project ./sqlreplay.toml"),
        "stderr should indicate the project source\nstderr:\n{}",
        String::from_utf8_lossy(&without_override.stderr)
    );

    let with_override = run_sqlreplay(
        [
            OsStr::new("--config"),
            override_config.as_os_str(),
            OsStr::new("list"),
        ],
        &project_dir,
        &home_dir,
    );
    assert_success(&with_override);
    assert_eq!(stdout(&with_override), "FromOverride\t1\n");
}

#[test]
fn list_show_remove_and_compact_edit_the_recording_file() {
    let sandbox = tempdir().expect("tempdir should be created");
    let home_dir = sandbox.path().join("home");
    fs::create_dir_all(&home_dir).expect("home dir should be created");
    let file = sandbox.path().join("db.txt");
    fs::write(&file, RECORDINGS).expect("recordings should be written");

    let listed = run_sqlreplay(
        [OsStr::new("list"), file.as_os_str(), OsStr::new("--json")],
        sandbox.path(),
        &home_dir,
    );
    assert_success(&listed);
    let json: Value = serde_json::from_slice(&listed.stdout).expect("list output should be JSON");
    assert_eq!(
        json,
        serde_json::json!([
            {"name": "TestOne", "records": 2},
            {"name": "TestTwo", "records": 2},
        ])
    );

    let shown = run_sqlreplay(
        [OsStr::new("show"), file.as_os_str(), OsStr::new("TestOne")],
        sandbox.path(),
        &home_dir,
    );
    assert_success(&shown);
    assert_eq!(
        stdout(&shown),
        "1\tDriverOpen\t1:nil\n2\tConnQuery\t2:\"SELECT 1\"\t1:nil\n"
    );

    let compacted = run_sqlreplay(
        [OsStr::new("compact"), file.as_os_str()],
        sandbox.path(),
        &home_dir,
    );
    assert_success(&compacted);
    assert!(
        stdout(&compacted).contains("4 -> 3 records"),
        "stdout:\n{}",
        stdout(&compacted)
    );

    let removed = run_sqlreplay(
        [OsStr::new("remove"), file.as_os_str(), OsStr::new("TestOne")],
        sandbox.path(),
        &home_dir,
    );
    assert_success(&removed);
    assert_eq!(
        fs::read_to_string(&file).expect("recordings should be readable"),
        "1=DriverOpen\t1:nil\n2=ConnQuery\t2:\"SELECT 2\"\t1:nil\n\n\"TestTwo\"=1,2\n"
    );

    let missing = run_sqlreplay(
        [OsStr::new("remove"), file.as_os_str(), OsStr::new("TestOne")],
        sandbox.path(),
        &home_dir,
    );
    assert!(!missing.status.success());
    assert!(
        String::from_utf8_lossy(&missing.stderr).contains("recording `TestOne` was not found"),
        "stderr:\n{}",
        String::from_utf8_lossy(&missing.stderr)
    );
}

#[test]
fn malformed_recording_file_is_reported_with_its_path() {
    let sandbox = tempdir().expect("tempdir should be created");
    let file = sandbox.path().join("broken.txt");
    fs::write(&file, "1=DriverOpen\t1:nil\n\n\"TestBroken\"=1,2\n")
        .expect("recordings should be written");

    let output = run_sqlreplay(
        [OsStr::new("list"), file.as_os_str()],
        sandbox.path(),
        sandbox.path(),
    );
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("parse recording file"), "stderr:\n{stderr}");
    assert!(stderr.contains("broken.txt"), "stderr:\n{stderr}");
}
