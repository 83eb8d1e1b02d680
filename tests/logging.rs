//! Tests for logging with `gridwright generate`.

use std::fs;
use std::process::Command;
use std::process::Stdio;

use tempfile::tempdir;

/// A test that ensures that `gridwright generate` logs to stderr at the
/// requested level and keeps stdout for the DAG path.
#[test]
fn logging() {
    let dir = tempdir().unwrap();

    fs::write(
        dir.path().join("workflow.json"),
        r#"{
  "name": "hello",
  "jobs": [
    { "id": "hello_ID1", "class": "compute", "executable": "/bin/echo", "arguments": "hello world", "site": "local" }
  ]
}
"#,
    )
    .unwrap();
    fs::write(
        dir.path().join("catalog.toml"),
        r#"
[sites.local]
shared_scratch = "/home/user/runs"

[sites.local.environment]
GW_HOME = "/opt/gridwright"
"#,
    )
    .unwrap();

    for (opt, level) in [("-vv", " DEBUG "), ("-v", " INFO ")] {
        let result = Command::new(env!("CARGO_BIN_EXE_gridwright"))
            .args([
                "generate",
                "workflow.json",
                "--catalog",
                "catalog.toml",
                "-o",
                "submit",
                opt,
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .current_dir(dir.path())
            .env_remove("RUST_LOG")
            .env_remove("RUST_BACKTRACE")
            .spawn()
            .expect("failed to spawn command")
            .wait_with_output()
            .expect("failed while waiting for command to finish");

        assert!(
            result.status.success(),
            "command failed {status}: {stderr}",
            status = result.status,
            stderr = str::from_utf8(&result.stderr).unwrap_or("<not UTF-8>")
        );
        assert_eq!(str::from_utf8(&result.stdout).unwrap(), "submit/hello.dag\n");

        // Debug output still includes the informational messages
        let stderr = str::from_utf8(&result.stderr).unwrap();
        assert!(stderr.contains(" INFO "), "{stderr}");
        assert!(stderr.contains(level), "{stderr}");

        assert!(dir.path().join("submit").join("hello_ID1.sub").exists());
    }
}
