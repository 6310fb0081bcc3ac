//! CLI tests for the `dockcheck` binary.
//!
//! Spawns the binary in a temp directory and verifies exit codes and output
//! for policy checks, validation, planning and pipeline runs.

use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use dockcheck::exit_codes;

const POLICY: &str = r#"version: "1"
hard_stops:
  commands:
    - pattern: "rm -rf /"
    - pattern: "DROP TABLE"
  critical_paths:
    - "**/.env"
    - "migrations/**"
  circuit_breakers:
    max_file_deletes_per_turn: 1
"#;

const PIPELINE: &str = r#"steps:
  - name: analyze
    skill: analyze
  - name: lint
    skill: lint
    depends_on: [analyze]
    parallel_group: checks
  - name: test
    skill: test
    depends_on: [analyze]
    parallel_group: checks
"#;

fn write_policy(dir: &Path) {
    fs::create_dir_all(dir.join(".dockcheck")).expect("mkdir");
    fs::write(dir.join(".dockcheck/policy.yaml"), POLICY).expect("write policy");
}

fn dockcheck(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_dockcheck"))
        .current_dir(dir)
        .args(args)
        .output()
        .expect("run dockcheck")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn clean_check_passes() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_policy(temp.path());

    let output = dockcheck(
        temp.path(),
        &["check", "--commands", "cargo test", "--files", "src/main.rs"],
    );

    assert_eq!(output.status.code(), Some(exit_codes::PASS));
    assert!(stdout(&output).contains("[PASS] Policy evaluation: PASS"));
}

#[test]
fn hard_stop_command_blocks() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_policy(temp.path());

    let output = dockcheck(temp.path(), &["check", "--commands", "psql -c 'drop table users'"]);

    assert_eq!(output.status.code(), Some(exit_codes::BLOCK));
    let text = stdout(&output);
    assert!(text.contains("[BLOCK]"));
    assert!(text.contains("Blocked commands: 1"));
}

#[test]
fn json_output_lists_blocked_paths() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_policy(temp.path());

    let output = dockcheck(
        temp.path(),
        &["check", "--files", "config/.env", "--files", "README.md", "--json"],
    );

    assert_eq!(output.status.code(), Some(exit_codes::BLOCK));
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(value["verdict"], "block");
    assert_eq!(value["blocked_paths"], serde_json::json!(["config/.env"]));
}

#[test]
fn diff_from_stdin_feeds_paths_and_deletes() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_policy(temp.path());
    let diff = "\
--- a/old_a.rs
+++ /dev/null
@@ -1 +0,0 @@
-fn a() {}
--- a/old_b.rs
+++ /dev/null
@@ -1 +0,0 @@
-fn b() {}
";

    let mut child = Command::new(env!("CARGO_BIN_EXE_dockcheck"))
        .current_dir(temp.path())
        .args(["check", "--diff", "-", "--json"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("spawn dockcheck");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(diff.as_bytes())
        .expect("write diff");
    let output = child.wait_with_output().expect("wait");

    assert_eq!(output.status.code(), Some(exit_codes::FAIL));
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(value["verdict"], "fail");
    assert_eq!(
        value["breaker_violations"],
        serde_json::json!(["File deletes (2) exceeds max 1"])
    );
}

#[test]
fn diff_touching_critical_path_blocks() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_policy(temp.path());
    fs::write(
        temp.path().join("change.diff"),
        "--- a/migrations/0001_init.sql\n+++ b/migrations/0001_init.sql\n@@ -1 +1 @@\n-a\n+b\n",
    )
    .expect("write diff");

    let output = dockcheck(temp.path(), &["check", "--diff", "change.diff"]);

    assert_eq!(output.status.code(), Some(exit_codes::BLOCK));
    assert!(stdout(&output).contains("Blocked paths: 1"));
}

#[test]
fn missing_policy_is_an_error() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = dockcheck(temp.path(), &["check", "--commands", "ls"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no policy.yaml found"));

    let output = dockcheck(temp.path(), &["validate", "--policy", "nope.yaml"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("policy file not found at nope.yaml"));
}

#[test]
fn validate_summarizes_policy() {
    let temp = tempfile::tempdir().expect("tempdir");
    write_policy(temp.path());

    let output = dockcheck(temp.path(), &["validate"]);

    assert_eq!(output.status.code(), Some(exit_codes::PASS));
    let text = stdout(&output);
    assert!(text.contains("Policy valid:"));
    assert!(text.contains("  Hard stop commands: 2"));
    assert!(text.contains("  Critical paths: 2"));
    assert!(text.contains("  Notification channels: 1"));
}

#[test]
fn plan_prints_layers_and_groups() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("pipeline.yaml"), PIPELINE).expect("write pipeline");

    let output = dockcheck(temp.path(), &["plan", "--pipeline", "pipeline.yaml"]);

    assert_eq!(output.status.code(), Some(exit_codes::PASS));
    assert_eq!(
        stdout(&output),
        "Layer 0:\n  - analyze\nLayer 1:\n  - [parallel: checks] lint, test\n"
    );
}

#[test]
fn plan_rejects_cycles() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("pipeline.yaml"),
        "steps:\n  - name: a\n    skill: a\n    depends_on: [b]\n  - name: b\n    skill: b\n    depends_on: [a]\n",
    )
    .expect("write pipeline");

    let output = dockcheck(temp.path(), &["plan", "--pipeline", "pipeline.yaml"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("cyclic dependency detected"));
}

#[cfg(unix)]
mod run {
    use super::*;

    use dockcheck::test_support::agent_script;

    fn run_with_agent(body: &str) -> Output {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("pipeline.yaml"), PIPELINE).expect("write pipeline");
        let script = agent_script(body).expect("script");
        dockcheck(
            temp.path(),
            &[
                "run",
                "--pipeline",
                "pipeline.yaml",
                "--claude-bin",
                &script.program(),
                "--json",
            ],
        )
    }

    #[test]
    fn confident_agents_deploy() {
        let output = run_with_agent(
            r#"printf '%s' '{"completed":true,"confidence":0.95,"turns_used":2,"summary":"ok","findings":[],"action_needed":"none"}'"#,
        );

        assert_eq!(output.status.code(), Some(exit_codes::PASS));
        let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
        assert_eq!(value["decision"], "deploy");
        assert_eq!(value["blocked"], false);
        assert_eq!(value["step_results"].as_object().map(|m| m.len()), Some(3));
    }

    #[test]
    fn unsure_agents_block() {
        let output = run_with_agent(
            r#"printf '%s' '{"completed":true,"confidence":0.3,"summary":"unsure"}'"#,
        );

        assert_eq!(output.status.code(), Some(exit_codes::BLOCK));
        let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
        assert_eq!(value["decision"], "block");
    }

    #[test]
    fn escalation_stops_after_first_step() {
        let output = run_with_agent(
            r#"printf '%s' '{"completed":false,"confidence":0.1,"summary":"needs a human","action_needed":"escalate"}'"#,
        );

        assert_eq!(output.status.code(), Some(exit_codes::BLOCK));
        let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
        let steps = value["step_results"].as_object().expect("steps");
        assert_eq!(steps.len(), 1);
        assert!(steps.contains_key("analyze"));
    }

    #[test]
    fn fanout_reports_each_service() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(
            temp.path().join("services.yaml"),
            "- name: api\n  path: services/api\n- name: web\n  path: services/web\n",
        )
        .expect("write services");
        let script = agent_script(
            r#"printf '%s' '{"completed":true,"confidence":0.9,"turns_used":4,"summary":"ok"}'"#,
        )
        .expect("script");

        let output = dockcheck(
            temp.path(),
            &[
                "fanout",
                "--services",
                "services.yaml",
                "--template",
                "Review {path}",
                "--agent-bin",
                &script.program(),
                "--json",
            ],
        );

        assert_eq!(output.status.code(), Some(exit_codes::PASS));
        let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
        assert_eq!(value["all_completed"], true);
        assert_eq!(value["results"][0]["task_id"], "api");
        assert_eq!(value["results"][1]["task_id"], "web");
    }

    #[test]
    fn fanout_fails_when_agent_is_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("services.yaml"), "- name: api\n").expect("write services");

        let output = dockcheck(
            temp.path(),
            &[
                "fanout",
                "--services",
                "services.yaml",
                "--template",
                "Review {name}",
                "--agent-bin",
                "./no-such-agent",
            ],
        );

        assert_eq!(output.status.code(), Some(exit_codes::FAIL));
        assert!(stdout(&output).contains("api: error:"));
    }
}
