//! Integration tests for the kiln binary.
//!
//! Each test writes a small project (`kiln.toml`, `package.json`,
//! `kiln.rhai`) into a temporary directory and runs the built binary in it.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use tempfile::TempDir;

const CONFIG: &str = r#"
[project]
name = "demo"
manifest = "package.json"

[build]
params = "config.json"
jobs = 2
"#;

const SCRIPT: &str = r#"
let version = VERSION;

file("src/*.raw").def(|ctx, t| {
    ctx.write(t, `raw ${t[1]}`);
});

file("out/*.bin").captures(["stem"]).def(|ctx, t| {
    let deps = ctx.need([t.dir_target, `src/${t["stem"]}.raw`]);
    ctx.cp(deps[1], t);
});

file("out/*.txt").def(|ctx, t| {
    ctx.need(`missing/${t.name}.src`);
});

virt("all").def(|ctx, t| {
    ctx.need(["out/a.bin", "out/b.bin"]);
    ctx.write("out/VERSION", `${ctx.params.prefix}-${version}`);
});

file("out/*.fail").def(|ctx, t| {
    ctx.need(`out/${t.name}.bin`);
    throw `cannot convert ${t.name}`;
});

virt("clean").def(|ctx, t| {
    ctx.rm(["out", "src"]);
});

want("all");
"#;

fn project() -> TempDir {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    fs::write(dir.path().join("kiln.toml"), CONFIG).unwrap();
    fs::write(dir.path().join("package.json"), r#"{ "version": "0.4.0" }"#).unwrap();
    fs::write(dir.path().join("config.json"), r#"{ "prefix": "Nowar" }"#).unwrap();
    fs::write(dir.path().join("kiln.rhai"), SCRIPT).unwrap();
    dir
}

fn kiln(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_kiln"))
        .args(args)
        .current_dir(dir)
        .output()
        .expect("failed to execute kiln")
}

fn describe(output: &Output) -> String {
    format!(
        "exit={:?}\nstdout:\n{}\nstderr:\n{}",
        output.status.code(),
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn build_wanted_targets() {
    let dir = project();
    let output = kiln(dir.path(), &["build"]);
    assert!(output.status.success(), "{}", describe(&output));

    assert_eq!(fs::read_to_string(dir.path().join("out/a.bin")).unwrap(), "raw a");
    assert_eq!(fs::read_to_string(dir.path().join("out/b.bin")).unwrap(), "raw b");
    assert_eq!(fs::read_to_string(dir.path().join("out/VERSION")).unwrap(), "Nowar-0.4.0");
}

#[test]
fn build_explicit_target_then_clean() {
    let dir = project();
    let output = kiln(dir.path(), &["-q", "build", "out/z.bin"]);
    assert!(output.status.success(), "{}", describe(&output));
    assert!(dir.path().join("out/z.bin").is_file());
    assert!(!dir.path().join("out/a.bin").exists());

    for _ in 0..2 {
        let output = kiln(dir.path(), &["build", "clean"]);
        assert!(output.status.success(), "{}", describe(&output));
    }
    assert!(!dir.path().join("out").exists());
}

#[test]
fn failure_reports_chain_and_root_cause() {
    let dir = project();
    let output = kiln(dir.path(), &["build", "out/x.txt", "out/c.bin"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to build `out/x.txt`"), "{}", describe(&output));
    assert!(stderr.contains("via: out/x.txt -> missing/x.src"), "{}", describe(&output));
    assert!(
        stderr.contains("in rule: out/*.txt (building `out/x.txt`)"),
        "{}",
        describe(&output)
    );
    assert!(stderr.contains("no rule to build `missing/x.src`"), "{}", describe(&output));
    assert!(stderr.contains("1 of 2 target(s) failed"), "{}", describe(&output));

    // The independent target still completed.
    assert!(dir.path().join("out/c.bin").is_file());
}

#[test]
fn failing_action_names_its_rule() {
    let dir = project();
    let output = kiln(dir.path(), &["build", "out/q.fail"]);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("in rule: out/*.fail (building `out/q.fail`)"), "{}", describe(&output));
    assert!(stderr.contains("cannot convert q"), "{}", describe(&output));
    assert!(dir.path().join("out/q.bin").is_file());
}

#[test]
fn list_and_explain() {
    let dir = project();
    let output = kiln(dir.path(), &["list"]);
    assert!(output.status.success(), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("out/*.bin [stem]"), "{stdout}");
    assert!(stdout.contains("virtual  clean"), "{stdout}");
    assert!(stdout.contains("Wanted:\n  all"), "{stdout}");

    let output = kiln(dir.path(), &["explain", "./out//sample.bin"]);
    assert!(output.status.success(), "{}", describe(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("target:   out/sample.bin"), "{stdout}");
    assert!(stdout.contains("rule:     out/*.bin (file)"), "{stdout}");
    assert!(stdout.contains("$1:       sample (stem)"), "{stdout}");
}

#[test]
fn explain_unknown_target_fails() {
    let dir = project();
    let output = kiln(dir.path(), &["explain", "nothing/here"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no rule to build"));
}

#[test]
fn missing_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = kiln(dir.path(), &["list"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("kiln.toml"));
}
