//! Scenario tests for the build scheduler.
//!
//! Each test registers a small rule set, builds against a temporary project
//! root and inspects outcomes, record states and side effects.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use kiln_engine::{
    BuildError, CommandArg, Options, Outcome, RecordState, RuleSet, Scheduler, Settings, TargetKind,
};
use serde_json::json;
use tempfile::TempDir;

fn scheduler(rules: RuleSet) -> (Scheduler, TempDir) {
    let root = tempfile::tempdir().unwrap();
    let settings = Settings {
        root: root.path().to_path_buf(),
        jobs: 4,
        params: json!({ "prefix": "Nowar", "families": ["Sans", "UI"] }),
        ..Settings::default()
    };
    (Scheduler::new(rules, settings), root)
}

fn counter() -> Arc<AtomicUsize> {
    Arc::new(AtomicUsize::new(0))
}

fn fail(target: &str) -> BuildError {
    BuildError::Action {
        target: target.into(),
        message: "boom".into(),
    }
}

// ---------------------------------------------------------------------------
// Memoization
// ---------------------------------------------------------------------------

#[test]
fn sequential_requests_execute_once() {
    let runs = counter();
    let mut rules = RuleSet::new();
    let r = runs.clone();
    rules
        .virt("version")
        .def(move |_, _| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(json!("0.4.0"))
        })
        .unwrap();

    let (sched, _root) = scheduler(rules);
    let first = sched.build("version").unwrap();
    let second = sched.build("./version").unwrap();
    assert_eq!(first, second);
    assert_eq!(first.value(), Some(&json!("0.4.0")));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(sched.executed(), 1);
}

#[test]
fn concurrent_requests_share_one_execution() {
    let runs = counter();
    let mut rules = RuleSet::new();
    let r = runs.clone();
    rules
        .virt("slow")
        .def(move |_, _| {
            r.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(50));
            Ok(())
        })
        .unwrap();

    let (sched, _root) = scheduler(rules);
    thread::scope(|s| {
        let handles: Vec<_> = (0..8).map(|_| s.spawn(|| sched.build("slow"))).collect();
        for h in handles {
            assert!(matches!(h.join().unwrap(), Ok(Outcome::Virtual { .. })));
        }
    });
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn failure_is_recorded_and_not_retried() {
    let runs = counter();
    let mut rules = RuleSet::new();
    let r = runs.clone();
    rules
        .virt("broken")
        .def(move |_, t| -> kiln_engine::Result<()> {
            r.fetch_add(1, Ordering::SeqCst);
            Err(fail(t.id()))
        })
        .unwrap();

    let (sched, _root) = scheduler(rules);
    for _ in 0..3 {
        assert!(matches!(sched.build("broken"), Err(BuildError::Action { .. })));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(sched.state("broken"), Some(RecordState::Failed));
}

// ---------------------------------------------------------------------------
// Dependencies
// ---------------------------------------------------------------------------

#[test]
fn need_returns_after_prerequisites_in_request_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut rules = RuleSet::new();

    let l = log.clone();
    rules
        .virt("part-*")
        .def(move |_, t| {
            thread::sleep(Duration::from_millis(if t.capture(1) == Some("1") { 40 } else { 5 }));
            l.lock().unwrap().push(t.id().to_string());
            Ok(json!(t.capture(1)))
        })
        .unwrap();

    let l = log.clone();
    rules
        .virt("top")
        .def(move |ctx, _| {
            let parts = ctx.need(["part-1", "part-2"])?;
            l.lock().unwrap().push("top".into());
            let values: Vec<_> = parts.iter().filter_map(Outcome::value).cloned().collect();
            Ok(json!(values))
        })
        .unwrap();

    let (sched, _root) = scheduler(rules);
    let outcome = sched.build("top").unwrap();
    assert_eq!(outcome.value(), Some(&json!(["1", "2"])));

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 3);
    assert_eq!(log.last().map(String::as_str), Some("top"));
}

#[test]
fn missing_rule_fails_dependent_without_marking_it_done() {
    let mut rules = RuleSet::new();
    rules
        .file("out/*.bin")
        .def(|ctx, t| {
            ctx.need([format!("src/{}.raw", t.name())])?;
            ctx.write(t.id(), "never")?;
            Ok(())
        })
        .unwrap();

    let (sched, root) = scheduler(rules);
    let err = sched.build("out/a.bin").unwrap_err();
    assert!(matches!(&err, BuildError::DependencyFailed { dependency, .. } if dependency == "src/a.raw"));
    assert!(matches!(err.root_cause(), BuildError::NoMatchingRule { target } if target == "src/a.raw"));
    assert_eq!(sched.state("out/a.bin"), Some(RecordState::Failed));
    assert!(!root.path().join("out/a.bin").exists());
}

#[test]
fn failure_isolation() {
    let mut rules = RuleSet::new();
    rules.virt("a").def(|ctx, _| ctx.need(["b"]).map(drop)).unwrap();
    rules
        .virt("b")
        .def(|_, t| -> kiln_engine::Result<()> { Err(fail(t.id())) })
        .unwrap();
    rules.virt("c").def(|_, _| Ok(json!(3))).unwrap();

    let (sched, _root) = scheduler(rules);
    let results = sched.build_all(&["a", "c"]);
    assert_eq!(results[0].0, "a");
    assert!(matches!(
        &results[0].1,
        Err(BuildError::DependencyFailed { dependency, .. }) if dependency == "b"
    ));
    assert_eq!(results[1].1.as_ref().unwrap().value(), Some(&json!(3)));
    assert_eq!(sched.state("a"), Some(RecordState::Failed));
    assert_eq!(sched.state("b"), Some(RecordState::Failed));
    assert_eq!(sched.state("c"), Some(RecordState::Done));
}

#[test]
fn failing_sibling_does_not_cancel_the_other() {
    let mut rules = RuleSet::new();
    rules
        .file("out/*.bin")
        .def(|ctx, t| {
            if t.name() == "a" {
                return Err(fail(t.id()));
            }
            thread::sleep(Duration::from_millis(30));
            ctx.write(t.id(), t.name())
        })
        .unwrap();
    rules
        .virt("all")
        .def(|ctx, _| ctx.need(["out/a.bin", "out/b.bin"]).map(drop))
        .unwrap();

    let (sched, root) = scheduler(rules);
    let err = sched.build("all").unwrap_err();
    assert_eq!(err.chain(), ["out/a.bin"]);
    assert_eq!(sched.state("out/b.bin"), Some(RecordState::Done));
    assert_eq!(fs::read_to_string(root.path().join("out/b.bin")).unwrap(), "b");
}

#[test]
fn cycles_are_reported() {
    let mut rules = RuleSet::new();
    rules.virt("ping").def(|ctx, _| ctx.need(["pong"]).map(drop)).unwrap();
    rules.virt("pong").def(|ctx, _| ctx.need(["ping"]).map(drop)).unwrap();
    rules.virt("self").def(|ctx, _| ctx.need(["self"]).map(drop)).unwrap();

    let (sched, _root) = scheduler(rules);
    let err = sched.build("ping").unwrap_err();
    assert!(matches!(err.root_cause(), BuildError::DependencyCycle { chain } if chain.len() == 3));

    let err = sched.build("self").unwrap_err();
    assert!(matches!(
        err.root_cause(),
        BuildError::DependencyCycle { chain } if chain == &["self", "self"]
    ));
}

#[test]
fn panicking_action_is_contained() {
    let mut rules = RuleSet::new();
    rules
        .virt("explode")
        .def(|_, _| -> kiln_engine::Result<()> { panic!("kaboom") })
        .unwrap();
    rules.virt("wrapper").def(|ctx, _| ctx.need(["explode"]).map(drop)).unwrap();

    let (sched, _root) = scheduler(rules);
    let err = sched.build("wrapper").unwrap_err();
    assert!(matches!(
        err.root_cause(),
        BuildError::ActionPanicked { target, message } if target == "explode" && message == "kaboom"
    ));
}

/// `n-K` needs `n-(K-1)` down to `n-0`; each level keeps a 64 KiB buffer
/// live on its stack while it waits.
fn chain_rules() -> RuleSet {
    let mut rules = RuleSet::new();
    rules
        .virt("n-*")
        .def(|ctx, t| {
            let pad = std::hint::black_box([1u8; 64 * 1024]);
            let k: u64 = t.capture(1).and_then(|k| k.parse().ok()).unwrap_or(0);
            if k > 0 {
                ctx.need_one(&format!("n-{}", k - 1))?;
            }
            Ok(json!(k + u64::from(pad[0]) - 1))
        })
        .unwrap();
    rules
        .virt("fan")
        .def(|ctx, _| ctx.need(["n-300", "n-0"]).map(drop))
        .unwrap();
    rules
}

#[test]
fn deep_chain_under_fan_out_builds() {
    let (sched, _root) = scheduler(chain_rules());
    sched.build("fan").unwrap();
    assert_eq!(sched.executed(), 302);
    assert_eq!(sched.state("n-150"), Some(RecordState::Done));
}

#[test]
fn chain_deeper_than_limit_fails_that_path_only() {
    let root = tempfile::tempdir().unwrap();
    let settings = Settings {
        root: root.path().to_path_buf(),
        max_depth: 16,
        ..Settings::default()
    };
    let sched = Scheduler::new(chain_rules(), settings);

    let results = sched.build_all(&["n-40", "n-3"]);
    let err = results[0].1.as_ref().unwrap_err();
    assert!(matches!(
        err.root_cause(),
        BuildError::DependencyTooDeep { target, limit: 16 } if target == "n-23"
    ));
    assert_eq!(err.chain().len(), 17);
    assert_eq!(results[1].1.as_ref().unwrap().value(), Some(&json!(3)));
}

// ---------------------------------------------------------------------------
// Targets, captures, filesystem
// ---------------------------------------------------------------------------

#[test]
fn captures_reach_the_action() {
    let seen = Arc::new(Mutex::new(None));
    let mut rules = RuleSet::new();
    let s = seen.clone();
    rules
        .file("build/as0/*-*-*.ttf")
        .captures(["family", "region", "style"])
        .def(move |_, t| {
            *s.lock().unwrap() = Some((
                t.named("family").map(str::to_string),
                t.capture(3).map(str::to_string),
                t.dir().to_string(),
            ));
            Ok(())
        })
        .unwrap();

    let (sched, _root) = scheduler(rules);
    let outcome = sched.build("build/as0/Sans-CN-Bd.ttf").unwrap();
    assert_eq!(outcome.target().map(|t| t.kind()), Some(TargetKind::File));
    assert_eq!(
        seen.lock().unwrap().clone(),
        Some((Some("Sans".into()), Some("Bd".into()), "build/as0".into()))
    );
}

#[test]
fn unmatched_top_level_target() {
    let (sched, _root) = scheduler(RuleSet::new());
    assert!(matches!(sched.build("nothing"), Err(BuildError::NoMatchingRule { .. })));
    assert!(matches!(sched.build(""), Err(BuildError::InvalidTarget(_))));
}

#[test]
fn directory_requests_and_cleanup() {
    let mut rules = RuleSet::new();
    rules
        .file("build/pass1/*.otd")
        .def(|ctx, t| {
            let dir = ctx.need_one(&t.dir_request())?;
            assert_eq!(dir, Outcome::Dir("build/pass1".into()));
            ctx.write(t.id(), "{}")
        })
        .unwrap();
    rules
        .virt("clean")
        .def(|ctx, _| {
            ctx.rm(["build", "out"])?;
            ctx.rm(["build", "out"])
        })
        .unwrap();

    let (sched, root) = scheduler(rules);
    sched.build("build/pass1/a.otd").unwrap();
    assert!(root.path().join("build/pass1/a.otd").is_file());

    sched.build("clean").unwrap();
    assert!(!root.path().join("build").exists());
}

#[test]
fn params_and_copies() {
    let mut rules = RuleSet::new();
    rules
        .file("out/*.txt")
        .def(|ctx, t| {
            let prefix = ctx.params()["prefix"].as_str().unwrap_or_default().to_string();
            ctx.write(format!("gen/{}.txt", t.name()), prefix)?;
            ctx.cp(format!("gen/{}.txt", t.name()), t.id())
        })
        .unwrap();

    let (sched, root) = scheduler(rules);
    sched.build("out/label.txt").unwrap();
    assert_eq!(fs::read_to_string(root.path().join("out/label.txt")).unwrap(), "Nowar");
}

// ---------------------------------------------------------------------------
// External commands
// ---------------------------------------------------------------------------

#[cfg(unix)]
#[test]
fn convert_scenario_runs_command_once() {
    let mut rules = RuleSet::new();
    rules
        .file("src/*.raw")
        .def(|ctx, t| ctx.write(t.id(), format!("raw {}", t.capture(1).unwrap_or_default())))
        .unwrap();
    rules
        .file("out/*.bin")
        .def(|ctx, t| {
            let [_, src] = <[Outcome; 2]>::try_from(ctx.need([
                t.dir_request(),
                format!("src/{}.raw", t.capture(1).unwrap_or_default()),
            ])?)
            .map_err(|_| fail(t.id()))?;
            let script = format!("echo convert >> convert.log; cp {src} {t}");
            ctx.run("sh", &["-c".into(), script.into()])?;
            Ok(())
        })
        .unwrap();

    let (sched, root) = scheduler(rules);
    thread::scope(|s| {
        let a = s.spawn(|| sched.build("out/x.bin"));
        let b = s.spawn(|| sched.build("out/x.bin"));
        a.join().unwrap().unwrap();
        b.join().unwrap().unwrap();
    });

    let log = fs::read_to_string(root.path().join("convert.log")).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert_eq!(fs::read_to_string(root.path().join("out/x.bin")).unwrap(), "raw x");
}

#[cfg(unix)]
#[test]
fn scoped_run_and_command_failure() {
    let mut rules = RuleSet::new();
    rules
        .virt("pack")
        .def(|ctx, _| {
            ctx.check("out/ttc")?;
            let opts = Options::new().flag("n", true).value("name", "release");
            let out = ctx
                .cd("out")
                .cd("ttc")
                .run("sh", &["-c".into(), "pwd; printf '%s\\n' \"$*\"".into(), "sh".into(), opts.into()])?;
            Ok(json!(out.stdout))
        })
        .unwrap();
    rules
        .virt("fails")
        .def(|ctx, _| ctx.run("sh", &[CommandArg::from("-c"), "exit 4".into()]).map(drop))
        .unwrap();

    let (sched, _root) = scheduler(rules);
    let outcome = sched.build("pack").unwrap();
    let stdout = outcome.value().and_then(|v| v.as_str()).unwrap().to_string();
    let mut lines = stdout.lines();
    assert!(lines.next().unwrap().ends_with("out/ttc"));
    assert_eq!(lines.next(), Some("-n --name release"));

    assert!(matches!(
        sched.build("fails"),
        Err(BuildError::ExternalCommandFailed { code: Some(4), .. })
    ));
}
