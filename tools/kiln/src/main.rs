//! kiln: scriptable task-graph build driver.
//!
//! Pipeline: find `kiln.toml` → resolve config → evaluate the build script
//! into rules and wanted targets → build the requested targets concurrently
//! → report every failure with its dependency chain and root cause.

mod cli;
mod config;
mod script;

use std::error::Error as _;
use std::path::Path;
use std::time::Instant;

use anyhow::{Result, bail};
use clap::Parser;
use kiln_engine::target::{is_dir_request, normalize};
use kiln_engine::verbose::{self, Timer};
use kiln_engine::{BuildError, RuleSet, Scheduler, Settings};

fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    verbose::init(cli.quiet, cli.verbose);

    match cli.command {
        cli::Command::Build(ref args) => cmd_build(&cli, &args.targets),
        cli::Command::List => cmd_list(&cli),
        cli::Command::Explain(ref args) => cmd_explain(&cli, &args.target),
    }
}

// ===========================================================================
// Script loading
// ===========================================================================

fn load(cli: &cli::Cli) -> Result<(config::ResolvedConfig, script::Script)> {
    let root = config::find_project_root()?;
    let config = config::load_config(&root, cli.jobs)?;
    verbose::detail(
        "Loading",
        format_args!(
            "{} for {} {}",
            relative(&config.script, &root),
            config.name,
            config.version
        ),
    );
    let script = {
        let _t = Timer::start("script evaluation");
        script::evaluate_script(&config)?
    };
    verbose::detail(
        "Loaded",
        format_args!(
            "{} rule(s), {} wanted target(s)",
            script.rules.len(),
            script.wanted.len()
        ),
    );
    Ok((config, script))
}

fn relative(path: &Path, root: &Path) -> String {
    path.strip_prefix(root).unwrap_or(path).display().to_string()
}

// ===========================================================================
// Commands
// ===========================================================================

/// Build the given targets, or the script's wanted targets.
fn cmd_build(cli: &cli::Cli, targets: &[String]) -> Result<()> {
    let (config, script) = load(cli)?;
    let targets = if targets.is_empty() {
        script.wanted
    } else {
        targets.to_vec()
    };
    if targets.is_empty() {
        bail!("nothing to build: pass targets or call want() in the build script");
    }

    let settings = Settings {
        root: config.root,
        jobs: config.jobs,
        params: config.params,
        max_depth: config.max_depth,
    };
    let scheduler = Scheduler::new(script.rules, settings);

    let start = Instant::now();
    let results = scheduler.build_all(&targets);
    let elapsed = start.elapsed();

    let mut failed = 0;
    for (target, result) in &results {
        if let Err(err) = result {
            failed += 1;
            report_failure(scheduler.rules(), target, err);
        }
    }

    if failed > 0 {
        bail!("{failed} of {} target(s) failed", results.len());
    }
    verbose::status(
        "Finished",
        format_args!(
            "{} target(s), {} action(s) run in {:.2?}",
            results.len(),
            scheduler.executed(),
            elapsed
        ),
    );
    Ok(())
}

/// Print a failed target, the chain of dependencies that led to the
/// failure, the rule that failed and its root cause.
fn report_failure(rules: &RuleSet, target: &str, err: &BuildError) {
    eprintln!("error: failed to build `{target}`");
    let chain = err.chain();
    if !chain.is_empty() {
        eprintln!("  via: {target} -> {}", chain.join(" -> "));
    }
    if let Some((failed, pattern)) = failing_rule(rules, target, &chain) {
        eprintln!("  in rule: {pattern} (building `{failed}`)");
    }
    let root = err.root_cause();
    eprintln!("  caused by: {root}");
    let mut source = root.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}

/// The innermost target on the failure path that has a rule, with that
/// rule's pattern. A target with no rule fails in the rule that needed it.
fn failing_rule<'a>(rules: &RuleSet, target: &'a str, chain: &[&'a str]) -> Option<(&'a str, String)> {
    std::iter::once(target)
        .chain(chain.iter().copied())
        .rev()
        .filter(|id| !is_dir_request(id))
        .find_map(|id| {
            let resolved = rules.resolve(&normalize(id).ok()?).ok()?;
            Some((id, resolved.pattern))
        })
}

/// Print every registered rule and the wanted targets.
fn cmd_list(cli: &cli::Cli) -> Result<()> {
    let (_config, script) = load(cli)?;

    println!("Rules:");
    for rule in script.rules.iter() {
        let names = rule
            .capture_names()
            .map(|n| format!(" [{}]", n.join(", ")))
            .unwrap_or_default();
        println!("  {:<8} {}{names}", rule.kind().as_str(), rule.pattern());
    }

    if !script.wanted.is_empty() {
        println!("Wanted:");
        for target in &script.wanted {
            println!("  {target}");
        }
    }
    Ok(())
}

/// Show how a target string resolves without building it.
fn cmd_explain(cli: &cli::Cli, raw: &str) -> Result<()> {
    let (_config, script) = load(cli)?;

    if is_dir_request(raw) {
        println!("{raw}: directory request (created on demand, no rule)");
        return Ok(());
    }

    let id = normalize(raw)?;
    let resolved = script.rules.resolve(&id)?;
    let target = &resolved.target;

    println!("target:   {target}");
    println!("rule:     {} ({})", resolved.pattern, resolved.kind.as_str());
    println!("dir:      {}", target.dir());
    println!("name:     {}", target.name());
    if let Some(ext) = target.ext() {
        println!("ext:      {ext}");
    }
    for (i, capture) in target.captures().iter().enumerate() {
        let name = target
            .capture_names()
            .and_then(|names| names.get(i))
            .map(|n| format!(" ({n})"))
            .unwrap_or_default();
        println!("${}:       {capture}{name}", i + 1);
    }
    Ok(())
}
