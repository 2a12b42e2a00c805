//! Rhai scripting front end.
//!
//! Evaluates the project's build script into a [`RuleSet`] plus the list of
//! wanted targets. Rule bodies are Rhai closures; they are called from
//! build threads with a `Context` and the `Target` being built:
//!
//! ```rhai
//! file("out/*.bin").captures(["stem"]).def(|ctx, t| {
//!     ctx.need([t.dir_target, `src/${t["stem"]}.raw`]);
//!     ctx.run("convert", [`src/${t[1]}.raw`, "-o", t]);
//! });
//! virt("all").def(|ctx, t| ctx.need(["out/a.bin", "out/b.bin"]));
//! want("all");
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};

use anyhow::{Result, anyhow};
use kiln_engine::{
    Action, BuildError, CommandArg, CommandOutput, Context, OptionValue, Options, Outcome,
    RuleKind, RuleSet, Scoped, Target,
};
use rhai::serde::{from_dynamic, to_dynamic};
use rhai::{AST, Array, Dynamic, Engine, EvalAltResult, FnPtr, ImmutableString, Map, Position, Scope};
use serde_json::Value;

use crate::config::{ResolvedConfig, read_json};

type RhaiResult<T> = std::result::Result<T, Box<EvalAltResult>>;

/// Rules and wanted targets produced by the build script.
pub struct Script {
    pub rules: RuleSet,
    pub wanted: Vec<String>,
}

#[derive(Default)]
struct Registry {
    rules: RuleSet,
    wanted: Vec<String>,
}

type SharedRegistry = Arc<Mutex<Registry>>;

/// The compiled script, shared by every rule action once evaluation is done.
struct Runtime {
    engine: Engine,
    ast: AST,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Evaluate the configured build script.
pub fn evaluate_script(config: &ResolvedConfig) -> Result<Script> {
    let registry: SharedRegistry = Arc::new(Mutex::new(Registry::default()));
    let runtime = Arc::new(OnceLock::new());

    let mut engine = Engine::new();
    engine.set_max_expr_depths(64, 64);

    let mut scope = Scope::new();
    scope.push_constant("NAME", config.name.clone());
    scope.push_constant("VERSION", config.version.clone());
    scope.push_constant("ROOT", config.root.display().to_string());
    scope.push_constant(
        "PARAMS",
        to_dynamic(&config.params).map_err(|e| anyhow!("cannot expose build params: {e}"))?,
    );

    register_rule_api(&mut engine, &registry, &Arc::downgrade(&runtime));
    register_target_api(&mut engine, &config.root);
    register_context_api(&mut engine);
    register_helpers(&mut engine, &config.root);

    let script_path = &config.script;
    let ast = engine
        .compile_file(script_path.clone())
        .map_err(|e| anyhow!("error compiling {}: {e}", script_path.display()))?;
    engine
        .run_ast_with_scope(&mut scope, &ast)
        .map_err(|e| anyhow!("error evaluating {}: {e}", script_path.display()))?;

    let Registry { rules, wanted } = std::mem::take(&mut *lock(&registry));
    runtime
        .set(Runtime { engine, ast })
        .map_err(|_| anyhow!("build script runtime initialized twice"))?;

    Ok(Script { rules, wanted })
}

// ---------------------------------------------------------------------------
// Errors crossing the script boundary
// ---------------------------------------------------------------------------

/// Carry a [`BuildError`] through Rhai so the action can recover it intact.
fn script_error(err: BuildError) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorSystem("build".into(), Box::new(err)))
}

fn runtime_error(message: impl Into<String>) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        message.into().into(),
        Position::NONE,
    ))
}

fn mismatch(expected: &str, actual: &Dynamic) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorMismatchDataType(
        expected.into(),
        actual.type_name().into(),
        Position::NONE,
    ))
}

fn into_build_error(target: &str, err: EvalAltResult) -> BuildError {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => into_build_error(target, *inner),
        EvalAltResult::ErrorSystem(message, source) => match source.downcast::<BuildError>() {
            Ok(err) => *err,
            Err(source) => BuildError::Action {
                target: target.into(),
                message: format!("{message}: {source}"),
            },
        },
        EvalAltResult::ErrorRuntime(value, _) => BuildError::Action {
            target: target.into(),
            message: value.to_string(),
        },
        other => BuildError::Action {
            target: target.into(),
            message: other.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Rule actions backed by script closures
// ---------------------------------------------------------------------------

struct ScriptAction {
    func: FnPtr,
    runtime: Arc<OnceLock<Runtime>>,
}

impl Action for ScriptAction {
    fn execute(&self, ctx: &Context, target: &Target) -> kiln_engine::Result<Value> {
        let Some(rt) = self.runtime.get() else {
            return Err(BuildError::Action {
                target: target.id().into(),
                message: "build script is still being evaluated".into(),
            });
        };
        let result: Dynamic = self
            .func
            .call(&rt.engine, &rt.ast, (ctx.clone(), target.clone()))
            .map_err(|e| into_build_error(target.id(), *e))?;
        Ok(to_json_value(result))
    }
}

fn to_json_value(value: Dynamic) -> Value {
    let value = value.flatten();
    if value.is::<Target>() {
        return Value::String(value.cast::<Target>().id().into());
    }
    from_dynamic::<Value>(&value).unwrap_or_else(|_| Value::String(value.to_string()))
}

// ---------------------------------------------------------------------------
// file() / virt() / want()
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct RuleDecl {
    registry: SharedRegistry,
    runtime: Weak<OnceLock<Runtime>>,
    kind: RuleKind,
    pattern: String,
    names: Option<Vec<String>>,
}

fn register_rule_api(engine: &mut Engine, registry: &SharedRegistry, runtime: &Weak<OnceLock<Runtime>>) {
    engine.register_type_with_name::<RuleDecl>("Rule");

    for (name, kind) in [("file", RuleKind::File), ("virt", RuleKind::Virtual)] {
        let registry = registry.clone();
        let runtime = runtime.clone();
        engine.register_fn(name, move |pattern: &str| -> RuleDecl {
            RuleDecl {
                registry: registry.clone(),
                runtime: runtime.clone(),
                kind,
                pattern: pattern.into(),
                names: None,
            }
        });
    }

    engine.register_fn(
        "captures",
        |decl: &mut RuleDecl, names: Array| -> RhaiResult<RuleDecl> {
            let names = names
                .into_iter()
                .map(|n| n.clone().into_string().map_err(|_| mismatch("string", &n)))
                .collect::<RhaiResult<Vec<_>>>()?;
            let mut decl = decl.clone();
            decl.names = Some(names);
            Ok(decl)
        },
    );

    engine.register_fn("def", |decl: &mut RuleDecl, func: FnPtr| -> RhaiResult<()> {
        let runtime = decl
            .runtime
            .upgrade()
            .ok_or_else(|| runtime_error("rules can only be defined while the build script loads"))?;
        let action = ScriptAction { func, runtime };

        let mut registry = lock(&decl.registry);
        let builder = match decl.kind {
            RuleKind::File => registry.rules.file(&decl.pattern),
            RuleKind::Virtual => registry.rules.virt(&decl.pattern),
        };
        let builder = match &decl.names {
            Some(names) => builder.captures(names.iter().cloned()),
            None => builder,
        };
        builder.action(action).map_err(|e| runtime_error(e.to_string()))
    });

    let reg = registry.clone();
    engine.register_fn("want", move |targets: Dynamic| -> RhaiResult<()> {
        let mut ids = Vec::new();
        collect_targets(targets, &mut ids)?;
        lock(&reg).wanted.extend(ids);
        Ok(())
    });
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

fn register_target_api(engine: &mut Engine, root: &Path) {
    engine.register_type_with_name::<Target>("Target");

    engine.register_get("id", |t: &mut Target| t.id().to_string());
    engine.register_get("dir", |t: &mut Target| t.dir().to_string());
    engine.register_get("dir_target", |t: &mut Target| t.dir_request());
    engine.register_get("name", |t: &mut Target| t.name().to_string());
    engine.register_get("basename", |t: &mut Target| t.basename().to_string());
    engine.register_get("ext", |t: &mut Target| t.ext().unwrap_or_default().to_string());
    engine.register_get("kind", |t: &mut Target| t.kind().as_str().to_string());
    engine.register_get("captures", |t: &mut Target| -> Array {
        t.captures().iter().cloned().map(Dynamic::from).collect()
    });
    let root = root.to_path_buf();
    engine.register_get("path", move |t: &mut Target| {
        t.path(&root).display().to_string()
    });

    engine.register_indexer_get(|t: &mut Target, n: i64| -> RhaiResult<String> {
        usize::try_from(n)
            .ok()
            .and_then(|n| t.capture(n))
            .map(str::to_string)
            .ok_or_else(|| runtime_error(format!("`{t}` has no capture ${n}")))
    });
    engine.register_indexer_get(|t: &mut Target, name: ImmutableString| -> RhaiResult<String> {
        t.named(&name)
            .map(str::to_string)
            .ok_or_else(|| runtime_error(format!("`{t}` has no capture named `{name}`")))
    });

    engine.register_fn("to_string", |t: &mut Target| t.id().to_string());
    engine.register_fn("to_debug", |t: &mut Target| format!("Target({})", t.id()));
}

// ---------------------------------------------------------------------------
// Context and Scoped
// ---------------------------------------------------------------------------

fn register_context_api(engine: &mut Engine) {
    engine.register_type_with_name::<Context>("Context");
    engine.register_type_with_name::<Scoped>("Scoped");

    engine.register_get("target", |ctx: &mut Context| ctx.target_id().to_string());
    engine.register_get("params", |ctx: &mut Context| {
        to_dynamic(ctx.params()).unwrap_or(Dynamic::UNIT)
    });

    engine.register_fn("need", |ctx: &mut Context, targets: Dynamic| -> RhaiResult<Dynamic> {
        let mut ids = Vec::new();
        let shape = request_shape(targets, &mut ids)?;
        let outcomes = ctx.need(&ids).map_err(script_error)?;
        Ok(shape_outcomes(&shape, &mut outcomes.into_iter()))
    });

    engine.register_fn("run", |ctx: &mut Context, cmd: &str| -> RhaiResult<Map> {
        ctx.run(cmd, &[]).map(output_map).map_err(script_error)
    });
    engine.register_fn("run", |ctx: &mut Context, cmd: &str, args: Array| -> RhaiResult<Map> {
        let args = command_args(args)?;
        ctx.run(cmd, &args).map(output_map).map_err(script_error)
    });
    engine.register_fn("run_interactive", |ctx: &mut Context, cmd: &str| -> RhaiResult<()> {
        ctx.run_interactive(cmd, &[]).map_err(script_error)
    });
    engine.register_fn(
        "run_interactive",
        |ctx: &mut Context, cmd: &str, args: Array| -> RhaiResult<()> {
            let args = command_args(args)?;
            ctx.run_interactive(cmd, &args).map_err(script_error)
        },
    );

    engine.register_fn("cd", |ctx: &mut Context, dir: Dynamic| -> RhaiResult<Scoped> {
        Ok(ctx.cd(path_arg(dir)?))
    });
    engine.register_fn("cp", |ctx: &mut Context, src: Dynamic, dst: Dynamic| -> RhaiResult<()> {
        ctx.cp(path_arg(src)?, path_arg(dst)?).map_err(script_error)
    });
    engine.register_fn("rm", |ctx: &mut Context, paths: Dynamic| -> RhaiResult<()> {
        let mut list = Vec::new();
        collect_targets(paths, &mut list)?;
        ctx.rm(&list).map_err(script_error)
    });
    engine.register_fn("check", |ctx: &mut Context, dir: Dynamic| -> RhaiResult<()> {
        ctx.check(path_arg(dir)?).map_err(script_error)
    });
    engine.register_fn(
        "write",
        |ctx: &mut Context, path: Dynamic, text: &str| -> RhaiResult<()> {
            ctx.write(path_arg(path)?, text).map_err(script_error)
        },
    );

    engine.register_get("dir", |s: &mut Scoped| s.dir().display().to_string());
    engine.register_fn("cd", |s: &mut Scoped, sub: Dynamic| -> RhaiResult<Scoped> {
        Ok(s.cd(path_arg(sub)?))
    });
    engine.register_fn("run", |s: &mut Scoped, cmd: &str| -> RhaiResult<Map> {
        s.run(cmd, &[]).map(output_map).map_err(script_error)
    });
    engine.register_fn("run", |s: &mut Scoped, cmd: &str, args: Array| -> RhaiResult<Map> {
        let args = command_args(args)?;
        s.run(cmd, &args).map(output_map).map_err(script_error)
    });
    engine.register_fn("run_interactive", |s: &mut Scoped, cmd: &str| -> RhaiResult<()> {
        s.run_interactive(cmd, &[]).map_err(script_error)
    });
    engine.register_fn(
        "run_interactive",
        |s: &mut Scoped, cmd: &str, args: Array| -> RhaiResult<()> {
            let args = command_args(args)?;
            s.run_interactive(cmd, &args).map_err(script_error)
        },
    );
}

/// Flatten strings, targets and (nested) arrays into target strings.
fn collect_targets(value: Dynamic, out: &mut Vec<String>) -> RhaiResult<()> {
    let value = value.flatten();
    if value.is_array() {
        for item in value.cast::<Array>() {
            collect_targets(item, out)?;
        }
    } else {
        out.push(path_arg(value)?);
    }
    Ok(())
}

/// How a `need` request was nested; results come back in the same shape.
enum Shape {
    One,
    Many(Vec<Shape>),
}

fn request_shape(value: Dynamic, ids: &mut Vec<String>) -> RhaiResult<Shape> {
    let value = value.flatten();
    if value.is_array() {
        value
            .cast::<Array>()
            .into_iter()
            .map(|item| request_shape(item, ids))
            .collect::<RhaiResult<_>>()
            .map(Shape::Many)
    } else {
        ids.push(path_arg(value)?);
        Ok(Shape::One)
    }
}

fn shape_outcomes<I: Iterator<Item = Outcome>>(shape: &Shape, outcomes: &mut I) -> Dynamic {
    match shape {
        Shape::One => outcomes.next().map_or(Dynamic::UNIT, outcome_to_dynamic),
        Shape::Many(items) => items
            .iter()
            .map(|item| shape_outcomes(item, outcomes))
            .collect::<Array>()
            .into(),
    }
}

fn path_arg(value: Dynamic) -> RhaiResult<String> {
    let value = value.flatten();
    if value.is::<Target>() {
        Ok(value.cast::<Target>().id().to_string())
    } else if value.is_string() {
        Ok(value.to_string())
    } else {
        Err(mismatch("string or Target", &value))
    }
}

/// Script values to command arguments: arrays splice, maps become options,
/// everything else is stringified.
fn command_arg(value: Dynamic) -> RhaiResult<CommandArg> {
    let value = value.flatten();
    if value.is::<Target>() {
        return Ok(CommandArg::from(&value.cast::<Target>()));
    }
    if value.is_array() {
        return command_args(value.cast::<Array>()).map(CommandArg::List);
    }
    if value.is_map() {
        let mut options = Options::new();
        for (key, v) in value.cast::<Map>() {
            let v = match v.as_bool() {
                Ok(on) => OptionValue::Flag(on),
                Err(_) => OptionValue::Value(v.to_string()),
            };
            options.insert(key.to_string(), v);
        }
        return Ok(options.into());
    }
    if value.is_unit() {
        return Err(mismatch("command argument", &value));
    }
    Ok(CommandArg::Value(value.to_string()))
}

fn command_args(args: Array) -> RhaiResult<Vec<CommandArg>> {
    args.into_iter().map(command_arg).collect()
}

fn outcome_to_dynamic(outcome: Outcome) -> Dynamic {
    match outcome {
        Outcome::File(target) => Dynamic::from(target),
        Outcome::Dir(path) => path.display().to_string().into(),
        Outcome::Virtual { value, .. } => to_dynamic(&value).unwrap_or(Dynamic::UNIT),
    }
}

fn output_map(output: CommandOutput) -> Map {
    let mut map = Map::new();
    map.insert("stdout".into(), output.stdout.into());
    map.insert("stderr".into(), output.stderr.into());
    map
}

// ---------------------------------------------------------------------------
// Helper functions available in scripts
// ---------------------------------------------------------------------------

fn register_helpers(engine: &mut Engine, root: &Path) {
    let root: PathBuf = root.to_path_buf();

    // load_json("config.json") -> map/array/...
    engine.register_fn("load_json", move |path: &str| -> RhaiResult<Dynamic> {
        let value = read_json(&root.join(path)).map_err(|e| runtime_error(format!("{e:#}")))?;
        to_dynamic(&value)
    });

    // to_json(value) -> string
    engine.register_fn("to_json", |value: Dynamic| -> RhaiResult<String> {
        serde_json::to_string(&to_json_value(value)).map_err(|e| runtime_error(e.to_string()))
    });

    // platform() -> "linux" | "macos" | "windows" | ...
    engine.register_fn("platform", || -> String { std::env::consts::OS.into() });

    // env("VAR") -> string, or () when unset
    engine.register_fn("env", |var: &str| -> Dynamic {
        std::env::var(var).map_or(Dynamic::UNIT, Dynamic::from)
    });
    // env("VAR", "fallback") -> string
    engine.register_fn("env", |var: &str, fallback: &str| -> String {
        std::env::var(var).unwrap_or_else(|_| fallback.to_string())
    });
}
