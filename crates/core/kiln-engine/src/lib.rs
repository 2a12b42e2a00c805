//! Task-graph build engine.
//!
//! Rules map target strings (file paths or virtual task names) to actions.
//! Patterns may contain single-segment `*` wildcards whose matched text is
//! handed to the action as positional (and optionally named) captures.
//!
//! The [`Scheduler`] builds a requested target by resolving its rule and
//! running the action on the calling thread. Actions declare prerequisites
//! with [`Context::need`], which builds every requested target concurrently
//! and returns once all of them have settled. Every target is built at most
//! once per scheduler: later and concurrent requests share the recorded
//! outcome or failure.
//!
//! ```ignore
//! let mut rules = RuleSet::new();
//! rules.file("out/*.bin").captures(["stem"]).def(|ctx, t| {
//!     let src = ctx.need_one(&format!("src/{}.raw", t.capture(1).unwrap_or_default()))?;
//!     ctx.run("convert", &[src.into(), "-o".into(), t.into()])?;
//!     Ok(())
//! })?;
//!
//! let scheduler = Scheduler::new(rules, Settings::default());
//! scheduler.build("out/a.bin")?;
//! ```

pub mod args;
pub mod context;
pub mod error;
pub mod fsops;
pub mod pattern;
pub mod process;
pub mod rules;
pub mod scheduler;
pub mod target;
pub mod verbose;

pub use args::{CommandArg, OptionValue, Options};
pub use context::{Context, Scoped};
pub use error::{BuildError, Result};
pub use pattern::Pattern;
pub use process::{CommandOutput, ProcessRunner};
pub use rules::{Action, Resolved, Rule, RuleBuilder, RuleKind, RuleSet};
pub use scheduler::{Outcome, RecordState, Scheduler, Settings};
pub use target::{Target, TargetKind};
