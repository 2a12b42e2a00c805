//! The handle a rule action receives.
//!
//! A [`Context`] is bound to the target being built. Prerequisites declared
//! through it are recorded as waits of that target, so cycles through
//! actions are detected. Relative paths given to its helpers are resolved
//! against the project root, never against the process working directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use crate::args::{self, CommandArg};
use crate::error::Result;
use crate::fsops;
use crate::process::CommandOutput;
use crate::scheduler::{Outcome, Shared};

/// Build operations available to a running action.
#[derive(Clone)]
pub struct Context {
    shared: Arc<Shared>,
    current: Arc<str>,
    depth: usize,
}

impl Context {
    pub(crate) fn new(shared: Arc<Shared>, current: &str, depth: usize) -> Self {
        Self {
            shared,
            current: current.into(),
            depth,
        }
    }

    /// The identity of the target this action builds.
    pub fn target_id(&self) -> &str {
        &self.current
    }

    /// The project root.
    pub fn root(&self) -> &Path {
        &self.shared.settings.root
    }

    /// The parameter document configured for this build.
    pub fn params(&self) -> &Value {
        &self.shared.settings.params
    }

    /// Resolve a root-relative path.
    pub fn path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.root().join(rel)
    }

    /// Build all `targets` concurrently and wait until every one settles.
    ///
    /// Outcomes are returned in request order. If any target failed, the
    /// first failure in request order is returned as
    /// [`BuildError::DependencyFailed`](crate::BuildError::DependencyFailed).
    /// A string ending in `/` only ensures that directory exists.
    pub fn need<I, S>(&self, targets: I) -> Result<Vec<Outcome>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let targets: Vec<String> = targets
            .into_iter()
            .map(|t| t.as_ref().to_string())
            .collect();
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        self.shared.need_from(&self.current, self.depth + 1, &targets)
    }

    /// [`need`](Self::need) for a single target.
    pub fn need_one(&self, target: &str) -> Result<Outcome> {
        let mut outcomes = self.need([target])?;
        Ok(outcomes.remove(0))
    }

    /// Run a command from the project root with captured output.
    pub fn run(&self, program: &str, args: &[CommandArg]) -> Result<CommandOutput> {
        self.shared
            .runner
            .run(program, &args::flatten(args), self.root())
    }

    /// Run a command from the project root attached to the terminal.
    pub fn run_interactive(&self, program: &str, args: &[CommandArg]) -> Result<()> {
        self.shared
            .runner
            .run_interactive(program, &args::flatten(args), self.root())
    }

    /// A handle that runs commands in `dir` (relative to the root).
    pub fn cd(&self, dir: impl AsRef<Path>) -> Scoped {
        Scoped {
            ctx: self.clone(),
            dir: self.path(dir),
        }
    }

    /// Copy a file or directory tree.
    pub fn cp(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<()> {
        fsops::copy(&self.path(src), &self.path(dst))
    }

    /// Remove files or directory trees; missing paths are ignored.
    pub fn rm<I, P>(&self, paths: I) -> Result<()>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        paths
            .into_iter()
            .try_for_each(|p| fsops::remove(&self.path(p)))
    }

    /// Ensure a directory exists.
    pub fn check(&self, dir: impl AsRef<Path>) -> Result<()> {
        fsops::ensure_dir(&self.path(dir))
    }

    /// Write a generated file.
    pub fn write(&self, path: impl AsRef<Path>, contents: impl AsRef<[u8]>) -> Result<()> {
        fsops::write_file(&self.path(path), contents.as_ref())
    }
}

/// Commands run from a fixed directory. Created by [`Context::cd`].
#[derive(Clone)]
pub struct Scoped {
    ctx: Context,
    dir: PathBuf,
}

impl Scoped {
    /// The directory commands run in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Narrow the scope to a subdirectory.
    #[must_use]
    pub fn cd(&self, sub: impl AsRef<Path>) -> Scoped {
        Scoped {
            ctx: self.ctx.clone(),
            dir: self.dir.join(sub),
        }
    }

    /// Run a command in this directory with captured output.
    pub fn run(&self, program: &str, args: &[CommandArg]) -> Result<CommandOutput> {
        self.ctx
            .shared
            .runner
            .run(program, &args::flatten(args), &self.dir)
    }

    /// Run a command in this directory attached to the terminal.
    pub fn run_interactive(&self, program: &str, args: &[CommandArg]) -> Result<()> {
        self.ctx
            .shared
            .runner
            .run_interactive(program, &args::flatten(args), &self.dir)
    }
}
