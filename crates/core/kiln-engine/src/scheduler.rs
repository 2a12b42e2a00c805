//! Memoizing, concurrent build scheduler.
//!
//! Every target identity gets one build record for the lifetime of a
//! [`Scheduler`]. The first request for an identity becomes its owner and
//! runs the rule action on its own thread; every other request blocks on
//! the record until the owner settles it, then shares the outcome or the
//! failure. A failed record is never retried.
//!
//! While a build path waits on another target, a wait-for edge is kept in
//! the record table. A request that would close a loop of such edges fails
//! with [`BuildError::DependencyCycle`] instead of blocking forever.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use serde_json::Value;

use crate::context::Context;
use crate::error::{BuildError, Result};
use crate::fsops;
use crate::process::ProcessRunner;
use crate::rules::{RuleKind, RuleSet};
use crate::target::{Target, is_dir_request, normalize, normalize_dir};
use crate::verbose::{self, Timer};

/// Stack reserved for each build thread; script actions add interpreter
/// frames for every nested `need`.
const BUILD_STACK_SIZE: usize = 16 * 1024 * 1024;

/// A single-target `need` runs on the requesting thread unless its depth is
/// a multiple of this, so no thread carries more than this many levels.
const INLINE_LEVELS: usize = 8;

/// Default for [`Settings::max_depth`].
pub const DEFAULT_MAX_DEPTH: usize = 512;

/// Per-run settings shared with every action.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Project root; target paths and `cd` scopes are relative to it.
    pub root: PathBuf,
    /// Maximum number of concurrent external processes (0 = auto-detect).
    pub jobs: usize,
    /// Opaque parameter document handed to actions.
    pub params: Value,
    /// Deepest allowed nesting of `need` calls; a request below it fails
    /// with [`BuildError::DependencyTooDeep`].
    pub max_depth: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            jobs: 0,
            params: Value::Null,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// The result of building one target.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// A file target was produced.
    File(Target),
    /// A directory request was satisfied; the path is relative to the root.
    Dir(PathBuf),
    /// A virtual target finished, with the value its action returned.
    Virtual {
        /// The virtual target.
        target: Target,
        /// The action's return value (`null` if it returned nothing).
        value: Value,
    },
}

impl Outcome {
    /// The built target, if this was not a directory request.
    pub fn target(&self) -> Option<&Target> {
        match self {
            Self::File(target) | Self::Virtual { target, .. } => Some(target),
            Self::Dir(_) => None,
        }
    }

    /// The value returned by a virtual action.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Virtual { value, .. } => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(target) | Self::Virtual { target, .. } => f.write_str(target.id()),
            Self::Dir(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Observable state of a build record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// The action is still running.
    Pending,
    /// The target was built.
    Done,
    /// The target failed; the error is final for this scheduler.
    Failed,
}

// ---------------------------------------------------------------------------
// Build records
// ---------------------------------------------------------------------------

enum SlotState {
    Pending,
    Done(Outcome),
    Failed(BuildError),
}

struct Slot {
    state: Mutex<SlotState>,
    settled: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            settled: Condvar::new(),
        }
    }

    fn settle(&self, result: &Result<Outcome>) {
        let mut state = lock(&self.state);
        *state = match result {
            Ok(outcome) => SlotState::Done(outcome.clone()),
            Err(err) => SlotState::Failed(err.clone()),
        };
        self.settled.notify_all();
    }

    fn wait(&self) -> Result<Outcome> {
        let mut state = lock(&self.state);
        loop {
            match &*state {
                SlotState::Pending => {}
                SlotState::Done(outcome) => return Ok(outcome.clone()),
                SlotState::Failed(err) => return Err(err.clone()),
            }
            state = self
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn observe(&self) -> RecordState {
        match &*lock(&self.state) {
            SlotState::Pending => RecordState::Pending,
            SlotState::Done(_) => RecordState::Done,
            SlotState::Failed(_) => RecordState::Failed,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Table {
    slots: HashMap<String, Arc<Slot>>,
    /// Wait-for edges: requester → targets it is currently waiting on.
    waits: HashMap<String, Vec<String>>,
}

impl Table {
    /// The loop that waiting on `target` from `requester` would close, if any.
    fn cycle(&self, requester: &str, target: &str) -> Option<Vec<String>> {
        if requester == target {
            return Some(vec![requester.into(), target.into()]);
        }

        let mut parent: HashMap<&str, &str> = HashMap::new();
        let mut queue = VecDeque::from([target]);
        while let Some(node) = queue.pop_front() {
            for next in self.waits.get(node).into_iter().flatten() {
                let next = next.as_str();
                if next == target || parent.contains_key(next) {
                    continue;
                }
                parent.insert(next, node);
                if next == requester {
                    let mut chain = vec![requester.to_string()];
                    let mut cur = requester;
                    while let Some(&prev) = parent.get(cur) {
                        chain.push(prev.to_string());
                        cur = prev;
                    }
                    chain.reverse();
                    chain.insert(0, requester.to_string());
                    return Some(chain);
                }
                queue.push_back(next);
            }
        }
        None
    }

    fn remove_wait(&mut self, requester: &str, target: &str) {
        if let Some(edges) = self.waits.get_mut(requester) {
            if let Some(i) = edges.iter().position(|t| t == target) {
                edges.swap_remove(i);
            }
            if edges.is_empty() {
                self.waits.remove(requester);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared scheduler state
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    rules: RuleSet,
    pub(crate) settings: Settings,
    pub(crate) runner: ProcessRunner,
    table: Mutex<Table>,
    executed: AtomicUsize,
}

/// A requested target string, classified and normalized.
struct Request {
    /// Record key; directory requests keep their trailing `/`.
    key: String,
    /// Normalized identity.
    id: String,
    dir: bool,
}

impl Request {
    fn parse(raw: &str) -> Result<Self> {
        if is_dir_request(raw) {
            let id = normalize_dir(raw)?;
            Ok(Self {
                key: format!("{id}/"),
                id,
                dir: true,
            })
        } else {
            let id = normalize(raw)?;
            Ok(Self {
                key: id.clone(),
                id,
                dir: false,
            })
        }
    }
}

impl Shared {
    /// Build one target on behalf of `requester` (`None` for top-level
    /// requests). `depth` counts the `need` calls above this request.
    pub(crate) fn build_from(
        self: &Arc<Self>,
        requester: Option<&str>,
        depth: usize,
        raw: &str,
    ) -> Result<Outcome> {
        let request = Request::parse(raw)?;
        if depth > self.settings.max_depth {
            return Err(BuildError::DependencyTooDeep {
                target: request.key,
                limit: self.settings.max_depth,
            });
        }

        let (slot, owner) = {
            let mut table = lock(&self.table);
            if let Some(requester) = requester {
                if let Some(chain) = table.cycle(requester, &request.key) {
                    return Err(BuildError::DependencyCycle { chain });
                }
            }
            let (slot, owner) = match table.slots.get(&request.key) {
                Some(slot) => (slot.clone(), false),
                None => {
                    let slot = Arc::new(Slot::new());
                    table.slots.insert(request.key.clone(), slot.clone());
                    (slot, true)
                }
            };
            if let Some(requester) = requester {
                table
                    .waits
                    .entry(requester.to_string())
                    .or_default()
                    .push(request.key.clone());
            }
            (slot, owner)
        };

        let result = if owner {
            let result = self.execute(&request, depth);
            if let Err(err) = &result {
                verbose::detail("Failed", format_args!("{}: {err}", request.key));
            }
            slot.settle(&result);
            result
        } else {
            verbose::detail("Reusing", &request.key);
            slot.wait()
        };

        if let Some(requester) = requester {
            lock(&self.table).remove_wait(requester, &request.key);
        }
        result
    }

    /// Build every target concurrently, returning results in request order.
    pub(crate) fn build_many(
        self: &Arc<Self>,
        requester: Option<&str>,
        depth: usize,
        targets: &[String],
    ) -> Vec<Result<Outcome>> {
        if let [single] = targets {
            if depth % INLINE_LEVELS != 0 {
                return vec![self.build_from(requester, depth, single)];
            }
        }
        thread::scope(|s| {
            let handles: Vec<_> = targets
                .iter()
                .map(|raw| {
                    thread::Builder::new()
                        .name("kiln-build".into())
                        .stack_size(BUILD_STACK_SIZE)
                        .spawn_scoped(s, move || self.build_from(requester, depth, raw))
                })
                .collect();
            handles
                .into_iter()
                .zip(targets)
                .map(|(handle, raw)| match handle {
                    Ok(handle) => handle.join().unwrap_or_else(|payload| {
                        Err(BuildError::ActionPanicked {
                            target: raw.clone(),
                            message: panic_message(payload.as_ref()),
                        })
                    }),
                    Err(err) => Err(BuildError::io("spawn build thread for", raw.as_str(), err)),
                })
                .collect()
        })
    }

    /// `need` on behalf of a running action: all targets settle, the first
    /// failure in request order is reported.
    pub(crate) fn need_from(
        self: &Arc<Self>,
        requester: &str,
        depth: usize,
        targets: &[String],
    ) -> Result<Vec<Outcome>> {
        let results = self.build_many(Some(requester), depth, targets);
        let mut outcomes = Vec::with_capacity(results.len());
        for (raw, result) in targets.iter().zip(results) {
            match result {
                Ok(outcome) => outcomes.push(outcome),
                Err(cause) => {
                    return Err(BuildError::DependencyFailed {
                        dependency: Request::parse(raw).map_or_else(|_| raw.clone(), |r| r.key),
                        cause: Arc::new(cause),
                    });
                }
            }
        }
        Ok(outcomes)
    }

    fn execute(self: &Arc<Self>, request: &Request, depth: usize) -> Result<Outcome> {
        if request.dir {
            fsops::ensure_dir(&self.settings.root.join(&request.id))?;
            return Ok(Outcome::Dir(PathBuf::from(&request.id)));
        }

        let resolved = self.rules.resolve(&request.id)?;
        let target = resolved.target;
        verbose::status("Building", &target);
        verbose::detail(
            "Resolved",
            format_args!(
                "{} rule `{}`, captures {:?}",
                resolved.kind.as_str(),
                resolved.pattern,
                target.captures()
            ),
        );
        let _timer = Timer::start(target.id());

        self.executed.fetch_add(1, Ordering::Relaxed);
        let ctx = Context::new(self.clone(), target.id(), depth);
        let action = resolved.action;
        let value = panic::catch_unwind(AssertUnwindSafe(|| action.execute(&ctx, &target)))
            .unwrap_or_else(|payload| {
                Err(BuildError::ActionPanicked {
                    target: target.id().into(),
                    message: panic_message(payload.as_ref()),
                })
            })?;

        Ok(match resolved.kind {
            RuleKind::File => Outcome::File(target),
            RuleKind::Virtual => Outcome::Virtual { target, value },
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".into()
    }
}

// ---------------------------------------------------------------------------
// Public handle
// ---------------------------------------------------------------------------

/// Builds targets against a fixed rule set.
///
/// Cloning the scheduler shares its build records.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Shared>,
}

impl Scheduler {
    /// Create a scheduler owning `rules`.
    pub fn new(rules: RuleSet, settings: Settings) -> Self {
        let runner = ProcessRunner::new(settings.jobs);
        Self {
            inner: Arc::new(Shared {
                rules,
                settings,
                runner,
                table: Mutex::new(Table::default()),
                executed: AtomicUsize::new(0),
            }),
        }
    }

    /// Build one target (or ensure a `dir/` request) and wait for it.
    ///
    /// The action runs on the calling thread; its prerequisites move to
    /// build threads as they nest.
    pub fn build(&self, target: &str) -> Result<Outcome> {
        self.inner.build_from(None, 0, target)
    }

    /// Build several targets concurrently.
    ///
    /// Every target is attempted even if others fail; results are returned
    /// in request order.
    pub fn build_all<S: AsRef<str>>(&self, targets: &[S]) -> Vec<(String, Result<Outcome>)> {
        let targets: Vec<String> = targets.iter().map(|t| t.as_ref().to_string()).collect();
        let results = self.inner.build_many(None, 0, &targets);
        targets.into_iter().zip(results).collect()
    }

    /// The state of a target's build record, if it was ever requested.
    pub fn state(&self, target: &str) -> Option<RecordState> {
        let key = Request::parse(target).ok()?.key;
        let slot = lock(&self.inner.table).slots.get(&key).cloned()?;
        Some(slot.observe())
    }

    /// Number of rule actions executed so far.
    pub fn executed(&self) -> usize {
        self.inner.executed.load(Ordering::Relaxed)
    }

    /// The rules this scheduler resolves against.
    pub fn rules(&self) -> &RuleSet {
        &self.inner.rules
    }

    /// The settings actions see.
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }
}
