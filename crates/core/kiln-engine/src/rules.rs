//! Rule registry.
//!
//! Rules are registered with a builder, mirroring how build scripts declare
//! them:
//!
//! ```ignore
//! rules.file("build/as0/*-*-*.ttf")
//!     .captures(["family", "region", "style"])
//!     .def(|ctx, t| { /* ... */ Ok(()) })?;
//! rules.virt("ttf").def(|ctx, _| { ctx.need(["out/a.ttf", "out/b.ttf"])?; Ok(()) })?;
//! ```
//!
//! Resolution precedence: a literal pattern beats any wildcarded one, and
//! among wildcarded patterns the most specific wins. Registration rejects
//! any rule that would leave a target with two equally good candidates.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::context::Context;
use crate::error::{BuildError, Result};
use crate::pattern::Pattern;
use crate::target::{Target, TargetKind};

/// Whether a rule produces a file or names a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Produces the file named by the target.
    File,
    /// Groups work under a name; may return a value.
    Virtual,
}

impl RuleKind {
    /// Lowercase name for display.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Virtual => "virtual",
        }
    }

    fn target_kind(self) -> TargetKind {
        match self {
            Self::File => TargetKind::File,
            Self::Virtual => TargetKind::Virtual,
        }
    }
}

/// The work a rule performs for one target.
///
/// Closures are registered through [`RuleBuilder::def`]; other
/// implementations (such as script functions) through
/// [`RuleBuilder::action`]. The returned value becomes the outcome of a
/// virtual target and is ignored for file targets.
pub trait Action: Send + Sync {
    /// Build `target`.
    fn execute(&self, ctx: &Context, target: &Target) -> Result<Value>;
}

struct FnAction<F>(F);

impl<F, R> Action for FnAction<F>
where
    F: Fn(&Context, &Target) -> Result<R> + Send + Sync,
    R: Into<Value>,
{
    fn execute(&self, ctx: &Context, target: &Target) -> Result<Value> {
        (self.0)(ctx, target).map(Into::into)
    }
}

/// A registered rule.
#[derive(Clone)]
pub struct Rule {
    pattern: Pattern,
    kind: RuleKind,
    names: Option<Arc<[String]>>,
    action: Arc<dyn Action>,
}

impl Rule {
    /// The rule's pattern.
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// File or virtual.
    pub fn kind(&self) -> RuleKind {
        self.kind
    }

    /// Capture names declared for the rule.
    pub fn capture_names(&self) -> Option<&[String]> {
        self.names.as_deref()
    }
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("pattern", &self.pattern.as_str())
            .field("kind", &self.kind)
            .field("names", &self.names)
            .finish_non_exhaustive()
    }
}

/// A target matched to the rule that builds it.
#[derive(Clone)]
pub struct Resolved {
    /// The matched rule's kind.
    pub kind: RuleKind,
    /// The matched rule's pattern text.
    pub pattern: String,
    /// The action to run.
    pub action: Arc<dyn Action>,
    /// The target with captures bound.
    pub target: Target,
}

/// All rules known to a build.
#[derive(Default, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    /// An empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start declaring a file rule.
    pub fn file(&mut self, pattern: &str) -> RuleBuilder<'_> {
        RuleBuilder::new(self, RuleKind::File, pattern)
    }

    /// Start declaring a virtual rule.
    pub fn virt(&mut self, name: &str) -> RuleBuilder<'_> {
        RuleBuilder::new(self, RuleKind::Virtual, name)
    }

    /// Register a rule.
    ///
    /// Fails if the pattern is invalid, the capture schema does not fit it,
    /// or the rule conflicts with one already registered.
    pub fn register(
        &mut self,
        kind: RuleKind,
        pattern: &str,
        names: Option<Vec<String>>,
        action: Arc<dyn Action>,
    ) -> Result<()> {
        let pattern = Pattern::parse(pattern)?;

        if let Some(names) = &names {
            if names.len() != pattern.wildcards() {
                return Err(BuildError::CaptureSchema {
                    pattern: pattern.as_str().into(),
                    wildcards: pattern.wildcards(),
                    names: names.len(),
                });
            }
        }

        if let Some(existing) = self.rules.iter().find(|r| conflicts(&r.pattern, &pattern)) {
            return Err(BuildError::RuleConflict {
                pattern: pattern.as_str().into(),
                existing: existing.pattern.as_str().into(),
            });
        }

        self.rules.push(Rule {
            pattern,
            kind,
            names: names.map(Into::into),
            action,
        });
        Ok(())
    }

    /// Find the rule for a normalized target string and bind its captures.
    pub fn resolve(&self, id: &str) -> Result<Resolved> {
        let mut best: Option<(&Rule, Vec<String>)> = None;
        for rule in &self.rules {
            let Some(captures) = rule.pattern.matches(id) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((current, _)) => outranks(&rule.pattern, &current.pattern),
            };
            if better {
                best = Some((rule, captures));
            }
        }

        let (rule, captures) = best.ok_or_else(|| BuildError::NoMatchingRule { target: id.into() })?;
        Ok(Resolved {
            kind: rule.kind,
            pattern: rule.pattern.as_str().into(),
            action: rule.action.clone(),
            target: Target::new(
                id.into(),
                rule.kind.target_kind(),
                captures,
                rule.names.clone(),
            ),
        })
    }

    /// Registered rules in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Returns `true` if no rule is registered.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// `a` is preferred over `b` for a target both match.
fn outranks(a: &Pattern, b: &Pattern) -> bool {
    match (a.is_literal(), b.is_literal()) {
        (true, false) => true,
        (false, true) => false,
        _ => a.specificity() > b.specificity(),
    }
}

/// Two patterns conflict when a target could match both without either
/// outranking the other.
fn conflicts(a: &Pattern, b: &Pattern) -> bool {
    if a.is_literal() != b.is_literal() {
        return false;
    }
    if a.is_literal() {
        return a.as_str() == b.as_str();
    }
    a.specificity() == b.specificity() && a.overlaps(b)
}

/// Declares one rule; finished by [`def`](Self::def) or [`action`](Self::action).
pub struct RuleBuilder<'a> {
    set: &'a mut RuleSet,
    kind: RuleKind,
    pattern: String,
    names: Option<Vec<String>>,
}

impl<'a> RuleBuilder<'a> {
    fn new(set: &'a mut RuleSet, kind: RuleKind, pattern: &str) -> Self {
        Self {
            set,
            kind,
            pattern: pattern.into(),
            names: None,
        }
    }

    /// Name the captures, in wildcard order.
    #[must_use]
    pub fn captures<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.names = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Register the rule with a closure as its action.
    pub fn def<F, R>(self, f: F) -> Result<()>
    where
        F: Fn(&Context, &Target) -> Result<R> + Send + Sync + 'static,
        R: Into<Value> + 'static,
    {
        self.action(FnAction(f))
    }

    /// Register the rule with any [`Action`].
    pub fn action(self, action: impl Action + 'static) -> Result<()> {
        self.set
            .register(self.kind, &self.pattern, self.names, Arc::new(action))
    }
}
