//! Error types for the build engine.
//!
//! A [`BuildError`] is recorded once per failed target and handed to every
//! caller that requested it, so it is `Clone`: I/O errors are shared behind
//! an [`Arc`].

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Convenience alias used throughout the engine.
pub type Result<T, E = BuildError> = std::result::Result<T, E>;

/// Errors that can occur while registering rules or building targets.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BuildError {
    /// A target string is empty after normalization.
    #[error("invalid target `{0}`")]
    InvalidTarget(String),

    /// A rule pattern cannot be parsed.
    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A rule would make resolution ambiguous.
    #[error("rule `{pattern}` conflicts with already registered rule `{existing}`")]
    RuleConflict {
        /// The pattern being registered.
        pattern: String,
        /// The registered pattern it overlaps with.
        existing: String,
    },

    /// A capture schema does not fit the pattern's wildcards.
    #[error("rule `{pattern}` has {wildcards} wildcard(s) but names {names} capture(s)")]
    CaptureSchema {
        /// The pattern the schema was attached to.
        pattern: String,
        /// Number of wildcards in the pattern.
        wildcards: usize,
        /// Number of names in the schema.
        names: usize,
    },

    /// No registered rule matches the target.
    #[error("no rule to build `{target}`")]
    NoMatchingRule {
        /// The requested target.
        target: String,
    },

    /// An external command exited unsuccessfully.
    #[error("command `{command}` failed with {}", exit_description(.code))]
    ExternalCommandFailed {
        /// The command line, for display.
        command: String,
        /// Exit code, or `None` if the process was killed by a signal.
        code: Option<i32>,
    },

    /// An external command could not be started.
    #[error("failed to start `{command}`")]
    Spawn {
        /// The command line, for display.
        command: String,
        /// The underlying spawn error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The source of a copy does not exist.
    #[error("copy source `{}` does not exist", .path.display())]
    SourceMissing {
        /// The missing source path.
        path: PathBuf,
    },

    /// A filesystem operation failed.
    #[error("{op} `{}` failed", .path.display())]
    Io {
        /// The operation, e.g. `copy` or `remove`.
        op: &'static str,
        /// The path the operation was applied to.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// A prerequisite requested through `need` failed.
    #[error("dependency `{dependency}` failed")]
    DependencyFailed {
        /// The prerequisite that failed.
        dependency: String,
        /// Why it failed.
        #[source]
        cause: Arc<BuildError>,
    },

    /// Waiting for a target would wait on itself.
    #[error("dependency cycle: {}", .chain.join(" -> "))]
    DependencyCycle {
        /// The targets forming the cycle, starting and ending with the same one.
        chain: Vec<String>,
    },

    /// Nested `need` calls went deeper than the configured limit.
    #[error("dependency chain deeper than {limit} levels at `{target}`")]
    DependencyTooDeep {
        /// The request that would exceed the limit.
        target: String,
        /// The configured limit.
        limit: usize,
    },

    /// A rule action panicked.
    #[error("action for `{target}` panicked: {message}")]
    ActionPanicked {
        /// The target whose action panicked.
        target: String,
        /// The panic payload, if it was a string.
        message: String,
    },

    /// A rule action reported a failure of its own.
    #[error("{target}: {message}")]
    Action {
        /// The target whose action failed.
        target: String,
        /// The failure message.
        message: String,
    },
}

#[allow(clippy::ref_option)]
fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".into(),
    }
}

impl BuildError {
    /// Wrap an I/O error for the given operation and path.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Follow `DependencyFailed` links down to the failure that started it.
    pub fn root_cause(&self) -> &BuildError {
        let mut err = self;
        while let Self::DependencyFailed { cause, .. } = err {
            err = cause.as_ref();
        }
        err
    }

    /// The dependencies traversed from this error to its root cause, outermost first.
    pub fn chain(&self) -> Vec<&str> {
        let mut deps = Vec::new();
        let mut err = self;
        while let Self::DependencyFailed { dependency, cause } = err {
            deps.push(dependency.as_str());
            err = cause.as_ref();
        }
        deps
    }
}
