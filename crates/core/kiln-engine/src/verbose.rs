//! Console status lines.
//!
//! Progress is reported as a right-aligned verb followed by its subject:
//!
//! ```text
//!     Building out/a.bin
//!      Running otfccbuild build/a.otd -o out/a.bin
//!     Finished 3 target(s), 3 action(s) run in 1.20s
//! ```
//!
//! [`status`] lines appear unless `-q` was given; [`detail`] lines (rule
//! resolution, reused records, working directories, per-target timings)
//! only with `-v`. Failures are reported by the driver on stderr and are
//! never suppressed.

use std::fmt::Display;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;

/// Width of the verb column.
pub const VERB_WIDTH: usize = 12;

/// How much progress a build prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// `-q`: no status lines, captured command stdout is dropped.
    Quiet = 0,
    /// Status lines and command output.
    Normal = 1,
    /// Status and detail lines.
    Verbose = 2,
}

impl Verbosity {
    /// The level selected by the `-q`/`-v` flags; `quiet` wins.
    pub fn from_flags(quiet: bool, verbose: bool) -> Self {
        match (quiet, verbose) {
            (true, _) => Self::Quiet,
            (false, true) => Self::Verbose,
            (false, false) => Self::Normal,
        }
    }
}

static LEVEL: AtomicU8 = AtomicU8::new(Verbosity::Normal as u8);

/// Set the level from command-line flags.
pub fn init(quiet: bool, verbose: bool) {
    set(Verbosity::from_flags(quiet, verbose));
}

/// Set the level for the rest of the process.
pub fn set(level: Verbosity) {
    LEVEL.store(level as u8, Ordering::Relaxed);
}

/// The current level.
pub fn verbosity() -> Verbosity {
    match LEVEL.load(Ordering::Relaxed) {
        0 => Verbosity::Quiet,
        2 => Verbosity::Verbose,
        _ => Verbosity::Normal,
    }
}

/// Whether detail lines are printed.
pub fn is_verbose() -> bool {
    verbosity() == Verbosity::Verbose
}

/// Whether status lines and command stdout are suppressed.
pub fn is_quiet() -> bool {
    verbosity() == Verbosity::Quiet
}

/// Format one status line.
pub fn status_line(verb: &str, subject: impl Display) -> String {
    format!("{verb:>VERB_WIDTH$} {subject}")
}

/// Print a status line unless quiet.
pub fn status(verb: &str, subject: impl Display) {
    if !is_quiet() {
        println!("{}", status_line(verb, subject));
    }
}

/// Print a status line in verbose mode only.
pub fn detail(verb: &str, subject: impl Display) {
    if is_verbose() {
        println!("{}", status_line(verb, subject));
    }
}

/// Reports how long it lived as a `Timing` detail line.
///
/// ```ignore
/// let _t = Timer::start(target.id());
/// ```
pub struct Timer {
    label: String,
    start: Instant,
}

impl Timer {
    /// Start timing `label`.
    pub fn start(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            start: Instant::now(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        detail(
            "Timing",
            format_args!("{} in {:.1?}", self.label, self.start.elapsed()),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_flag_wins() {
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Normal);
    }

    #[test]
    fn verbs_are_right_aligned() {
        assert_eq!(status_line("Building", "out/a.bin"), "    Building out/a.bin");
        assert_eq!(status_line("Running", "sh"), "     Running sh");
        assert_eq!(status_line("Decompressing", "x"), "Decompressing x");
    }
}
