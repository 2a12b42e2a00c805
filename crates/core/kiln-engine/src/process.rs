//! External process invocation.
//!
//! Every spawned command holds a job slot for as long as it runs, so at
//! most `jobs` external processes are alive at once no matter how many
//! build paths are active. Interactive commands additionally own the
//! terminal.

use std::io::{self, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use crate::error::{BuildError, Result};
use crate::verbose;

/// Captured output of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Everything the command wrote to stdout.
    pub stdout: String,
    /// Everything the command wrote to stderr.
    pub stderr: String,
}

/// Counting semaphore over running processes.
struct JobSlots {
    free: Mutex<usize>,
    released: Condvar,
}

struct JobSlot<'a> {
    slots: &'a JobSlots,
}

impl JobSlots {
    fn new(limit: usize) -> Self {
        Self {
            free: Mutex::new(limit.max(1)),
            released: Condvar::new(),
        }
    }

    fn acquire(&self) -> JobSlot<'_> {
        let mut free = lock(&self.free);
        while *free == 0 {
            free = self
                .released
                .wait(free)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *free -= 1;
        JobSlot { slots: self }
    }
}

impl Drop for JobSlot<'_> {
    fn drop(&mut self) {
        *lock(&self.slots.free) += 1;
        self.slots.released.notify_one();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs external commands on behalf of rule actions.
#[derive(Clone)]
pub struct ProcessRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    slots: JobSlots,
    terminal: Mutex<()>,
    console: Mutex<()>,
}

impl ProcessRunner {
    /// A runner allowing `jobs` concurrent processes; `0` means the
    /// machine's available parallelism.
    pub fn new(jobs: usize) -> Self {
        let limit = if jobs == 0 {
            thread::available_parallelism().map_or(1, usize::from)
        } else {
            jobs
        };
        Self {
            inner: Arc::new(RunnerInner {
                slots: JobSlots::new(limit),
                terminal: Mutex::new(()),
                console: Mutex::new(()),
            }),
        }
    }

    /// Run `program` in `cwd` with captured output.
    ///
    /// Stdin is closed. Once the command exits its stdout (unless quiet)
    /// and stderr are forwarded to the console as one block. A non-zero
    /// exit fails with [`BuildError::ExternalCommandFailed`].
    pub fn run(&self, program: &str, args: &[String], cwd: &Path) -> Result<CommandOutput> {
        let display = display_command(program, args);
        let output = {
            let _slot = self.inner.slots.acquire();
            verbose::detail("Running", format_args!("{display} (in {})", cwd.display()));
            Command::new(program)
                .args(args)
                .current_dir(cwd)
                .stdin(Stdio::null())
                .output()
                .map_err(|source| BuildError::Spawn {
                    command: display.clone(),
                    source: Arc::new(source),
                })?
        };

        let captured = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        self.forward(&captured);
        check_status(display, output.status)?;
        Ok(captured)
    }

    /// Run `program` in `cwd` attached to the terminal.
    ///
    /// Only one interactive command runs at a time.
    pub fn run_interactive(&self, program: &str, args: &[String], cwd: &Path) -> Result<()> {
        let display = display_command(program, args);
        let _terminal = lock(&self.inner.terminal);
        let _slot = self.inner.slots.acquire();
        verbose::status("Running", &display);

        let status = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|source| BuildError::Spawn {
                command: display.clone(),
                source: Arc::new(source),
            })?;
        check_status(display, status)
    }

    fn forward(&self, output: &CommandOutput) {
        let _console = lock(&self.inner.console);
        if !output.stdout.is_empty() && !verbose::is_quiet() {
            let mut out = io::stdout().lock();
            let _ = out.write_all(output.stdout.as_bytes());
            let _ = out.flush();
        }
        if !output.stderr.is_empty() {
            let mut err = io::stderr().lock();
            let _ = err.write_all(output.stderr.as_bytes());
            let _ = err.flush();
        }
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(0)
    }
}

fn check_status(command: String, status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(BuildError::ExternalCommandFailed {
            command,
            code: status.code(),
        })
    }
}

/// Render a command line for messages, quoting arguments with whitespace.
pub fn display_command(program: &str, args: &[String]) -> String {
    let mut line = quote(program);
    for arg in args {
        line.push(' ');
        line.push_str(&quote(arg));
    }
    line
}

fn quote(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'') {
        format!("{arg:?}")
    } else {
        arg.to_string()
    }
}
