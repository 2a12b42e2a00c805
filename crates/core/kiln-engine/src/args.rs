//! Structured command arguments.
//!
//! Rule actions build command lines out of plain values, nested lists and
//! option maps. [`flatten`] turns them into the argv handed to the process
//! runner.

use std::path::Path;

use crate::scheduler::Outcome;
use crate::target::Target;

/// The value of one option entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    /// `true` emits the bare flag, `false` emits nothing.
    Flag(bool),
    /// Emits the flag followed by the value.
    Value(String),
}

/// An ordered option map, flattened to `-k`/`--key` arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(Vec<(String, OptionValue)>);

impl Options {
    /// An empty option map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a boolean flag.
    #[must_use]
    pub fn flag(mut self, key: impl Into<String>, on: bool) -> Self {
        self.insert(key, OptionValue::Flag(on));
        self
    }

    /// Add a flag with a value.
    #[must_use]
    pub fn value(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, OptionValue::Value(value.to_string()));
        self
    }

    /// Add an entry, replacing an earlier one with the same key in place.
    pub fn insert(&mut self, key: impl Into<String>, value: OptionValue) {
        let key = key.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some((_, slot)) => *slot = value,
            None => self.0.push((key, value)),
        }
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn push_args(&self, out: &mut Vec<String>) {
        for (key, value) in &self.0 {
            if *value == OptionValue::Flag(false) {
                continue;
            }
            let dashes = if key.chars().count() == 1 { "-" } else { "--" };
            out.push(format!("{dashes}{key}"));
            if let OptionValue::Value(v) = value {
                out.push(v.clone());
            }
        }
    }
}

/// One argument of a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandArg {
    /// A single argument.
    Value(String),
    /// Arguments spliced in order; may nest.
    List(Vec<CommandArg>),
    /// Options flattened to flags.
    Options(Options),
}

/// Flatten structured arguments into an argv.
pub fn flatten(args: &[CommandArg]) -> Vec<String> {
    let mut out = Vec::new();
    for arg in args {
        push_arg(arg, &mut out);
    }
    out
}

fn push_arg(arg: &CommandArg, out: &mut Vec<String>) {
    match arg {
        CommandArg::Value(v) => out.push(v.clone()),
        CommandArg::List(items) => items.iter().for_each(|a| push_arg(a, out)),
        CommandArg::Options(opts) => opts.push_args(out),
    }
}

impl From<&str> for CommandArg {
    fn from(value: &str) -> Self {
        Self::Value(value.into())
    }
}

impl From<String> for CommandArg {
    fn from(value: String) -> Self {
        Self::Value(value)
    }
}

impl From<&String> for CommandArg {
    fn from(value: &String) -> Self {
        Self::Value(value.clone())
    }
}

impl From<&Path> for CommandArg {
    fn from(value: &Path) -> Self {
        Self::Value(value.display().to_string())
    }
}

impl From<&Target> for CommandArg {
    fn from(value: &Target) -> Self {
        Self::Value(value.id().into())
    }
}

impl From<Outcome> for CommandArg {
    fn from(value: Outcome) -> Self {
        Self::Value(value.to_string())
    }
}

impl From<Options> for CommandArg {
    fn from(value: Options) -> Self {
        Self::Options(value)
    }
}

impl<T: Into<CommandArg>> From<Vec<T>> for CommandArg {
    fn from(value: Vec<T>) -> Self {
        Self::List(value.into_iter().map(Into::into).collect())
    }
}
