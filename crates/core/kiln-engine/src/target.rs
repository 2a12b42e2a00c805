//! Target identities.
//!
//! A target is identified by a normalized, `/`-separated string relative to
//! the project root. Structural parts (`dir`, `name`, `ext`) are derived
//! from that string; captures are attached when the target was resolved
//! against a wildcarded rule.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{BuildError, Result};

/// What kind of thing a target names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    /// A file produced under the project root.
    File,
    /// A named task without a filesystem artifact.
    Virtual,
    /// A directory that only has to exist (requested as `"dir/"`).
    Directory,
}

impl TargetKind {
    /// Lowercase name for display.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Virtual => "virtual",
            Self::Directory => "directory",
        }
    }
}

/// A resolved target: identity, kind, and wildcard captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    id: String,
    kind: TargetKind,
    captures: Vec<String>,
    names: Option<Arc<[String]>>,
}

/// Normalize a target string.
///
/// Empty and `.` segments are dropped, `..` removes the preceding segment
/// when there is one, and a leading `/` is preserved. Fails with
/// [`BuildError::InvalidTarget`] if nothing is left.
pub fn normalize(raw: &str) -> Result<String> {
    let absolute = raw.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            s => parts.push(s),
        }
    }

    let body = parts.join("/");
    match (absolute, body.is_empty()) {
        (true, true) => Ok("/".into()),
        (true, false) => Ok(format!("/{body}")),
        (false, true) => Err(BuildError::InvalidTarget(raw.into())),
        (false, false) => Ok(body),
    }
}

/// Returns `true` if `raw` requests a directory rather than a rule target.
pub fn is_dir_request(raw: &str) -> bool {
    raw.len() > 1 && raw.ends_with('/')
}

/// Normalize a directory request; the project root itself becomes `.`.
pub fn normalize_dir(raw: &str) -> Result<String> {
    match normalize(raw) {
        Err(BuildError::InvalidTarget(_)) if !raw.is_empty() => Ok(".".into()),
        other => other,
    }
}

impl Target {
    pub(crate) fn new(
        id: String,
        kind: TargetKind,
        captures: Vec<String>,
        names: Option<Arc<[String]>>,
    ) -> Self {
        Self {
            id,
            kind,
            captures,
            names,
        }
    }

    /// A file target without captures.
    pub fn file(raw: &str) -> Result<Self> {
        Ok(Self::new(normalize(raw)?, TargetKind::File, Vec::new(), None))
    }

    /// A virtual target without captures.
    pub fn virtual_target(raw: &str) -> Result<Self> {
        Ok(Self::new(normalize(raw)?, TargetKind::Virtual, Vec::new(), None))
    }

    /// A directory target.
    pub fn directory(raw: &str) -> Result<Self> {
        Ok(Self::new(normalize_dir(raw)?, TargetKind::Directory, Vec::new(), None))
    }

    /// The normalized identity string.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// What kind of target this is.
    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    /// Returns `true` for virtual targets.
    pub fn is_virtual(&self) -> bool {
        self.kind == TargetKind::Virtual
    }

    /// Everything before the final `/`, or `.` for a top-level target.
    pub fn dir(&self) -> &str {
        match self.id.rfind('/') {
            Some(0) => "/",
            Some(i) => &self.id[..i],
            None => ".",
        }
    }

    /// The final segment.
    pub fn basename(&self) -> &str {
        match self.id.rfind('/') {
            Some(i) => &self.id[i + 1..],
            None => &self.id,
        }
    }

    /// The final segment without its last extension.
    pub fn name(&self) -> &str {
        let base = self.basename();
        match base.rfind('.') {
            Some(i) if i > 0 => &base[..i],
            _ => base,
        }
    }

    /// The last extension of the final segment, without the dot.
    pub fn ext(&self) -> Option<&str> {
        let base = self.basename();
        match base.rfind('.') {
            Some(i) if i > 0 => Some(&base[i + 1..]),
            _ => None,
        }
    }

    /// The `need` argument that ensures this target's directory exists.
    pub fn dir_request(&self) -> String {
        format!("{}/", self.dir())
    }

    /// The target's location under `root`.
    pub fn path(&self, root: &Path) -> PathBuf {
        root.join(&self.id)
    }

    /// Captured wildcard text, 1-based like `$1`, `$2`, ...
    pub fn capture(&self, n: usize) -> Option<&str> {
        n.checked_sub(1)
            .and_then(|i| self.captures.get(i))
            .map(String::as_str)
    }

    /// All captures in pattern order.
    pub fn captures(&self) -> &[String] {
        &self.captures
    }

    /// Capture bound to `name` by the rule's capture schema.
    pub fn named(&self, name: &str) -> Option<&str> {
        let names = self.names.as_deref()?;
        let idx = names.iter().position(|n| n == name)?;
        self.captures.get(idx).map(String::as_str)
    }

    /// The rule's capture names, if it declared a schema.
    pub fn capture_names(&self) -> Option<&[String]> {
        self.names.as_deref()
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

impl AsRef<str> for Target {
    fn as_ref(&self) -> &str {
        &self.id
    }
}
