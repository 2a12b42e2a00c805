//! Project configuration.
//!
//! Parses `kiln.toml` from the project root and resolves the version
//! string, build script location and parameter document.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use kiln_engine::scheduler::DEFAULT_MAX_DEPTH;
use serde::Deserialize;
use serde_json::Value;

/// Name of the project configuration file.
pub const CONFIG_FILE: &str = "kiln.toml";

/// Top-level configuration loaded from `kiln.toml`.
#[derive(Debug, Deserialize)]
pub struct ProjectConfig {
    pub project: ProjectMeta,
    #[serde(default)]
    pub build: BuildSection,
}

/// `[project]` section.
#[derive(Debug, Deserialize)]
pub struct ProjectMeta {
    pub name: String,
    pub version: Option<String>,
    /// JSON manifest with a `version` field, e.g. `package.json`.
    pub manifest: Option<String>,
}

/// `[build]` section.
#[derive(Debug, Deserialize)]
pub struct BuildSection {
    #[serde(default = "default_script")]
    pub script: String,
    /// JSON document handed to actions as `ctx.params` / `PARAMS`.
    pub params: Option<String>,
    pub jobs: Option<usize>,
    /// Deepest allowed nesting of `need` calls.
    pub max_depth: Option<usize>,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            script: default_script(),
            params: None,
            jobs: None,
            max_depth: None,
        }
    }
}

fn default_script() -> String {
    "kiln.rhai".into()
}

/// Fully resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub root: PathBuf,
    pub name: String,
    pub version: String,
    pub script: PathBuf,
    pub params: Value,
    pub jobs: usize,
    pub max_depth: usize,
}

/// Find the project root by looking for `kiln.toml`.
pub fn find_project_root() -> Result<PathBuf> {
    let mut dir = std::env::current_dir()?;
    loop {
        if dir.join(CONFIG_FILE).exists() {
            return Ok(dir);
        }
        if !dir.pop() {
            bail!("could not find {CONFIG_FILE} in any parent directory");
        }
    }
}

/// Load `kiln.toml` under `root`. `jobs` overrides the file's value.
pub fn load_config(root: &Path, jobs: Option<usize>) -> Result<ResolvedConfig> {
    let toml_path = root.join(CONFIG_FILE);
    let contents = std::fs::read_to_string(&toml_path)
        .with_context(|| format!("failed to read {}", toml_path.display()))?;
    let config: ProjectConfig =
        toml::from_str(&contents).with_context(|| format!("failed to parse {CONFIG_FILE}"))?;
    resolve(root, config, jobs)
}

fn resolve(root: &Path, config: ProjectConfig, jobs: Option<usize>) -> Result<ResolvedConfig> {
    ensure!(!config.project.name.is_empty(), "project name is required");

    let version = match (&config.project.version, &config.project.manifest) {
        (Some(version), _) => version.clone(),
        (None, Some(manifest)) => manifest_version(&root.join(manifest))?,
        (None, None) => bail!("project version is required (set `version` or `manifest`)"),
    };
    semver::Version::parse(&version)
        .with_context(|| format!("project version '{version}' is not valid semver"))?;

    let params = match &config.build.params {
        Some(path) => read_json(&root.join(path))?,
        None => Value::Null,
    };

    Ok(ResolvedConfig {
        root: root.to_path_buf(),
        name: config.project.name,
        version,
        script: root.join(&config.build.script),
        params,
        jobs: jobs.or(config.build.jobs).unwrap_or(0),
        max_depth: config.build.max_depth.unwrap_or(DEFAULT_MAX_DEPTH),
    })
}

/// Read and parse a JSON file.
pub fn read_json(path: &Path) -> Result<Value> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn manifest_version(path: &Path) -> Result<String> {
    let manifest = read_json(path)?;
    match manifest.get("version").and_then(Value::as_str) {
        Some(version) => Ok(version.to_string()),
        None => bail!("{} has no string \"version\" field", path.display()),
    }
}
