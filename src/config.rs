//! Declarative window model and its YAML loader.
//!
//! ```yaml
//! session: robot
//! init_cmd: source @TMULE_CONFIG_DIR@/env.sh
//! windows:
//!   - name: core
//!     panes: [roscore]
//!     check: rostopic list
//!     tags: [base]
//!   - !include more-windows.yaml
//! ```

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::error::ConfigError;

pub const DEFAULT_SESSION: &str = "tmule";
pub const DEFAULT_CONFIG_FILE: &str = "tmule.yaml";

fn default_session() -> String {
    DEFAULT_SESSION.to_string()
}

/// The full set of windows managed in one tmux session
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_session")]
    pub session: String,
    /// Sent to every pane (and prefixed to every check) before its command
    #[serde(default)]
    pub init_cmd: Option<String>,
    #[serde(default)]
    pub windows: Vec<Window>,
    /// Values substituted for `@NAME@` while loading
    #[serde(skip)]
    pub vars: BTreeMap<String, String>,
}

/// A named group of panes launched and supervised together
#[derive(Debug, Deserialize)]
pub struct Window {
    pub name: String,
    /// One shell command per pane, in pane index order
    #[serde(default)]
    pub panes: Vec<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub skip: bool,
    /// Seconds to sleep after launching, overriding the global default
    #[serde(default)]
    pub wait: Option<f64>,
    /// Readiness check; a zero exit status means the window is up
    #[serde(default)]
    pub check: Option<String>,
    #[serde(skip)]
    running: AtomicBool,
}

impl Window {
    /// Whether this window takes part in a batch filtered by `tags`.
    ///
    /// Skipped windows never do. With a non-empty filter, a window must share
    /// at least one tag with it, so untagged windows are left out.
    pub fn selected(&self, tags: &BTreeSet<String>) -> bool {
        !self.skip && (tags.is_empty() || !self.tags.is_disjoint(tags))
    }

    /// Bookkeeping flag: true only while the orchestrator considers it launched
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Configured post-launch wait; zero or negative values mean no wait
    pub fn wait(&self) -> Option<Duration> {
        self.wait.map(|w| {
            if w.is_finite() && w > 0.0 {
                Duration::from_secs_f64(w)
            } else {
                Duration::ZERO
            }
        })
    }
}

impl Config {
    pub fn window(&self, name: &str) -> Option<&Window> {
        self.windows.iter().find(|w| w.name == name)
    }

    /// Union of all tags used by any window
    pub fn known_tags(&self) -> BTreeSet<String> {
        self.windows
            .iter()
            .flat_map(|w| w.tags.iter().cloned())
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for window in &self.windows {
            if !seen.insert(window.name.as_str()) {
                return Err(ConfigError::DuplicateWindow(window.name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
impl Config {
    pub fn new(session: &str, windows: Vec<Window>) -> Self {
        Self {
            session: session.to_string(),
            init_cmd: None,
            windows,
            vars: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
impl Window {
    pub fn new(name: &str, panes: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            panes: panes.iter().map(|p| p.to_string()).collect(),
            tags: BTreeSet::new(),
            skip: false,
            wait: None,
            check: None,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }
}

/// Pick the configuration file: the explicit path, else `tmule.yaml` in the
/// working directory, else `<config dir>/tmule/tmule.yaml`.
pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }

    let mut candidates = vec![PathBuf::from(DEFAULT_CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("tmule").join(DEFAULT_CONFIG_FILE));
    }

    candidates
        .iter()
        .find(|p| p.is_file())
        .cloned()
        .ok_or_else(|| {
            let tried: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
            ConfigError::NotFound(tried.join(", "))
        })
}

/// Load a configuration file, resolving `!include` tags and `@VAR@` substitutions.
///
/// The session name comes from `session_override`, else the file, else `tmule`.
pub fn load(path: &Path, session_override: Option<&str>) -> Result<Config, ConfigError> {
    let path = std::fs::canonicalize(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut value = read_yaml(&path)?;

    let session = session_override
        .map(str::to_string)
        .or_else(|| value.get("session").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(default_session);

    let dir = path.parent().unwrap_or(Path::new("/"));
    let vars = BTreeMap::from([
        ("TMULE_CONFIG_FILE".to_string(), path.display().to_string()),
        ("TMULE_CONFIG_DIR".to_string(), dir.display().to_string()),
        ("TMULE_SESSION_NAME".to_string(), session.clone()),
    ]);
    substitute(&mut value, &vars);

    let mut config: Config = serde_yaml::from_value(value).map_err(|source| ConfigError::Yaml {
        path: path.clone(),
        source,
    })?;
    config.session = session;
    config.vars = vars;
    config.validate()?;

    debug!(
        path = %path.display(),
        session = %config.session,
        windows = config.windows.len(),
        "loaded config"
    );
    Ok(config)
}

fn read_yaml(path: &Path) -> Result<Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    let dir = path.parent().unwrap_or(Path::new("."));
    resolve_includes(value, dir)
}

/// The space-separated file list of an `!include` node, if `value` is one
fn include_target(value: &Value) -> Option<&str> {
    match value {
        Value::Tagged(tagged) if tagged.tag == "include" => tagged.value.as_str(),
        _ => None,
    }
}

/// Load every file named by an include tag and concatenate their sequences
fn load_include(targets: &str, dir: &Path) -> Result<Vec<Value>, ConfigError> {
    let mut items = Vec::new();
    for file in targets.split_whitespace() {
        let path = if file.starts_with('$') {
            PathBuf::from(expand_env(file))
        } else {
            dir.join(file)
        };
        debug!(path = %path.display(), "including");
        match read_yaml(&path)? {
            Value::Sequence(included) => items.extend(included),
            _ => return Err(ConfigError::IncludeNotSequence { path }),
        }
    }
    Ok(items)
}

fn resolve_includes(value: Value, dir: &Path) -> Result<Value, ConfigError> {
    if let Some(targets) = include_target(&value) {
        return Ok(Value::Sequence(load_include(targets, dir)?));
    }

    match value {
        Value::Sequence(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                // an include used as a list element splices its items in place
                match include_target(&item) {
                    Some(targets) => resolved.extend(load_include(targets, dir)?),
                    None => resolved.push(resolve_includes(item, dir)?),
                }
            }
            Ok(Value::Sequence(resolved))
        }
        Value::Mapping(map) => {
            let mut resolved = Mapping::with_capacity(map.len());
            for (k, v) in map {
                resolved.insert(k, resolve_includes(v, dir)?);
            }
            Ok(Value::Mapping(resolved))
        }
        Value::Tagged(mut tagged) => {
            tagged.value = resolve_includes(tagged.value, dir)?;
            Ok(Value::Tagged(tagged))
        }
        other => Ok(other),
    }
}

/// Replace `$NAME` and `${NAME}` with environment values; unknown names stay as written
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match std::env::var(name) {
            Ok(value) if !name.is_empty() => out.push_str(&value),
            _ => out.push_str(&rest[pos..pos + 1 + consumed]),
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

fn substitute(value: &mut Value, vars: &BTreeMap<String, String>) {
    match value {
        Value::String(s) => {
            for (name, replacement) in vars {
                let pattern = format!("@{name}@");
                if s.contains(&pattern) {
                    *s = s.replace(&pattern, replacement);
                }
            }
        }
        Value::Sequence(items) => items.iter_mut().for_each(|v| substitute(v, vars)),
        Value::Mapping(map) => map.values_mut().for_each(|v| substitute(v, vars)),
        Value::Tagged(tagged) => substitute(&mut tagged.value, vars),
        _ => {}
    }
}
