//! `package.json` handling: dependency-change detection, script
//! normalization and dev-server launch command resolution.

use serde_json::{Map, Value};

use crate::errors::ManifestError;

/// Whether the current manifest requires a dependency install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyDecision {
    /// Dependencies changed (or were newly declared); install required.
    Changed,
    /// Dependencies are identical, or there is nothing to install.
    Unchanged,
    /// The manifest is mid-write during streaming; decide later.
    Undecided,
}

impl DependencyDecision {
    pub fn requires_install(self) -> bool {
        matches!(self, Self::Changed)
    }
}

const DEPENDENCY_FIELDS: [&str; 2] = ["dependencies", "devDependencies"];

/// Parse manifest text into its top-level object.
pub fn parse(text: &str) -> Result<Map<String, Value>, ManifestError> {
    match serde_json::from_str::<Value>(text).map_err(|source| ManifestError::Parse { source })? {
        Value::Object(map) => Ok(map),
        _ => Err(ManifestError::NotAnObject),
    }
}

fn declares_dependencies(manifest: &Map<String, Value>) -> bool {
    DEPENDENCY_FIELDS.iter().any(|field| {
        manifest
            .get(*field)
            .and_then(Value::as_object)
            .is_some_and(|deps| !deps.is_empty())
    })
}

/// Compare successive manifest snapshots.
///
/// `previous` is the last mounted manifest, `current` the desired one. A
/// parse failure in `current` is an error unless `streaming`, in which case
/// the manifest may be half-written and the decision is deferred. An
/// unparsable `previous` counts as "no previous manifest".
pub fn dependencies_changed(
    previous: Option<&str>,
    current: Option<&str>,
    streaming: bool,
) -> Result<DependencyDecision, ManifestError> {
    let Some(current) = current else {
        return Ok(DependencyDecision::Unchanged);
    };
    let current = match parse(current) {
        Ok(map) => map,
        Err(_) if streaming => return Ok(DependencyDecision::Undecided),
        Err(e) => return Err(e),
    };

    let previous = previous.and_then(|text| parse(text).ok());
    let Some(previous) = previous else {
        return Ok(if declares_dependencies(&current) {
            DependencyDecision::Changed
        } else {
            DependencyDecision::Unchanged
        });
    };

    let differs = DEPENDENCY_FIELDS
        .iter()
        .any(|field| previous.get(*field) != current.get(*field));
    Ok(if differs {
        DependencyDecision::Changed
    } else {
        DependencyDecision::Unchanged
    })
}

/// Strip script flags the sandbox can't honour (multi-process bundler
/// accelerators). Returns `None` when nothing changed or the manifest does
/// not parse, so the original text is used as-is.
pub fn normalize_scripts(text: &str, stripped_flags: &[String]) -> Option<String> {
    let mut manifest = parse(text).ok()?;
    let scripts = manifest.get_mut("scripts")?.as_object_mut()?;

    let mut changed = false;
    for script in scripts.values_mut() {
        let Some(command) = script.as_str() else {
            continue;
        };
        let kept: Vec<&str> = command
            .split_whitespace()
            .filter(|word| !stripped_flags.iter().any(|flag| flag == word))
            .collect();
        if kept.len() != command.split_whitespace().count() {
            *script = Value::String(kept.join(" "));
            changed = true;
        }
    }

    if !changed {
        return None;
    }
    serde_json::to_string_pretty(&Value::Object(manifest)).ok()
}

/// How to launch the dev server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub command: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl std::fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Pick the dev-server command: the `dev` script, then `start`, then the
/// manifest's `main` entry, then `index.js`. No manifest (or an unparsable
/// one) falls through to `node index.js`.
pub fn launch_command(manifest: Option<&str>, package_manager: &str) -> LaunchCommand {
    let parsed = manifest.and_then(|text| parse(text).ok());
    let Some(manifest) = parsed else {
        return LaunchCommand::new("node", &["index.js"]);
    };

    let scripts = manifest.get("scripts").and_then(Value::as_object);
    for name in ["dev", "start"] {
        if scripts.is_some_and(|s| s.get(name).and_then(Value::as_str).is_some()) {
            return LaunchCommand::new(package_manager, &["run", name]);
        }
    }

    let entry = manifest
        .get("main")
        .and_then(Value::as_str)
        .filter(|m| !m.trim().is_empty())
        .unwrap_or("index.js");
    LaunchCommand::new("node", &[entry])
}
