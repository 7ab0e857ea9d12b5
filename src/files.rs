//! Project paths and the flat `path -> content` file map.

use glob::Pattern;
use std::collections::BTreeMap;

/// Flat mapping of project-relative path to file content.
///
/// Ordered so that directory creation and tree building visit parents before
/// children and diff output is deterministic.
pub type FileMap = BTreeMap<String, String>;

/// Name of the project manifest.
pub const MANIFEST: &str = "package.json";

/// Normalize a sandbox or store path into the project-relative form used as a
/// [`FileMap`] key: forward slashes, no leading `/` or `./`, no empty or `.`
/// segments.
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Parent directory of a normalized path, if it has one.
pub fn parent_dir(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

/// Join a directory and a child name into a normalized path.
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Segment-wise ignore list for build artifacts, dependency directories and
/// hidden tool state.
#[derive(Debug, Clone)]
pub struct IgnoreFilter {
    patterns: Vec<Pattern>,
}

impl IgnoreFilter {
    /// Build a filter from glob patterns. Invalid patterns are matched literally.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = patterns
            .into_iter()
            .map(|p| {
                let p = p.as_ref();
                Pattern::new(p).unwrap_or_else(|_| {
                    tracing::warn!(pattern = p, "invalid ignore pattern, matching literally");
                    Pattern::new(&Pattern::escape(p)).unwrap_or_default()
                })
            })
            .collect();
        Self { patterns }
    }

    /// Whether any segment of `path` matches an ignore pattern.
    pub fn is_ignored(&self, path: &str) -> bool {
        path.split('/')
            .any(|segment| self.patterns.iter().any(|p| p.matches(segment)))
    }
}
