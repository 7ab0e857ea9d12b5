//! Flat file map to nested mount tree.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::files::FileMap;

/// Directory listing in mount format, keyed by entry name.
pub type FileTree = BTreeMap<String, FileNode>;

/// A mount-tree node. Serializes as `{"file": {"contents": ...}}` or
/// `{"directory": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileNode {
    File { contents: String },
    Directory(FileTree),
}

/// Build the nested tree for `files`.
///
/// Paths are split on `/`; every segment but the last becomes a directory.
/// Colliding paths are not validated: a later path overwrites an earlier node
/// of the other kind.
pub fn build_tree(files: &FileMap) -> FileTree {
    let mut root = FileTree::new();
    for (path, contents) in files {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((leaf, dirs)) = segments.split_last() else {
            continue;
        };

        let mut level = &mut root;
        for dir in dirs {
            let node = level
                .entry((*dir).to_string())
                .or_insert_with(|| FileNode::Directory(FileTree::new()));
            if !matches!(node, FileNode::Directory(_)) {
                *node = FileNode::Directory(FileTree::new());
            }
            level = match node {
                FileNode::Directory(children) => children,
                FileNode::File { .. } => unreachable!("node was just made a directory"),
            };
        }

        level.insert(
            (*leaf).to_string(),
            FileNode::File {
                contents: contents.clone(),
            },
        );
    }
    root
}

/// Flatten a tree back into `path -> content`, mostly for inspection.
pub fn flatten_tree(tree: &FileTree) -> FileMap {
    fn walk(prefix: &str, tree: &FileTree, out: &mut FileMap) {
        for (name, node) in tree {
            let path = crate::files::join(prefix, name);
            match node {
                FileNode::File { contents } => {
                    out.insert(path, contents.clone());
                }
                FileNode::Directory(children) => walk(&path, children, out),
            }
        }
    }
    let mut out = FileMap::new();
    walk("", tree, &mut out);
    out
}
