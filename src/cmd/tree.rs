//! Mount tree preview - `devenv tree`.

use anyhow::{Context, Result};
use std::path::Path;

use devenv::DevenvConfig;
use devenv::files::IgnoreFilter;
use devenv::sandbox::build_tree;
use devenv::store::{DirStore, FileStore};

pub async fn cmd_tree(project_dir: &Path) -> Result<()> {
    let config = DevenvConfig::load(project_dir)?;
    let store = DirStore::new(project_dir, IgnoreFilter::new(&config.sync.ignore));
    let files = store.current_files().await?;
    let tree = build_tree(&files);
    let json = serde_json::to_string_pretty(&tree).context("Failed to render mount tree")?;
    println!("{}", json);
    Ok(())
}
