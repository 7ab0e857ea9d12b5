//! Configuration view - `devenv config`.

use anyhow::{Context, Result};
use std::path::Path;

use devenv::DevenvConfig;

pub fn cmd_config(project_dir: &Path) -> Result<()> {
    let config = DevenvConfig::load(project_dir)?;
    let config_path = DevenvConfig::path_for(project_dir);

    println!();
    println!("Devenv Configuration");
    println!("====================");
    println!();
    if config_path.exists() {
        println!("Config file: {}", config_path.display());
    } else {
        println!("Config file: none (using defaults)");
    }
    println!();

    let rendered = toml::to_string_pretty(&config).context("Failed to render configuration")?;
    println!("{}", rendered);
    Ok(())
}
