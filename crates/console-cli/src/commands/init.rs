use anyhow::Result;
use std::path::Path;

use console_core::config::ConsoleConfig;

/// Write `config` to `path` unless a config is already there.
pub fn run(path: &Path, config: &ConsoleConfig, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("Config already exists at {}", path.display());
        return Ok(());
    }
    config.validate()?;
    config.save(path)?;
    println!("Created config: {}", path.display());

    std::fs::create_dir_all(&config.console.backup_dir)?;
    println!("Backup directory: {}", config.console.backup_dir);
    Ok(())
}
