//! Configuration view: `edocebiv config`.

use anyhow::Result;
use edocebiv::config::Config;

pub fn cmd_config(path: &std::path::Path, config: &Config) -> Result<()> {
    if path.exists() {
        println!("# Config file: {}", path.display());
    } else {
        println!("# No config file at {}; using defaults", path.display());
    }
    println!("# Effective values (with env overrides):");
    println!();
    print!("{}", config.to_toml()?);
    Ok(())
}
