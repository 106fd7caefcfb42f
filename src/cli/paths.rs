//! CLI subcommand: `defuse paths`
//!
//! Prints all resolved paths for debugging and scripting.

use anyhow::Result;
use std::path::Path;

pub fn run(config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let paths = &config.paths;

    println!("defuse paths");
    println!("============");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config file:    {}", config.file_path().display());
    println!();
    println!("Cache:      {}", paths.cache_dir.display());
    println!("  downloads:      {}", paths.downloads_dir().display());
    println!("  temp dir:       {}", config.temp_dir().display());
    println!();
    println!("Output:     {}", config.output_dir().display());

    Ok(())
}
