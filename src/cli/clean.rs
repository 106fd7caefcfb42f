use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};

/// Leftovers of interrupted runs: downloads, smoke-test files and helper
/// staging directories.
const LEFTOVER_PATTERNS: &[&str] = &["defuse-*.tmp", ".defuse-stage-*"];

#[derive(Args)]
pub struct CleanArgs {
    /// Only list what would be removed
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn run(args: CleanArgs, config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let temp_dir = config.temp_dir();

    let leftovers = find_leftovers(&temp_dir)?;
    if leftovers.is_empty() {
        println!("Nothing to clean in {}", temp_dir.display());
        return Ok(());
    }

    let mut removed = 0;
    for path in &leftovers {
        if args.dry_run {
            println!("would remove {}", path.display());
            continue;
        }
        let result = if path.is_dir() {
            std::fs::remove_dir_all(path)
        } else {
            std::fs::remove_file(path)
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to remove {}: {}", path.display(), e),
        }
    }

    if !args.dry_run {
        println!("Removed {} item(s) from {}", removed, temp_dir.display());
    }
    Ok(())
}

fn find_leftovers(dir: &Path) -> Result<Vec<PathBuf>> {
    let base = glob::Pattern::escape(&dir.to_string_lossy());
    let mut found = Vec::new();
    for pattern in LEFTOVER_PATTERNS {
        let full = format!("{}/{}", base, pattern);
        let entries =
            glob::glob(&full).with_context(|| format!("Bad cleanup pattern {}", full))?;
        found.extend(entries.flatten());
    }
    found.sort();
    Ok(found)
}
