use anyhow::Result;
use std::path::Path;

use defuse::sandbox::{Capabilities, SystemProbe};
use defuse::sanitizer::{self, DocumentSanitizer};

pub async fn run(config_path: Option<&Path>) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    let mut all_good = true;

    println!("Checking dependencies...");
    println!();

    match sanitizer::find_dangerzone_cli() {
        Some(cli) => {
            println!("Dangerzone CLI: {}", cli.display());
            let sanitizer = DocumentSanitizer::from_config(&config, cli.clone())?;
            if let Some(version) = sanitizer.version().await {
                println!("  Version: {}", version);
            }

            let found = cli.display().to_string();
            if config.sanitizer.dangerzone_path.as_deref() != Some(found.as_str()) {
                config.sanitizer.dangerzone_path = Some(found);
                config.save()?;
                println!("  Saved to {}", config.file_path().display());
            }
        }
        None => {
            println!("Dangerzone CLI: not found");
            println!();
            println!("To install Dangerzone:");
            for hint in super::dangerzone_install_hints() {
                println!("{}", hint);
            }
            all_good = false;
        }
    }

    println!();
    println!("Sandbox backends:");
    match Capabilities::detect(&SystemProbe).await {
        Ok(caps) => {
            for line in caps.status_lines() {
                println!("{}", line);
            }
        }
        Err(e) => {
            println!("  No sandbox backend installed ({})", e);
            println!();
            println!("Install one of:");
            for hint in super::sandbox_install_hints() {
                println!("{}", hint);
            }
            all_good = false;
        }
    }

    println!();
    if all_good {
        println!("All dependencies are ready.");
    } else {
        println!("Some dependencies are missing. Install them to use defuse.");
    }

    Ok(())
}
