use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use tracing::debug;

use defuse::formats::FileTypeDetector;
use defuse::sanitizer::{self, DocumentSanitizer};

#[derive(Args)]
pub struct SanitizeArgs {
    /// Local document to sanitize
    pub file: PathBuf,

    /// Output directory for the sanitized document
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// File name for the sanitized PDF
    #[arg(short = 'f', long)]
    pub output_filename: Option<String>,
}

pub async fn run(args: SanitizeArgs, config_path: Option<&Path>) -> Result<()> {
    if !args.file.is_file() {
        anyhow::bail!("File not found: {}", args.file.display());
    }

    let mut config = super::load_config(config_path)?;
    if let Some(dir) = &args.output_dir {
        config.sanitizer.output_dir = dir.display().to_string();
    }

    let (format, confidence) = FileTypeDetector::new()
        .detect_file(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let Some(format) = format else {
        anyhow::bail!(
            "{} is not a supported document format (supported: {})",
            args.file.display(),
            FileTypeDetector::new().supported_extensions().join(", ")
        );
    };
    debug!(
        "Detected {} ({:.0}% confidence)",
        format.description(),
        confidence * 100.0
    );

    let Some(cli) = sanitizer::resolve_cli(&config.sanitizer) else {
        eprintln!("Dangerzone CLI not found. Run: defuse check-deps");
        anyhow::bail!("dangerzone-cli is required");
    };
    let sanitizer = DocumentSanitizer::from_config(&config, cli)?;

    println!("Sanitizing: {}", args.file.display());
    let output = sanitizer
        .sanitize(&args.file, args.output_filename.as_deref())
        .await
        .context("Sanitization failed")?;
    sanitizer.cleanup_temp_files();

    println!("Sanitized document saved to: {}", output.display());
    Ok(())
}
