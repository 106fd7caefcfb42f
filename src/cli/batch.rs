use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};

use super::download::Pipeline;

#[derive(Args)]
pub struct BatchArgs {
    /// File with one URL per line (`#` starts a comment)
    pub urls_file: PathBuf,

    /// Output directory for the sanitized documents
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Keep the downloaded originals
    #[arg(long)]
    pub keep_originals: bool,
}

pub async fn run(args: BatchArgs, config_path: Option<&Path>) -> Result<()> {
    let content = std::fs::read_to_string(&args.urls_file)
        .with_context(|| format!("Failed to read {}", args.urls_file.display()))?;
    let urls = parse_url_list(&content);
    if urls.is_empty() {
        anyhow::bail!("No URLs found in {}", args.urls_file.display());
    }

    let mut config = super::load_config(config_path)?;
    if let Some(dir) = &args.output_dir {
        config.sanitizer.output_dir = dir.display().to_string();
    }
    let pipeline = Pipeline::prepare(&config, None, None, args.keep_originals).await?;

    let total = urls.len();
    let mut succeeded = 0;
    for (i, url) in urls.iter().enumerate() {
        println!("[{}/{}] {}", i + 1, total, url);
        match pipeline.process(url, None).await {
            Ok(output) => {
                println!("  saved to {}", output.display());
                succeeded += 1;
            }
            Err(e) => eprintln!("  failed: {:#}", e),
        }
    }

    println!();
    println!("Successfully processed {}/{} documents", succeeded, total);

    if succeeded == 0 {
        anyhow::bail!("No documents could be processed");
    }
    Ok(())
}

/// Non-empty, non-comment lines, trimmed.
fn parse_url_list(content: &str) -> Vec<&str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url_list() {
        let content = concat!(
            "# reports\n",
            "https://a.example/x.pdf\n",
            "\n",
            "   https://b.example/y.docx  \n",
            "  # indented comment\n",
        );
        assert_eq!(
            parse_url_list(content),
            vec!["https://a.example/x.pdf", "https://b.example/y.docx"]
        );
        assert!(parse_url_list("# nothing\n\n").is_empty());
    }
}
