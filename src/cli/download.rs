use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};
use tracing::debug;

use defuse::config::Config;
use defuse::formats::{self, FileTypeDetector};
use defuse::sandbox::{IsolationLevel, SandboxBackend, SandboxError, SandboxedDownloader};
use defuse::sanitizer::{self, DocumentSanitizer};

#[derive(Args)]
pub struct DownloadArgs {
    /// URL of the document to fetch
    pub url: String,

    /// Output directory for the sanitized document
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// File name for the sanitized PDF
    #[arg(short = 'f', long)]
    pub output_filename: Option<String>,

    /// Keep the downloaded original instead of deleting it
    #[arg(long)]
    pub keep_original: bool,

    /// Isolation level: none, basic, strict, paranoid
    #[arg(long)]
    pub isolation: Option<IsolationLevel>,

    /// Sandbox backend: auto, firejail, bubblewrap, podman, docker
    #[arg(long)]
    pub sandbox_backend: Option<SandboxBackend>,
}

pub async fn run(args: DownloadArgs, config_path: Option<&Path>) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    if let Some(dir) = &args.output_dir {
        config.sanitizer.output_dir = dir.display().to_string();
    }

    let pipeline = Pipeline::prepare(
        &config,
        args.sandbox_backend,
        args.isolation,
        args.keep_original,
    )
    .await?;

    println!("Downloading document from: {}", args.url);
    println!("  Sandbox: {}", pipeline.downloader.backend());

    let output = pipeline
        .process(&args.url, args.output_filename.as_deref())
        .await?;
    println!("Sanitized document saved to: {}", output.display());

    Ok(())
}

/// Sandboxed download, format check and sanitization for one URL at a time.
pub struct Pipeline {
    downloader: SandboxedDownloader,
    sanitizer: DocumentSanitizer,
    detector: FileTypeDetector,
    keep_original: bool,
}

impl Pipeline {
    /// Locate dangerzone-cli and the sandbox tools. Prints install hints
    /// when either is missing.
    pub async fn prepare(
        config: &Config,
        backend: Option<SandboxBackend>,
        isolation: Option<IsolationLevel>,
        keep_original: bool,
    ) -> Result<Self> {
        let Some(cli) = sanitizer::resolve_cli(&config.sanitizer) else {
            eprintln!("Dangerzone CLI not found.");
            eprintln!();
            eprintln!("To install Dangerzone:");
            for hint in super::dangerzone_install_hints() {
                eprintln!("{}", hint);
            }
            eprintln!();
            eprintln!("Then run: defuse check-deps");
            anyhow::bail!("dangerzone-cli is required");
        };
        let sanitizer = DocumentSanitizer::from_config(config, cli)?;

        let mut downloader = match SandboxedDownloader::new(config).await {
            Ok(d) => d,
            Err(e @ SandboxError::NoBackendAvailable { .. }) => {
                eprintln!("No sandbox backend installed ({}).", e);
                eprintln!();
                eprintln!("Install one of:");
                for hint in super::sandbox_install_hints() {
                    eprintln!("{}", hint);
                }
                anyhow::bail!("no sandbox backend installed");
            }
            Err(e) => return Err(e).context("Invalid sandbox configuration"),
        };
        if let Some(backend) = backend {
            downloader = downloader.with_backend(backend);
        }
        if let Some(level) = isolation {
            downloader = downloader.with_isolation_level(level);
        }

        Ok(Self {
            downloader,
            sanitizer,
            detector: FileTypeDetector::new(),
            keep_original,
        })
    }

    /// Fetch `url` in the sandbox and sanitize it. Returns the PDF path.
    pub async fn process(&self, url: &str, output_filename: Option<&str>) -> Result<PathBuf> {
        let downloaded = self
            .downloader
            .sandboxed_download(url, None)
            .await
            .ok_or_else(|| anyhow::anyhow!("download failed for this URL: {}", url))?;
        debug!("Downloaded to {}", downloaded.display());

        let result = self.sanitize_download(&downloaded, url, output_filename).await;

        if self.keep_original {
            println!("  Original kept at: {}", downloaded.display());
        } else if let Err(e) = std::fs::remove_file(&downloaded) {
            debug!("Failed to remove {}: {}", downloaded.display(), e);
        }
        self.sanitizer.cleanup_temp_files();

        result
    }

    async fn sanitize_download(
        &self,
        downloaded: &Path,
        url: &str,
        output_filename: Option<&str>,
    ) -> Result<PathBuf> {
        let header = formats::read_header(downloaded)
            .with_context(|| format!("Failed to read {}", downloaded.display()))?;
        let (format, confidence) = self.detector.detect_format(Some(&header), None, None);
        let Some(format) = format else {
            anyhow::bail!("Downloaded content is not a supported document format");
        };
        debug!(
            "Detected {} ({:.0}% confidence)",
            format.description(),
            confidence * 100.0
        );

        let name = output_filename
            .map(str::to_string)
            .unwrap_or_else(|| default_output_name(url));

        println!("Sanitizing {} with Dangerzone...", format.description());
        let output = self
            .sanitizer
            .sanitize(downloaded, Some(&name))
            .await
            .context("Sanitization failed")?;
        Ok(output)
    }
}

/// `<stem>_defused.pdf` from the last URL path segment.
pub fn default_output_name(url: &str) -> String {
    let stem = reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .map(|segment| {
            let stem = Path::new(&segment)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            stem.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                        c
                    } else {
                        '_'
                    }
                })
                .collect::<String>()
        })
        .filter(|s| !s.is_empty() && !s.starts_with('.'))
        .unwrap_or_else(|| "document".to_string());

    format!("{}_defused.pdf", stem)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_name() {
        assert_eq!(
            default_output_name("https://example.com/files/report.docx"),
            "report_defused.pdf"
        );
        assert_eq!(
            default_output_name("https://example.com/a/b/Q3%20results.pdf?dl=1"),
            "Q3_20results_defused.pdf"
        );
        assert_eq!(default_output_name("https://example.com/"), "document_defused.pdf");
        assert_eq!(default_output_name("https://example.com"), "document_defused.pdf");
        assert_eq!(default_output_name("not a url"), "document_defused.pdf");
        assert_eq!(
            default_output_name("https://example.com/archive.tar.gz"),
            "archive.tar_defused.pdf"
        );
    }
}
