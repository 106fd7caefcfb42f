//! Document sanitization through an external `dangerzone-cli` process.
//!
//! The downloaded file is handed to Dangerzone, which renders it to pixels
//! and back into a clean PDF. Only the produced PDF is checked here.

use crate::config::{Config, SanitizerConfig};
use crate::sandbox::Platform;
use crate::sandbox::detect::find_in_path;
use crate::sandbox::executor::{Invocation, run_with_timeout};
use std::ffi::OsStr;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CLI_NAME: &str = "dangerzone-cli";

/// Env var pointing at a dangerzone-cli outside PATH.
pub const CLI_ENV: &str = "DANGERZONE_CLI_PATH";

/// Smallest output accepted as a real PDF.
const MIN_OUTPUT_BYTES: u64 = 100;

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("Dangerzone CLI not found at: {0}")]
    CliNotFound(PathBuf),

    #[error("Input file does not exist: {0}")]
    InputMissing(PathBuf),

    #[error("Dangerzone failed: {0}")]
    Failed(String),

    #[error("Failed to run Dangerzone: {0:#}")]
    Run(anyhow::Error),

    #[error("Dangerzone did not create expected output file")]
    MissingOutput,

    #[error("Output file failed validation: {0}")]
    InvalidOutput(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct DocumentSanitizer {
    settings: SanitizerConfig,
    output_dir: PathBuf,
    cli: PathBuf,
}

impl DocumentSanitizer {
    pub fn new(
        settings: SanitizerConfig,
        output_dir: PathBuf,
        cli: PathBuf,
    ) -> Result<Self, SanitizeError> {
        if !cli.exists() {
            return Err(SanitizeError::CliNotFound(cli));
        }
        Ok(Self {
            settings,
            output_dir,
            cli,
        })
    }

    /// Sanitizer writing to the configured output directory.
    pub fn from_config(config: &Config, cli: PathBuf) -> Result<Self, SanitizeError> {
        Self::new(config.sanitizer.clone(), config.output_dir(), cli)
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn cli_path(&self) -> &Path {
        &self.cli
    }

    /// Convert `input` into a sanitized PDF inside the output directory.
    ///
    /// Returns the path of the validated PDF. On any failure after
    /// Dangerzone ran, a partial output file is removed.
    pub async fn sanitize(
        &self,
        input: &Path,
        output_filename: Option<&str>,
    ) -> Result<PathBuf, SanitizeError> {
        if !input.exists() {
            return Err(SanitizeError::InputMissing(input.to_path_buf()));
        }

        let filename = output_filename_for(input, output_filename);
        let output_path = self.output_dir.join(&filename);
        std::fs::create_dir_all(&self.output_dir)?;

        let result = self.convert(input, &filename, &output_path).await;
        if result.is_err() && output_path.exists() {
            let _ = std::fs::remove_file(&output_path);
        }
        result
    }

    async fn convert(
        &self,
        input: &Path,
        filename: &str,
        output_path: &Path,
    ) -> Result<PathBuf, SanitizeError> {
        let invocation = self.invocation(input, filename);
        debug!("Running {}", invocation);

        let timeout = Duration::from_secs(self.settings.timeout_secs);
        let output = run_with_timeout(&invocation, timeout)
            .await
            .map_err(SanitizeError::Run)?;

        if !output.success {
            let message = if output.stderr.trim().is_empty() {
                output.stdout.trim()
            } else {
                output.stderr.trim()
            };
            return Err(SanitizeError::Failed(message.to_string()));
        }

        if !output_path.exists() {
            // Dangerzone's own naming: "<stem>-safe.pdf"
            let safe = safe_suffixed(output_path);
            if !safe.exists() {
                return Err(SanitizeError::MissingOutput);
            }
            debug!("Renaming {} to {}", safe.display(), output_path.display());
            std::fs::rename(&safe, output_path)?;
        }

        if !is_valid_pdf(output_path) {
            return Err(SanitizeError::InvalidOutput(output_path.to_path_buf()));
        }

        info!("Sanitized {} -> {}", input.display(), output_path.display());
        Ok(output_path.to_path_buf())
    }

    fn invocation(&self, input: &Path, filename: &str) -> Invocation {
        let mut invocation = Invocation::new(self.cli.as_os_str())
            .arg(input.as_os_str())
            .opt("--output-filename", filename)
            .in_dir(&self.output_dir);

        if let Some(lang) = self.settings.ocr_lang.as_deref().filter(|l| !l.is_empty()) {
            invocation = invocation.opt("--ocr-lang", lang);
        }
        if self.settings.archive_original {
            invocation = invocation.arg("--archive");
        }
        invocation
    }

    /// Output of `dangerzone-cli --version`, if it runs.
    pub async fn version(&self) -> Option<String> {
        let invocation = Invocation::new(self.cli.as_os_str()).arg("--version");
        match run_with_timeout(&invocation, VERSION_TIMEOUT).await {
            Ok(output) if output.success => Some(output.stdout.trim().to_string()),
            Ok(_) => None,
            Err(e) => {
                debug!("dangerzone-cli --version failed: {:#}", e);
                None
            }
        }
    }

    /// Remove `temp_*` leftovers and the `unsafe/` archive from the output
    /// directory unless the configuration keeps them.
    pub fn cleanup_temp_files(&self) {
        if self.settings.keep_temp_files {
            return;
        }

        let pattern = format!(
            "{}/temp_*",
            glob::Pattern::escape(&self.output_dir.to_string_lossy())
        );
        match glob::glob(&pattern) {
            Ok(entries) => {
                for path in entries.flatten().filter(|p| p.is_file()) {
                    if let Err(e) = std::fs::remove_file(&path) {
                        warn!("Failed to remove {}: {}", path.display(), e);
                    }
                }
            }
            Err(e) => warn!("Bad cleanup pattern {}: {}", pattern, e),
        }

        let unsafe_dir = self.output_dir.join("unsafe");
        if unsafe_dir.is_dir() && !self.settings.keep_unsafe_files {
            if let Err(e) = std::fs::remove_dir_all(&unsafe_dir) {
                warn!("Failed to remove {}: {}", unsafe_dir.display(), e);
            }
        }
    }
}

/// Output file name: the requested one or `<stem>_defused`, always ending
/// in `.pdf`.
pub fn output_filename_for(input: &Path, requested: Option<&str>) -> String {
    let name = match requested.filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => {
            let stem = input
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "document".to_string());
            format!("{}_defused.pdf", stem)
        }
    };

    if name.ends_with(".pdf") {
        name
    } else {
        format!("{}.pdf", name)
    }
}

fn safe_suffixed(output_path: &Path) -> PathBuf {
    let stem = output_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    output_path.with_file_name(format!("{}-safe.pdf", stem))
}

/// At least `MIN_OUTPUT_BYTES` long and starting with the PDF magic.
pub fn is_valid_pdf(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() || meta.len() < MIN_OUTPUT_BYTES {
        return false;
    }

    let mut magic = [0u8; 4];
    std::fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| &magic == b"%PDF")
        .unwrap_or(false)
}

/// Configured dangerzone-cli if it exists, otherwise a search of the usual
/// locations.
pub fn resolve_cli(settings: &SanitizerConfig) -> Option<PathBuf> {
    if let Some(configured) = settings.dangerzone_path.as_deref().filter(|p| !p.is_empty()) {
        let path = PathBuf::from(shellexpand::tilde(configured).into_owned());
        if path.exists() {
            return Some(path);
        }
        warn!(
            "Configured dangerzone_path {} does not exist, searching",
            path.display()
        );
    }
    find_dangerzone_cli()
}

/// Look for dangerzone-cli on PATH, then `DANGERZONE_CLI_PATH`, then the
/// platform's common install locations.
pub fn find_dangerzone_cli() -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    let env_override = std::env::var_os(CLI_ENV).map(PathBuf::from);
    locate_cli(Platform::current(), &path_var, env_override)
}

fn locate_cli(
    platform: Platform,
    path_var: &OsStr,
    env_override: Option<PathBuf>,
) -> Option<PathBuf> {
    find_in_path(CLI_NAME, path_var)
        .or_else(|| env_override.filter(|p| p.exists()))
        .or_else(|| install_locations(platform).into_iter().find(|p| p.exists()))
}

fn install_locations(platform: Platform) -> Vec<PathBuf> {
    let candidates: &[&str] = match platform {
        Platform::Macos => &[
            "/Applications/Dangerzone.app/Contents/MacOS/dangerzone-cli",
            "~/Applications/Dangerzone.app/Contents/MacOS/dangerzone-cli",
            "/opt/homebrew/bin/dangerzone-cli",
            "/usr/local/bin/dangerzone-cli",
        ],
        Platform::Linux => &[
            "/usr/bin/dangerzone-cli",
            "/usr/local/bin/dangerzone-cli",
            "/bin/dangerzone-cli",
            "/var/lib/flatpak/exports/bin/dangerzone-cli",
            "~/.local/share/flatpak/exports/bin/dangerzone-cli",
            "/snap/bin/dangerzone-cli",
            "~/.local/bin/dangerzone-cli",
            "~/bin/dangerzone-cli",
        ],
        Platform::Windows => &[
            "C:/Program Files/Dangerzone/dangerzone-cli.exe",
            "C:/Program Files (x86)/Dangerzone/dangerzone-cli.exe",
            "~/AppData/Local/Dangerzone/dangerzone-cli.exe",
            "~/AppData/Roaming/Dangerzone/dangerzone-cli.exe",
        ],
        Platform::Other => &[],
    };

    candidates
        .iter()
        .map(|c| PathBuf::from(shellexpand::tilde(c).into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn fake_cli(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(CLI_NAME);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Shell snippet writing a plausible PDF to the file named by `target`.
    #[cfg(unix)]
    const WRITE_PDF: &str = r#"write_pdf() {
  printf '%%PDF-1.4\n' > "$1"
  i=0
  while [ $i -lt 20 ]; do echo 'xxxxxxxxxxxxxxxx' >> "$1"; i=$((i+1)); done
}"#;

    #[cfg(unix)]
    fn sanitizer(tmp: &Path, body: &str, settings: SanitizerConfig) -> DocumentSanitizer {
        let bin = tmp.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let cli = fake_cli(&bin, &format!("{}\n{}", WRITE_PDF, body));
        DocumentSanitizer::new(settings, tmp.join("out"), cli).unwrap()
    }

    #[cfg(unix)]
    fn input_file(tmp: &Path) -> PathBuf {
        let input = tmp.join("report.docx");
        std::fs::write(&input, b"PK\x03\x04 not really a docx").unwrap();
        input
    }

    #[test]
    fn test_output_filename() {
        let input = Path::new("/tmp/defuse-1234.tmp");
        assert_eq!(output_filename_for(input, None), "defuse-1234_defused.pdf");
        assert_eq!(output_filename_for(input, Some("invoice")), "invoice.pdf");
        assert_eq!(output_filename_for(input, Some("invoice.pdf")), "invoice.pdf");
        assert_eq!(output_filename_for(input, Some("")), "defuse-1234_defused.pdf");
    }

    #[test]
    fn test_missing_cli_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let result = DocumentSanitizer::new(
            SanitizerConfig::default(),
            tmp.path().to_path_buf(),
            tmp.path().join("no-such-cli"),
        );
        assert!(matches!(result, Err(SanitizeError::CliNotFound(_))));
    }

    #[test]
    fn test_is_valid_pdf() {
        let tmp = tempfile::tempdir().unwrap();

        let good = tmp.path().join("good.pdf");
        let mut data = b"%PDF-1.7\n".to_vec();
        data.resize(200, b'x');
        std::fs::write(&good, &data).unwrap();
        assert!(is_valid_pdf(&good));

        let small = tmp.path().join("small.pdf");
        std::fs::write(&small, b"%PDF-1.7").unwrap();
        assert!(!is_valid_pdf(&small));

        let html = tmp.path().join("page.pdf");
        std::fs::write(&html, vec![b'<'; 200]).unwrap();
        assert!(!is_valid_pdf(&html));

        assert!(!is_valid_pdf(&tmp.path().join("missing.pdf")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sanitize_success() {
        let tmp = tempfile::tempdir().unwrap();
        let s = sanitizer(tmp.path(), r#"write_pdf "$3""#, SanitizerConfig::default());

        let output = s.sanitize(&input_file(tmp.path()), None).await.unwrap();
        assert_eq!(output, tmp.path().join("out/report_defused.pdf"));
        assert!(is_valid_pdf(&output));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sanitize_renames_safe_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let s = sanitizer(
            tmp.path(),
            r#"write_pdf "${3%.pdf}-safe.pdf""#,
            SanitizerConfig::default(),
        );

        let output = s
            .sanitize(&input_file(tmp.path()), Some("clean"))
            .await
            .unwrap();
        assert_eq!(output, tmp.path().join("out/clean.pdf"));
        assert!(output.exists());
        assert!(!tmp.path().join("out/clean-safe.pdf").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sanitize_passes_options() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = SanitizerConfig {
            ocr_lang: Some("eng".to_string()),
            archive_original: true,
            ..SanitizerConfig::default()
        };
        let s = sanitizer(tmp.path(), r#"echo "$@" > args.txt; write_pdf "$3""#, settings);

        s.sanitize(&input_file(tmp.path()), None).await.unwrap();
        let args = std::fs::read_to_string(tmp.path().join("out/args.txt")).unwrap();
        assert!(args.contains("--output-filename report_defused.pdf"));
        assert!(args.contains("--ocr-lang eng"));
        assert!(args.trim_end().ends_with("--archive"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sanitize_reports_cli_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let s = sanitizer(
            tmp.path(),
            "echo 'conversion failed' >&2; exit 1",
            SanitizerConfig::default(),
        );

        let err = s.sanitize(&input_file(tmp.path()), None).await.unwrap_err();
        assert!(matches!(err, SanitizeError::Failed(ref m) if m == "conversion failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sanitize_rejects_and_removes_bad_output() {
        let tmp = tempfile::tempdir().unwrap();
        let s = sanitizer(tmp.path(), r#"echo tiny > "$3""#, SanitizerConfig::default());

        let err = s.sanitize(&input_file(tmp.path()), None).await.unwrap_err();
        assert!(matches!(err, SanitizeError::InvalidOutput(_)));
        assert!(!tmp.path().join("out/report_defused.pdf").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sanitize_missing_output() {
        let tmp = tempfile::tempdir().unwrap();
        let s = sanitizer(tmp.path(), "exit 0", SanitizerConfig::default());

        let err = s.sanitize(&input_file(tmp.path()), None).await.unwrap_err();
        assert!(matches!(err, SanitizeError::MissingOutput));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sanitize_missing_input() {
        let tmp = tempfile::tempdir().unwrap();
        let s = sanitizer(tmp.path(), "exit 0", SanitizerConfig::default());

        let err = s
            .sanitize(&tmp.path().join("nope.pdf"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SanitizeError::InputMissing(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_version() {
        let tmp = tempfile::tempdir().unwrap();
        let s = sanitizer(
            tmp.path(),
            r#"[ "$1" = "--version" ] && echo 'dangerzone-cli 0.9.0'"#,
            SanitizerConfig::default(),
        );
        assert_eq!(s.version().await.as_deref(), Some("dangerzone-cli 0.9.0"));
    }

    #[cfg(unix)]
    #[test]
    fn test_cleanup_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let s = sanitizer(tmp.path(), "exit 0", SanitizerConfig::default());
        let out = s.output_dir().to_path_buf();
        std::fs::create_dir_all(out.join("unsafe")).unwrap();
        std::fs::write(out.join("unsafe/original.docx"), b"x").unwrap();
        std::fs::write(out.join("temp_1"), b"x").unwrap();
        std::fs::write(out.join("kept.pdf"), b"x").unwrap();

        s.cleanup_temp_files();
        assert!(!out.join("temp_1").exists());
        assert!(!out.join("unsafe").exists());
        assert!(out.join("kept.pdf").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_cleanup_respects_keep_flags() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = SanitizerConfig {
            keep_unsafe_files: true,
            ..SanitizerConfig::default()
        };
        let s = sanitizer(tmp.path(), "exit 0", settings);
        let out = s.output_dir().to_path_buf();
        std::fs::create_dir_all(out.join("unsafe")).unwrap();
        std::fs::write(out.join("temp_1"), b"x").unwrap();

        s.cleanup_temp_files();
        assert!(!out.join("temp_1").exists());
        assert!(out.join("unsafe").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_locate_cli_order() {
        let tmp = tempfile::tempdir().unwrap();
        let on_path = tmp.path().join("path");
        std::fs::create_dir_all(&on_path).unwrap();
        let path_cli = fake_cli(&on_path, "exit 0");

        let elsewhere = tmp.path().join("elsewhere");
        std::fs::create_dir_all(&elsewhere).unwrap();
        let env_cli = fake_cli(&elsewhere, "exit 0");

        assert_eq!(
            locate_cli(Platform::Other, on_path.as_os_str(), Some(env_cli.clone())),
            Some(path_cli)
        );
        assert_eq!(
            locate_cli(Platform::Other, OsStr::new(""), Some(env_cli.clone())),
            Some(env_cli)
        );
        assert_eq!(
            locate_cli(
                Platform::Other,
                OsStr::new(""),
                Some(tmp.path().join("missing"))
            ),
            None
        );
    }

    #[test]
    fn test_install_locations_per_platform() {
        assert!(install_locations(Platform::Other).is_empty());
        assert!(
            install_locations(Platform::Linux)
                .iter()
                .any(|p| p == Path::new("/snap/bin/dangerzone-cli"))
        );
        assert!(
            install_locations(Platform::Macos)
                .iter()
                .all(|p| !p.to_string_lossy().starts_with('~'))
        );
    }
}
