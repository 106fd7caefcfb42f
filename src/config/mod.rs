use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::paths::Paths;

/// Environment variable naming an alternate config file.
pub const CONFIG_ENV: &str = "DEFUSE_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    /// File this config was loaded from (not serialized)
    #[serde(skip)]
    pub source: Option<PathBuf>,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub sanitizer: SanitizerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Directory for in-flight downloads. Empty means `<cache_dir>/downloads`.
    #[serde(default)]
    pub temp_dir: String,

    /// Largest document accepted, in bytes (default: 100MB)
    #[serde(default = "default_max_file_size")]
    pub max_file_size_bytes: u64,

    /// Per-request HTTP timeout inside the sandbox
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,

    /// Deadline the sandbox enforces on itself
    #[serde(default = "default_sandbox_timeout")]
    pub sandbox_timeout_secs: u64,

    /// Deadline the parent enforces on the sandbox process; must exceed
    /// `sandbox_timeout_secs`
    #[serde(default = "default_process_timeout")]
    pub process_timeout_secs: u64,

    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,

    #[serde(default = "default_max_cpu_seconds")]
    pub max_cpu_seconds: u64,

    /// Maximum processes inside the sandbox (firejail rlimit, container pids limit)
    #[serde(default = "default_max_processes")]
    pub max_processes: u32,

    /// Host suffixes allowed for downloads; empty allows any host
    #[serde(default)]
    pub allowed_domains: Vec<String>,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Advisory level: "none" | "basic" | "strict" | "paranoid"
    #[serde(default = "default_isolation_level")]
    pub isolation_level: String,

    /// "auto" | "firejail" | "bubblewrap" | "podman" | "docker"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Image used by the docker and podman backends
    #[serde(default = "default_container_image")]
    pub container_image: String,

    /// Fetch helper executable to mount into sandboxes (default: this binary)
    #[serde(default)]
    pub helper_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizerConfig {
    /// Where sanitized PDFs are written. Empty means the user's download dir.
    #[serde(default)]
    pub output_dir: String,

    /// Explicit dangerzone-cli location
    #[serde(default)]
    pub dangerzone_path: Option<String>,

    /// OCR language passed to dangerzone-cli (e.g. "eng")
    #[serde(default)]
    pub ocr_lang: Option<String>,

    /// Ask dangerzone-cli to keep the unsafe original in an archive
    #[serde(default)]
    pub archive_original: bool,

    #[serde(default)]
    pub keep_temp_files: bool,

    #[serde(default)]
    pub keep_unsafe_files: bool,

    #[serde(default = "default_sanitizer_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}
fn default_download_timeout() -> u64 {
    30
}
fn default_sandbox_timeout() -> u64 {
    120
}
fn default_process_timeout() -> u64 {
    150
}
fn default_max_memory_mb() -> u64 {
    512
}
fn default_max_cpu_seconds() -> u64 {
    60
}
fn default_max_processes() -> u32 {
    64
}
fn default_user_agent() -> String {
    format!("Mozilla/5.0 (compatible; defuse/{})", env!("CARGO_PKG_VERSION"))
}
fn default_isolation_level() -> String {
    "strict".to_string()
}
fn default_backend() -> String {
    "auto".to_string()
}
fn default_container_image() -> String {
    "python:3.11-slim".to_string()
}
fn default_sanitizer_timeout() -> u64 {
    600
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            temp_dir: String::new(),
            max_file_size_bytes: default_max_file_size(),
            download_timeout_secs: default_download_timeout(),
            sandbox_timeout_secs: default_sandbox_timeout(),
            process_timeout_secs: default_process_timeout(),
            max_memory_mb: default_max_memory_mb(),
            max_cpu_seconds: default_max_cpu_seconds(),
            max_processes: default_max_processes(),
            allowed_domains: Vec::new(),
            user_agent: default_user_agent(),
            isolation_level: default_isolation_level(),
            backend: default_backend(),
            container_image: default_container_image(),
            helper_path: None,
        }
    }
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            output_dir: String::new(),
            dangerzone_path: None,
            ocr_lang: None,
            archive_original: false,
            keep_temp_files: false,
            keep_unsafe_files: false,
            timeout_secs: default_sanitizer_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl SandboxConfig {
    /// Resolved temp directory, with `~` expanded.
    pub fn temp_dir_path(&self, paths: &Paths) -> PathBuf {
        if self.temp_dir.trim().is_empty() {
            paths.downloads_dir()
        } else {
            expand_path(&self.temp_dir)
        }
    }

    /// Helper executable override, with `~` expanded.
    pub fn helper_path(&self) -> Option<PathBuf> {
        self.helper_path
            .as_deref()
            .filter(|p| !p.trim().is_empty())
            .map(expand_path)
    }
}

impl SanitizerConfig {
    pub fn output_dir_path(&self, paths: &Paths) -> PathBuf {
        if self.output_dir.trim().is_empty() {
            paths.download_dir.clone()
        } else {
            expand_path(&self.output_dir)
        }
    }
}

impl Config {
    /// Load from `DEFUSE_CONFIG` or the default location.
    pub fn load() -> Result<Self> {
        let explicit = std::env::var_os(CONFIG_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self::load_with(explicit.as_deref())
    }

    /// Load from an explicit file, or the default location when `None`.
    ///
    /// The default file is created from the template on first run; an
    /// explicit file must already exist.
    pub fn load_with(explicit: Option<&Path>) -> Result<Self> {
        let paths = Paths::resolve()?;
        paths.ensure_dirs()?;

        let path = match explicit {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let path = paths.config_file();
                if !path.exists() {
                    // Create default config file on first run
                    let config = Config {
                        paths,
                        source: Some(path),
                        ..Config::default()
                    };
                    config.save_with_template()?;
                    return Ok(config);
                }
                path
            }
        };

        let mut config = Self::from_file(&path)?;
        config.paths = paths;
        Ok(config)
    }

    /// Parse a config file without touching any directories.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// File this config is saved to.
    pub fn file_path(&self) -> PathBuf {
        self.source
            .clone()
            .unwrap_or_else(|| self.paths.config_file())
    }

    pub fn save(&self) -> Result<()> {
        let path = self.file_path();

        // Create parent directories
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.file_path();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        if let Some(explicit) = std::env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
            return Ok(PathBuf::from(explicit));
        }
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.sandbox.temp_dir_path(&self.paths)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.sanitizer.output_dir_path(&self.paths)
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();
        let s = &self.sandbox;
        let z = &self.sanitizer;

        match parts.as_slice() {
            ["sandbox", "temp_dir"] => Ok(self.temp_dir().display().to_string()),
            ["sandbox", "max_file_size_bytes"] => Ok(s.max_file_size_bytes.to_string()),
            ["sandbox", "download_timeout_secs"] => Ok(s.download_timeout_secs.to_string()),
            ["sandbox", "sandbox_timeout_secs"] => Ok(s.sandbox_timeout_secs.to_string()),
            ["sandbox", "process_timeout_secs"] => Ok(s.process_timeout_secs.to_string()),
            ["sandbox", "max_memory_mb"] => Ok(s.max_memory_mb.to_string()),
            ["sandbox", "max_cpu_seconds"] => Ok(s.max_cpu_seconds.to_string()),
            ["sandbox", "max_processes"] => Ok(s.max_processes.to_string()),
            ["sandbox", "allowed_domains"] => Ok(s.allowed_domains.join(",")),
            ["sandbox", "user_agent"] => Ok(s.user_agent.clone()),
            ["sandbox", "isolation_level"] => Ok(s.isolation_level.clone()),
            ["sandbox", "backend"] => Ok(s.backend.clone()),
            ["sandbox", "container_image"] => Ok(s.container_image.clone()),
            ["sandbox", "helper_path"] => Ok(s.helper_path.clone().unwrap_or_default()),
            ["sanitizer", "output_dir"] => Ok(self.output_dir().display().to_string()),
            ["sanitizer", "dangerzone_path"] => Ok(z.dangerzone_path.clone().unwrap_or_default()),
            ["sanitizer", "ocr_lang"] => Ok(z.ocr_lang.clone().unwrap_or_default()),
            ["sanitizer", "archive_original"] => Ok(z.archive_original.to_string()),
            ["sanitizer", "keep_temp_files"] => Ok(z.keep_temp_files.to_string()),
            ["sanitizer", "keep_unsafe_files"] => Ok(z.keep_unsafe_files.to_string()),
            ["sanitizer", "timeout_secs"] => Ok(z.timeout_secs.to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();
        let s = &mut self.sandbox;
        let z = &mut self.sanitizer;

        match parts.as_slice() {
            ["sandbox", "temp_dir"] => s.temp_dir = value.to_string(),
            ["sandbox", "max_file_size_bytes"] => s.max_file_size_bytes = value.parse()?,
            ["sandbox", "download_timeout_secs"] => s.download_timeout_secs = value.parse()?,
            ["sandbox", "sandbox_timeout_secs"] => s.sandbox_timeout_secs = value.parse()?,
            ["sandbox", "process_timeout_secs"] => s.process_timeout_secs = value.parse()?,
            ["sandbox", "max_memory_mb"] => s.max_memory_mb = value.parse()?,
            ["sandbox", "max_cpu_seconds"] => s.max_cpu_seconds = value.parse()?,
            ["sandbox", "max_processes"] => s.max_processes = value.parse()?,
            ["sandbox", "allowed_domains"] => {
                s.allowed_domains = value
                    .split(',')
                    .map(|d| d.trim().to_lowercase())
                    .filter(|d| !d.is_empty())
                    .collect()
            }
            ["sandbox", "user_agent"] => s.user_agent = value.to_string(),
            ["sandbox", "isolation_level"] => {
                let level: crate::sandbox::IsolationLevel =
                    value.parse().map_err(anyhow::Error::msg)?;
                s.isolation_level = level.to_string();
            }
            ["sandbox", "backend"] => {
                let backend: crate::sandbox::SandboxBackend =
                    value.parse().map_err(anyhow::Error::msg)?;
                s.backend = backend.to_string();
            }
            ["sandbox", "container_image"] => s.container_image = value.to_string(),
            ["sandbox", "helper_path"] => s.helper_path = non_empty(value),
            ["sanitizer", "output_dir"] => z.output_dir = value.to_string(),
            ["sanitizer", "dangerzone_path"] => z.dangerzone_path = non_empty(value),
            ["sanitizer", "ocr_lang"] => z.ocr_lang = non_empty(value),
            ["sanitizer", "archive_original"] => z.archive_original = value.parse()?,
            ["sanitizer", "keep_temp_files"] => z.keep_temp_files = value.parse()?,
            ["sanitizer", "keep_unsafe_files"] => z.keep_unsafe_files = value.parse()?,
            ["sanitizer", "timeout_secs"] => z.timeout_secs = value.parse()?,
            ["logging", "level"] => self.logging.level = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }

    /// Add a host suffix to the download allow-list. Returns false if it
    /// was already present. A leading dot is kept: `.example.com` admits
    /// subdomains only.
    pub fn add_allowed_domain(&mut self, domain: &str) -> Result<bool> {
        let domain = domain.trim().to_lowercase();
        if domain.trim_start_matches('.').is_empty()
            || domain.contains('/')
            || domain.contains(':')
        {
            anyhow::bail!("Not a domain name: {:?}", domain);
        }
        if self.sandbox.allowed_domains.contains(&domain) {
            return Ok(false);
        }
        self.sandbox.allowed_domains.push(domain);
        Ok(true)
    }

    /// Human-readable problems with the current values. Empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let s = &self.sandbox;
        let mut problems = Vec::new();

        if s.max_file_size_bytes == 0 {
            problems.push("sandbox.max_file_size_bytes must be positive".to_string());
        }
        if s.download_timeout_secs == 0 {
            problems.push("sandbox.download_timeout_secs must be positive".to_string());
        }
        if s.sandbox_timeout_secs == 0 {
            problems.push("sandbox.sandbox_timeout_secs must be positive".to_string());
        }
        if s.process_timeout_secs <= s.sandbox_timeout_secs {
            problems.push(format!(
                "sandbox.process_timeout_secs ({}) must be greater than \
                 sandbox.sandbox_timeout_secs ({})",
                s.process_timeout_secs, s.sandbox_timeout_secs
            ));
        }
        if s.download_timeout_secs > s.sandbox_timeout_secs {
            problems.push(format!(
                "sandbox.download_timeout_secs ({}) should not exceed \
                 sandbox.sandbox_timeout_secs ({})",
                s.download_timeout_secs, s.sandbox_timeout_secs
            ));
        }
        if s.max_memory_mb == 0 {
            problems.push("sandbox.max_memory_mb must be positive".to_string());
        }
        if s.max_processes == 0 {
            problems.push("sandbox.max_processes must be positive".to_string());
        }
        if s.isolation_level.parse::<crate::sandbox::IsolationLevel>().is_err() {
            problems.push(format!(
                "sandbox.isolation_level {:?} is not one of none, basic, strict, paranoid",
                s.isolation_level
            ));
        }
        if s.backend.parse::<crate::sandbox::SandboxBackend>().is_err() {
            problems.push(format!(
                "sandbox.backend {:?} is not one of auto, firejail, bubblewrap, podman, docker",
                s.backend
            ));
        }
        if s.container_image.trim().is_empty() {
            problems.push("sandbox.container_image must not be empty".to_string());
        }
        if self.sanitizer.timeout_secs == 0 {
            problems.push("sanitizer.timeout_secs must be positive".to_string());
        }

        problems
    }
}

fn expand_path(s: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(s.trim()).to_string())
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# defuse configuration
# Auto-created on first run. Edit as needed.

[sandbox]
# Backend: auto | firejail | bubblewrap | podman | docker
# auto picks the strongest one installed (firejail > bubblewrap > containers).
backend = "auto"

# Advisory isolation preference: none | basic | strict | paranoid
isolation_level = "strict"

# Limits for the fetch running inside the sandbox
max_file_size_bytes = 104857600      # 100MB
download_timeout_secs = 30
sandbox_timeout_secs = 120
process_timeout_secs = 150           # must be greater than sandbox_timeout_secs
max_memory_mb = 512
max_cpu_seconds = 60
max_processes = 64

# Only allow downloads from these hosts (suffix match). Empty allows any host.
# allowed_domains = ["example.com", "arxiv.org"]

# Directory for in-flight downloads (default: ~/.cache/defuse/downloads)
# temp_dir = "~/.cache/defuse/downloads"

# Image used by the podman and docker backends
# container_image = "python:3.11-slim"

# Fetch helper mounted into sandboxes (default: this executable).
# On non-Linux hosts with containers, point this at a Linux build.
# helper_path = "~/bin/defuse-linux"

[sanitizer]
# output_dir = "~/Downloads"
# dangerzone_path = "/usr/bin/dangerzone-cli"
# ocr_lang = "eng"
archive_original = false
keep_temp_files = false
timeout_secs = 600

[logging]
level = "info"
"#;
