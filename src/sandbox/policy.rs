use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use super::error::SandboxError;
use crate::config::SandboxConfig;

/// Coarse security-strength classification.
///
/// Used for reporting: the configured value is advisory and the computed
/// maximum only reflects which backends were found.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Nothing enforced.
    None,
    /// Resource limits only.
    Basic,
    /// Container isolation (podman, docker).
    Strict,
    /// Dedicated Linux sandboxes (firejail, bubblewrap).
    Paranoid,
}

/// Isolation mechanisms able to run the fetch helper.
///
/// `Auto` defers the choice to the ranker. There is no variant
/// for an unsandboxed fetch.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    Auto,
    Firejail,
    Bubblewrap,
    Podman,
    Docker,
}

impl SandboxBackend {
    /// Every backend that maps to a real isolation tool.
    pub const CONCRETE: [SandboxBackend; 4] = [
        SandboxBackend::Firejail,
        SandboxBackend::Bubblewrap,
        SandboxBackend::Podman,
        SandboxBackend::Docker,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SandboxBackend::Auto => "auto",
            SandboxBackend::Firejail => "firejail",
            SandboxBackend::Bubblewrap => "bubblewrap",
            SandboxBackend::Podman => "podman",
            SandboxBackend::Docker => "docker",
        }
    }

    /// Executable that must be on PATH for this backend.
    pub fn binary(self) -> Option<&'static str> {
        match self {
            SandboxBackend::Auto => None,
            SandboxBackend::Firejail => Some("firejail"),
            SandboxBackend::Bubblewrap => Some("bwrap"),
            SandboxBackend::Podman => Some("podman"),
            SandboxBackend::Docker => Some("docker"),
        }
    }

    /// Isolation tier this backend provides.
    pub fn isolation_level(self) -> IsolationLevel {
        match self {
            SandboxBackend::Firejail | SandboxBackend::Bubblewrap => IsolationLevel::Paranoid,
            SandboxBackend::Podman | SandboxBackend::Docker => IsolationLevel::Strict,
            SandboxBackend::Auto => IsolationLevel::None,
        }
    }

    /// Parse a config value, falling back to `Auto` for anything unknown.
    pub fn from_config(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            tracing::warn!("Unknown sandbox backend {:?}, using auto", value);
            SandboxBackend::Auto
        })
    }
}

impl fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(SandboxBackend::Auto),
            "firejail" => Ok(SandboxBackend::Firejail),
            "bubblewrap" | "bwrap" => Ok(SandboxBackend::Bubblewrap),
            "podman" => Ok(SandboxBackend::Podman),
            "docker" => Ok(SandboxBackend::Docker),
            other => Err(format!("unknown sandbox backend: {}", other)),
        }
    }
}

impl IsolationLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            IsolationLevel::None => "none",
            IsolationLevel::Basic => "basic",
            IsolationLevel::Strict => "strict",
            IsolationLevel::Paranoid => "paranoid",
        }
    }

    /// Parse a config value, falling back to `Paranoid` for anything unknown.
    pub fn from_config(value: &str) -> Self {
        value.parse().unwrap_or_else(|_| {
            tracing::warn!("Unknown isolation level {:?}, using paranoid", value);
            IsolationLevel::Paranoid
        })
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(IsolationLevel::None),
            "basic" => Ok(IsolationLevel::Basic),
            "strict" => Ok(IsolationLevel::Strict),
            "paranoid" => Ok(IsolationLevel::Paranoid),
            other => Err(format!("unknown isolation level: {}", other)),
        }
    }
}

/// Inner/outer timeout pair for one sandboxed invocation.
///
/// `inner` is how long the sandbox (or the helper itself) lets the fetch
/// run; `outer` is how long the parent waits before killing the process.
/// `outer > inner` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPair {
    inner: Duration,
    outer: Duration,
}

impl TimeoutPair {
    pub fn new(inner: Duration, outer: Duration) -> Result<Self, SandboxError> {
        if outer <= inner {
            return Err(SandboxError::InvalidTimeouts {
                inner_secs: inner.as_secs(),
                outer_secs: outer.as_secs(),
            });
        }
        Ok(Self { inner, outer })
    }

    pub fn from_config(config: &SandboxConfig) -> Result<Self, SandboxError> {
        Self::new(
            Duration::from_secs(config.sandbox_timeout_secs),
            Duration::from_secs(config.process_timeout_secs),
        )
    }

    pub fn inner(&self) -> Duration {
        self.inner
    }

    pub fn outer(&self) -> Duration {
        self.outer
    }
}

/// Parameters handed to the fetch helper inside the sandbox.
///
/// Serialized to JSON and passed as a single argv entry; nothing here is
/// ever spliced into code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Target URL (validated again inside the sandbox).
    pub url: String,

    /// Destination as seen from inside the sandbox.
    pub output_path: PathBuf,

    /// Byte ceiling for the whole body.
    pub max_file_size_bytes: u64,

    /// Per-request HTTP timeout.
    pub download_timeout_secs: u64,

    /// Hard deadline for the helper process as a whole.
    pub sandbox_timeout_secs: u64,

    /// Host suffixes the URL must match; empty allows any host.
    pub allowed_domains: Vec<String>,

    pub user_agent: String,

    /// RLIMIT_AS in megabytes.
    pub max_memory_mb: u64,

    /// RLIMIT_CPU in seconds.
    pub max_cpu_seconds: u64,
}

/// Build the helper request for `url`, writing to `output_path` (a path
/// inside the sandbox's view of the filesystem).
pub fn build_fetch_request(config: &SandboxConfig, url: &str, output_path: &Path) -> FetchRequest {
    FetchRequest {
        url: url.to_string(),
        output_path: output_path.to_path_buf(),
        max_file_size_bytes: config.max_file_size_bytes,
        download_timeout_secs: config.download_timeout_secs,
        sandbox_timeout_secs: config.sandbox_timeout_secs,
        allowed_domains: config.allowed_domains.clone(),
        user_agent: config.user_agent.clone(),
        max_memory_mb: config.max_memory_mb,
        max_cpu_seconds: config.max_cpu_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_ordering() {
        assert!(IsolationLevel::None < IsolationLevel::Basic);
        assert!(IsolationLevel::Basic < IsolationLevel::Strict);
        assert!(IsolationLevel::Strict < IsolationLevel::Paranoid);
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("auto".parse(), Ok(SandboxBackend::Auto));
        assert_eq!("Firejail".parse(), Ok(SandboxBackend::Firejail));
        assert_eq!("bwrap".parse(), Ok(SandboxBackend::Bubblewrap));
        assert_eq!(" podman ".parse(), Ok(SandboxBackend::Podman));
        assert!("subprocess".parse::<SandboxBackend>().is_err());
    }

    #[test]
    fn test_unknown_config_values_fall_back() {
        assert_eq!(SandboxBackend::from_config("subprocess"), SandboxBackend::Auto);
        assert_eq!(SandboxBackend::from_config("docker"), SandboxBackend::Docker);
        assert_eq!(IsolationLevel::from_config("extreme"), IsolationLevel::Paranoid);
        assert_eq!(IsolationLevel::from_config("basic"), IsolationLevel::Basic);
    }

    #[test]
    fn test_backend_tiers() {
        assert_eq!(SandboxBackend::Firejail.isolation_level(), IsolationLevel::Paranoid);
        assert_eq!(SandboxBackend::Bubblewrap.isolation_level(), IsolationLevel::Paranoid);
        assert_eq!(SandboxBackend::Podman.isolation_level(), IsolationLevel::Strict);
        assert_eq!(SandboxBackend::Docker.isolation_level(), IsolationLevel::Strict);
        assert!(!SandboxBackend::CONCRETE.contains(&SandboxBackend::Auto));
    }

    #[test]
    fn test_timeout_pair_requires_outer_longer() {
        let pair = TimeoutPair::new(Duration::from_secs(120), Duration::from_secs(150)).unwrap();
        assert!(pair.outer() > pair.inner());

        assert!(TimeoutPair::new(Duration::from_secs(150), Duration::from_secs(150)).is_err());
        assert!(TimeoutPair::new(Duration::from_secs(200), Duration::from_secs(150)).is_err());
    }

    #[test]
    fn test_timeout_pair_from_default_config() {
        let config = SandboxConfig::default();
        let pair = TimeoutPair::from_config(&config).unwrap();
        assert_eq!(pair.inner(), Duration::from_secs(120));
        assert_eq!(pair.outer(), Duration::from_secs(150));
    }

    #[test]
    fn test_fetch_request_carries_config() {
        let mut config = SandboxConfig::default();
        config.allowed_domains = vec!["example.com".to_string()];
        config.max_file_size_bytes = 1024;

        let request =
            build_fetch_request(&config, "https://example.com/a.pdf", Path::new("/output/a.tmp"));
        assert_eq!(request.url, "https://example.com/a.pdf");
        assert_eq!(request.output_path, PathBuf::from("/output/a.tmp"));
        assert_eq!(request.max_file_size_bytes, 1024);
        assert_eq!(request.allowed_domains, vec!["example.com".to_string()]);

        // The request must survive the argv hop unchanged, quotes included.
        let tricky = build_fetch_request(
            &config,
            "https://example.com/a'b\"c.pdf?x=$(id)",
            Path::new("/output/a.tmp"),
        );
        let json = serde_json::to_string(&tricky).unwrap();
        let back: FetchRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, tricky);
    }
}
