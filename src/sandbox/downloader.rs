use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::backends;
use super::detect::{Capabilities, HostProbe, Platform, SystemProbe};
use super::error::SandboxError;
use super::policy::{IsolationLevel, SandboxBackend, TimeoutPair};
use crate::config::{Config, SandboxConfig};

/// Runs one backend's isolated fetch. `true` means the file is on disk.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BackendRunner: Send + Sync {
    async fn run(
        &self,
        backend: SandboxBackend,
        url: &str,
        output_path: &Path,
        config: &SandboxConfig,
    ) -> bool;
}

/// Dispatches to the real per-backend invokers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SandboxRunner;

#[async_trait]
impl BackendRunner for SandboxRunner {
    async fn run(
        &self,
        backend: SandboxBackend,
        url: &str,
        output_path: &Path,
        config: &SandboxConfig,
    ) -> bool {
        match backend {
            SandboxBackend::Firejail => {
                backends::run_firejail_download(url, output_path, config).await
            }
            SandboxBackend::Bubblewrap => {
                backends::run_bubblewrap_download(url, output_path, config).await
            }
            SandboxBackend::Podman => backends::run_podman_download(url, output_path, config).await,
            SandboxBackend::Docker => backends::run_docker_download(url, output_path, config).await,
            SandboxBackend::Auto => {
                warn!("Refusing to run an unresolved 'auto' backend");
                false
            }
        }
    }
}

/// Snapshot of the sandbox situation, for display or JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct SecurityReport {
    pub platform: Platform,
    pub available_backends: BTreeMap<SandboxBackend, bool>,
    pub recommended_backend: SandboxBackend,
    pub current_backend: SandboxBackend,
    pub isolation_level: IsolationLevel,
    pub max_isolation_level: IsolationLevel,
    pub fallback_order: Vec<SandboxBackend>,
    pub temp_dir: PathBuf,
}

/// Downloads untrusted URLs through the strongest available sandbox,
/// falling back through weaker ones.
///
/// One download at a time per instance; create more instances for
/// parallelism.
pub struct SandboxedDownloader {
    config: SandboxConfig,
    temp_dir: PathBuf,
    capabilities: Capabilities,
    backend: SandboxBackend,
    isolation_level: IsolationLevel,
    runner: Box<dyn BackendRunner>,
}

impl SandboxedDownloader {
    /// Probe the real host and build a downloader.
    pub async fn new(config: &Config) -> Result<Self, SandboxError> {
        Self::with_probe(config, &SystemProbe).await
    }

    /// Build a downloader using `probe` for capability detection.
    pub async fn with_probe(config: &Config, probe: &dyn HostProbe) -> Result<Self, SandboxError> {
        let capabilities = Capabilities::detect(probe).await?;
        Self::from_capabilities(config, capabilities, Box::new(SandboxRunner))
    }

    /// Build from already-detected capabilities and an explicit runner.
    pub fn from_capabilities(
        config: &Config,
        capabilities: Capabilities,
        runner: Box<dyn BackendRunner>,
    ) -> Result<Self, SandboxError> {
        TimeoutPair::from_config(&config.sandbox)?;

        let configured = SandboxBackend::from_config(&config.sandbox.backend);
        let isolation_level = IsolationLevel::from_config(&config.sandbox.isolation_level);

        let mut downloader = Self {
            config: config.sandbox.clone(),
            temp_dir: config.temp_dir(),
            capabilities,
            backend: SandboxBackend::Auto,
            isolation_level,
            runner,
        };
        downloader.backend = downloader.resolve(configured);

        info!(
            "Sandbox backend: {} (recommended {}, max isolation {})",
            downloader.backend,
            downloader.capabilities.recommended_backend(),
            downloader.capabilities.max_isolation_level()
        );
        if isolation_level > downloader.capabilities.max_isolation_level() {
            warn!(
                "Requested isolation level {} exceeds what this host provides ({})",
                isolation_level,
                downloader.capabilities.max_isolation_level()
            );
        }

        Ok(downloader)
    }

    /// Override the configured backend (e.g. from the command line).
    pub fn with_backend(mut self, backend: SandboxBackend) -> Self {
        self.backend = self.resolve(backend);
        self
    }

    /// Override the advisory isolation level.
    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    fn resolve(&self, requested: SandboxBackend) -> SandboxBackend {
        match requested {
            SandboxBackend::Auto => self.capabilities.recommended_backend(),
            backend => {
                if !self.capabilities.is_available(backend) {
                    warn!(
                        "Configured backend {} is not available, will fall back",
                        backend
                    );
                }
                backend
            }
        }
    }

    pub fn backend(&self) -> SandboxBackend {
        self.backend
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Backends in the order they will be tried for one download.
    pub fn attempt_order(&self) -> Vec<SandboxBackend> {
        let mut order = Vec::with_capacity(4);
        if self.capabilities.is_available(self.backend) {
            order.push(self.backend);
        }
        for backend in self.capabilities.fallback_order() {
            if backend != self.backend && self.capabilities.is_available(backend) {
                order.push(backend);
            }
        }
        order
    }

    /// Random output path inside the temp directory.
    pub fn temp_output_path(&self) -> PathBuf {
        self.temp_dir
            .join(format!("defuse-{}.tmp", uuid::Uuid::new_v4().simple()))
    }

    /// Download `url` inside a sandbox.
    ///
    /// Returns the path of the downloaded file, or `None` if every available
    /// backend failed. Nothing is left at the output path on failure.
    pub async fn sandboxed_download(
        &self,
        url: &str,
        output_path: Option<&Path>,
    ) -> Option<PathBuf> {
        let output_path = match output_path {
            Some(p) => p.to_path_buf(),
            None => {
                if let Err(e) = crate::paths::create_dir_with_mode(&self.temp_dir) {
                    warn!("Cannot prepare temp directory: {:#}", e);
                    return None;
                }
                self.temp_output_path()
            }
        };

        for backend in self.attempt_order() {
            remove_stale(&output_path);
            debug!("Trying {} for {}", backend, url);

            if self.runner.run(backend, url, &output_path, &self.config).await {
                if backend != self.backend {
                    info!("Download succeeded with fallback backend {}", backend);
                }
                return Some(output_path);
            }
            warn!("{} could not download {}", backend, url);
        }

        remove_stale(&output_path);
        warn!("All sandbox backends failed for {}", url);
        None
    }

    /// Current sandbox configuration and host capabilities.
    pub fn security_report(&self) -> SecurityReport {
        SecurityReport {
            platform: self.capabilities.platform(),
            available_backends: self.capabilities.available_backends().clone(),
            recommended_backend: self.capabilities.recommended_backend(),
            current_backend: self.backend,
            isolation_level: self.isolation_level,
            max_isolation_level: self.capabilities.max_isolation_level(),
            fallback_order: self.capabilities.fallback_order().to_vec(),
            temp_dir: self.temp_dir.clone(),
        }
    }
}

fn remove_stale(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed partial file {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => debug!("Failed to remove {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    fn all_available() -> Capabilities {
        Capabilities::from_availability(
            Platform::Linux,
            SandboxBackend::CONCRETE.iter().map(|b| (*b, true)).collect(),
        )
        .unwrap()
    }

    fn test_config(temp_dir: &Path, backend: &str) -> Config {
        let mut config = Config::default();
        config.sandbox.temp_dir = temp_dir.display().to_string();
        config.sandbox.backend = backend.to_string();
        config
    }

    fn write_output(path: &Path) -> bool {
        std::fs::write(path, b"%PDF-1.4").unwrap();
        true
    }

    #[tokio::test]
    async fn test_fallback_reaches_only_working_backend() {
        for configured in ["auto", "firejail", "bubblewrap", "podman", "docker"] {
            let tmp = tempfile::tempdir().unwrap();
            let mut runner = MockBackendRunner::new();
            runner
                .expect_run()
                .withf(|backend, _, _, _| *backend == SandboxBackend::Docker)
                .times(1)
                .returning(|_, _, path, _| write_output(path));
            runner
                .expect_run()
                .withf(|backend, _, _, _| *backend != SandboxBackend::Docker)
                .returning(|_, _, _, _| false);

            let downloader = SandboxedDownloader::from_capabilities(
                &test_config(tmp.path(), configured),
                all_available(),
                Box::new(runner),
            )
            .unwrap();

            let path = downloader
                .sandboxed_download("https://example.com/a.pdf", None)
                .await
                .unwrap_or_else(|| panic!("no result with {} configured", configured));
            assert!(path.starts_with(tmp.path()));
            assert!(path.exists());
        }
    }

    #[tokio::test]
    async fn test_attempts_are_ordered_and_skip_first_choice() {
        let tmp = tempfile::tempdir().unwrap();
        let mut seq = Sequence::new();
        let mut runner = MockBackendRunner::new();
        for backend in [
            SandboxBackend::Podman,
            SandboxBackend::Firejail,
            SandboxBackend::Bubblewrap,
            SandboxBackend::Docker,
        ] {
            runner
                .expect_run()
                .withf(move |b, _, _, _| *b == backend)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _, _, _| false);
        }

        let downloader = SandboxedDownloader::from_capabilities(
            &test_config(tmp.path(), "podman"),
            all_available(),
            Box::new(runner),
        )
        .unwrap();
        assert!(
            downloader
                .sandboxed_download("https://example.com/a.pdf", None)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_unavailable_backends_are_never_tried() {
        let tmp = tempfile::tempdir().unwrap();
        let caps = Capabilities::from_availability(
            Platform::Linux,
            BTreeMap::from([(SandboxBackend::Bubblewrap, true)]),
        )
        .unwrap();

        let mut runner = MockBackendRunner::new();
        runner
            .expect_run()
            .withf(|b, _, _, _| *b == SandboxBackend::Bubblewrap)
            .times(1)
            .returning(|_, _, _, _| false);

        // Configured docker is unavailable: only bubblewrap gets a try
        let downloader = SandboxedDownloader::from_capabilities(
            &test_config(tmp.path(), "docker"),
            caps,
            Box::new(runner),
        )
        .unwrap();
        assert_eq!(downloader.attempt_order(), vec![SandboxBackend::Bubblewrap]);
        assert!(
            downloader
                .sandboxed_download("https://example.com/a.pdf", None)
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_total_failure_leaves_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let mut runner = MockBackendRunner::new();
        runner.expect_run().times(4).returning(|_, _, path, _| {
            // Leave a partial file behind each time
            std::fs::write(path, b"partial").unwrap();
            false
        });

        let downloader = SandboxedDownloader::from_capabilities(
            &test_config(tmp.path(), "auto"),
            all_available(),
            Box::new(runner),
        )
        .unwrap();

        let output = tmp.path().join("pre-created.tmp");
        std::fs::write(&output, b"stale").unwrap();

        let result = downloader
            .sandboxed_download("https://example.com/a.pdf", Some(&output))
            .await;
        assert!(result.is_none());
        assert!(!output.exists());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_explicit_output_path_is_used() {
        let tmp = tempfile::tempdir().unwrap();
        let output = tmp.path().join("chosen.bin");
        let expected = output.clone();

        let mut runner = MockBackendRunner::new();
        runner
            .expect_run()
            .withf(move |b, url, path, _| {
                *b == SandboxBackend::Firejail && url == "https://example.com/x" && path == expected
            })
            .times(1)
            .returning(|_, _, path, _| write_output(path));

        let downloader = SandboxedDownloader::from_capabilities(
            &test_config(tmp.path(), "auto"),
            all_available(),
            Box::new(runner),
        )
        .unwrap();
        assert_eq!(
            downloader
                .sandboxed_download("https://example.com/x", Some(&output))
                .await,
            Some(output)
        );
    }

    #[test]
    fn test_construction_rejects_bad_timeouts() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path(), "auto");
        config.sandbox.process_timeout_secs = config.sandbox.sandbox_timeout_secs;

        let result = SandboxedDownloader::from_capabilities(
            &config,
            all_available(),
            Box::new(MockBackendRunner::new()),
        );
        assert!(matches!(result, Err(SandboxError::InvalidTimeouts { .. })));
    }

    #[tokio::test]
    async fn test_construction_fails_without_backends() {
        let mut probe = super::super::detect::MockHostProbe::new();
        probe.expect_platform().return_const(Platform::Linux);
        probe.expect_find_binary().returning(|_| None);
        probe.expect_runtime_responds().returning(|_, _| false);

        let result = SandboxedDownloader::with_probe(&Config::default(), &probe).await;
        assert!(matches!(
            result,
            Err(SandboxError::NoBackendAvailable {
                platform: Platform::Linux
            })
        ));
    }

    #[test]
    fn test_security_report() {
        let tmp = tempfile::tempdir().unwrap();
        let caps = Capabilities::from_availability(
            Platform::Linux,
            BTreeMap::from([(SandboxBackend::Docker, true)]),
        )
        .unwrap();
        let downloader = SandboxedDownloader::from_capabilities(
            &test_config(tmp.path(), "auto"),
            caps,
            Box::new(MockBackendRunner::new()),
        )
        .unwrap()
        .with_isolation_level(IsolationLevel::Paranoid);

        let report = downloader.security_report();
        assert_eq!(report.platform, Platform::Linux);
        assert_eq!(report.recommended_backend, SandboxBackend::Docker);
        assert_eq!(report.current_backend, SandboxBackend::Docker);
        assert_eq!(report.isolation_level, IsolationLevel::Paranoid);
        assert_eq!(report.max_isolation_level, IsolationLevel::Strict);
        assert_eq!(report.available_backends.get(&SandboxBackend::Auto), Some(&true));
        assert_eq!(
            report.available_backends.get(&SandboxBackend::Firejail),
            Some(&false)
        );

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["current_backend"], "docker");
        assert_eq!(json["max_isolation_level"], "strict");
        assert_eq!(json["available_backends"]["docker"], true);
    }

    #[test]
    fn test_with_backend_override() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = SandboxedDownloader::from_capabilities(
            &test_config(tmp.path(), "auto"),
            all_available(),
            Box::new(MockBackendRunner::new()),
        )
        .unwrap();
        assert_eq!(downloader.backend(), SandboxBackend::Firejail);

        let downloader = downloader.with_backend(SandboxBackend::Docker);
        assert_eq!(downloader.backend(), SandboxBackend::Docker);
        assert_eq!(
            downloader.attempt_order(),
            vec![
                SandboxBackend::Docker,
                SandboxBackend::Firejail,
                SandboxBackend::Bubblewrap,
                SandboxBackend::Podman
            ]
        );
    }

    #[test]
    fn test_temp_output_paths_are_random() {
        let tmp = tempfile::tempdir().unwrap();
        let downloader = SandboxedDownloader::from_capabilities(
            &test_config(tmp.path(), "auto"),
            all_available(),
            Box::new(MockBackendRunner::new()),
        )
        .unwrap();

        let a = downloader.temp_output_path();
        let b = downloader.temp_output_path();
        assert_ne!(a, b);
        assert!(a.starts_with(tmp.path()));
        assert!(a.to_string_lossy().ends_with(".tmp"));
        assert!(!a.exists());
    }
}
