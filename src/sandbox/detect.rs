use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::error::SandboxError;
use super::policy::{IsolationLevel, SandboxBackend};

/// How long `docker info` / `podman info` may take before the runtime is
/// considered unavailable.
pub const RUNTIME_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Host operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    Macos,
    Windows,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "linux" => Platform::Linux,
            "macos" => Platform::Macos,
            "windows" => Platform::Windows,
            _ => Platform::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Macos => "macos",
            Platform::Windows => "windows",
            Platform::Other => "other",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host queries needed to decide which backends are usable.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostProbe: Send + Sync {
    /// Operating system family of the host.
    fn platform(&self) -> Platform;

    /// Locate an executable on PATH.
    fn find_binary(&self, name: &str) -> Option<PathBuf>;

    /// Whether `<program> info` exits successfully within `timeout`.
    async fn runtime_responds(&self, program: &Path, timeout: Duration) -> bool;
}

/// Probes the real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

#[async_trait]
impl HostProbe for SystemProbe {
    fn platform(&self) -> Platform {
        Platform::current()
    }

    fn find_binary(&self, name: &str) -> Option<PathBuf> {
        find_in_path(name, std::env::var_os("PATH")?)
    }

    async fn runtime_responds(&self, program: &Path, timeout: Duration) -> bool {
        let status = tokio::time::timeout(
            timeout,
            tokio::process::Command::new(program)
                .arg("info")
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .kill_on_drop(true)
                .status(),
        )
        .await;

        match status {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!("{} info failed to run: {}", program.display(), e);
                false
            }
            Err(_) => {
                debug!(
                    "{} info did not answer within {}s",
                    program.display(),
                    timeout.as_secs()
                );
                false
            }
        }
    }
}

/// Search a PATH-style variable for an executable file.
pub fn find_in_path(name: &str, path_var: impl AsRef<std::ffi::OsStr>) -> Option<PathBuf> {
    for dir in std::env::split_paths(path_var.as_ref()) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let exe = dir.join(format!("{}.exe", name));
            if is_executable(&exe) {
                return Some(exe);
            }
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }

    #[cfg(not(unix))]
    {
        true
    }
}

/// Priority sequence used both for auto-selection and for fallback.
///
/// Dedicated Linux sandboxes first, then container runtimes. Linux prefers
/// rootless/daemonless podman; elsewhere docker is the generic runtime.
pub fn fallback_order(platform: Platform) -> [SandboxBackend; 4] {
    match platform {
        Platform::Linux => [
            SandboxBackend::Firejail,
            SandboxBackend::Bubblewrap,
            SandboxBackend::Podman,
            SandboxBackend::Docker,
        ],
        _ => [
            SandboxBackend::Firejail,
            SandboxBackend::Bubblewrap,
            SandboxBackend::Docker,
            SandboxBackend::Podman,
        ],
    }
}

/// Pick the strongest available backend, or refuse.
pub fn rank(
    platform: Platform,
    available: &BTreeMap<SandboxBackend, bool>,
) -> Result<SandboxBackend, SandboxError> {
    fallback_order(platform)
        .into_iter()
        .find(|backend| available.get(backend).copied().unwrap_or(false))
        .ok_or(SandboxError::NoBackendAvailable { platform })
}

/// Detected sandbox capabilities of the current host.
#[derive(Debug, Clone)]
pub struct Capabilities {
    platform: Platform,
    available: BTreeMap<SandboxBackend, bool>,
    recommended: SandboxBackend,
}

impl Capabilities {
    /// Probe the host and rank what was found.
    ///
    /// Individual probe failures only mark a backend unavailable; the single
    /// error is "nothing usable at all".
    pub async fn detect(probe: &dyn HostProbe) -> Result<Self, SandboxError> {
        let platform = probe.platform();
        let mut available = BTreeMap::new();

        for backend in [SandboxBackend::Firejail, SandboxBackend::Bubblewrap] {
            let found = platform == Platform::Linux
                && backend
                    .binary()
                    .and_then(|name| probe.find_binary(name))
                    .is_some();
            available.insert(backend, found);
        }

        for backend in [SandboxBackend::Docker, SandboxBackend::Podman] {
            let found = match backend.binary().and_then(|name| probe.find_binary(name)) {
                Some(program) => {
                    probe
                        .runtime_responds(&program, RUNTIME_PROBE_TIMEOUT)
                        .await
                }
                None => false,
            };
            available.insert(backend, found);
        }

        debug!("Sandbox probe on {}: {:?}", platform, available);
        Self::from_availability(platform, available)
    }

    /// Build capabilities from a known availability map.
    pub fn from_availability(
        platform: Platform,
        mut available: BTreeMap<SandboxBackend, bool>,
    ) -> Result<Self, SandboxError> {
        available.insert(SandboxBackend::Auto, true);
        for backend in SandboxBackend::CONCRETE {
            available.entry(backend).or_insert(false);
        }
        let recommended = rank(platform, &available)?;
        Ok(Self {
            platform,
            available,
            recommended,
        })
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Availability of every backend, `Auto` included.
    pub fn available_backends(&self) -> &BTreeMap<SandboxBackend, bool> {
        &self.available
    }

    pub fn is_available(&self, backend: SandboxBackend) -> bool {
        self.available.get(&backend).copied().unwrap_or(false)
    }

    pub fn recommended_backend(&self) -> SandboxBackend {
        self.recommended
    }

    pub fn fallback_order(&self) -> [SandboxBackend; 4] {
        fallback_order(self.platform)
    }

    /// Strongest isolation tier the host can provide.
    pub fn max_isolation_level(&self) -> IsolationLevel {
        if self.is_available(SandboxBackend::Firejail)
            || self.is_available(SandboxBackend::Bubblewrap)
        {
            IsolationLevel::Paranoid
        } else if self.is_available(SandboxBackend::Docker)
            || self.is_available(SandboxBackend::Podman)
        {
            IsolationLevel::Strict
        } else {
            IsolationLevel::Basic
        }
    }

    /// Human-readable status lines for `sandbox status`.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        lines.push(format!("  Platform:    {}", self.platform));
        for backend in self.fallback_order() {
            let mark = if self.is_available(backend) {
                "available       ok"
            } else {
                "not available   --"
            };
            lines.push(format!("  {:<12} {}", format!("{}:", backend), mark));
        }
        lines.push(format!("  Recommended: {}", self.recommended));
        lines.push(format!("  Max level:   {}", self.max_isolation_level()));

        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn availability(
        firejail: bool,
        bubblewrap: bool,
        podman: bool,
        docker: bool,
    ) -> BTreeMap<SandboxBackend, bool> {
        BTreeMap::from([
            (SandboxBackend::Firejail, firejail),
            (SandboxBackend::Bubblewrap, bubblewrap),
            (SandboxBackend::Podman, podman),
            (SandboxBackend::Docker, docker),
        ])
    }

    fn probe_with(
        platform: Platform,
        binaries: &'static [&'static str],
        responding: bool,
    ) -> MockHostProbe {
        let mut probe = MockHostProbe::new();
        probe.expect_platform().return_const(platform);
        probe
            .expect_find_binary()
            .returning(move |name| {
                binaries
                    .contains(&name)
                    .then(|| PathBuf::from(format!("/usr/bin/{}", name)))
            });
        probe
            .expect_runtime_responds()
            .returning(move |_, _| responding);
        probe
    }

    #[test]
    fn test_recommended_backend_for_every_combination() {
        for mask in 0u8..16 {
            let (firejail, bubblewrap, podman, docker) =
                (mask & 1 != 0, mask & 2 != 0, mask & 4 != 0, mask & 8 != 0);
            let result = Capabilities::from_availability(
                Platform::Linux,
                availability(firejail, bubblewrap, podman, docker),
            );

            if mask == 0 {
                assert!(matches!(result, Err(SandboxError::NoBackendAvailable { .. })));
                continue;
            }

            let caps = result.unwrap();
            let expected = if firejail {
                SandboxBackend::Firejail
            } else if bubblewrap {
                SandboxBackend::Bubblewrap
            } else if podman {
                SandboxBackend::Podman
            } else {
                SandboxBackend::Docker
            };
            assert_eq!(caps.recommended_backend(), expected, "mask {:04b}", mask);

            // The reported tier always matches the tier of the pick.
            assert_eq!(
                caps.max_isolation_level(),
                caps.recommended_backend().isolation_level(),
                "mask {:04b}",
                mask
            );
            assert!(caps.is_available(SandboxBackend::Auto));
            assert!(
                SandboxBackend::CONCRETE
                    .iter()
                    .any(|backend| caps.is_available(*backend))
            );
        }
    }

    #[test]
    fn test_docker_only_on_linux() {
        let docker_only = availability(false, false, false, true);
        let caps = Capabilities::from_availability(Platform::Linux, docker_only).unwrap();
        assert_eq!(caps.recommended_backend(), SandboxBackend::Docker);
        assert_eq!(caps.max_isolation_level(), IsolationLevel::Strict);
    }

    #[test]
    fn test_firejail_beats_bubblewrap() {
        let caps =
            Capabilities::from_availability(Platform::Linux, availability(true, true, false, false))
                .unwrap();
        assert_eq!(caps.recommended_backend(), SandboxBackend::Firejail);
        assert_eq!(caps.max_isolation_level(), IsolationLevel::Paranoid);
    }

    #[test]
    fn test_container_preference_depends_on_platform() {
        let both = availability(false, false, true, true);

        let linux = Capabilities::from_availability(Platform::Linux, both.clone()).unwrap();
        assert_eq!(linux.recommended_backend(), SandboxBackend::Podman);

        let macos = Capabilities::from_availability(Platform::Macos, both).unwrap();
        assert_eq!(macos.recommended_backend(), SandboxBackend::Docker);

        let podman_only = Capabilities::from_availability(
            Platform::Macos,
            availability(false, false, true, false),
        )
        .unwrap();
        assert_eq!(podman_only.recommended_backend(), SandboxBackend::Podman);
    }

    #[test]
    fn test_fallback_order() {
        assert_eq!(
            fallback_order(Platform::Linux),
            [
                SandboxBackend::Firejail,
                SandboxBackend::Bubblewrap,
                SandboxBackend::Podman,
                SandboxBackend::Docker
            ]
        );
        assert_eq!(
            fallback_order(Platform::Windows),
            [
                SandboxBackend::Firejail,
                SandboxBackend::Bubblewrap,
                SandboxBackend::Docker,
                SandboxBackend::Podman
            ]
        );
    }

    #[test]
    fn test_isolation_without_concrete_backends_is_basic() {
        // Not constructible through `from_availability`, so build it directly.
        let caps = Capabilities {
            platform: Platform::Linux,
            available: BTreeMap::from([(SandboxBackend::Auto, true)]),
            recommended: SandboxBackend::Auto,
        };
        assert_eq!(caps.max_isolation_level(), IsolationLevel::Basic);
    }

    #[tokio::test]
    async fn test_detect_nothing_installed_fails() {
        let probe = probe_with(Platform::Linux, &[], false);
        let err = Capabilities::detect(&probe).await.unwrap_err();
        assert!(err.to_string().contains("no suitable sandbox backend"));
    }

    #[tokio::test]
    async fn test_detect_runtime_present_but_not_running() {
        let probe = probe_with(Platform::Linux, &["docker", "podman"], false);
        assert!(Capabilities::detect(&probe).await.is_err());
    }

    #[tokio::test]
    async fn test_detect_linux_tools_ignored_off_linux() {
        let probe = probe_with(Platform::Macos, &["firejail", "bwrap", "docker"], true);
        let caps = Capabilities::detect(&probe).await.unwrap();

        assert!(!caps.is_available(SandboxBackend::Firejail));
        assert!(!caps.is_available(SandboxBackend::Bubblewrap));
        assert!(caps.is_available(SandboxBackend::Docker));
        assert!(!caps.is_available(SandboxBackend::Podman));
        assert_eq!(caps.recommended_backend(), SandboxBackend::Docker);
        assert_eq!(caps.platform(), Platform::Macos);
    }

    #[tokio::test]
    async fn test_detect_runtime_probe_uses_found_binary() {
        let mut probe = MockHostProbe::new();
        probe.expect_platform().return_const(Platform::Linux);
        probe.expect_find_binary().returning(|name| {
            (name == "docker").then(|| PathBuf::from("/opt/bin/docker"))
        });
        probe
            .expect_runtime_responds()
            .withf(|program, timeout| {
                program == Path::new("/opt/bin/docker") && *timeout == RUNTIME_PROBE_TIMEOUT
            })
            .times(1)
            .returning(|_, _| true);

        let caps = Capabilities::detect(&probe).await.unwrap();
        assert_eq!(caps.recommended_backend(), SandboxBackend::Docker);
    }

    #[test]
    fn test_find_in_path() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = tmp.path().join("fake-sandbox-tool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let dirs = [PathBuf::from("/nonexistent"), tmp.path().to_path_buf()];
        let path_var = std::env::join_paths(dirs).unwrap();
        assert_eq!(find_in_path("fake-sandbox-tool", &path_var), Some(tool));
        assert_eq!(find_in_path("missing-tool", &path_var), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_find_in_path_skips_non_executable() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("plain-file"), "data").unwrap();
        assert_eq!(find_in_path("plain-file", tmp.path()), None);
    }

    #[tokio::test]
    async fn test_system_probe_missing_runtime_is_unavailable() {
        let probe = SystemProbe;
        assert!(
            !probe
                .runtime_responds(Path::new("/nonexistent/docker"), Duration::from_secs(1))
                .await
        );
    }

    #[test]
    fn test_status_lines() {
        let caps =
            Capabilities::from_availability(Platform::Linux, availability(false, true, false, true))
                .unwrap();
        let lines = caps.status_lines();
        assert!(lines.iter().any(|l| l.contains("bubblewrap:") && l.contains("ok")));
        assert!(lines.iter().any(|l| l.contains("Recommended: bubblewrap")));
        assert!(lines.iter().any(|l| l.contains("Max level:   paranoid")));
    }
}
