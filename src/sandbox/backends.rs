//! Per-backend invocations of the fetch helper.
//!
//! Each backend has a pure builder returning an [`Invocation`] (so the
//! security-relevant flags can be inspected) and an async runner that
//! executes it under the outer timeout. Runners never fail: every problem
//! is logged and reported as `false`.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::child::HELPER_NAME;
use super::executor::{Invocation, run_with_timeout};
use super::policy::{FetchRequest, TimeoutPair, build_fetch_request};
use crate::config::SandboxConfig;

/// Where the output directory is mounted inside bubblewrap and containers.
pub const SANDBOX_OUTPUT_DIR: &str = "/output";

/// Helper location inside containers.
pub const CONTAINER_HELPER_PATH: &str = "/usr/local/bin/defuse-fetch";

/// Helper location inside bubblewrap.
pub const BWRAP_HELPER_PATH: &str = "/tmp/defuse-fetch";

/// Container `/tmp`: small, not executable.
const CONTAINER_TMPFS: &str = "/tmp:noexec,nosuid,size=100m";

/// Docker relative CPU weight (default is 1024).
const DOCKER_CPU_SHARES: &str = "512";

/// Podman CPU quota.
const PODMAN_CPUS: &str = "0.5";

/// Bound on `<runtime> rm -f` after a failed run.
const CONTAINER_REMOVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Firejail file-descriptor limit.
const FIREJAIL_NOFILE: u32 = 64;

/// System directories bound read-only into bubblewrap.
const BWRAP_SYSTEM_DIRS: [&str; 3] = ["/usr", "/bin", "/lib"];

/// Bound when present: multilib loader dir, plus what DNS and TLS need.
const BWRAP_OPTIONAL_DIRS: [&str; 7] = [
    "/lib64",
    "/etc/resolv.conf",
    "/etc/hosts",
    "/etc/nsswitch.conf",
    "/etc/ssl",
    "/etc/pki",
    "/etc/ca-certificates",
];

/// Container runtime flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl ContainerRuntime {
    pub fn program(self) -> &'static str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Podman => "podman",
        }
    }
}

/// Format seconds as firejail's `hh:mm:ss`.
pub fn firejail_timeout(secs: u64) -> String {
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Build the firejail command line.
///
/// `helper` must be a path whose file name is `defuse-fetch` (see
/// [`HelperStage`]); the request carries host paths since firejail shares
/// the host filesystem view.
pub fn firejail_invocation(
    helper: &Path,
    request: &FetchRequest,
    config: &SandboxConfig,
    timeouts: &TimeoutPair,
) -> anyhow::Result<Invocation> {
    let request_json = serde_json::to_string(request)?;

    Ok(Invocation::new("firejail")
        .args([
            "--noprofile",
            "--seccomp",
            "--noroot",
            "--nonewprivs",
            "--caps.drop=all",
            "--private-tmp",
            "--private-dev",
            "--quiet",
        ])
        .arg(format!("--rlimit-fsize={}", config.max_file_size_bytes))
        .arg(format!("--rlimit-nofile={}", FIREJAIL_NOFILE))
        .arg(format!("--rlimit-nproc={}", config.max_processes))
        .arg(format!("--timeout={}", firejail_timeout(timeouts.inner().as_secs())))
        .arg(helper)
        .arg(request_json))
}

/// Build the bubblewrap command line.
///
/// `request.output_path` must already be rewritten to live under
/// [`SANDBOX_OUTPUT_DIR`].
pub fn bubblewrap_invocation(
    helper: &Path,
    output_dir: &Path,
    request: &FetchRequest,
) -> anyhow::Result<Invocation> {
    let request_json = serde_json::to_string(request)?;

    let mut inv = Invocation::new("bwrap").args([
        "--die-with-parent",
        "--new-session",
        "--unshare-pid",
        "--unshare-ipc",
        "--unshare-uts",
        "--unshare-cgroup-try",
        "--tmpfs",
        "/tmp",
        "--proc",
        "/proc",
        "--dev",
        "/dev",
    ]);

    for dir in BWRAP_SYSTEM_DIRS {
        inv = inv.args(["--ro-bind", dir, dir]);
    }
    for dir in BWRAP_OPTIONAL_DIRS {
        inv = inv.args(["--ro-bind-try", dir, dir]);
    }

    Ok(inv
        .arg("--ro-bind")
        .arg(helper)
        .arg(BWRAP_HELPER_PATH)
        .arg("--bind")
        .arg(output_dir)
        .arg(SANDBOX_OUTPUT_DIR)
        .arg(BWRAP_HELPER_PATH)
        .arg(request_json))
}

/// Build the docker/podman command line.
pub fn container_invocation(
    runtime: ContainerRuntime,
    name: &str,
    helper: &Path,
    output_dir: &Path,
    request: &FetchRequest,
    config: &SandboxConfig,
) -> anyhow::Result<Invocation> {
    let request_json = serde_json::to_string(request)?;

    let mut inv = Invocation::new(runtime.program())
        .args(["run", "--rm"])
        .opt("--name", name)
        .opt("--network", "bridge")
        .opt("--memory", format!("{}m", config.max_memory_mb));

    inv = match runtime {
        ContainerRuntime::Docker => inv.opt("--cpu-shares", DOCKER_CPU_SHARES),
        ContainerRuntime::Podman => inv.opt("--cpus", PODMAN_CPUS),
    };

    inv = inv
        .opt("--pids-limit", config.max_processes.to_string())
        .opt("--security-opt", "no-new-privileges:true")
        .opt("--cap-drop", "ALL")
        .arg("--read-only")
        .opt("--tmpfs", CONTAINER_TMPFS)
        .opt("--volume", volume(output_dir, SANDBOX_OUTPUT_DIR, "rw"))
        .opt("--volume", volume(helper, CONTAINER_HELPER_PATH, "ro"));

    // Rootful docker would otherwise write the file as root; rootless
    // podman already maps container root to the caller.
    #[cfg(unix)]
    {
        if runtime == ContainerRuntime::Docker {
            let uid = nix::unistd::getuid().as_raw();
            let gid = nix::unistd::getgid().as_raw();
            inv = inv.opt("--user", format!("{}:{}", uid, gid));
        }
    }

    Ok(inv
        .opt("--entrypoint", CONTAINER_HELPER_PATH)
        .arg(config.container_image.as_str())
        .arg(request_json))
}

fn volume(host: &Path, target: &str, mode: &str) -> OsString {
    let mut mapping = host.as_os_str().to_os_string();
    mapping.push(format!(":{}:{}", target, mode));
    mapping
}

/// Per-call staging directory exposing the helper as `defuse-fetch`.
///
/// Firejail executes the path it is given, so argv[0] dispatch needs a file
/// with the right name. The directory is removed on drop.
pub struct HelperStage {
    dir: tempfile::TempDir,
    path: PathBuf,
}

impl HelperStage {
    pub fn new(helper: &Path, parent: &Path) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(".defuse-stage-")
            .tempdir_in(parent)?;
        let path = dir.path().join(HELPER_NAME);

        #[cfg(unix)]
        std::os::unix::fs::symlink(helper, &path)?;
        #[cfg(not(unix))]
        std::fs::copy(helper, &path).map(|_| ())?;

        Ok(Self { dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

/// Executable mounted into sandboxes: the configured override, else this
/// binary.
pub fn resolve_helper(config: &SandboxConfig) -> Option<PathBuf> {
    let helper = match config.helper_path() {
        Some(path) => path,
        None => match std::env::current_exe() {
            Ok(path) => path,
            Err(e) => {
                warn!("Cannot locate the current executable: {}", e);
                return None;
            }
        },
    };

    match helper.canonicalize() {
        Ok(path) if path.is_file() => Some(path),
        _ => {
            warn!("Fetch helper not found at {}", helper.display());
            None
        }
    }
}

/// Random container name so a timed-out run can be removed.
pub fn container_name() -> String {
    format!("defuse-fetch-{}", uuid::Uuid::new_v4().simple())
}

/// Split an output path into (parent dir, file name).
fn split_output(output_path: &Path) -> Option<(PathBuf, OsString)> {
    let file_name = output_path.file_name()?.to_os_string();
    let parent = match output_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let parent = std::path::absolute(parent).ok()?;
    Some((parent, file_name))
}

/// Common preparation shared by all runners.
struct Prepared {
    helper: PathBuf,
    output_dir: PathBuf,
    file_name: OsString,
    timeouts: TimeoutPair,
}

fn prepare(backend: &str, output_path: &Path, config: &SandboxConfig) -> Option<Prepared> {
    let timeouts = match TimeoutPair::from_config(config) {
        Ok(t) => t,
        Err(e) => {
            warn!("{} download skipped: {}", backend, e);
            return None;
        }
    };
    let Some((output_dir, file_name)) = split_output(output_path) else {
        warn!(
            "{} download skipped: bad output path {}",
            backend,
            output_path.display()
        );
        return None;
    };
    if let Err(e) = std::fs::create_dir_all(&output_dir) {
        warn!(
            "{} download skipped: cannot create {}: {}",
            backend,
            output_dir.display(),
            e
        );
        return None;
    }
    let helper = resolve_helper(config)?;

    Some(Prepared {
        helper,
        output_dir,
        file_name,
        timeouts,
    })
}

/// Run an invocation and decide success: zero exit AND the file exists.
async fn execute(
    backend: &str,
    invocation: &Invocation,
    timeouts: &TimeoutPair,
    output_path: &Path,
) -> bool {
    debug!("{} invocation: {}", backend, invocation);

    match run_with_timeout(invocation, timeouts.outer()).await {
        Ok(output) if output.success && output_path.exists() => {
            info!("Downloaded {} using {}", output_path.display(), backend);
            true
        }
        Ok(output) if output.success => {
            warn!(
                "{} exited successfully but {} was not created",
                backend,
                output_path.display()
            );
            false
        }
        Ok(output) => {
            warn!(
                "{} download failed (exit {:?}): {}",
                backend,
                output.exit_code,
                output.last_stderr_line().unwrap_or("no output")
            );
            false
        }
        Err(e) => {
            warn!("{} download failed: {:#}", backend, e);
            false
        }
    }
}

pub async fn run_firejail_download(url: &str, output_path: &Path, config: &SandboxConfig) -> bool {
    let Some(prep) = prepare("firejail", output_path, config) else {
        return false;
    };

    let stage = match HelperStage::new(&prep.helper, &prep.output_dir) {
        Ok(stage) => stage,
        Err(e) => {
            warn!("firejail download skipped: cannot stage helper: {}", e);
            return false;
        }
    };
    debug!("Staged fetch helper in {}", stage.dir().display());

    let host_output = prep.output_dir.join(&prep.file_name);
    let request = build_fetch_request(config, url, &host_output);
    let invocation = match firejail_invocation(stage.path(), &request, config, &prep.timeouts) {
        Ok(inv) => inv,
        Err(e) => {
            warn!("firejail download skipped: {}", e);
            return false;
        }
    };

    execute("firejail", &invocation, &prep.timeouts, output_path).await
    // `stage` dropped here: staging directory removed on every path
}

pub async fn run_bubblewrap_download(
    url: &str,
    output_path: &Path,
    config: &SandboxConfig,
) -> bool {
    let Some(prep) = prepare("bubblewrap", output_path, config) else {
        return false;
    };

    let inner_output = Path::new(SANDBOX_OUTPUT_DIR).join(&prep.file_name);
    let request = build_fetch_request(config, url, &inner_output);
    let invocation = match bubblewrap_invocation(&prep.helper, &prep.output_dir, &request) {
        Ok(inv) => inv,
        Err(e) => {
            warn!("bubblewrap download skipped: {}", e);
            return false;
        }
    };

    execute("bubblewrap", &invocation, &prep.timeouts, output_path).await
}

pub async fn run_docker_download(url: &str, output_path: &Path, config: &SandboxConfig) -> bool {
    run_container_download(ContainerRuntime::Docker, url, output_path, config).await
}

pub async fn run_podman_download(url: &str, output_path: &Path, config: &SandboxConfig) -> bool {
    run_container_download(ContainerRuntime::Podman, url, output_path, config).await
}

async fn run_container_download(
    runtime: ContainerRuntime,
    url: &str,
    output_path: &Path,
    config: &SandboxConfig,
) -> bool {
    run_container_with(runtime, OsStr::new(runtime.program()), url, output_path, config).await
}

/// Container run through `program`, which stands in for the runtime binary.
async fn run_container_with(
    runtime: ContainerRuntime,
    program: &OsStr,
    url: &str,
    output_path: &Path,
    config: &SandboxConfig,
) -> bool {
    let backend = runtime.program();
    let Some(prep) = prepare(backend, output_path, config) else {
        return false;
    };

    let name = container_name();
    let inner_output = Path::new(SANDBOX_OUTPUT_DIR).join(&prep.file_name);
    let request = build_fetch_request(config, url, &inner_output);
    let mut invocation = match container_invocation(
        runtime,
        &name,
        &prep.helper,
        &prep.output_dir,
        &request,
        config,
    ) {
        Ok(inv) => inv,
        Err(e) => {
            warn!("{} download skipped: {}", backend, e);
            return false;
        }
    };

    invocation.program = program.to_os_string();

    let ok = execute(backend, &invocation, &prep.timeouts, output_path).await;
    if !ok {
        // `--rm` does not fire when the client is killed on timeout
        remove_container(program, &name).await;
    }
    ok
}

/// `<program> rm -f <name>`, best effort.
async fn remove_container(program: &OsStr, name: &str) {
    let inv = Invocation::new(program).args(["rm", "-f", name]);
    match run_with_timeout(&inv, CONTAINER_REMOVE_TIMEOUT).await {
        Ok(out) if out.success => debug!("Removed container {}", name),
        Ok(_) => debug!("Container {} already gone", name),
        Err(e) => debug!("Failed to remove container {}: {:#}", name, e),
    }
}
