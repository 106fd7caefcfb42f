//! Errors raised by the sandbox engine.
//!
//! Only construction-time problems are errors. Fetch failures inside a
//! backend are reported as `false`/`None` so the fallback loop can move on.

use thiserror::Error;

use super::detect::Platform;

#[derive(Debug, Error)]
pub enum SandboxError {
    /// None of firejail, bubblewrap, podman or docker is usable on this host.
    #[error(
        "no suitable sandbox backend available on {platform}: \
         install firejail or bubblewrap (Linux), or a running podman/docker"
    )]
    NoBackendAvailable { platform: Platform },

    /// The outer process timeout must leave room for the sandbox's own timeout.
    #[error(
        "process timeout ({outer_secs}s) must be longer than the sandbox timeout ({inner_secs}s)"
    )]
    InvalidTimeouts { inner_secs: u64, outer_secs: u64 },
}
