//! Sandboxed document fetching.
//!
//! The host is probed for isolation tools (firejail, bubblewrap, podman,
//! docker), the strongest one is picked, and the fetch runs inside it. If a
//! backend fails the next one in the fixed fallback order is tried; there is
//! never an unsandboxed fetch.
//!
//! The fetch itself is done by this same binary re-executed under the name
//! "defuse-fetch" (argv[0] dispatch in `main`), with all parameters passed
//! as one JSON argument.

pub mod backends;
pub mod child;
pub mod detect;
pub mod downloader;
pub mod error;
pub mod executor;
pub mod fetch;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod policy;

pub use child::{fetch_child_main, is_helper_invocation};
pub use detect::{Capabilities, HostProbe, Platform, SystemProbe};
pub use downloader::{BackendRunner, SandboxRunner, SandboxedDownloader, SecurityReport};
pub use error::SandboxError;
pub use policy::{FetchRequest, IsolationLevel, SandboxBackend, TimeoutPair};
