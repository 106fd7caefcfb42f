pub mod batch;
pub mod check_deps;
pub mod clean;
pub mod config;
pub mod download;
pub mod paths;
pub mod sandbox;
pub mod sanitize;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use defuse::config::Config;
use defuse::sandbox::Platform;

#[derive(Parser)]
#[command(name = "defuse")]
#[command(
    author,
    version,
    about = "Download untrusted documents inside a sandbox and convert them to safe PDFs"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "DEFUSE_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download a document in a sandbox and sanitize it
    Download(download::DownloadArgs),

    /// Sanitize a local document
    Sanitize(sanitize::SanitizeArgs),

    /// Download and sanitize every URL listed in a file
    Batch(batch::BatchArgs),

    /// Check for Dangerzone and sandbox tools
    CheckDeps,

    /// Sandbox capabilities and diagnostics
    Sandbox(sandbox::SandboxArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved directory paths
    Paths,

    /// Remove leftover downloads from the temp directory
    Clean(clean::CleanArgs),
}

pub fn load_config(path: Option<&Path>) -> Result<Config> {
    Config::load_with(path)
}

/// Install instructions for the sandbox tools on this platform.
pub fn sandbox_install_hints() -> Vec<&'static str> {
    match Platform::current() {
        Platform::Linux => vec![
            "  sudo apt install firejail bubblewrap   # Debian/Ubuntu",
            "  sudo dnf install firejail bubblewrap   # Fedora",
            "  or a container runtime: podman (package manager)",
            "  or Docker (https://docs.docker.com/engine/install/)",
        ],
        Platform::Macos => vec![
            "  Install Docker Desktop: https://docker.com/products/docker-desktop",
            "  or Podman: brew install podman && podman machine init && podman machine start",
        ],
        _ => vec!["  Install Docker Desktop: https://docker.com/products/docker-desktop"],
    }
}

/// Install instructions for dangerzone-cli on this platform.
pub fn dangerzone_install_hints() -> Vec<&'static str> {
    match Platform::current() {
        Platform::Macos => vec![
            "  Download from: https://dangerzone.rocks",
            "  or use Homebrew: brew install --cask dangerzone",
        ],
        _ => vec![
            "  Install from: https://dangerzone.rocks",
            "  or use your package manager",
        ],
    }
}
