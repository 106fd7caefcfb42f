//! XDG Base Directory Specification compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. defuse-specific env var (DEFUSE_CONFIG_DIR, etc.)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG spec.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolved directory paths for the entire application.
///
/// Created once at startup, threaded through Config.
/// All paths are absolute.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Config directory: config.toml lives here
    pub config_dir: PathBuf,

    /// Cache directory: in-flight downloads and sandbox staging
    pub cache_dir: PathBuf,

    /// Where sanitized PDFs land unless configured otherwise
    pub download_dir: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "DEFUSE_CONFIG_DIR", || {
            strategy.config_dir().join("defuse")
        });

        let cache_dir = env_or(&env_fn, "DEFUSE_CACHE_DIR", || {
            strategy.cache_dir().join("defuse")
        });

        let download_dir = env_or(&env_fn, "DEFUSE_OUTPUT_DIR", || {
            directories::UserDirs::new()
                .and_then(|dirs| dirs.download_dir().map(Path::to_path_buf))
                .unwrap_or_else(|| strategy.home_dir().join("Downloads"))
        });

        Ok(Self {
            config_dir,
            cache_dir,
            download_dir,
        })
    }

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Default sandbox temp directory: cache_dir/downloads
    ///
    /// Kept out of `/tmp` because firejail's `--private-tmp` would hide
    /// anything written there from the host.
    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir.join("downloads")
    }

    /// Create all directories with appropriate permissions.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.cache_dir, &self.downloads_dir()] {
            create_dir_with_mode(dir)?;
        }
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            // Fallback when no base directories resolve
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            Self {
                config_dir: home.join(".config").join("defuse"),
                cache_dir: home.join(".cache").join("defuse"),
                download_dir: home.join("Downloads"),
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths per XDG spec.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute()) // XDG spec: ignore relative paths
        .unwrap_or_else(default)
}

/// Create a directory with mode 0700 per XDG spec.
pub fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}
