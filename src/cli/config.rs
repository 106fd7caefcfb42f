use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

use defuse::config::{Config, DEFAULT_CONFIG_TEMPLATE};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Get a configuration value
    Get {
        /// Config key (e.g., sandbox.backend)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Config key (e.g., sandbox.backend)
        key: String,

        /// Value to set
        value: String,
    },

    /// Show config file path
    Path,

    /// Initialize default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },

    /// Allow downloads from a domain (and its subdomains)
    AddDomain {
        /// Domain name, e.g. example.com
        domain: String,
    },

    /// Check the configuration for inconsistent values
    Validate,
}

pub async fn run(args: ConfigArgs, config_path: Option<&Path>) -> Result<()> {
    match args.command {
        ConfigCommands::Show { format } => show_config(&format, config_path),
        ConfigCommands::Get { key } => get_config(&key, config_path),
        ConfigCommands::Set { key, value } => set_config(&key, &value, config_path),
        ConfigCommands::Path => show_path(config_path),
        ConfigCommands::Init { force } => init_config(force, config_path),
        ConfigCommands::AddDomain { domain } => add_domain(&domain, config_path),
        ConfigCommands::Validate => validate_config(config_path),
    }
}

fn show_config(format: &str, config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        _ => {
            let toml = toml::to_string_pretty(&config)?;
            println!("{}", toml);
        }
    }

    Ok(())
}

fn get_config(key: &str, config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let value = config.get_value(key)?;
    println!("{}", value);
    Ok(())
}

fn set_config(key: &str, value: &str, config_path: Option<&Path>) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    config.set_value(key, value)?;
    config.save()?;
    println!("Set {} = {}", key, value);
    Ok(())
}

fn resolve_path(config_path: Option<&Path>) -> Result<PathBuf> {
    match config_path {
        Some(p) => Ok(p.to_path_buf()),
        None => Config::config_path(),
    }
}

fn show_path(config_path: Option<&Path>) -> Result<()> {
    println!("{}", resolve_path(config_path)?.display());
    Ok(())
}

fn init_config(force: bool, config_path: Option<&Path>) -> Result<()> {
    let path = resolve_path(config_path)?;

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;

    println!("Created config file at {}", path.display());
    Ok(())
}

fn add_domain(domain: &str, config_path: Option<&Path>) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    if config.add_allowed_domain(domain)? {
        config.save()?;
        println!("Added allowed domain: {}", domain);
    } else {
        println!("Domain already allowed: {}", domain);
    }
    Ok(())
}

fn validate_config(config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let problems = config.validate();

    if problems.is_empty() {
        println!("{}: ok", config.file_path().display());
        return Ok(());
    }

    for problem in &problems {
        println!("  {}", problem);
    }
    anyhow::bail!("{} problem(s) in {}", problems.len(), config.file_path().display())
}
