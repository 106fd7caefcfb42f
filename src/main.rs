use anyhow::Result;
use clap::Parser;

mod cli;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    // argv[0] dispatch: if re-exec'd as "defuse-fetch" inside a sandbox,
    // enter the fetch helper immediately, before Tokio, Clap or logging.
    if let Some(arg0) = std::env::args_os().next()
        && defuse::sandbox::is_helper_invocation(&arg0.to_string_lossy())
    {
        defuse::sandbox::fetch_child_main();
    }

    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();

    // Logging: RUST_LOG, then --verbose, then the configured level
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        defuse::Config::load_with(config_path)
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level)),
        )
        .init();

    match cli.command {
        Commands::Download(args) => cli::download::run(args, config_path).await,
        Commands::Sanitize(args) => cli::sanitize::run(args, config_path).await,
        Commands::Batch(args) => cli::batch::run(args, config_path).await,
        Commands::CheckDeps => cli::check_deps::run(config_path).await,
        Commands::Sandbox(args) => cli::sandbox::run(args, config_path).await,
        Commands::Config(args) => cli::config::run(args, config_path).await,
        Commands::Paths => cli::paths::run(config_path),
        Commands::Clean(args) => cli::clean::run(args, config_path).await,
    }
}
