use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use std::io::Write;
use std::path::Path;

use defuse::sandbox::{
    BackendRunner, Capabilities, SandboxError, SandboxRunner, SandboxedDownloader, SystemProbe,
};

/// URL fetched by `sandbox test` when none is given.
const DEFAULT_TEST_URL: &str = "https://example.com/";

#[derive(Args)]
pub struct SandboxArgs {
    #[command(subcommand)]
    pub command: SandboxCommands,
}

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Show sandbox capabilities and configuration
    Status,

    /// Fetch a URL through every available backend
    Test {
        /// URL to fetch
        #[arg(default_value = DEFAULT_TEST_URL)]
        url: String,
    },

    /// Print the security report
    Report {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

pub async fn run(args: SandboxArgs, config_path: Option<&Path>) -> Result<()> {
    match args.command {
        SandboxCommands::Status => run_status(config_path).await,
        SandboxCommands::Test { url } => run_test(&url, config_path).await,
        SandboxCommands::Report { json } => run_report(json, config_path).await,
    }
}

async fn detect_or_explain() -> Result<Capabilities> {
    match Capabilities::detect(&SystemProbe).await {
        Ok(caps) => Ok(caps),
        Err(e) => {
            explain(&e);
            Err(e.into())
        }
    }
}

fn explain(e: &SandboxError) {
    if let SandboxError::NoBackendAvailable { .. } = e {
        eprintln!("No sandbox backend installed. Install one of:");
        for hint in super::sandbox_install_hints() {
            eprintln!("{}", hint);
        }
    }
}

async fn run_status(config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let caps = detect_or_explain().await?;

    println!("Sandbox Capabilities:");
    for line in caps.status_lines() {
        println!("{}", line);
    }
    println!();

    let s = &config.sandbox;
    println!("Configuration:");
    println!("  Backend:     {}", s.backend);
    println!("  Level:       {}", s.isolation_level);
    println!("  Temp dir:    {}", config.temp_dir().display());
    println!(
        "  Timeouts:    download {}s, sandbox {}s, process {}s",
        s.download_timeout_secs, s.sandbox_timeout_secs, s.process_timeout_secs
    );
    println!("  Max fsize:   {} bytes", s.max_file_size_bytes);
    println!("  Max memory:  {} MB", s.max_memory_mb);
    println!("  Max CPU:     {}s", s.max_cpu_seconds);
    println!("  Max procs:   {}", s.max_processes);
    println!("  Image:       {}", s.container_image);
    if s.allowed_domains.is_empty() {
        println!("  Domains:     any");
    } else {
        println!("  Domains:     {}", s.allowed_domains.join(", "));
    }

    Ok(())
}

async fn run_test(url: &str, config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let caps = detect_or_explain().await?;
    let temp_dir = config.temp_dir();
    defuse::paths::create_dir_with_mode(&temp_dir)?;

    let backends: Vec<_> = caps
        .fallback_order()
        .into_iter()
        .filter(|b| caps.is_available(*b))
        .collect();

    println!("Fetching {} through each available backend...", url);
    println!();

    let runner = SandboxRunner;
    let mut passed = 0;
    let mut failed = 0;
    for (i, backend) in backends.iter().enumerate() {
        let output = temp_dir.join(format!("defuse-test-{}.tmp", uuid::Uuid::new_v4().simple()));
        print!("  [{}/{}] {:<12} ", i + 1, backends.len(), backend.to_string());
        let _ = std::io::stdout().flush();

        let start = std::time::Instant::now();
        if runner.run(*backend, url, &output, &config.sandbox).await {
            let size = std::fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
            println!("ok ({} bytes in {:.1}s)", size, start.elapsed().as_secs_f64());
            passed += 1;
        } else {
            println!("FAIL (run with --verbose for details)");
            failed += 1;
        }
        let _ = std::fs::remove_file(&output);
    }

    println!();
    if failed == 0 {
        println!("All {} backends passed.", passed);
    } else {
        println!("{} passed, {} failed.", passed, failed);
    }

    Ok(())
}

async fn run_report(json: bool, config_path: Option<&Path>) -> Result<()> {
    let config = super::load_config(config_path)?;
    let downloader = match SandboxedDownloader::new(&config).await {
        Ok(d) => d,
        Err(e) => {
            explain(&e);
            return Err(e).context("Could not generate security report");
        }
    };
    let report = downloader.security_report();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("defuse security report");
    println!();
    println!("Platform:              {}", report.platform);
    println!("Current backend:       {}", report.current_backend);
    println!("Recommended backend:   {}", report.recommended_backend);
    println!("Isolation level:       {}", report.isolation_level);
    println!("Max isolation level:   {}", report.max_isolation_level);
    println!("Temp dir:              {}", report.temp_dir.display());
    println!();
    println!("Backends (fallback order):");
    for backend in &report.fallback_order {
        let available = report
            .available_backends
            .get(backend)
            .copied()
            .unwrap_or(false);
        println!(
            "  {:<12} {}",
            backend.to_string(),
            if available { "available" } else { "not available" }
        );
    }
    println!();
    println!("Limits:");
    println!(
        "  Max file size:     {} MB",
        config.sandbox.max_file_size_bytes / (1024 * 1024)
    );
    println!("  Download timeout:  {}s", config.sandbox.download_timeout_secs);
    println!("  Max CPU time:      {}s", config.sandbox.max_cpu_seconds);
    println!("  Max memory:        {} MB", config.sandbox.max_memory_mb);

    Ok(())
}
