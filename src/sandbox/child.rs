use super::policy::FetchRequest;

/// argv[0] suffix that routes the binary into the fetch helper.
pub const HELPER_NAME: &str = "defuse-fetch";

/// RLIMIT_NOFILE soft/hard values for the helper.
const NOFILE_SOFT: u64 = 64;
const NOFILE_HARD: u64 = 128;

/// Whether `arg0` names the fetch helper.
pub fn is_helper_invocation(arg0: &str) -> bool {
    arg0.ends_with(HELPER_NAME)
}

/// Entry point for the fetch helper running inside a sandbox.
///
/// Called when the binary detects argv[0] ends with "defuse-fetch".
/// This function never returns: it prints a one-line verdict to stderr and
/// exits with 0 on success, 1 otherwise.
///
/// argv layout:
///   argv[0] = "defuse-fetch" (already consumed by dispatch)
///   argv[1] = FetchRequest JSON
pub fn fetch_child_main() -> ! {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        fail("expected a fetch request argument");
    }

    let request: FetchRequest = match serde_json::from_str(&args[1]) {
        Ok(r) => r,
        Err(e) => fail(&format!("failed to parse fetch request: {}", e)),
    };

    // Resource limits first, before any threads exist
    #[cfg(unix)]
    {
        if let Err(e) = apply_rlimits(&request) {
            fail(&format!("failed to apply rlimits: {}", e));
        }
    }

    #[cfg(target_os = "linux")]
    {
        let output_dir = request
            .output_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(std::path::Path::new("."));
        if let Err(e) = super::linux::harden(output_dir) {
            fail(&format!("failed to harden helper: {}", e));
        }
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => fail(&format!("failed to start runtime: {}", e)),
    };

    match runtime.block_on(super::fetch::fetch_document(&request)) {
        Ok(bytes) => {
            eprintln!(
                "SUCCESS: downloaded {} bytes to {}",
                bytes,
                request.output_path.display()
            );
            std::process::exit(0);
        }
        Err(e) => fail(&e.to_string()),
    }
}

fn fail(message: &str) -> ! {
    eprintln!("ERROR: {}", message);
    std::process::exit(1);
}

/// Apply resource limits using setrlimit.
#[cfg(unix)]
fn apply_rlimits(request: &FetchRequest) -> Result<(), String> {
    use nix::sys::resource::{Resource, getrlimit, setrlimit};

    // RLIMIT_AS: address space
    let max_memory = request.max_memory_mb.saturating_mul(1024 * 1024);
    setrlimit(Resource::RLIMIT_AS, max_memory, max_memory)
        .map_err(|e| format!("RLIMIT_AS: {}", e))?;

    // RLIMIT_CPU: CPU seconds
    setrlimit(
        Resource::RLIMIT_CPU,
        request.max_cpu_seconds,
        request.max_cpu_seconds,
    )
    .map_err(|e| format!("RLIMIT_CPU: {}", e))?;

    // RLIMIT_FSIZE: largest file the helper may write
    setrlimit(
        Resource::RLIMIT_FSIZE,
        request.max_file_size_bytes,
        request.max_file_size_bytes,
    )
    .map_err(|e| format!("RLIMIT_FSIZE: {}", e))?;

    // RLIMIT_NOFILE: never raise above the inherited hard limit
    let (_, current_hard) =
        getrlimit(Resource::RLIMIT_NOFILE).map_err(|e| format!("RLIMIT_NOFILE: {}", e))?;
    let (soft, hard) = nofile_limits(current_hard);
    setrlimit(Resource::RLIMIT_NOFILE, soft, hard).map_err(|e| format!("RLIMIT_NOFILE: {}", e))?;

    Ok(())
}

/// NOFILE (soft, hard) clamped to the limit already in force.
fn nofile_limits(current_hard: u64) -> (u64, u64) {
    let hard = NOFILE_HARD.min(current_hard);
    (NOFILE_SOFT.min(hard), hard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_invocation_names() {
        assert!(is_helper_invocation("defuse-fetch"));
        assert!(is_helper_invocation("/tmp/defuse-fetch"));
        assert!(is_helper_invocation("/usr/local/bin/defuse-fetch"));
        assert!(!is_helper_invocation("defuse"));
        assert!(!is_helper_invocation("/usr/bin/defuse-fetch-other"));
    }

    #[test]
    fn test_nofile_limits_clamped() {
        assert_eq!(nofile_limits(1_048_576), (64, 128));
        assert_eq!(nofile_limits(100), (64, 100));
        assert_eq!(nofile_limits(32), (32, 32));
    }
}
