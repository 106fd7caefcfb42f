use std::path::Path;

/// Harden the fetch helper: NO_NEW_PRIVS, then Landlock write confinement.
///
/// After this the process can still read the system (TLS roots, resolver
/// config) and use the network, but may only create or modify files under
/// `output_dir`.
pub fn harden(output_dir: &Path) -> Result<(), String> {
    // Required for unprivileged Landlock
    set_no_new_privs()?;

    if let Err(e) = confine_writes(output_dir) {
        // Landlock may not be available: the outer sandbox still applies
        eprintln!("defuse-fetch: landlock not applied: {}", e);
    }

    Ok(())
}

fn set_no_new_privs() -> Result<(), String> {
    // prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0)
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

/// Handle only write-type accesses, then allow them beneath `output_dir`.
///
/// Uses BestEffort ABI negotiation so rules degrade gracefully on older
/// kernels.
fn confine_writes(output_dir: &Path) -> Result<(), String> {
    use landlock::{
        ABI, Access, AccessFs, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreatedAttr,
        RulesetStatus,
    };

    let abi = ABI::V5;
    let write_access = AccessFs::from_write(abi);

    let mut ruleset = Ruleset::default()
        .handle_access(write_access)
        .map_err(|e| format!("Landlock ruleset creation: {}", e))?
        .create()
        .map_err(|e| format!("Landlock ruleset create: {}", e))?;

    let fd = PathFd::new(output_dir)
        .map_err(|e| format!("Landlock open {}: {}", output_dir.display(), e))?;
    (&mut ruleset)
        .add_rule(PathBeneath::new(fd, write_access))
        .map_err(|e| format!("Landlock add rule: {}", e))?;

    // /dev/null and friends stay writable for the TLS stack and resolver
    if let Ok(fd) = PathFd::new("/dev") {
        let dev_access = AccessFs::WriteFile | AccessFs::Truncate;
        let _ = (&mut ruleset).add_rule(PathBeneath::new(fd, dev_access & write_access));
    }

    let status = ruleset
        .restrict_self()
        .map_err(|e| format!("Landlock restrict_self: {}", e))?;

    match status.ruleset {
        RulesetStatus::FullyEnforced => {}
        RulesetStatus::PartiallyEnforced => {
            eprintln!("defuse-fetch: Landlock partially enforced (ABI downgrade)");
        }
        RulesetStatus::NotEnforced => {
            return Err("Landlock not enforced by kernel".to_string());
        }
    }

    Ok(())
}
