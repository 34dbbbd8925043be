use thiserror::Error;

/// The five error kinds this project's protocol can fail with.
///
/// Every variant carries enough context to print the single English
/// diagnostic sentence the CLI contract requires; callers still wrap these
/// (and any raw syscall error) in `anyhow::Context` for the surrounding
/// narrative, matching how the rest of the codebase threads `anyhow`.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A raw syscall failed (open/stat/read/write/clone/unshare/setns/chroot/...).
    #[error("{op} failed: {source}")]
    Syscall {
        op: &'static str,
        #[source]
        source: nix::Error,
    },

    /// The PID-file claim/reclaim protocol found a name already in use: an
    /// existing entry at the target name is still locked.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Missing or malformed user input: no name, an unparsable PID, a missing
    /// runtime directory, and so on.
    #[error("{0}")]
    Input(String),

    /// The leader died before or during the spawn rendezvous.
    #[error("leader process failed: {0}")]
    ChildFailure(String),

    /// `exec` of the requested command failed (not found, not executable).
    #[error("exec failed: {0}")]
    Exec(String),
}

impl ProtocolError {
    pub fn syscall(op: &'static str, source: nix::Error) -> anyhow::Error {
        ProtocolError::Syscall { op, source }.into()
    }
}

/// Print one diagnostic line per the CLI contract and compute the process
/// exit code for an error returned from a binary's `run()`.
///
/// A supervised child's own exit status or `128 + signum` is never routed
/// through here — each binary's `run()` returns it directly as `Ok(code)`,
/// so it reaches `main`'s `std::process::exit` without a diagnostic line.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    eprintln!("error: {}", first_line(err));
    1
}

fn first_line(err: &anyhow::Error) -> String {
    err.chain()
        .next()
        .map(|e| e.to_string())
        .unwrap_or_else(|| err.to_string())
}
