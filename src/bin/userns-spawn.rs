use std::ffi::CString;

use anyhow::{Context, Result};
use clap::Parser;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{close, execvp, sethostname};

use userns::error::{exit_code_for, ProtocolError};
use userns::idmap;
use userns::namespace::{self, SpawnToggles};
use userns::rendezvous;
use userns::{config, pidfile};

/// Create a new user-owned namespace session.
#[derive(Parser, Debug)]
#[command(
    name = "userns-spawn",
    version,
    about = "Create a new user-owned Linux namespace session"
)]
struct Args {
    /// Name of the namespace session
    #[arg(short, long)]
    name: String,

    /// Domain of the namespace session (default: $USERNS_DOMAIN or localdomain)
    #[arg(short, long)]
    domain: Option<String>,

    /// Unshare a new user namespace, mapping the caller to uid/gid 0 inside it
    #[arg(long = "user")]
    new_user_ns: bool,

    /// Create a new net namespace, or join an existing one (--net=NETNS)
    #[arg(long = "net", num_args = 0..=1, default_missing_value = "")]
    net: Option<String>,

    /// Do not create a new PID namespace
    #[arg(long = "no-pid")]
    no_pid: bool,

    /// Do not create a new cgroup namespace
    #[arg(long = "no-cgroup")]
    no_cgroup: bool,

    /// Path to the pidfile (default: ${XDG_RUNTIME_DIR}/userns/<name>)
    #[arg(long)]
    pidfile: Option<String>,

    /// Block for and mirror the leader's exit status instead of detaching
    #[arg(long)]
    wait: bool,

    /// Command to run inside the session (default: $SHELL, or /bin/sh)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() {
    std::process::exit(match run() {
        Ok(code) => code,
        Err(e) => exit_code_for(&e),
    });
}

fn run() -> Result<i32> {
    userns::init_logging("userns=info")?;
    let args = Args::parse();

    let domain = config::resolve_domain(args.domain.as_deref());
    let (dir, name) =
        config::resolve_pidfile_location(args.pidfile.as_deref(), Some(args.name.as_str()))?;
    config::ensure_pidfile_dir(&dir)?;

    if let Some(netns) = args.net.as_deref().filter(|s| !s.is_empty()) {
        namespace::join_named_netns(netns)?;
        tracing::info!(netns, "joined existing network namespace");
    }

    if args.new_user_ns {
        idmap::unshare_user_ns()?;
        tracing::info!("unshared user namespace");
    }

    // Block SIGCHLD before the leader exists so no transition can be missed.
    let mut sfd = rendezvous::block_sigchld()?;

    let toggles = SpawnToggles {
        new_user_ns: args.new_user_ns,
        new_net_ns: args.net.as_deref().is_some_and(|s| s.is_empty()),
        suppress_pid_ns: args.no_pid,
        suppress_cgroup_ns: args.no_cgroup,
    };
    let flags = namespace::leader_clone_flags(&toggles);

    let command = if args.command.is_empty() {
        config::default_command()
    } else {
        args.command.clone()
    };

    let session_name = args.name.clone();
    let leader_dir = dir.clone();
    let leader_name = name.clone();
    let mut stack = vec![0u8; 1024 * 1024];
    let child = unsafe {
        nix::sched::clone(
            Box::new(move || {
                leader_entry(&leader_dir, &leader_name, &session_name, &domain, &command)
            }),
            &mut stack,
            flags,
            Some(nix::libc::SIGCHLD),
        )
    }
    .map_err(|e| ProtocolError::syscall("clone", e))?;
    tracing::info!(session = %args.name, pid = child.as_raw(), "cloned leader");

    // The leader inherits stdin/stdout only transiently.
    let _ = close(0);
    let _ = close(1);

    if let Err(e) = rendezvous::await_rendezvous(&mut sfd, child) {
        let _ = kill(child, Signal::SIGKILL);
        return Err(e);
    }

    if let Err(e) = pidfile::claim(&dir, &name, child) {
        let _ = kill(child, Signal::SIGKILL);
        return Err(e);
    }
    tracing::info!(session = %args.name, "pidfile claimed");

    rendezvous::resume_leader(child)?;
    tracing::info!(session = %args.name, pid = child.as_raw(), "leader rendezvous complete");

    if args.wait {
        let code = rendezvous::wait_for_exit(child)?;
        pidfile::unlink_best_effort(&dir, &name);
        return Ok(code);
    }

    Ok(0)
}

/// Entry point for the leader, running on the stack handed to `clone`.
/// Returning from this closure is what ends the clone-spawned thread of
/// control on error; success never returns (the `exec` replaces it).
fn leader_entry(
    pidfile_dir: &std::path::Path,
    pidfile_name: &str,
    name: &str,
    domain: &str,
    command: &[String],
) -> isize {
    match leader_main(pidfile_dir, pidfile_name, name, domain, command) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {}", e);
            127
        }
    }
}

fn leader_main(
    pidfile_dir: &std::path::Path,
    pidfile_name: &str,
    name: &str,
    domain: &str,
    command: &[String],
) -> Result<()> {
    rendezvous::join_group_and_stop()?;

    // Resumed: restore the signal mask the parent set before cloning us, lock
    // our own pidfile entry (the Spawner only claimed the name), set up the
    // session identity, and become the requested command.
    rendezvous::unblock_sigchld()?;

    // Held open (not `O_CLOEXEC`) across `exec` below: this is what makes the
    // advisory lock cover the session's whole life, released only when the
    // leader itself dies.
    let _pidfile_lock = pidfile::lock_own_pidfile(pidfile_dir, pidfile_name)?;

    std::env::set_var("USERNS_NAME", name);
    std::env::set_var("USERNS_DOMAIN", domain);

    sethostname(name).map_err(|e| ProtocolError::syscall("sethostname", e))?;
    setdomainname(domain)?;

    let prog = CString::new(command[0].as_str()).context("command contains a NUL byte")?;
    let argv: Vec<CString> = command
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<std::result::Result<_, _>>()
        .context("command contains a NUL byte")?;

    let err = execvp(&prog, &argv).unwrap_err();
    Err(ProtocolError::Exec(format!("{}: {}", command[0], err)).into())
}

/// `setdomainname(2)` has no `nix` wrapper; call it directly as the rest of
/// this codebase does for the handful of syscalls `nix` doesn't cover.
fn setdomainname(domain: &str) -> Result<()> {
    let rc = unsafe {
        nix::libc::setdomainname(domain.as_ptr() as *const nix::libc::c_char, domain.len())
    };
    if rc != 0 {
        return Err(ProtocolError::syscall("setdomainname", nix::Error::last()).into());
    }
    Ok(())
}
