use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd};

use anyhow::{Context, Result};
use clap::Parser;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chroot, execvp, fchdir, fork, ForkResult};

use userns::error::{exit_code_for, ProtocolError};
use userns::{config, environ, namespace, pidfile};

/// Join an existing user-owned namespace session.
#[derive(Parser, Debug)]
#[command(
    name = "userns-enter",
    version,
    about = "Join an existing Linux namespace session"
)]
struct Args {
    /// Name of the namespace session to join
    #[arg(short, long)]
    name: Option<String>,

    /// Path to the pidfile (default: ${XDG_RUNTIME_DIR}/userns/<name>)
    #[arg(long)]
    pidfile: Option<String>,

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

    let path = config::resolve_pidfile_path(args.pidfile.as_deref(), args.name.as_deref())?;
    let leader_pid = pidfile::read_pid(&path)?;
    tracing::info!(pid = leader_pid.as_raw(), "resolved leader pid");

    // Acquire root/cwd descriptors before attaching namespaces: once we've
    // chrooted, paths under /proc may no longer be reachable.
    let root_fd = open_proc_path(leader_pid, "root")?;
    let cwd_fd = open_proc_path(leader_pid, "cwd")?;

    namespace::attach_to_leader(leader_pid)?;
    tracing::info!(pid = leader_pid.as_raw(), "attached to leader namespaces");

    let vars = environ::read_environ(leader_pid)?;
    environ::install_environ(&vars);

    fchdir(root_fd.as_raw_fd()).map_err(|e| ProtocolError::syscall("fchdir(root)", e))?;
    chroot(".").map_err(|e| ProtocolError::syscall("chroot", e))?;
    fchdir(cwd_fd.as_raw_fd()).map_err(|e| ProtocolError::syscall("fchdir(cwd)", e))?;
    drop(root_fd);
    drop(cwd_fd);

    if pidfile::probe_lock_state(&path)? == pidfile::LockState::Unlocked {
        return Err(ProtocolError::ChildFailure(
            "leader died during namespace attachment".to_string(),
        )
        .into());
    }

    let command = if args.command.is_empty() {
        config::default_command()
    } else {
        args.command
    };

    let prog = CString::new(command[0].as_str()).context("command contains a NUL byte")?;
    let argv: Vec<CString> = command
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<std::result::Result<_, _>>()
        .context("command contains a NUL byte")?;

    match unsafe { fork() }.map_err(|e| ProtocolError::syscall("fork", e))? {
        ForkResult::Child => {
            let err = execvp(&prog, &argv).unwrap_err();
            eprintln!("error: exec {}: {}", command[0], err);
            std::process::exit(127);
        }
        ForkResult::Parent { child } => loop {
            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(code),
                Ok(WaitStatus::Signaled(_, sig, _)) => return Ok(128 + sig as i32),
                Ok(WaitStatus::Stopped(..)) => continue,
                Ok(_) => continue,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(ProtocolError::syscall("waitpid", e).into()),
            }
        },
    }
}

/// Open `/proc/<pid>/<which>` (`root` or `cwd`) as a path-only descriptor.
fn open_proc_path(pid: nix::unistd::Pid, which: &str) -> Result<OwnedFd> {
    let path = format!("/proc/{}/{}", pid, which);
    let fd = nix::fcntl::open(path.as_str(), OFlag::O_PATH, Mode::empty())
        .map_err(|e| ProtocolError::syscall("open", e))
        .with_context(|| format!("Failed to open {}", path))?;
    Ok(unsafe { std::os::fd::FromRawFd::from_raw_fd(fd) })
}
