use std::ffi::CString;
use std::os::fd::OwnedFd;

use anyhow::{bail, Context, Result};
use clap::Parser;
use nix::fcntl::{open, OFlag};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{dup2, execvp, fork, setsid, ForkResult};

use userns::error::exit_code_for;

/// Double-fork detach helper: run a command as a daemon, redirecting its
/// standard streams to the given paths.
#[derive(Parser, Debug)]
#[command(
    name = "userns-daemonize",
    version,
    about = "Detach a command into a daemon process"
)]
struct Args {
    /// File to redirect the daemon's stdout into (truncated)
    #[arg(short, long)]
    stdout: String,

    /// File to redirect the daemon's stderr into (truncated)
    #[arg(short, long)]
    stderr: String,

    /// Command to run as the daemon
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
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

    match unsafe { fork() }.context("Failed to fork")? {
        ForkResult::Parent { .. } => return Ok(0),
        ForkResult::Child => {}
    }

    setsid().context("Failed to setsid")?;

    match unsafe { fork() }.context("Failed to fork again")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    umask(Mode::empty());

    redirect_stdin()?;
    redirect_to(1, &args.stdout)?;
    redirect_to(2, &args.stderr)?;

    let prog = CString::new(args.command[0].as_str()).context("command contains a NUL byte")?;
    let argv: Vec<CString> = args
        .command
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<std::result::Result<_, _>>()
        .context("command contains a NUL byte")?;

    let err = execvp(&prog, &argv).unwrap_err();
    bail!("exec {}: {}", args.command[0], err);
}

fn redirect_stdin() -> Result<()> {
    let fd: OwnedFd = open("/dev/null", OFlag::O_RDONLY, Mode::empty())
        .context("Failed to open /dev/null")
        .map(|raw| unsafe { std::os::fd::FromRawFd::from_raw_fd(raw) })?;
    dup2(std::os::fd::AsRawFd::as_raw_fd(&fd), 0).context("Failed to dup2 stdin")?;
    Ok(())
}

fn redirect_to(target_fd: i32, path: &str) -> Result<()> {
    let raw = open(
        path,
        OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_TRUNC,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )
    .with_context(|| format!("Failed to open {}", path))?;
    let fd: OwnedFd = unsafe { std::os::fd::FromRawFd::from_raw_fd(raw) };
    dup2(std::os::fd::AsRawFd::as_raw_fd(&fd), target_fd)
        .with_context(|| format!("Failed to dup2 onto fd {}", target_fd))?;
    Ok(())
}
