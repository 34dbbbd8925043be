use anyhow::Result;
use clap::Parser;
use nix::sys::signal::{kill, Signal};
use std::str::FromStr;

use userns::config;
use userns::error::{exit_code_for, ProtocolError};
use userns::pidfile::{self, Liveness, LockState};

/// Probe or terminate an existing user-owned namespace session.
#[derive(Parser, Debug)]
#[command(
    name = "userns-check",
    version,
    about = "Check liveness of a Linux namespace session, optionally terminating it"
)]
struct Args {
    /// Name of the namespace session to check
    #[arg(short, long)]
    name: Option<String>,

    /// Path to the pidfile (default: ${XDG_RUNTIME_DIR}/userns/<name>)
    #[arg(long)]
    pidfile: Option<String>,

    /// Send a termination signal to the leader if the session is alive
    #[arg(long)]
    kill: bool,

    /// Signal to send with --kill (default: KILL)
    #[arg(long, default_value = "KILL")]
    signal: String,
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
    let pid = pidfile::read_pid(&path)?;
    let lock_state = pidfile::probe_lock_state(&path)?;

    tracing::info!(pid = pid.as_raw(), lock = ?lock_state, "checked session");

    if lock_state == LockState::Unlocked {
        eprintln!("error: pidfile not locked");
        return Ok(1);
    }

    println!("alive (pid {})", pid);

    if args.kill {
        // Narrowing, not closing: the lock already established the session
        // is alive; this just avoids signaling a pid that died and was
        // reused in the narrow window since the probe above.
        if pidfile::probe_liveness(&path)? == Liveness::Dead {
            eprintln!("error: leader pid {} already dead", pid);
            return Ok(1);
        }
        let signal = parse_signal(&args.signal)?;
        kill(pid, signal).map_err(|e| ProtocolError::syscall("kill", e))?;
        tracing::info!(pid = pid.as_raw(), signal = %args.signal, "sent signal to leader");
    }

    Ok(0)
}

fn parse_signal(name: &str) -> Result<Signal> {
    let candidate = name.trim().to_ascii_uppercase();
    let with_prefix = if candidate.starts_with("SIG") {
        candidate.clone()
    } else {
        format!("SIG{}", candidate)
    };
    Signal::from_str(&with_prefix)
        .map_err(|_| ProtocolError::Input(format!("unknown signal: {}", name)).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_signal_accepts_bare_and_prefixed_names() {
        assert_eq!(parse_signal("TERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("SIGTERM").unwrap(), Signal::SIGTERM);
        assert_eq!(parse_signal("kill").unwrap(), Signal::SIGKILL);
    }

    #[test]
    fn parse_signal_rejects_garbage() {
        assert!(parse_signal("NOTASIGNAL").is_err());
    }
}
