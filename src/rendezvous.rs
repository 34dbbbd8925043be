use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};
use nix::sys::signalfd::SignalFd;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::error::ProtocolError;

/// Block `SIGCHLD` on the calling thread and return a signalfd over it.
///
/// Must run before the leader is cloned: the Spawner reads this fd instead of
/// installing a `SIGCHLD` handler, so it can correlate the leader's
/// stop/continue/exit transitions with `waitpid` from ordinary control flow.
pub fn block_sigchld() -> Result<SignalFd> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.thread_block().context("Failed to block SIGCHLD")?;
    SignalFd::new(&mask).context("Failed to create signalfd")
}

/// Run in the leader immediately after `clone`, before any namespace-private
/// setup that might fail: join its own process group and stop itself.
///
/// The self-stop is the rendezvous signal the Spawner waits for — it means
/// "I've reached a safe point; publish the pidfile and wake me."
pub fn join_group_and_stop() -> Result<()> {
    nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
        .map_err(|e| ProtocolError::syscall("setpgid", e))?;
    nix::sys::signal::raise(Signal::SIGSTOP)
        .map_err(|e| ProtocolError::syscall("raise(SIGSTOP)", e))?;
    Ok(())
}

/// Block until `child` either stops (rendezvous reached) or dies trying.
///
/// Each signalfd read can coalesce more than one `SIGCHLD`, so every read is
/// followed by draining `waitpid(WNOHANG)` until it would block.
pub fn await_rendezvous(sfd: &mut SignalFd, child: Pid) -> Result<()> {
    loop {
        sfd.read_signal()
            .map_err(|e| ProtocolError::syscall("read signalfd", e))?;

        loop {
            let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
            match waitpid(child, Some(flags)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Stopped(p, _)) if p == child => return Ok(()),
                Ok(WaitStatus::Exited(p, code)) if p == child => {
                    return Err(ProtocolError::ChildFailure(format!(
                        "leader exited with status {}",
                        code
                    ))
                    .into());
                }
                Ok(WaitStatus::Signaled(p, sig, _)) if p == child => {
                    return Err(ProtocolError::ChildFailure(format!(
                        "leader killed by signal {}",
                        sig
                    ))
                    .into());
                }
                Ok(_) => continue,
                Err(Errno::ECHILD) => {
                    return Err(
                        ProtocolError::Protocol("leader vanished before rendezvous".to_string())
                            .into(),
                    )
                }
                Err(e) => return Err(ProtocolError::syscall("waitpid", e).into()),
            }
        }
    }
}

/// Unblock `SIGCHLD` again. Run in the leader after rendezvous, restoring
/// the mask the parent temporarily set via [`block_sigchld`] before the
/// command it `exec`s inherits it.
pub fn unblock_sigchld() -> Result<()> {
    let mut mask = SigSet::empty();
    mask.add(Signal::SIGCHLD);
    mask.thread_unblock().context("Failed to restore signal mask")?;
    Ok(())
}

/// Wake the stopped leader by sending `SIGCONT` to its process group.
pub fn resume_leader(leader_pgid: Pid) -> Result<()> {
    nix::sys::signal::kill(Pid::from_raw(-leader_pgid.as_raw()), Signal::SIGCONT)
        .map_err(|e| ProtocolError::syscall("kill(SIGCONT)", e))?;
    Ok(())
}

/// Reap the leader without blocking, for the `--wait` path where the Spawner
/// stays attached and forwards the leader's final exit status.
pub fn wait_for_exit(child: Pid) -> Result<i32> {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(p, code)) if p == child => return Ok(code),
            Ok(WaitStatus::Signaled(p, sig, _)) if p == child => {
                return Ok(128 + sig as i32);
            }
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ProtocolError::syscall("waitpid", e).into()),
        }
    }
}
