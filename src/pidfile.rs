use std::fs::File;
use std::io::Read;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag};
use nix::libc;
use nix::sys::stat::Mode;
use nix::unistd::{LinkatFlags, Pid, UnlinkatFlags};

use crate::error::ProtocolError;

/// A PID file this process has locked for the life of the session. Dropping
/// it closes the lock-holding descriptor, releasing the lock; the leader
/// holds one of these open (un-`CLOEXEC`'d) across its own `exec`, so the
/// lock persists until the leader itself dies. The file stays linked the
/// whole time — only the lock, not the link, carries "session alive".
pub struct ClaimedPidFile {
    #[allow(dead_code)]
    lock: OwnedFd,
}

/// Whether the advisory lock covering a pidfile is currently held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Locked,
    Unlocked,
}

/// Whether the leader named by a pidfile is still alive, per `kill(pid, 0)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Dead,
}

/// Claim `<dir>/<name>` for `pid`: write it into a fresh unlinked tmpfile and
/// hardlink that into place, reclaiming any stale (unlocked) entry found at
/// that name. Does not lock anything — the Spawner only establishes the
/// name; the leader locks its own entry once it resumes (see
/// [`lock_own_pidfile`]). A name is in use, and this fails, only when an
/// existing entry at it is locked.
pub fn claim(dir: &Path, name: &str, pid: Pid) -> Result<()> {
    let dirfd = open_dir(dir)?;

    loop {
        let tmp = open_tmpfile(dirfd.as_raw_fd())?;
        let mut f = File::from(tmp);

        let data = pid.as_raw().to_string();
        std::io::Write::write_all(&mut f, data.as_bytes()).context("Failed to write pidfile")?;
        std::io::Write::flush(&mut f).context("Failed to flush pidfile")?;
        nix::unistd::fdatasync(f.as_raw_fd())
            .map_err(|e| ProtocolError::syscall("fdatasync pidfile", e))?;

        let proc_path = format!("/proc/self/fd/{}", f.as_raw_fd());
        match nix::unistd::linkat(
            None,
            proc_path.as_str(),
            Some(dirfd.as_raw_fd()),
            name,
            LinkatFlags::SYMLINK_FOLLOW,
        ) {
            Ok(()) => return Ok(()),
            Err(Errno::EEXIST) => {
                drop(f);
                if reclaim_stale(&dirfd, name)? {
                    continue;
                }
            }
            Err(e) => return Err(ProtocolError::syscall("link pidfile", e).into()),
        }
    }
}

/// Open and lock `<dir>/<name>` on behalf of the leader that now owns it.
/// The returned descriptor is not `O_CLOEXEC`: the caller is expected to hold
/// it open across its own `exec`, so the lock survives for the whole life of
/// the session and is released only when the leader's last descriptor closes
/// (ordinarily, at its death).
pub fn lock_own_pidfile(dir: &Path, name: &str) -> Result<ClaimedPidFile> {
    let path = dir.join(name);
    let raw = nix::fcntl::open(&path, OFlag::O_RDWR, Mode::empty())
        .map_err(|e| ProtocolError::syscall("open pidfile", e))
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let fd: OwnedFd = unsafe { OwnedFd::from_raw_fd(raw) };

    let len = nix::sys::stat::fstat(fd.as_raw_fd())
        .map_err(|e| ProtocolError::syscall("fstat pidfile", e))?
        .st_size;
    lock_exclusive(fd.as_raw_fd(), len).context("Failed to lock pidfile")?;

    Ok(ClaimedPidFile { lock: fd })
}

/// Attempt to reclaim a stale entry at `<dirfd>/<name>`. Returns `Ok(true)`
/// when the caller should retry the link (the entry was removed, or had
/// already vanished), and an error when the name is genuinely in use.
///
/// Lock state alone decides staleness: a PID file is either locked (a live
/// leader owns it) or unlocked (stale, reclaimable unconditionally) — there
/// is no third state.
fn reclaim_stale(dirfd: &OwnedFd, name: &str) -> Result<bool> {
    let existing = match nix::fcntl::openat(
        dirfd.as_raw_fd(),
        name,
        OFlag::O_RDONLY | OFlag::O_CLOEXEC,
        Mode::empty(),
    ) {
        Ok(fd) => unsafe { OwnedFd::from_raw_fd(fd) },
        Err(Errno::ENOENT) => return Ok(true),
        Err(e) => return Err(ProtocolError::syscall("open pidfile", e).into()),
    };

    let len = nix::sys::stat::fstat(existing.as_raw_fd())
        .map_err(|e| ProtocolError::syscall("fstat pidfile", e))?
        .st_size;

    if lock_state_of(existing.as_raw_fd(), len)? == LockState::Locked {
        return Err(ProtocolError::Protocol(
            "pidfile locked: name already in use".to_string(),
        )
        .into());
    }

    match nix::unistd::unlinkat(Some(dirfd.as_raw_fd()), name, UnlinkatFlags::NoRemoveDir) {
        Ok(()) | Err(Errno::ENOENT) => Ok(true),
        Err(e) => Err(ProtocolError::syscall("unlink stale pidfile", e).into()),
    }
}

/// Read and parse the PID stored at `path`.
pub fn read_pid(path: &Path) -> Result<Pid> {
    let mut buf = String::new();
    File::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?
        .read_to_string(&mut buf)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse_pid(&buf).with_context(|| format!("Failed to parse pid from {}", path.display()))
}

fn parse_pid(s: &str) -> Result<Pid> {
    s.trim()
        .parse::<i32>()
        .map(Pid::from_raw)
        .map_err(|_| ProtocolError::Input(format!("unparsable pid: {:?}", s)).into())
}

/// Whether the process named by `path`'s contents is still alive, per
/// `kill(pid, 0)`. Used only as a narrowing safety check immediately before
/// sending a signal; the lock, not this probe, is the session-alive oracle
/// (see [`probe_lock_state`]).
pub fn probe_liveness(path: &Path) -> Result<Liveness> {
    let pid = read_pid(path)?;
    Ok(if process_alive(pid) {
        Liveness::Alive
    } else {
        Liveness::Dead
    })
}

/// Whether `path`'s advisory lock is currently held. This is the
/// authoritative "is the session alive" oracle: a PID file is locked iff its
/// leader is alive, unlocked iff the entry is stale.
pub fn probe_lock_state(path: &Path) -> Result<LockState> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let len = f
        .metadata()
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .len() as libc::off_t;
    lock_state_of(f.as_raw_fd(), len)
}

/// Best-effort removal of `<dir>/<name>`, for a Spawner that waited for its
/// leader to actually exit. Never fails the caller; a failed unlink just
/// leaves a stale entry for the next Spawner to reclaim.
pub fn unlink_best_effort(dir: &Path, name: &str) {
    let path = dir.join(name);
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove pidfile");
        }
    }
}

fn process_alive(pid: Pid) -> bool {
    match nix::sys::signal::kill(pid, None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        // EPERM means the process exists but we can't signal it — still alive.
        Err(_) => true,
    }
}

fn open_dir(dir: &Path) -> Result<OwnedFd> {
    let fd = nix::fcntl::open(
        dir,
        OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        Mode::empty(),
    )
    .map_err(|e| ProtocolError::syscall("open pidfile directory", e))
    .with_context(|| format!("Failed to open {}", dir.display()))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn open_tmpfile(dirfd: RawFd) -> Result<OwnedFd> {
    let fd = nix::fcntl::openat(
        dirfd,
        ".",
        OFlag::O_TMPFILE | OFlag::O_WRONLY | OFlag::O_CLOEXEC,
        Mode::S_IRUSR | Mode::S_IWUSR,
    )
    .map_err(|e| ProtocolError::syscall("open pidfile tmpfile", e))?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn lock_exclusive(fd: RawFd, len: libc::off_t) -> Result<()> {
    let flock = new_flock(libc::F_WRLCK, len);
    nix::fcntl::fcntl(fd, FcntlArg::F_SETLK(&flock))
        .map_err(|e| ProtocolError::syscall("lock pidfile", e))?;
    Ok(())
}

fn lock_state_of(fd: RawFd, len: libc::off_t) -> Result<LockState> {
    let mut flock = new_flock(libc::F_WRLCK, len);
    nix::fcntl::fcntl(fd, FcntlArg::F_GETLK(&mut flock))
        .map_err(|e| ProtocolError::syscall("probe pidfile lock", e))?;
    Ok(if flock.l_type as i32 == libc::F_UNLCK {
        LockState::Unlocked
    } else {
        LockState::Locked
    })
}

fn new_flock(l_type: i32, len: libc::off_t) -> libc::flock {
    libc::flock {
        l_type: l_type as libc::c_short,
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: len,
        l_pid: 0,
        ..unsafe { std::mem::zeroed() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::wait::waitpid;
    use nix::unistd::{fork, ForkResult};

    fn tmp_session_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "userns-pidfile-test-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Fork a child that locks `<dir>/<name>` via [`lock_own_pidfile`], then
    /// blocks until killed. Returns the child's pid once it has signalled
    /// (over a pipe) that the lock is held — so the parent can probe lock
    /// state from a genuinely different process, the only way F_GETLK
    /// observes it (a process never sees its own F_SETLK as a conflict).
    fn spawn_locking_child(dir: &Path, name: &str) -> Pid {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                drop(read_fd);
                let _claim = lock_own_pidfile(dir, name).unwrap();
                std::io::Write::write_all(&mut File::from(write_fd), b"x").unwrap();
                loop {
                    nix::unistd::pause();
                }
            }
            ForkResult::Parent { child } => {
                drop(write_fd);
                let mut buf = [0u8; 1];
                std::io::Read::read(&mut File::from(read_fd), &mut buf).unwrap();
                child
            }
        }
    }

    #[test]
    fn claim_then_read_round_trips_pid() {
        let dir = tmp_session_dir("roundtrip");
        let pid = Pid::this();
        claim(&dir, "sess", pid).unwrap();
        let path = dir.join("sess");
        assert_eq!(read_pid(&path).unwrap(), pid);
        // nobody has locked it yet: genuinely unlocked, observable even from
        // this same process since there is no lock of ours to hide.
        assert_eq!(probe_lock_state(&path).unwrap(), LockState::Unlocked);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn leader_lock_is_observable_as_locked_from_another_process() {
        let dir = tmp_session_dir("observe");
        claim(&dir, "sess", Pid::this()).unwrap();

        let child = spawn_locking_child(&dir, "sess");
        let path = dir.join("sess");
        assert_eq!(probe_lock_state(&path).unwrap(), LockState::Locked);

        nix::sys::signal::kill(child, nix::sys::signal::Signal::SIGKILL).unwrap();
        let _ = waitpid(child, None);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn second_claim_while_leader_holds_lock_is_rejected() {
        let dir = tmp_session_dir("locked");
        claim(&dir, "sess", Pid::this()).unwrap();

        let child = spawn_locking_child(&dir, "sess");
        let err = claim(&dir, "sess", Pid::from_raw(1)).unwrap_err();
        assert!(err.to_string().contains("already in use"));

        nix::sys::signal::kill(child, nix::sys::signal::Signal::SIGKILL).unwrap();
        let _ = waitpid(child, None);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn stale_entry_after_leader_death_is_reclaimed() {
        let dir = tmp_session_dir("stale");
        claim(&dir, "sess", Pid::from_raw(1)).unwrap();

        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let _claim = lock_own_pidfile(&dir, "sess").unwrap();
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                waitpid(child, None).unwrap();
                // the leader's only lock-holding descriptor died with it:
                // the entry is now unlocked, and unconditionally reclaimable.
                let live = Pid::this();
                claim(&dir, "sess", live).unwrap();
                let path = dir.join("sess");
                assert_eq!(read_pid(&path).unwrap(), live);
            }
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn parse_pid_rejects_garbage() {
        assert!(parse_pid("not-a-pid").is_err());
        assert!(parse_pid("123\n").is_ok());
    }
}
