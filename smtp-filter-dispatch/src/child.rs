//! Process supervisor: fork/exec a shell-invoked filter, and reap it with
//! escalating termination signals.

use std::{
    os::unix::io::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, RawFd},
    time::{Duration, Instant},
};

use nix::{
    fcntl::{fcntl, FcntlArg, OFlag},
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{close, dup2, execv, fork, pipe, ForkResult, Pid},
};

use crate::DispatchError;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// One end of a pipe installed between us and a filter child.
#[derive(Debug)]
pub struct PipeEnd {
    fd: RawFd,
}

impl PipeEnd {
    fn new(fd: RawFd) -> nix::Result<PipeEnd> {
        let flags = fcntl(fd, FcntlArg::F_GETFL)?;
        let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(flags))?;
        Ok(PipeEnd { fd })
    }
}

impl AsRawFd for PipeEnd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl AsFd for PipeEnd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: `self.fd` is owned by this `PipeEnd` for its whole lifetime.
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        let _ = close(self.fd);
    }
}

/// The three pipe ends the parent keeps after spawning a filter, any subset
/// of which may be absent depending on what was requested.
#[derive(Debug, Default)]
pub struct ChildPipes {
    pub stdin: Option<PipeEnd>,
    pub stdout: Option<PipeEnd>,
    pub stderr: Option<PipeEnd>,
}

/// An owned handle to a forked filter process.
///
/// Dropping a live `ChildProcess` terminates and reaps it, so that no filter
/// process can ever outlive the driver that spawned it.
pub struct ChildProcess {
    pid: Option<Pid>,
    timeout: Duration,
}

/// What publishing envelope variables into the about-to-exec child looks
/// like, from the core's point of view: just a callback the host provides.
pub trait EnterFilterCallback {
    fn setup_forked(&self);
}

impl ChildProcess {
    /// Forks and execs `/bin/sh -c command`, wiring up the requested pipe
    /// ends. `on_enter_filter` runs in the child, right before `exec`, to let
    /// the host publish envelope variables into the environment.
    pub fn spawn(
        command: &str,
        want_stdin: bool,
        want_stdout: bool,
        want_stderr: bool,
        timeout: Duration,
        on_enter_filter: &impl EnterFilterCallback,
    ) -> Result<(ChildProcess, ChildPipes), DispatchError> {
        // `nix::unistd::pipe()` returns owned, close-on-drop `OwnedFd`s as of
        // nix 0.27; convert to raw fds immediately so the rest of this
        // function can freely copy and pass them across the fork without
        // fighting move semantics (and without an `OwnedFd` closing an end
        // out from under us the moment it's destructured).
        let stdin_pipe = want_stdin
            .then(pipe)
            .transpose()
            .map_err(DispatchError::Spawn)?
            .map(|(r, w)| (r.into_raw_fd(), w.into_raw_fd()));
        let stdout_pipe = want_stdout
            .then(pipe)
            .transpose()
            .map_err(DispatchError::Spawn)?
            .map(|(r, w)| (r.into_raw_fd(), w.into_raw_fd()));
        let stderr_pipe = want_stderr
            .then(pipe)
            .transpose()
            .map_err(DispatchError::Spawn)?
            .map(|(r, w)| (r.into_raw_fd(), w.into_raw_fd()));

        // SAFETY: fork() is only followed by async-signal-safe syscalls (dup2,
        // close, execv) or _exit in the child before returning to user code.
        match unsafe { fork() }.map_err(DispatchError::Spawn)? {
            ForkResult::Child => {
                let child_fail = || -> ! {
                    loop {
                        let _ = kill(Pid::this(), Signal::SIGKILL);
                    }
                };

                if let Some((r, _w)) = stdin_pipe {
                    if dup2(r, 0).is_err() {
                        child_fail();
                    }
                }
                if let Some((_r, w)) = stdout_pipe {
                    if dup2(w, 1).is_err() {
                        child_fail();
                    }
                }
                if let Some((_r, w)) = stderr_pipe {
                    if dup2(w, 2).is_err() {
                        child_fail();
                    }
                }

                for (r, w) in [stdin_pipe, stdout_pipe, stderr_pipe].into_iter().flatten() {
                    let _ = close(r);
                    let _ = close(w);
                }

                let max_fd = nix::unistd::sysconf(nix::unistd::SysconfVar::OPEN_MAX)
                    .ok()
                    .flatten()
                    .unwrap_or(1024);
                for fd in 3..max_fd as RawFd {
                    let _ = close(fd);
                }

                on_enter_filter.setup_forked();

                let shell = std::ffi::CString::new("/bin/sh").unwrap();
                let dash_c = std::ffi::CString::new("-c").unwrap();
                let cmd = match std::ffi::CString::new(command) {
                    Ok(c) => c,
                    Err(_) => child_fail(),
                };
                let _ = execv(&shell, &[shell.clone(), dash_c, cmd]);
                child_fail();
            }
            ForkResult::Parent { child } => {
                let mut pipes = ChildPipes::default();
                if let Some((r, w)) = stdin_pipe {
                    let _ = close(r);
                    pipes.stdin = Some(PipeEnd::new(w).map_err(DispatchError::Spawn)?);
                }
                if let Some((r, w)) = stdout_pipe {
                    let _ = close(w);
                    pipes.stdout = Some(PipeEnd::new(r).map_err(DispatchError::Spawn)?);
                }
                if let Some((r, w)) = stderr_pipe {
                    let _ = close(w);
                    pipes.stderr = Some(PipeEnd::new(r).map_err(DispatchError::Spawn)?);
                }
                Ok((
                    ChildProcess {
                        pid: Some(child),
                        timeout,
                    },
                    pipes,
                ))
            }
        }
    }

    /// Polls for normal termination up to `self.timeout`, with a fixed
    /// polling granularity.
    pub fn wait(&mut self) -> Result<Option<WaitStatus>, DispatchError> {
        let pid = match self.pid {
            Some(pid) => pid,
            None => return Ok(None),
        };
        let deadline = Instant::now() + self.timeout;
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(WAIT_POLL_INTERVAL);
                }
                Ok(status) => {
                    self.pid = None;
                    return Ok(Some(status));
                }
                Err(nix::errno::Errno::ECHILD) | Err(nix::errno::Errno::ESRCH) => {
                    self.pid = None;
                    return Ok(None);
                }
                Err(e) => return Err(DispatchError::Spawn(e)),
            }
        }
    }

    /// Best-effort graceful termination: SIGTERM, wait, then SIGKILL, wait
    /// again. `ESRCH` at any point counts as success.
    pub fn terminate(&mut self) {
        let pid = match self.pid {
            Some(pid) => pid,
            None => return,
        };

        if kill(pid, Signal::SIGTERM).is_ok() && self.wait().ok().flatten().is_some() {
            return;
        }
        if self.pid.is_none() {
            return;
        }

        let _ = kill(pid, Signal::SIGKILL);
        let _ = self.wait();

        // Last resort: block until reaped, so we never leak a zombie.
        if self.pid.is_some() {
            let _ = waitpid(pid, None);
            self.pid = None;
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.pid.is_some() {
            self.terminate();
        }
    }
}
