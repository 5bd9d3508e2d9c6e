//! Three-FD non-blocking pump: feed the cached body into the filter's
//! stdin, drain its stdout into a new cache, and drain its stderr into the
//! reject accumulator.

use std::{
    os::unix::io::AsRawFd,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags},
    sys::wait::WaitStatus,
};

use crate::{
    child::{ChildPipes, ChildProcess, EnterFilterCallback},
    reject_buffer::RejectBuffer,
    DispatchError, FilterConfig, Host, SessionContext, Verdict,
};

const READ_CHUNK: usize = 1024;

struct ForkedInto<'a, H: Host + ?Sized> {
    host: &'a H,
    ctx: &'a SessionContext,
}

impl<'a, H: Host + ?Sized> EnterFilterCallback for ForkedInto<'a, H> {
    fn setup_forked(&self) {
        self.host.setup_forked(self.ctx, true);
    }
}

/// Runs the pipe-filter driver to completion.
pub fn run(
    ctx: &SessionContext,
    cfg: &FilterConfig,
    host: &mut impl Host,
) -> Result<Verdict, DispatchError> {
    let command = cfg
        .command
        .as_deref()
        .expect("pipe driver requires a command");

    let (mut child, pipes) = {
        let enter = ForkedInto { host, ctx };
        ChildProcess::spawn(command, true, true, true, cfg.timeout, &enter)?
    };

    host.write_data(ctx, &[])?; // open the out-cache for writing

    let ChildPipes {
        mut stdin,
        mut stdout,
        mut stderr,
    } = pipes;

    let mut reject = RejectBuffer::new();
    let mut input_buf: Vec<u8> = Vec::new();
    let mut input_pos = 0;
    let mut input_eof = false;

    loop {
        if stdin.is_none() && stdout.is_none() && stderr.is_none() {
            break;
        }
        if host.is_quit() {
            child.terminate();
            return Err(DispatchError::Cancelled);
        }

        let timeout_ms = i32::try_from(cfg.timeout.as_millis()).unwrap_or(i32::MAX);
        let deadline = Instant::now() + cfg.timeout;

        // Scoped so the borrows `PollFd` holds on `stdin`/`stdout`/`stderr`
        // end before we need to mutate those variables below.
        let (stdout_ready, stderr_ready, stdin_ready) = {
            let mut fds = Vec::new();
            let stdout_idx = stdout.as_ref().map(|p| {
                fds.push(PollFd::new(p, PollFlags::POLLIN));
                fds.len() - 1
            });
            let stderr_idx = stderr.as_ref().map(|p| {
                fds.push(PollFd::new(p, PollFlags::POLLIN));
                fds.len() - 1
            });
            let stdin_idx = stdin.as_ref().map(|p| {
                fds.push(PollFd::new(p, PollFlags::POLLOUT));
                fds.len() - 1
            });

            let n = match poll(&mut fds, timeout_ms) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(_) => {
                    child.terminate();
                    return Err(DispatchError::Io(std::io::Error::last_os_error()));
                }
            };
            if n == 0 {
                child.terminate();
                return Err(DispatchError::Timeout);
            }

            let ready = |idx: Option<usize>, mask: PollFlags| {
                idx.is_some_and(|i| {
                    fds[i]
                        .revents()
                        .map(|r| r.intersects(mask))
                        .unwrap_or(false)
                })
            };
            (
                ready(stdout_idx, PollFlags::POLLIN | PollFlags::POLLHUP),
                ready(stderr_idx, PollFlags::POLLIN | PollFlags::POLLHUP),
                ready(
                    stdin_idx,
                    PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR,
                ),
            )
        };

        if Instant::now() > deadline + Duration::from_secs(1) {
            // poll() woke up but we somehow ran far past the deadline anyway
            // (e.g. heavily loaded host); treat it the same as a timeout.
            child.terminate();
            return Err(DispatchError::Timeout);
        }

        if stdout_ready {
            let mut buf = [0u8; READ_CHUNK];
            match stdout.as_mut().unwrap().as_raw_fd_read(&mut buf) {
                Ok(0) => stdout = None,
                Ok(n) => host.write_data(ctx, &buf[..n])?,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    child.terminate();
                    return Err(DispatchError::Io(e));
                }
            }
        }

        if stderr_ready {
            let mut buf = [0u8; READ_CHUNK];
            match stderr.as_mut().unwrap().as_raw_fd_read(&mut buf) {
                Ok(0) => stderr = None,
                Ok(n) => reject.append(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    child.terminate();
                    return Err(DispatchError::Io(e));
                }
            }
        }

        if stdin_ready {
            if input_pos >= input_buf.len() {
                if input_eof {
                    stdin = None;
                } else {
                    input_buf.resize(16 * 1024, 0);
                    let n = host.read_data(ctx, &mut input_buf)?;
                    input_buf.truncate(n);
                    input_pos = 0;
                    if n == 0 {
                        input_eof = true;
                        stdin = None;
                    }
                }
            } else {
                match stdin.as_mut().unwrap().as_raw_fd_write(&input_buf[input_pos..]) {
                    Ok(n) => input_pos += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) if e.raw_os_error() == Some(Errno::EPIPE as i32) => {
                        // Filter quit reading early; drain the rest of the
                        // host's input and stop writing. Not an error.
                        loop {
                            input_buf.resize(16 * 1024, 0);
                            let n = host.read_data(ctx, &mut input_buf)?;
                            if n == 0 {
                                break;
                            }
                        }
                        stdin = None;
                    }
                    Err(e) => {
                        child.terminate();
                        return Err(DispatchError::Io(e));
                    }
                }
            }
        }
    }

    host.write_data(ctx, &[])?; // flush/close the out-cache

    let status = child.wait()?.ok_or(DispatchError::Timeout)?;
    match status {
        WaitStatus::Exited(_, 0) => Ok(Verdict::Accepted),
        WaitStatus::Exited(_, _) => Ok(Verdict::Rejected(reject.finalize())),
        _ => Err(DispatchError::AbnormalExit),
    }
}

trait RawFdIo {
    fn as_raw_fd_read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn as_raw_fd_write(&mut self, buf: &[u8]) -> std::io::Result<usize>;
}

impl<T: AsRawFd> RawFdIo for T {
    fn as_raw_fd_read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let res = unsafe { libc::read(self.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len()) };
        if res < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }

    fn as_raw_fd_write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let res = unsafe { libc::write(self.as_raw_fd(), buf.as_ptr() as *const _, buf.len()) };
        if res < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res as usize)
        }
    }
}
