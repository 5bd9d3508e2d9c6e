//! File-filter driver: the filter inspects the cached body in place and
//! reports its verdict purely through its exit code and stderr, never
//! touching stdin/stdout.

use std::os::unix::io::AsRawFd;

use nix::{poll::PollFd, sys::wait::WaitStatus};

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

/// Runs the file-filter driver to completion.
///
/// The body must already be committed to `ctx.cachename` on disk by the host
/// ([`Host::cache_data`]) before this is called; the filter is handed that
/// path through its environment (via `setup_forked`), not through a pipe.
pub fn run(
    ctx: &SessionContext,
    cfg: &FilterConfig,
    host: &mut impl Host,
) -> Result<Verdict, DispatchError> {
    let command = cfg
        .command
        .as_deref()
        .expect("file driver requires a command");

    host.cache_data(ctx)?;

    let (mut child, pipes) = {
        let enter = ForkedInto { host, ctx };
        ChildProcess::spawn(command, false, false, true, cfg.timeout, &enter)?
    };

    let ChildPipes { mut stderr, .. } = pipes;
    let mut reject = RejectBuffer::new();

    loop {
        let stderr_end = match &stderr {
            Some(p) => p,
            None => break,
        };
        if host.is_quit() {
            child.terminate();
            return Err(DispatchError::Cancelled);
        }

        let timeout_ms = i32::try_from(cfg.timeout.as_millis()).unwrap_or(i32::MAX);
        let ready = {
            let mut fds = [PollFd::new(stderr_end, nix::poll::PollFlags::POLLIN)];
            match nix::poll::poll(&mut fds, timeout_ms) {
                Ok(0) => {
                    child.terminate();
                    return Err(DispatchError::Timeout);
                }
                Ok(_) => fds[0]
                    .revents()
                    .map(|r| r.intersects(nix::poll::PollFlags::POLLIN | nix::poll::PollFlags::POLLHUP))
                    .unwrap_or(false),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(_) => {
                    child.terminate();
                    return Err(DispatchError::Io(std::io::Error::last_os_error()));
                }
            }
        };

        if ready {
            let mut buf = [0u8; READ_CHUNK];
            let fd = stderr.as_ref().unwrap().as_raw_fd();
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::Interrupted
                {
                    continue;
                }
                child.terminate();
                return Err(DispatchError::Io(err));
            } else if n == 0 {
                stderr = None;
            } else {
                reject.append(&buf[..n as usize]);
            }
        }
    }

    let status = child.wait()?.ok_or(DispatchError::Timeout)?;
    match status {
        WaitStatus::Exited(_, 0) => Ok(Verdict::Accepted),
        WaitStatus::Exited(_, _) => Ok(Verdict::Rejected(reject.finalize())),
        _ => Err(DispatchError::AbnormalExit),
    }
}
