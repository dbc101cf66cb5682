// SPDX-License-Identifier: AGPL-3.0-only

//! The self-pipe: converting asynchronous signal delivery into a
//! pollable stream.
//!
//! [`SIGCHLD`], [`SIGINT`], [`SIGQUIT`], and [`SIGTERM`] are the only
//! signals this crate cares about. The handler installed for all four
//! does exactly one thing: write the signal number into the write end
//! of a pipe. That write is the only thing the handler is allowed to
//! do, since a signal handler can run at any point on the main thread's
//! stack and most of libc is not safe to call from it.

use {
    crate::error::{Error, ResultExt},
    muontrap_os::{self as os, SIGCHLD, SIGINT, SIGQUIT, SIGTERM, pid_t},
    std::{
        mem::forget,
        os::unix::io::{AsRawFd, OwnedFd, RawFd},
        slice,
        sync::atomic::{AtomicI32, Ordering},
        time::{Duration, Instant},
    },
};

/// The signals this crate installs a handler for.
const HANDLED_SIGNALS: [libc::c_int; 4] = [SIGCHLD, SIGINT, SIGQUIT, SIGTERM];

/// Write end of the signal pipe, readable only from the signal handler.
///
/// `-1` means "not yet installed"; the handler checks for this so a
/// signal arriving before [`SignalPipe::install`] finishes is simply
/// dropped rather than causing undefined behavior.
static SIGNAL_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handler(signum: libc::c_int)
{
    let fd = SIGNAL_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        os::write_signal_number(fd, signum);
    }
}

/// The read end of the self-pipe, owned exclusively by the supervisor loop.
pub struct SignalPipe
{
    read: OwnedFd,
}

impl SignalPipe
{
    /// Create the pipe and install the handler for all four signals.
    ///
    /// Both ends of the pipe are close-on-exec, so the forked child does
    /// not inherit them.
    pub fn install() -> Result<Self, Error>
    {
        let [read, write] = os::pipe2(0).context("pipe2: signal pipe")?;

        // The write end lives for the rest of the process; the handler
        // needs it to stay open and there is nobody else to close it.
        SIGNAL_WRITE_FD.store(write.as_raw_fd(), Ordering::Relaxed);
        forget(write);

        for &signum in &HANDLED_SIGNALS {
            os::sigaction(signum, handler)
                .context(format!("sigaction({signum})"))?;
        }

        Ok(Self{read})
    }

    /// Restore default disposition for all four signals.
    ///
    /// Called once, at the very end of teardown.
    pub fn restore_default()
    {
        for &signum in &HANDLED_SIGNALS {
            let _ = os::sigaction_default(signum);
        }
    }

    /// Read one signal number off the pipe. Blocks if none is pending;
    /// callers are expected to only call this after `poll` reports the
    /// read end as readable.
    pub fn read_one(&self) -> Result<libc::c_int, Error>
    {
        os::read_signal_number(&self.read).context("read: signal pipe")
    }

    /// Wait up to `timeout` for SIGCHLD to reap `pid_to_match`.
    ///
    /// Any other pid reaped along the way is reaped and ignored. Returns
    /// `Ok(true)` only if `pid_to_match` was reaped before the deadline;
    /// a terminating signal observed during the wait counts the same as
    /// a timeout, matching the original's `wait_for_sigchld`.
    pub fn wait_for_sigchld(&self, pid_to_match: pid_t, timeout: Duration) -> Result<bool, Error>
    {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let timeout_ms = remaining.as_millis().min(i32::MAX as u128) as i32;

            let mut pollfd = os::pollfd{fd: self.as_raw_fd(), events: os::POLLIN, revents: 0};
            match os::poll(slice::from_mut(&mut pollfd), timeout_ms) {
                Ok(0) => return Ok(false),
                Ok(_) => {},
                Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
                Err(inner) => return Err(Error{inner, context: "poll: signal pipe".into()}),
            }

            match self.read_one()? {
                SIGCHLD => {
                    let mut matched = false;
                    reap_all(|pid, _status| matched |= pid == pid_to_match)?;
                    if matched {
                        return Ok(true);
                    }
                },
                SIGINT | SIGQUIT | SIGTERM => return Ok(false),
                _ => return Ok(false),
            }
        }
    }
}

impl AsRawFd for SignalPipe
{
    fn as_raw_fd(&self) -> RawFd
    {
        self.read.as_raw_fd()
    }
}

/// Reap every currently-exited child without blocking.
///
/// A single `SIGCHLD` delivery can correspond to more than one exited
/// child (deliveries of the same signal can coalesce), so every reaction
/// to `SIGCHLD` drains `waitpid(-1, WNOHANG)` until no more children are
/// immediately reapable. `on_reaped` is called once per reaped pid.
pub fn reap_all(
    mut on_reaped: impl FnMut(pid_t, std::process::ExitStatus),
) -> Result<(), Error>
{
    loop {
        match os::waitpid(-1, os::WNOHANG) {
            Ok((0, _)) => return Ok(()),
            Ok((pid, status)) => on_reaped(pid, status),
            Err(err) if err.raw_os_error() == Some(libc::ECHILD) => return Ok(()),
            Err(err) => return Err(Error{inner: err, context: "waitpid".into()}),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn handler_writes_the_signal_number_to_the_installed_fd()
    {
        // Exercise the handler function directly rather than raising a
        // real signal, since raising SIGTERM in a test process would
        // either kill it or require its own handler juggling.
        let [read, write] = os::pipe2(0).unwrap();
        let previous = SIGNAL_WRITE_FD.swap(write.as_raw_fd(), Ordering::Relaxed);
        handler(SIGTERM);
        SIGNAL_WRITE_FD.store(previous, Ordering::Relaxed);

        let pipe = SignalPipe{read};
        assert_eq!(pipe.read_one().unwrap(), SIGTERM);
    }
}
