// SPDX-License-Identifier: AGPL-3.0-only

//! Flow-controlled forwarding of captured child output.
//!
//! The forwarder owns the read ends of up to two anonymous pipes (one for
//! standard output, one for standard error) whose write ends the child
//! inherits. Bytes read from either pipe are written to the supervisor's
//! own standard output, consuming [`CreditWindow`] budget as they go.

use {
    crate::error::{Error, ResultExt},
    muontrap_os as os,
    std::os::unix::io::{AsRawFd, OwnedFd},
};

#[cfg(not(target_os = "linux"))]
use std::os::unix::io::RawFd;

/// Whether, and how, to capture the child's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapturePolicy
{
    /// Forward the child's standard output.
    pub capture_output: bool,

    /// With `capture_output`: also forward standard error. Without it:
    /// also discard standard error (send it to the same sink as stdout).
    pub capture_stderr: bool,
}

/// Write ends of the capture pipes, inherited by the child.
pub struct CaptureWriteEnds
{
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

/// Read ends of the capture pipes, owned by the supervisor loop.
pub struct CaptureReadEnds
{
    pub stdout: Option<OwnedFd>,
    pub stderr: Option<OwnedFd>,
}

/// Create the capture pipes called for by `policy`.
///
/// Both ends are close-on-exec; the child dup2s the write end into place
/// before exec, which clears `CLOEXEC` on the duplicate.
pub fn open_pipes(policy: CapturePolicy) -> Result<(CaptureReadEnds, CaptureWriteEnds), Error>
{
    if !policy.capture_output {
        return Ok((
            CaptureReadEnds{stdout: None, stderr: None},
            CaptureWriteEnds{stdout: None, stderr: None},
        ));
    }

    let [stdout_r, stdout_w] = os::pipe2(0).context("pipe2: stdout capture")?;
    let (stderr_r, stderr_w) = if policy.capture_stderr {
        let [r, w] = os::pipe2(0).context("pipe2: stderr capture")?;
        (Some(r), Some(w))
    } else {
        (None, None)
    };

    Ok((
        CaptureReadEnds{stdout: Some(stdout_r), stderr: stderr_r},
        CaptureWriteEnds{stdout: Some(stdout_w), stderr: stderr_w},
    ))
}

/// The credit-based back-pressure window.
///
/// `available` is consumed one-for-one by bytes forwarded to the
/// supervisor's standard output, and replenished by acknowledgement bytes
/// read from standard input: each byte *b* returns *(1 + b)* credit.
pub struct CreditWindow
{
    max: u32,
    available: u32,
}

impl CreditWindow
{
    /// A fresh window, fully credited, with the given maximum.
    pub fn new(max: u32) -> Self
    {
        Self{max, available: max}
    }

    /// Whether the window currently allows any forwarding.
    pub fn is_open(&self) -> bool
    {
        self.available > 0
    }

    /// The number of bytes that may currently be forwarded.
    pub fn available(&self) -> u32
    {
        self.available
    }

    /// Record that `n` bytes were forwarded.
    pub fn consume(&mut self, n: u32)
    {
        self.available = self.available.saturating_sub(n);
    }

    /// Apply acknowledgement bytes read from standard input.
    ///
    /// Each byte *b* returns *(1 + b)* credit. Fails if the total would
    /// push `available` above `max`: the host is misbehaving.
    pub fn acknowledge(&mut self, bytes: &[u8]) -> Result<(), String>
    {
        let mut total: u32 = 0;
        for &b in bytes {
            total += 1 + u32::from(b);
        }
        let new_available = self.available + total;
        if new_available > self.max {
            return Err(format!(
                "too many acks {new_available}/{max}, got {total}",
                max = self.max,
            ));
        }
        self.available = new_available;
        Ok(())
    }
}

/// Forward up to `window`'s available credit from `fd_in` to `fd_out`.
///
/// On Linux this moves bytes in-kernel via `splice(2)`; elsewhere it
/// falls back to a bounded intermediate buffer.
pub fn forward(
    fd_in:  &impl AsRawFd,
    fd_out: &impl AsRawFd,
    window: &mut CreditWindow,
) -> Result<(), Error>
{
    if !window.is_open() {
        return Ok(());
    }
    let moved = forward_impl(fd_in, fd_out, window.available() as usize)?;
    window.consume(moved as u32);
    Ok(())
}

#[cfg(target_os = "linux")]
fn forward_impl(fd_in: &impl AsRawFd, fd_out: &impl AsRawFd, max: usize) -> Result<usize, Error>
{
    loop {
        match os::splice(fd_in, fd_out, max) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(Error{inner: err, context: "splice: stdio forward".into()}),
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn forward_impl(fd_in: &impl AsRawFd, fd_out: &impl AsRawFd, max: usize) -> Result<usize, Error>
{
    let max = max.min(4096);
    let mut buf = vec![0u8; max];
    let got = raw_read(fd_in.as_raw_fd(), &mut buf)
        .context("read: stdio forward")?;

    let mut written = 0;
    while written < got {
        written += raw_write(fd_out.as_raw_fd(), &buf[written .. got])
            .context("write: stdio forward")?;
    }
    Ok(written)
}

#[cfg(not(target_os = "linux"))]
fn raw_read(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize>
{
    loop {
        match unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) } {
            -1 if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted => continue,
            -1 => return Err(std::io::Error::last_os_error()),
            n  => return Ok(n as usize),
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn raw_write(fd: RawFd, buf: &[u8]) -> std::io::Result<usize>
{
    loop {
        match unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) } {
            -1 if std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted => continue,
            -1 => return Err(std::io::Error::last_os_error()),
            n  => return Ok(n as usize),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn zero_byte_ack_returns_exactly_one_credit()
    {
        let mut window = CreditWindow::new(16);
        window.consume(16);
        assert_eq!(window.available(), 0);
        window.acknowledge(&[0]).unwrap();
        assert_eq!(window.available(), 1);
    }

    #[test]
    fn max_byte_ack_returns_256_credit()
    {
        let mut window = CreditWindow::new(1000);
        window.consume(300);
        window.acknowledge(&[255]).unwrap();
        assert_eq!(window.available(), 1000 - 300 + 256);
    }

    #[test]
    fn over_credit_is_rejected()
    {
        let mut window = CreditWindow::new(16);
        assert!(window.acknowledge(&[255]).is_err());
    }

    #[test]
    fn multiple_acks_in_one_read_accumulate()
    {
        let mut window = CreditWindow::new(16);
        window.consume(16);
        window.acknowledge(&[3, 3, 3, 3]).unwrap();
        assert_eq!(window.available(), 16);
    }

    #[test]
    fn window_closes_at_zero_and_reopens_after_credit()
    {
        let mut window = CreditWindow::new(16);
        window.consume(16);
        assert!(!window.is_open());
        window.acknowledge(&[0]).unwrap();
        assert!(window.is_open());
    }
}
