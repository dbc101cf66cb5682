// SPDX-License-Identifier: AGPL-3.0-only

//! Wrappers for various system calls.
//!
//! The wrappers retain the original names and behaviors of the system calls,
//! making it easy to look up their exact behavior in the man pages.
//! However, there are a few trivial differences for ease of use:
//!
//!  - Errors are reported via using [`Result`] instead of `errno`.
//!  - New file descriptors are returned using [`OwnedFd`].
//!  - `*_CLOEXEC` is passed to file handle creation functions by default,
//!    as setting this flag in a separate call incurs a race condition.
//!  - String arguments and array arguments are passed in a memory-safe way.
//!    The exact ways in which this is done are ad-hoc for some functions.
//!
//! These functions do not allocate memory except:
//!
//!  - When they call a trait method that allocates memory.
//!  - When otherwise noted.

#![feature(io_safety)]
#![feature(maybe_uninit_slice)]
#![feature(never_type)]
#![feature(unwrap_infallible)]
#![warn(missing_docs)]

use {
    crate::cstr::{CStringArr, WithCStr},
    std::{
        ffi::CStr,
        io::{Error, Result},
        mem::MaybeUninit,
        os::unix::{io::{AsRawFd, FromRawFd, OwnedFd}, process::ExitStatusExt},
        process::ExitStatus,
    },
};

pub use libc::{
    EAGAIN,
    O_CLOEXEC,
    O_RDONLY,
    O_TRUNC,
    O_WRONLY,
    POLLHUP,
    POLLIN,
    SIGCHLD,
    SIGINT,
    SIGKILL,
    SIGQUIT,
    SIGTERM,
    WNOHANG,
    gid_t,
    mode_t,
    pid_t,
    pollfd,
    uid_t,
};

pub mod cstr;

/// _exit(2).
pub fn _exit(status: libc::c_int) -> !
{
    unsafe {
        libc::_exit(status);
    }
}

/// dup2(2).
pub fn dup2(oldfd: &impl AsRawFd, newfd: libc::c_int) -> Result<()>
{
    unsafe {
        match libc::dup2(oldfd.as_raw_fd(), newfd) {
            -1 => Err(Error::last_os_error()),
            _  => Ok(()),
        }
    }
}

/// execvp(3).
///
/// Searches `PATH` for `file` the way a shell would, unless `file`
/// contains a slash, in which case it is used as-is.
pub fn execvp(file: impl WithCStr, argv: &CStringArr) -> Error
{
    let result: Result<!> = file.with_cstr(|file| {
        unsafe {
            libc::execvp(file.as_ptr(), argv.as_ptr());
        }
        Err(Error::last_os_error())
    });
    result.into_err()
}

/// fork(2).
///
/// # Safety
///
/// The child process may only call async-signal-safe functions
/// until it calls [`execvp`] or [`_exit`].
pub unsafe fn fork() -> Result<pid_t>
{
    match libc::fork() {
        -1  => Err(Error::last_os_error()),
        pid => Ok(pid),
    }
}

/// getgid(2).
pub fn getgid() -> gid_t
{
    unsafe {
        libc::getgid()
    }
}

/// getuid(2).
pub fn getuid() -> uid_t
{
    unsafe {
        libc::getuid()
    }
}

/// getpid(2).
pub fn getpid() -> pid_t
{
    unsafe {
        libc::getpid()
    }
}

/// Look up a user by name, as with getpwnam(3).
///
/// Returns `Ok(None)` if no such user exists.
pub fn getpwnam(name: &CStr) -> Result<Option<uid_t>>
{
    unsafe {
        let mut buf = vec![0 as libc::c_char; 16384];
        let mut pwd: libc::passwd = std::mem::zeroed();
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        loop {
            let rc = libc::getpwnam_r(
                name.as_ptr(), &mut pwd,
                buf.as_mut_ptr(), buf.len(),
                &mut result,
            );
            match rc {
                0 if result.is_null() => return Ok(None),
                0                     => return Ok(Some(pwd.pw_uid)),
                libc::ERANGE          => buf.resize(buf.len() * 2, 0),
                errno                 => return Err(Error::from_raw_os_error(errno)),
            }
        }
    }
}

/// Look up a group by name, as with getgrnam(3).
///
/// Returns `Ok(None)` if no such group exists.
pub fn getgrnam(name: &CStr) -> Result<Option<gid_t>>
{
    unsafe {
        let mut buf = vec![0 as libc::c_char; 16384];
        let mut grp: libc::group = std::mem::zeroed();
        let mut result: *mut libc::group = std::ptr::null_mut();
        loop {
            let rc = libc::getgrnam_r(
                name.as_ptr(), &mut grp,
                buf.as_mut_ptr(), buf.len(),
                &mut result,
            );
            match rc {
                0 if result.is_null() => return Ok(None),
                0                     => return Ok(Some(grp.gr_gid)),
                libc::ERANGE          => buf.resize(buf.len() * 2, 0),
                errno                 => return Err(Error::from_raw_os_error(errno)),
            }
        }
    }
}

/// kill(2).
pub fn kill(pid: pid_t, sig: libc::c_int) -> Result<()>
{
    unsafe {
        match libc::kill(pid, sig) {
            -1 => Err(Error::last_os_error()),
            _  => Ok(())
        }
    }
}

/// mkdir(2).
pub fn mkdir(pathname: impl WithCStr, mode: mode_t) -> Result<()>
{
    pathname.with_cstr(|pathname| {
        unsafe {
            match libc::mkdir(pathname.as_ptr(), mode) {
                -1 => Err(Error::last_os_error()),
                _  => Ok(()),
            }
        }
    })
}

/// open(2).
pub fn open(
    pathname:  impl WithCStr,
    mut flags: libc::c_int,
    mode:      mode_t,
) -> Result<OwnedFd>
{
    flags |= libc::O_CLOEXEC;
    pathname.with_cstr(|pathname| {
        unsafe {
            match libc::open(pathname.as_ptr(), flags, mode) {
                -1 => Err(Error::last_os_error()),
                fd => Ok(OwnedFd::from_raw_fd(fd)),
            }
        }
    })
}

/// pipe2(2).
pub fn pipe2(mut flags: libc::c_int) -> Result<[OwnedFd; 2]>
{
    flags |= libc::O_CLOEXEC;
    unsafe {
        let mut pipefd = [0, 0];
        match libc::pipe2(pipefd.as_mut_ptr(), flags) {
            -1 => Err(Error::last_os_error()),
            _  => Ok(pipefd.map(|fd| OwnedFd::from_raw_fd(fd))),
        }
    }
}

/// poll(2).
pub fn poll(fds: &mut [pollfd], timeout: libc::c_int) -> Result<usize>
{
    unsafe {
        match libc::poll(fds.as_mut_ptr(), fds.len() as u64, timeout) {
            -1 => Err(Error::last_os_error()),
            n  => Ok(n as usize),
        }
    }
}

/// read(2).
///
/// Reads directly from `fd`, bypassing any userspace buffering. Callers
/// that multiplex `fd` with `poll` must use this instead of
/// [`std::io::Read`] on a buffered stream, which can silently strand
/// bytes a `poll` on the raw descriptor can never see again.
pub fn read(fd: &impl AsRawFd, buf: &mut [u8]) -> Result<usize>
{
    unsafe {
        match libc::read(fd.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, buf.len()) {
            -1 => Err(Error::last_os_error()),
            n  => Ok(n as usize),
        }
    }
}

/// rmdir(2).
pub fn rmdir(pathname: impl WithCStr) -> Result<()>
{
    pathname.with_cstr(|pathname| {
        unsafe {
            match libc::rmdir(pathname.as_ptr()) {
                -1 => Err(Error::last_os_error()),
                _  => Ok(()),
            }
        }
    })
}

/// setgid(2) followed by setting the real gid too, as with setregid(2).
///
/// Sets both the real and effective group id, matching the order
/// mandated for privilege drops: group before user.
pub fn setregid(rgid: gid_t, egid: gid_t) -> Result<()>
{
    unsafe {
        match libc::setregid(rgid, egid) {
            -1 => Err(Error::last_os_error()),
            _  => Ok(()),
        }
    }
}

/// setreuid(2).
///
/// Sets both the real and effective user id.
pub fn setreuid(ruid: uid_t, euid: uid_t) -> Result<()>
{
    unsafe {
        match libc::setreuid(ruid, euid) {
            -1 => Err(Error::last_os_error()),
            _  => Ok(()),
        }
    }
}

/// A signal handler registered with [`sigaction`].
///
/// Must be async-signal-safe: no allocations, no panics, no locks.
pub type SignalHandler = extern "C" fn(libc::c_int);

/// sigaction(2), installing `handler` for `signum` with an empty mask
/// and no flags, mirroring a plain `signal(2)` style installation.
pub fn sigaction(signum: libc::c_int, handler: SignalHandler) -> Result<()>
{
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = handler as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = 0;
        match libc::sigaction(signum, &sa, std::ptr::null_mut()) {
            -1 => Err(Error::last_os_error()),
            _  => Ok(()),
        }
    }
}

/// sigaction(2), restoring the default disposition for `signum`.
pub fn sigaction_default(signum: libc::c_int) -> Result<()>
{
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = 0;
        match libc::sigaction(signum, &sa, std::ptr::null_mut()) {
            -1 => Err(Error::last_os_error()),
            _  => Ok(()),
        }
    }
}

/// write(2) of a raw signal number.
///
/// Intended to be called from within a [`SignalHandler`]: a single
/// write of one machine word, async-signal-safe, errors ignored.
pub fn write_signal_number(fd: libc::c_int, signum: libc::c_int)
{
    unsafe {
        let bytes = signum.to_ne_bytes();
        libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len());
    }
}

/// read(2) of a raw signal number written by [`write_signal_number`].
pub fn read_signal_number(fd: &impl AsRawFd) -> Result<libc::c_int>
{
    unsafe {
        let mut bytes = [0u8; std::mem::size_of::<libc::c_int>()];
        match libc::read(fd.as_raw_fd(), bytes.as_mut_ptr() as *mut libc::c_void, bytes.len()) {
            -1 => Err(Error::last_os_error()),
            _  => Ok(libc::c_int::from_ne_bytes(bytes)),
        }
    }
}

/// splice(2).
///
/// Zero-copy move of bytes from one file descriptor to another,
/// without passing through userspace. Linux-only.
#[cfg(target_os = "linux")]
pub fn splice(
    fd_in:  &impl AsRawFd,
    fd_out: &impl AsRawFd,
    len:    usize,
) -> Result<usize>
{
    unsafe {
        match libc::splice(
            fd_in.as_raw_fd(), std::ptr::null_mut(),
            fd_out.as_raw_fd(), std::ptr::null_mut(),
            len, libc::SPLICE_F_MOVE,
        ) {
            -1 => Err(Error::last_os_error()),
            n  => Ok(n as usize),
        }
    }
}

/// waitpid(2).
pub fn waitpid(pid: pid_t, options: libc::c_int)
    -> Result<(pid_t, ExitStatus)>
{
    unsafe {
        let mut wstatus = 0;
        match libc::waitpid(pid, &mut wstatus, options) {
            -1  => Err(Error::last_os_error()),
            pid => Ok((pid, ExitStatus::from_raw(wstatus))),
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn getpwnam_root_resolves_to_uid_0()
    {
        let name = CStr::from_bytes_with_nul(b"root\0").unwrap();
        assert_eq!(getpwnam(name).unwrap(), Some(0));
    }

    #[test]
    fn getpwnam_unknown_user_is_none()
    {
        let name = CStr::from_bytes_with_nul(b"no-such-user-muontrap\0").unwrap();
        assert_eq!(getpwnam(name).unwrap(), None);
    }

    #[test]
    fn signal_number_round_trips_through_pipe()
    {
        let [r, w] = pipe2(0).unwrap();
        write_signal_number(w.as_raw_fd(), SIGTERM);
        assert_eq!(read_signal_number(&r).unwrap(), SIGTERM);
    }
}
