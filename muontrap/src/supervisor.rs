// SPDX-License-Identifier: AGPL-3.0-only

//! The supervisor loop: composes every other module into one run.
//!
//! Everything here after the immediate child is forked funnels into
//! [`teardown::run`] before returning, whatever the reason the loop
//! exited — this is the central invariant of the design: no path may
//! exit once the child exists without running teardown.

use {
    crate::{
        child, cli::Config,
        error::Failure,
        forwarder::{self, CapturePolicy, CaptureReadEnds, CreditWindow},
        signals::{self, SignalPipe},
        teardown::{self, Teardown},
    },
    muontrap_os::{self as os, pid_t},
    std::{
        os::unix::io::{AsRawFd, BorrowedFd},
        os::unix::process::ExitStatusExt,
        process::ExitStatus,
    },
};

/// Run the supervisor to completion and return the process exit code.
pub fn run(config: Config) -> i32
{
    match run_inner(config) {
        Ok(code) => code,
        Err(failure) => {
            log::error!("{failure}");
            eprintln!("MUONTRAP: {failure}");
            1
        },
    }
}

fn run_inner(config: Config) -> Result<i32, Failure>
{
    let Config{
        mut controllers, group_path: _, target_gid, target_uid, grace,
        stdio_window_max, capture_output, capture_stderr,
        arg0: _, program, argv,
    } = config;

    // Order matters here: the signal pipe and capture pipes must exist
    // before anything that can fail partway through — cgroup creation in
    // particular — so a terminating signal arriving during setup is
    // always observable by the event loop once it starts.
    let pipe = SignalPipe::install()?;

    let capture_policy = CapturePolicy{capture_output, capture_stderr};
    let (capture_read, capture_write) = forwarder::open_pipes(capture_policy)?;

    if !controllers.is_empty() {
        controllers.create().map_err(|(name, kind, err)| {
            use crate::cgroup::CreateFailure;
            match kind {
                CreateFailure::LeafAlreadyExists =>
                    Failure::Configuration(format!(
                        "'{name}' already exists. Please specify a deeper group_path or clean up the cgroup",
                    )),
                CreateFailure::Other =>
                    Failure::Configuration(format!("Couldn't create cgroup for '{name}': {err}")),
            }
        })?;
        controllers.apply_settings()?;
    }

    let launch = child::Launch{
        controllers:    &controllers,
        capture:        &capture_write,
        capture_policy,
        target_gid,
        target_uid,
        program:        &program,
        argv:           &argv,
    };
    // SAFETY: no other threads have been started by this point.
    let pid = unsafe { child::spawn(&launch) }?;

    // Drop our copies of the write ends: only the child should hold them,
    // so the read ends see EOF once the child (and its own forks of
    // these fds) are all gone.
    drop(capture_write);

    let mut window = CreditWindow::new(stdio_window_max);
    let outcome = event_loop(&pipe, &capture_read, &mut window, pid);

    let teardown = Teardown{pipe: &pipe, controllers: &controllers, grace};
    Ok(teardown::run(&teardown, pid, outcome.still_running, outcome.exit_status))
}

struct LoopOutcome
{
    exit_status: i32,
    still_running: bool,
}

fn event_loop(
    pipe: &SignalPipe,
    capture: &CaptureReadEnds,
    window: &mut CreditWindow,
    child_pid: pid_t,
) -> LoopOutcome
{
    loop {
        let mut fds = vec![
            os::pollfd{fd: libc::STDIN_FILENO, events: os::POLLIN | os::POLLHUP, revents: 0},
            os::pollfd{fd: pipe.as_raw_fd(), events: os::POLLIN, revents: 0},
        ];
        let stdout_slot = capture.stdout.as_ref().filter(|_| window.is_open()).map(|fd| {
            fds.push(os::pollfd{fd: fd.as_raw_fd(), events: os::POLLIN, revents: 0});
            fds.len() - 1
        });
        let stderr_slot = capture.stderr.as_ref().filter(|_| window.is_open()).map(|fd| {
            fds.push(os::pollfd{fd: fd.as_raw_fd(), events: os::POLLIN, revents: 0});
            fds.len() - 1
        });

        if let Err(err) = os::poll(&mut fds, -1) {
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            log::warn!("poll: {err}");
            return LoopOutcome{exit_status: 1, still_running: true};
        }

        if fds[0].revents & os::POLLHUP != 0 {
            log::debug!("stdin closed, exiting");
            return LoopOutcome{exit_status: 1, still_running: true};
        }

        if fds[0].revents & os::POLLIN != 0 {
            let mut acks = [0u8; 32];
            // Read the raw fd directly: `std::io::stdin()` is a shared,
            // buffered reader that can pull more bytes from the kernel
            // than `acks` holds and strand the rest where a later `poll`
            // on fd 0 can't see them.
            let stdin = unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) };
            match os::read(&stdin, &mut acks) {
                Ok(n) => {
                    if let Err(message) = window.acknowledge(&acks[.. n]) {
                        log::error!("{}", Failure::Protocol(message));
                        return LoopOutcome{exit_status: 1, still_running: true};
                    }
                },
                Err(err) => {
                    log::warn!("read stdin: {err}");
                    return LoopOutcome{exit_status: 1, still_running: true};
                },
            }
        }

        if let Some(slot) = stdout_slot {
            if fds[slot].revents != 0 {
                if let Some(fd) = &capture.stdout {
                    if let Err(err) = forwarder::forward(fd, &std::io::stdout(), window) {
                        log::warn!("{err}");
                    }
                }
            }
        }
        if let Some(slot) = stderr_slot {
            if fds[slot].revents != 0 {
                if let Some(fd) = &capture.stderr {
                    if let Err(err) = forwarder::forward(fd, &std::io::stdout(), window) {
                        log::warn!("{err}");
                    }
                }
            }
        }

        if fds[1].revents & os::POLLIN != 0 {
            match pipe.read_one() {
                Ok(os::SIGCHLD) => {
                    let mut reaped_status = None;
                    if let Err(err) = signals::reap_all(|pid, status| {
                        if pid == child_pid {
                            reaped_status = Some(status);
                        }
                    }) {
                        log::warn!("{err}");
                    }
                    if let Some(status) = reaped_status {
                        return LoopOutcome{
                            exit_status: map_exit_status(status),
                            still_running: false,
                        };
                    }
                },
                Ok(os::SIGINT) | Ok(os::SIGQUIT) | Ok(os::SIGTERM) => {
                    return LoopOutcome{exit_status: 1, still_running: true};
                },
                Ok(other) => {
                    log::warn!("unexpected signal: {other}");
                    return LoopOutcome{exit_status: 1, still_running: true};
                },
                Err(err) => {
                    log::warn!("read: signal pipe: {err}");
                    return LoopOutcome{exit_status: 1, still_running: true};
                },
            }
        }
    }
}

/// Map a reaped [`ExitStatus`] to the supervisor's own exit code,
/// following POSIX convention for signalled children: 128+*n*.
fn map_exit_status(status: ExitStatus) -> i32
{
    if let Some(signal) = status.signal() {
        128 + signal
    } else if let Some(code) = status.code() {
        code
    } else {
        1
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn normal_exit_code_is_passed_through()
    {
        let status = ExitStatus::from_raw(0 << 8);
        assert_eq!(map_exit_status(status), 0);
    }

    #[test]
    fn signalled_exit_maps_to_128_plus_signal()
    {
        let status = ExitStatus::from_raw(os::SIGTERM);
        assert_eq!(map_exit_status(status), 128 + os::SIGTERM);
    }
}
