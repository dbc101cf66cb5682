// SPDX-License-Identifier: AGPL-3.0-only

//! Teardown: the two-phase child shutdown followed by the descendant
//! sweep and control-group removal. Runs unconditionally once the
//! supervisor loop exits, whatever the reason.

use {
    crate::{cgroup::Controllers, signals::SignalPipe},
    muontrap_os::{self as os, pid_t},
    std::time::Duration,
};

/// Inputs shared by every phase of teardown.
pub struct Teardown<'a>
{
    /// Used to wait for SIGCHLD during the polite-then-brutal kill.
    pub pipe: &'a SignalPipe,

    /// Swept for descendants and removed once the child is gone.
    pub controllers: &'a Controllers,

    /// Time allowed for the child to exit after each of SIGTERM and SIGKILL.
    pub grace: Duration,
}

/// Run every phase of teardown and return `exit_status` unchanged.
///
/// `still_running` says whether the immediate child (`child_pid`) was
/// still alive when the supervisor loop exited.
pub fn run(teardown: &Teardown, child_pid: pid_t, still_running: bool, exit_status: i32) -> i32
{
    if still_running {
        phase_a_polite_then_brutal(teardown, child_pid);
    }
    phase_b_sweep(teardown);
    phase_c_remove_directories(teardown);
    SignalPipe::restore_default();
    exit_status
}

/// Phase A: SIGTERM, a bounded wait, then SIGKILL and another bounded wait.
fn phase_a_polite_then_brutal(teardown: &Teardown, pid: pid_t)
{
    log::debug!("kill -TERM {pid}");
    if os::kill(pid, os::SIGTERM).is_err() {
        return;
    }
    if matches!(teardown.pipe.wait_for_sigchld(pid, teardown.grace), Ok(true)) {
        return;
    }

    log::debug!("kill -KILL {pid}");
    if os::kill(pid, os::SIGKILL).is_err() {
        return;
    }
    if !matches!(teardown.pipe.wait_for_sigchld(pid, teardown.grace), Ok(true)) {
        log::warn!("SIGKILL didn't reap pid {pid} within the grace period");
    }
}

/// Phase B: repeatedly SIGKILL every pid still listed in any controller's
/// member file, until none remain or the retry budget is exhausted.
///
/// Re-reads the member files every pass, since a descendant can fork
/// between one read and the next.
fn phase_b_sweep(teardown: &Teardown)
{
    let mut budget = teardown.grace.as_millis().max(1);
    loop {
        let signalled = teardown.controllers.kill_members(os::SIGKILL);
        if signalled == 0 {
            return;
        }
        if budget == 0 {
            log::warn!("failed to kill {signalled} descendant pid(s) within the retry budget");
            for (name, pids) in teardown.controllers.remaining_members() {
                log::warn!("  {name}: {pids:?}");
            }
            return;
        }
        std::thread::sleep(Duration::from_millis(1));
        budget -= 1;
    }
}

/// Phase C: remove every controller's leaf directory. Errors are logged
/// and ignored by [`Controllers::destroy`] itself.
fn phase_c_remove_directories(teardown: &Teardown)
{
    teardown.controllers.destroy();
}
