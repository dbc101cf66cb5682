// SPDX-License-Identifier: AGPL-3.0-only

//! The child launcher: forks once, and in the child, joins the configured
//! control groups, remaps stdio per capture policy, drops privilege, and
//! execs the target program.

use {
    crate::{
        cgroup::Controllers,
        error::{Error, ResultExt},
        forwarder::{CapturePolicy, CaptureWriteEnds},
    },
    muontrap_os::{self as os, cstr::CStringArr, gid_t, pid_t, uid_t},
    std::ffi::CStr,
};

/// Everything the child needs to join its groups, set up its stdio, drop
/// privilege, and exec — gathered so nothing is looked up twice between
/// fork and exec.
pub struct Launch<'a>
{
    /// The control groups to join immediately after fork.
    pub controllers: &'a Controllers,

    /// Write ends of the capture pipes, to be dup2'd into place.
    pub capture: &'a CaptureWriteEnds,

    /// Which of `capture`'s ends are actually in use.
    pub capture_policy: CapturePolicy,

    /// Group to drop to before exec, if any.
    pub target_gid: Option<gid_t>,

    /// User to drop to before exec, if any.
    pub target_uid: Option<uid_t>,

    /// Program to exec, located via `PATH` as `execvp(3)` does.
    pub program: &'a CStr,

    /// Full argument vector, element 0 already resolved against `--arg0`.
    pub argv: &'a CStringArr,
}

/// Fork and, in the child, run [`Launch`] to completion.
///
/// # Safety
///
/// Must be called with no other threads running, as with any `fork(2)`.
pub unsafe fn spawn(launch: &Launch) -> Result<pid_t, Error>
{
    let pid = os::fork().context("fork")?;
    if pid == 0 {
        let error = child_main(launch);
        eprintln!("MUONTRAP: {error}");
        os::_exit(1);
    }
    Ok(pid)
}

/// Runs in the child between `fork(2)` and `execvp(3)`. Only returns on
/// failure — the normal path replaces the process image entirely.
fn child_main(launch: &Launch) -> Error
{
    if let Err(err) = launch.controllers.join(os::getpid()) {
        return err;
    }

    if let Err(err) = remap_stdio(launch) {
        return err;
    }

    // Drop privilege group-first, matching the mandated revocation order:
    // changing uid first would remove the ability to change gid.
    if let Some(gid) = launch.target_gid {
        if let Err(inner) = os::setregid(gid, gid) {
            return Error{inner, context: format!("setgid({gid})").into()};
        }
    }
    if let Some(uid) = launch.target_uid {
        if let Err(inner) = os::setreuid(uid, uid) {
            return Error{inner, context: format!("setuid({uid})").into()};
        }
    }

    let inner = os::execvp(launch.program, launch.argv);
    Error{inner, context: "execvp".into()}
}

fn remap_stdio(launch: &Launch) -> Result<(), Error>
{
    if launch.capture_policy.capture_output {
        let stdout = launch.capture.stdout.as_ref()
            .expect("capture_output implies an open stdout pipe");
        os::dup2(stdout, libc::STDOUT_FILENO).context("dup2: stdout")?;

        if launch.capture_policy.capture_stderr {
            let stderr = launch.capture.stderr.as_ref()
                .expect("capture_stderr implies an open stderr pipe");
            os::dup2(stderr, libc::STDERR_FILENO).context("dup2: stderr")?;
        }
    } else {
        let devnull = os::open("/dev/null", os::O_WRONLY, 0).context("open: /dev/null")?;
        os::dup2(&devnull, libc::STDOUT_FILENO).context("dup2: stdout")?;
        if launch.capture_policy.capture_stderr {
            os::dup2(&devnull, libc::STDERR_FILENO).context("dup2: stderr")?;
        }
    }
    Ok(())
}
