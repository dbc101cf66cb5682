// SPDX-License-Identifier: AGPL-3.0-only

//! Errors shared by the control-group, child-launch, and teardown machinery.
//!
//! The supervision machinery consists of a lot of different steps, any one
//! of which can fail with an error from the operating system. This type
//! wraps [`io::Error`] and adds contextual information about which step
//! failed, so a single diagnostic line can say both what went wrong and
//! where.

use std::{borrow::Cow, error, fmt, io};

/// Error related to an individual operating-system call.
#[derive(Debug)]
pub struct Error
{
    /// Which error ultimately occurred.
    pub inner: io::Error,

    /// Which step the error comes from.
    pub context: Cow<'static, str>,
}

impl Error
{
    /// Mimics [`io::Error::last_os_error`].
    pub fn last_os_error<C>(context: C) -> Self
        where C: Into<Cow<'static, str>>
    {
        Self{
            inner: io::Error::last_os_error(),
            context: context.into(),
        }
    }
}

impl error::Error for Error
{
}

impl fmt::Display for Error
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result
    {
        write!(f, "{}: {}", self.context, self.inner)
    }
}

/// Attach step context to a [`std::io::Result`].
pub trait ResultExt
{
    type Ok;

    fn context<C>(self, context: C) -> Result<Self::Ok, Error>
        where C: Into<Cow<'static, str>>;
}

impl<T> ResultExt for Result<T, io::Error>
{
    type Ok = T;

    fn context<C>(self, context: C) -> Result<T, Error>
        where C: Into<Cow<'static, str>>
    {
        self.map_err(|inner| Error{inner, context: context.into()})
    }
}

/// Top-level failure, covering every way the supervisor can fail to
/// produce the exit code of its immediate child.
///
/// This is the single type `main` matches on to choose an exit code.
/// Every variant that can occur once the immediate child has been forked
/// is reached only after teardown has already run (see the module-level
/// documentation of [`crate::supervisor`]).
#[derive(Debug, thiserror::Error)]
pub enum Failure
{
    /// A bad command line: unknown flag, missing argument, conflicting
    /// options, an unresolvable user/group name, or a forbidden uid/gid
    /// of 0. Occurs before any side effect.
    #[error("{0}")]
    Configuration(String),

    /// Could not create or populate a control-group directory.
    /// Occurs before the child is forked.
    #[error("{0}")]
    Cgroup(#[from] Error),

    /// The host misbehaved: it returned more credit than the configured
    /// window allows.
    #[error("protocol violation: {0}")]
    Protocol(String),
}
