// SPDX-License-Identifier: AGPL-3.0-only

#![feature(io_safety)]
#![feature(never_type)]
#![feature(unwrap_infallible)]
#![warn(missing_docs)]

//! Confine a child process and its descendants to a cgroup and guarantee
//! their cleanup.
//!
//! This crate is the library half of the `muontrap` binary. [`cli`] turns
//! argv into a [`cli::Config`]; [`supervisor::run`] takes that `Config` and
//! does everything else: installs signal handling, sets up the cgroups,
//! forks the target program, forwards its output under a credit-based
//! window, and tears everything down again no matter how the run ends.

pub mod cgroup;
pub mod child;
pub mod cli;
pub mod error;
pub mod forwarder;
pub mod signals;
pub mod supervisor;
pub mod teardown;
