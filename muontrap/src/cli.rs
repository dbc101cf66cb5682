// SPDX-License-Identifier: AGPL-3.0-only

//! The command-line front end.
//!
//! Turns argv into a [`Config`] before any side effect occurs: no pipe,
//! cgroup directory, or process is created until [`parse`] returns `Ok`.

use {
    crate::cgroup::{Controllers, Handle},
    clap::{Arg, ArgAction, Command},
    muontrap_os::{cstr::CStringArray, gid_t, uid_t},
    std::{ffi::CString, path::PathBuf, time::Duration},
};

/// Minimum accepted `--stdio-window`, enforced silently (never rejected).
const MIN_STDIO_WINDOW: u32 = 16;

/// Default `--stdio-window`.
const DEFAULT_STDIO_WINDOW: u32 = 10240;

/// Default `--delay-to-sigkill`, in milliseconds.
const DEFAULT_GRACE_MS: u64 = 500;

/// The immutable value produced by parsing argv.
///
/// Constructed once, never mutated; every other component borrows from it.
pub struct Config
{
    /// The controllers named by `--controller`/`--set`, in command-line order.
    pub controllers: Controllers,

    /// The path given by `--group`, relative to each controller's root.
    ///
    /// Required iff `controllers` is non-empty.
    pub group_path: Option<PathBuf>,

    /// Target gid to drop to, resolved and validated. Never zero.
    pub target_gid: Option<gid_t>,

    /// Target uid to drop to, resolved and validated. Never zero.
    pub target_uid: Option<uid_t>,

    /// Grace between SIGTERM and SIGKILL during teardown.
    pub grace: Duration,

    /// Maximum size of the output credit window.
    pub stdio_window_max: u32,

    /// Whether to forward the child's standard output.
    pub capture_output: bool,

    /// Whether to forward (or, without capture, discard) standard error.
    pub capture_stderr: bool,

    /// Override for argv[0], if `--arg0` was given.
    pub arg0: Option<CString>,

    /// The target program, to be located via `PATH` as `execvp(3)` does.
    pub program: CString,

    /// The full argument vector passed to `execvp(3)`, element 0 already
    /// replaced by [`Config::arg0`] if one was given.
    pub argv: CStringArray,
}

/// Outcome of parsing argv.
pub enum Outcome
{
    /// `--help` was given: the usage text has already been printed.
    Help,

    /// A runnable configuration.
    Run(Config),
}

/// Parse `args` (including the program name in position 0, as `std::env::args`
/// yields it) into an [`Outcome`].
///
/// Returns a single human-readable diagnostic line on any failure: an
/// unrecognized option, a missing argument, or a validation failure from
/// §4.7. No side effect has occurred when this returns `Err`.
pub fn parse<I, T>(args: I) -> Result<Outcome, String>
    where I: IntoIterator<Item = T>
        , T: Into<std::ffi::OsString> + Clone
{
    let matches = match command().try_get_matches_from(args) {
        Ok(matches) => matches,
        Err(err) if is_help_or_version(&err) => {
            print!("{err}");
            return Ok(Outcome::Help);
        },
        Err(err) => return Err(err.to_string().trim_end().to_owned()),
    };

    let mut controllers = Controllers::new();
    apply_controller_and_set_options(&matches, &mut controllers)?;

    let group_path = matches.get_one::<String>("group").map(PathBuf::from);
    match (controllers.is_empty(), &group_path) {
        (true, Some(_))  => return Err("Specify a cgroup controller (-c) if you specify a group_path".to_owned()),
        (false, None)    => return Err("Specify a cgroup group_path (-g)".to_owned()),
        _                => {},
    }
    if let Some(path) = &group_path {
        controllers.finalize(path);
    }

    let target_gid = match matches.get_one::<String>("gid") {
        Some(value) => Some(resolve_gid(value)?),
        None         => None,
    };
    let target_uid = match matches.get_one::<String>("uid") {
        Some(value) => Some(resolve_uid(value)?),
        None         => None,
    };

    let grace = Duration::from_millis(
        match matches.get_one::<String>("delay-to-sigkill") {
            Some(value) => value.parse()
                .map_err(|_| format!("Invalid --delay-to-sigkill value '{value}'"))?,
            None => DEFAULT_GRACE_MS,
        },
    );

    let stdio_window_max = match matches.get_one::<String>("stdio-window") {
        Some(value) => {
            let requested: u32 = value.parse()
                .map_err(|_| format!("Invalid --stdio-window value '{value}'"))?;
            requested.max(MIN_STDIO_WINDOW)
        },
        None => DEFAULT_STDIO_WINDOW,
    };

    let capture_output = matches.get_flag("capture-output");
    let capture_stderr = matches.get_flag("capture-stderr");

    let arg0 = match matches.get_one::<String>("arg0") {
        Some(value) => Some(CString::new(value.as_str())
            .map_err(|_| "--arg0 must not contain a NUL byte".to_owned())?),
        None => None,
    };

    let tokens: Vec<&String> = matches.get_many::<String>("program")
        .ok_or_else(|| "Specify a program to run".to_owned())?
        .collect();
    let program_name = tokens.first()
        .ok_or_else(|| "Specify a program to run".to_owned())?;
    let program = CString::new(program_name.as_str())
        .map_err(|_| "program name must not contain a NUL byte".to_owned())?;

    let mut argv = CStringArray::new();
    for (i, token) in tokens.iter().enumerate() {
        let value = if i == 0 {
            arg0.clone().unwrap_or_else(|| program.clone())
        } else {
            CString::new(token.as_str())
                .map_err(|_| "program arguments must not contain a NUL byte".to_owned())?
        };
        argv.push(value);
    }

    Ok(Outcome::Run(Config{
        controllers,
        group_path,
        target_gid,
        target_uid,
        grace,
        stdio_window_max,
        capture_output,
        capture_stderr,
        arg0,
        program,
        argv,
    }))
}

fn is_help_or_version(err: &clap::Error) -> bool
{
    use clap::error::ErrorKind;
    matches!(err.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion)
}

/// Build up `controllers` by interleaving `-c`/`--controller` and
/// `-s`/`--set` in the order they appeared on the command line: each
/// `--set` attaches to the most recently named controller, exactly like
/// the original's `current_controller`.
fn apply_controller_and_set_options(
    matches: &clap::ArgMatches,
    controllers: &mut Controllers,
) -> Result<(), String>
{
    enum Event<'a> { Controller(&'a str), Set(&'a str) }

    let mut events: Vec<(usize, Event)> = Vec::new();

    if let (Some(indices), Some(values)) = (
        matches.indices_of("controller"),
        matches.get_many::<String>("controller"),
    ) {
        events.extend(indices.zip(values).map(|(i, v)| (i, Event::Controller(v.as_str()))));
    }
    if let (Some(indices), Some(values)) = (
        matches.indices_of("set"),
        matches.get_many::<String>("set"),
    ) {
        events.extend(indices.zip(values).map(|(i, v)| (i, Event::Set(v.as_str()))));
    }
    events.sort_by_key(|(index, _)| *index);

    let mut current: Option<Handle> = None;
    for (_, event) in events {
        match event {
            Event::Controller(name) => current = Some(controllers.add(name)),
            Event::Set(spec) => {
                let handle = current.ok_or_else(||
                    "Specify a cgroup controller (-c) before setting a variable".to_owned())?;
                let (key, value) = spec.split_once('=').ok_or_else(||
                    format!("No '=' found when setting a variable: '{spec}'"))?;
                controllers.set(handle, key, value);
            },
        }
    }
    Ok(())
}

/// Resolve a `--uid` argument: a literal decimal integer is used as-is,
/// otherwise the string is looked up with `getpwnam(3)`. Either way, a
/// resolved value of 0 is rejected.
fn resolve_uid(value: &str) -> Result<uid_t, String>
{
    let uid = match value.parse::<uid_t>() {
        Ok(uid) => uid,
        Err(_) => {
            let name = CString::new(value)
                .map_err(|_| format!("Unknown user '{value}'"))?;
            muontrap_os::getpwnam(&name)
                .map_err(|err| format!("Looking up user '{value}': {err}"))?
                .ok_or_else(|| format!("Unknown user '{value}'"))?
        },
    };
    if uid == 0 {
        return Err("Setting the user to root or uid 0 is not allowed".to_owned());
    }
    Ok(uid)
}

/// Resolve a `--gid` argument, analogous to [`resolve_uid`] but via `getgrnam(3)`.
fn resolve_gid(value: &str) -> Result<gid_t, String>
{
    let gid = match value.parse::<gid_t>() {
        Ok(gid) => gid,
        Err(_) => {
            let name = CString::new(value)
                .map_err(|_| format!("Unknown group '{value}'"))?;
            muontrap_os::getgrnam(&name)
                .map_err(|err| format!("Looking up group '{value}': {err}"))?
                .ok_or_else(|| format!("Unknown group '{value}'"))?
        },
    };
    if gid == 0 {
        return Err("Setting the group to root or gid 0 is not allowed".to_owned());
    }
    Ok(gid)
}

fn command() -> Command
{
    Command::new("muontrap")
        .about("Confine a child process and its descendants to a cgroup and guarantee their cleanup")
        .override_usage("muontrap [OPTION]... -- <program> <args>")
        .arg(Arg::new("arg0").short('0').long("arg0").value_name("ARG0"))
        .arg(Arg::new("controller").short('c').long("controller")
            .value_name("CONTROLLER").action(ArgAction::Append))
        .arg(Arg::new("group").short('g').long("group").value_name("PATH"))
        .arg(Arg::new("set").short('s').long("set")
            .value_name("KEY=VALUE").action(ArgAction::Append))
        .arg(Arg::new("uid").short('u').long("uid").value_name("UID-OR-NAME"))
        .arg(Arg::new("gid").short('a').long("gid").value_name("GID-OR-NAME"))
        .arg(Arg::new("delay-to-sigkill").short('k').long("delay-to-sigkill").value_name("MILLISECONDS"))
        .arg(Arg::new("stdio-window").short('l').long("stdio-window").value_name("BYTES"))
        .arg(Arg::new("capture-output").short('o').long("capture-output").action(ArgAction::SetTrue))
        .arg(Arg::new("capture-stderr").short('e').long("capture-stderr").action(ArgAction::SetTrue))
        .arg(Arg::new("program").value_name("PROGRAM").num_args(1..)
            .trailing_var_arg(true).allow_hyphen_values(true))
}

#[cfg(test)]
mod tests
{
    use super::*;

    fn parse_args(args: &[&str]) -> Result<Config, String>
    {
        let mut full = vec!["muontrap".to_owned()];
        full.extend(args.iter().map(|s| s.to_string()));
        match parse(full)? {
            Outcome::Run(config) => Ok(config),
            Outcome::Help        => panic!("unexpected --help"),
        }
    }

    #[test]
    fn missing_program_is_an_error()
    {
        assert!(parse_args(&[]).is_err());
    }

    #[test]
    fn simple_program_with_no_options()
    {
        let config = parse_args(&["--", "true"]).unwrap();
        assert_eq!(config.program, CString::new("true").unwrap());
        assert!(config.controllers.is_empty());
    }

    #[test]
    fn group_without_controller_is_rejected()
    {
        assert!(parse_args(&["-g", "foo", "--", "true"]).is_err());
    }

    #[test]
    fn controller_without_group_is_rejected()
    {
        assert!(parse_args(&["-c", "memory", "--", "true"]).is_err());
    }

    #[test]
    fn set_before_any_controller_is_rejected()
    {
        assert!(parse_args(&["-s", "memory.max=100", "-g", "x", "--", "true"]).is_err());
    }

    #[test]
    fn set_attaches_to_the_most_recently_named_controller()
    {
        let config = parse_args(&[
            "-c", "memory", "-s", "memory.max=100",
            "-c", "cpu", "-s", "cpu.weight=50",
            "-g", "x", "--", "true",
        ]).unwrap();
        assert!(!config.controllers.is_empty());
    }

    #[test]
    fn uid_zero_is_rejected()
    {
        assert!(parse_args(&["-u", "0", "--", "true"]).is_err());
    }

    #[test]
    fn stdio_window_is_clamped_to_minimum()
    {
        let config = parse_args(&["-l", "0", "--", "true"]).unwrap();
        assert_eq!(config.stdio_window_max, MIN_STDIO_WINDOW);
    }

    #[test]
    fn arg0_override_replaces_only_argv_zero()
    {
        let config = parse_args(&["-0", "myname", "--", "true", "--flag"]).unwrap();
        assert_eq!(config.program, CString::new("true").unwrap());
    }

    #[test]
    fn help_does_not_error()
    {
        let outcome = parse(vec!["muontrap".to_owned(), "--help".to_owned()]).unwrap();
        assert!(matches!(outcome, Outcome::Help));
    }
}
