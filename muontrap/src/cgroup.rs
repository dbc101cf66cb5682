// SPDX-License-Identifier: AGPL-3.0-only

//! The control-group manager.
//!
//! A [`Controllers`] holds one entry per `--controller` given on the
//! command line, in the order they were first named. Each entry tracks
//! the settings queued for it with `--set` and, once [`Controllers::finalize`]
//! has computed paths, the absolute group directory and member file used
//! by every later step: [`Controllers::create`], [`Controllers::apply_settings`],
//! [`Controllers::join`], [`Controllers::kill_members`], [`Controllers::destroy`].

use {
    crate::error::{Error, ResultExt},
    muontrap_os::{self as os, pid_t},
    std::{
        io,
        path::{Path, PathBuf},
    },
};

/// Where the kernel mounts the cgroup hierarchy.
const CGROUP_MOUNT_PATH: &str = "/sys/fs/cgroup";

/// A handle to a previously-added controller, returned by [`Controllers::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle(usize);

struct Controller
{
    name: String,
    settings: Vec<(String, Vec<u8>)>,
    group_path: Option<PathBuf>,
    member_file: Option<PathBuf>,
}

/// The ordered collection of controllers built while parsing the command
/// line, and the operations performed on it over the life of a run.
pub struct Controllers
{
    root: PathBuf,
    items: Vec<Controller>,
}

/// Why a controller's leaf directory could not be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateFailure
{
    /// The leaf directory named by `--group` already existed.
    LeafAlreadyExists,

    /// Some other `mkdir(2)` failure.
    Other,
}

impl Controllers
{
    /// A fresh, empty collection rooted at `/sys/fs/cgroup`.
    pub fn new() -> Self
    {
        Self::with_root(PathBuf::from(CGROUP_MOUNT_PATH))
    }

    /// Like [`Controllers::new`], but rooted elsewhere.
    ///
    /// Only used by this module's own tests: the command-line surface
    /// has no option for the cgroup root, matching the original.
    #[cfg(test)]
    pub(crate) fn with_root(root: PathBuf) -> Self
    {
        Self{root, items: Vec::new()}
    }

    #[cfg(not(test))]
    fn with_root(root: PathBuf) -> Self
    {
        Self{root, items: Vec::new()}
    }

    /// Whether any controllers have been added.
    pub fn is_empty(&self) -> bool
    {
        self.items.is_empty()
    }

    /// Append a controller named `name`, or return the handle of the
    /// existing one if already present (first-wins on duplicate names).
    pub fn add(&mut self, name: &str) -> Handle
    {
        if let Some(i) = self.items.iter().position(|c| c.name == name) {
            return Handle(i);
        }
        self.items.push(Controller{
            name: name.to_owned(),
            settings: Vec::new(),
            group_path: None,
            member_file: None,
        });
        Handle(self.items.len() - 1)
    }

    /// Queue writing `value` to the file named `key` inside the
    /// controller's group directory, in insertion order.
    pub fn set(&mut self, handle: Handle, key: &str, value: &str)
    {
        self.items[handle.0].settings.push((key.to_owned(), value.as_bytes().to_vec()));
    }

    /// Compute the absolute group path and member-file path of every
    /// controller, given the single relative path shared by all of them.
    ///
    /// Must be called after all `--controller`/`--set` options have been
    /// parsed and before any filesystem action.
    pub fn finalize(&mut self, relative: &Path)
    {
        for controller in &mut self.items {
            let group_path = self.root.join(&controller.name).join(relative);
            let member_file = group_path.join("cgroup.procs");
            controller.group_path = Some(group_path);
            controller.member_file = Some(member_file);
        }
    }

    /// Create every controller's leaf directory.
    ///
    /// Directories are created component-by-component starting from
    /// `<root>/<name>`, which is expected to already exist (the kernel
    /// creates one directory per mounted controller). Only the final
    /// component — the leaf named by `--group` — is required to be
    /// absent beforehand.
    pub fn create(&self) -> Result<(), (String, CreateFailure, Error)>
    {
        for controller in &self.items {
            let group_path = controller.group_path.as_ref()
                .expect("finalize must run before create");
            let base = self.root.join(&controller.name);
            log::debug!("mkdir -p {}", group_path.display());
            if let Err(err) = mkdir_p(&base, group_path) {
                let kind = if err.raw_os_error() == Some(libc::EEXIST) {
                    CreateFailure::LeafAlreadyExists
                } else {
                    CreateFailure::Other
                };
                return Err((
                    controller.name.clone(),
                    kind,
                    Error{inner: err, context: format!("mkdir: {}", group_path.display()).into()},
                ));
            }
        }
        Ok(())
    }

    /// Write every queued setting to its controller's group directory,
    /// in the order `--set` was given on the command line.
    pub fn apply_settings(&self) -> Result<(), Error>
    {
        for controller in &self.items {
            let group_path = controller.group_path.as_ref()
                .expect("finalize must run before apply_settings");
            for (key, value) in &controller.settings {
                let path = group_path.join(key);
                log::debug!("write {} -> {}", String::from_utf8_lossy(value), path.display());
                write_file(&path, value)
                    .context(format!("write: {}", path.display()))?;
            }
        }
        Ok(())
    }

    /// Add `pid` to every controller's member file.
    ///
    /// Called by the child immediately after fork, before it execs.
    pub fn join(&self, pid: pid_t) -> Result<(), Error>
    {
        for controller in &self.items {
            let member_file = controller.member_file.as_ref()
                .expect("finalize must run before join");
            log::debug!("join {} -> {}", pid, member_file.display());
            write_file(member_file, pid.to_string().as_bytes())
                .context(format!("write: {}", member_file.display()))?;
        }
        Ok(())
    }

    /// Send `signal` to every pid currently listed in every controller's
    /// member file. Returns the number of pids signalled.
    ///
    /// Errors opening or reading a member file are tolerated as "no
    /// members", matching the original's `procfile_killall`.
    pub fn kill_members(&self, signal: libc::c_int) -> usize
    {
        let mut total = 0;
        for controller in &self.items {
            let Some(member_file) = &controller.member_file else { continue };
            let Some(contents) = read_member_file(member_file) else { continue };
            for token in contents.split_whitespace() {
                if let Ok(pid) = token.parse::<pid_t>() {
                    log::debug!("kill -{} {}", signal, pid);
                    let _ = os::kill(pid, signal);
                    total += 1;
                }
            }
        }
        total
    }

    /// The pids currently listed in every controller's member file,
    /// grouped by controller name. Used only to log a warning when the
    /// sweep in teardown exhausts its retry budget with members left.
    pub fn remaining_members(&self) -> Vec<(String, Vec<pid_t>)>
    {
        self.items.iter().filter_map(|controller| {
            let member_file = controller.member_file.as_ref()?;
            let contents = read_member_file(member_file)?;
            let pids = contents.split_whitespace()
                .filter_map(|token| token.parse::<pid_t>().ok())
                .collect();
            Some((controller.name.clone(), pids))
        }).collect()
    }

    /// Remove every controller's leaf directory.
    ///
    /// Errors are logged and ignored: the supervisor never tracked what,
    /// if anything, it created above the leaf, and does not attempt to
    /// remove those.
    pub fn destroy(&self)
    {
        for controller in &self.items {
            let Some(group_path) = &controller.group_path else { continue };
            log::debug!("rmdir {}", group_path.display());
            if let Err(err) = remove_dir(group_path) {
                log::warn!("error removing {}: {}", group_path.display(), err);
            }
        }
    }
}

/// Create every path component of `target` from `base` downward.
///
/// Matches the original's `mkdir_p`: only the result of the very last
/// `mkdir(2)` call (the leaf) determines success; earlier components are
/// created best-effort (they usually already exist).
fn mkdir_p(base: &Path, target: &Path) -> io::Result<()>
{
    let relative = target.strip_prefix(base).unwrap_or(target);
    let mut acc = base.to_path_buf();
    let mut last = Ok(());
    for component in relative.components() {
        acc.push(component);
        last = mkdir_one(&acc);
    }
    last
}

fn mkdir_one(path: &Path) -> io::Result<()>
{
    let path = path.to_str().ok_or_else(|| io::Error::new(
        io::ErrorKind::InvalidInput, "cgroup path is not valid UTF-8",
    ))?;
    os::mkdir(path.to_owned(), 0o755)
}

fn write_file(path: &Path, value: &[u8]) -> io::Result<()>
{
    use std::io::Write;
    let path = path.to_str().ok_or_else(|| io::Error::new(
        io::ErrorKind::InvalidInput, "cgroup path is not valid UTF-8",
    ))?;
    let fd = os::open(path.to_owned(), os::O_WRONLY | os::O_TRUNC, 0)?;
    let mut file = std::fs::File::from(fd);
    file.write_all(value)
}

fn remove_dir(path: &Path) -> io::Result<()>
{
    let path = path.to_str().ok_or_else(|| io::Error::new(
        io::ErrorKind::InvalidInput, "cgroup path is not valid UTF-8",
    ))?;
    os::rmdir(path.to_owned())
}

/// Read a member file's entire contents as a string.
///
/// Returns `None` on any error (missing file, permission denied, not
/// valid UTF-8) — callers treat that the same as "no members".
fn read_member_file(path: &Path) -> Option<String>
{
    let str_path = path.to_str()?;
    let fd = os::open(str_path.to_owned(), os::O_RDONLY, 0).ok()?;

    let mut contents = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match os::read(&fd, &mut buf) {
            Ok(0) => break,
            Ok(n) => contents.extend_from_slice(&buf[.. n]),
            Err(_) => return None,
        }
    }
    String::from_utf8(contents).ok()
}

#[cfg(test)]
mod tests
{
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn add_deduplicates_by_name_first_wins()
    {
        let mut controllers = Controllers::with_root(PathBuf::from("/unused"));
        let a = controllers.add("memory");
        let b = controllers.add("memory");
        assert_eq!(a, b);
        assert_eq!(controllers.items.len(), 1);
    }

    #[test]
    fn settings_are_applied_in_insertion_order()
    {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("memory")).unwrap();

        let mut controllers = Controllers::with_root(root.path().to_path_buf());
        let handle = controllers.add("memory");
        controllers.finalize(Path::new("leaf"));
        controllers.create().unwrap();

        controllers.set(handle, "memory.max", "100");
        controllers.set(handle, "memory.max", "200");
        controllers.apply_settings().unwrap();

        let path = root.path().join("memory/leaf/memory.max");
        assert_eq!(std::fs::read_to_string(path).unwrap(), "200");
    }

    #[test]
    fn create_fails_if_leaf_already_exists()
    {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("memory/leaf")).unwrap();

        let mut controllers = Controllers::with_root(root.path().to_path_buf());
        controllers.add("memory");
        controllers.finalize(Path::new("leaf"));

        let err = controllers.create().unwrap_err();
        assert_eq!(err.1, CreateFailure::LeafAlreadyExists);
    }

    #[test]
    fn join_and_kill_members_round_trip()
    {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("memory/leaf")).unwrap();
        std::fs::write(root.path().join("memory/leaf/cgroup.procs"), "").unwrap();

        let mut controllers = Controllers::with_root(root.path().to_path_buf());
        controllers.add("memory");
        controllers.finalize(Path::new("leaf"));

        controllers.join(4242).unwrap();
        let members = controllers.remaining_members();
        assert_eq!(members, vec![("memory".to_owned(), vec![4242])]);
    }

    #[test]
    fn destroy_removes_the_leaf_directory_only()
    {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("memory/leaf")).unwrap();

        let mut controllers = Controllers::with_root(root.path().to_path_buf());
        controllers.add("memory");
        controllers.finalize(Path::new("leaf"));
        controllers.destroy();

        assert!(!root.path().join("memory/leaf").exists());
        assert!(root.path().join("memory").exists());
    }
}
