//! Ownership-checked recursive removal.
//!
//! The walk works on directory file descriptors only: every child is looked
//! up with `fstatat(AT_SYMLINK_NOFOLLOW)`, opened with `openat(O_NOFOLLOW)`
//! and removed with `unlinkat` relative to its parent. The working directory
//! is never changed, symlinks are removed as links, and directories on a
//! different device than the root are not entered.
//!
//! Only the directory being emptied is held open. Descending closes the
//! parent; climbing back reopens it through `..` and checks it is still the
//! directory that was left, so tree depth is not bounded by `RLIMIT_NOFILE`.

use crate::error::RemovalFailure;
use crate::{Result, TmpdirError};
use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::{AT_FDCWD, AtFlags, OFlag};
use nix::sys::stat::{FileStat, Mode, SFlag, fstat, fstatat};
use nix::unistd::{Uid, UnlinkatFlags, unlinkat};
use std::ffi::{CStr, CString, OsStr};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

const DIR_FLAGS: OFlag = OFlag::O_RDONLY
    .union(OFlag::O_DIRECTORY)
    .union(OFlag::O_NOFOLLOW)
    .union(OFlag::O_CLOEXEC);

/// What to remove under the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemovalScope {
    /// The root and everything below it
    #[default]
    Tree,
    /// Everything below the root; the root itself stays
    ContentsOnly,
}

/// What a successful removal did.
#[derive(Debug, Default)]
pub struct RemovalReport {
    /// Entries removed, in removal order
    pub removed: Vec<PathBuf>,
    /// False when the root was missing or unreadable and nothing was done
    pub root_present: bool,
}

/// Removes a tree only if its root belongs to the expected user.
#[derive(Debug, Clone, Copy)]
pub struct SecureTreeRemover {
    owner: Uid,
    scope: RemovalScope,
}

impl SecureTreeRemover {
    #[must_use]
    pub const fn new(owner: Uid) -> Self {
        Self {
            owner,
            scope: RemovalScope::Tree,
        }
    }

    #[must_use]
    pub const fn scope(mut self, scope: RemovalScope) -> Self {
        self.scope = scope;
        self
    }

    /// Remove `root` and its contents.
    ///
    /// A missing or unreadable root is a successful no-op. A root owned by
    /// anyone else is refused before anything is touched. Individual entry
    /// failures do not stop the walk; they are returned together as
    /// [`TmpdirError::PartialDelete`].
    pub fn remove(&self, root: &Path) -> Result<RemovalReport> {
        let mut report = RemovalReport::default();

        let root_dir = match Dir::open(root, DIR_FLAGS, Mode::empty()) {
            Ok(dir) => dir,
            Err(e) => {
                tracing::debug!(path = %root.display(), error = %e, "nothing to remove");
                return Ok(report);
            }
        };
        let st = match fstat(&root_dir) {
            Ok(st) => st,
            Err(e) => {
                tracing::debug!(path = %root.display(), error = %e, "unable to stat removal root");
                return Ok(report);
            }
        };
        report.root_present = true;

        if st.st_uid != self.owner.as_raw() {
            return Err(TmpdirError::OwnershipMismatch {
                path: root.to_path_buf(),
                expected: self.owner.as_raw(),
                found: st.st_uid,
            });
        }

        let mut walk = Walk {
            root_dev: st.st_dev,
            removed: Vec::new(),
            failures: Vec::new(),
        };
        walk.run(root_dir, root, &st);

        if self.scope == RemovalScope::Tree {
            // unlinkat never follows a symlink in the final component
            match unlinkat(AT_FDCWD, root, UnlinkatFlags::RemoveDir) {
                Ok(()) => walk.removed.push(root.to_path_buf()),
                Err(Errno::ENOENT) => {}
                Err(e) => walk.fail(root, e.into()),
            }
        }

        report.removed = walk.removed;
        if walk.failures.is_empty() {
            tracing::debug!(
                path = %root.display(),
                entries = report.removed.len(),
                "removed directory tree"
            );
            Ok(report)
        } else {
            Err(TmpdirError::PartialDelete {
                path: root.to_path_buf(),
                failures: walk.failures,
            })
        }
    }
}

/// A directory on the walk's current branch.
struct Frame {
    path: PathBuf,
    /// Name in the parent; `None` for the root
    name: Option<CString>,
    dev: libc::dev_t,
    ino: libc::ino_t,
    /// Children not visited yet
    pending: Vec<CString>,
}

struct Walk {
    root_dev: libc::dev_t,
    removed: Vec<PathBuf>,
    failures: Vec<RemovalFailure>,
}

impl Walk {
    /// Empty the root, deepest entries first.
    fn run(&mut self, mut current: Dir, root: &Path, st: &FileStat) {
        let Some(pending) = self.names(&mut current, root) else {
            return;
        };
        let mut stack = vec![Frame {
            path: root.to_path_buf(),
            name: None,
            dev: st.st_dev,
            ino: st.st_ino,
            pending,
        }];

        while let Some(frame) = stack.last_mut() {
            if let Some(name) = frame.pending.pop() {
                let path = frame.path.join(OsStr::from_bytes(name.to_bytes()));
                if let Some((dir, child)) = self.descend(&current, name, path) {
                    current = dir;
                    stack.push(child);
                }
                continue;
            }

            let Some(done) = stack.pop() else { break };
            let (Some(name), Some(parent)) = (done.name, stack.last()) else {
                break;
            };
            match ascend(&current, parent) {
                Ok(dir) => current = dir,
                Err(e) => {
                    // the branch moved; nothing above it can be reached safely
                    self.fail(&done.path, e);
                    break;
                }
            }
            self.unlink(&current, &name, &done.path, UnlinkatFlags::RemoveDir);
        }
    }

    /// Remove a non-directory child, or open a directory child for emptying.
    fn descend(&mut self, parent: &Dir, name: CString, path: PathBuf) -> Option<(Dir, Frame)> {
        let st = match fstatat(parent, name.as_c_str(), AtFlags::AT_SYMLINK_NOFOLLOW) {
            Ok(st) => st,
            Err(Errno::ENOENT) => return None,
            Err(e) => {
                self.fail(&path, e.into());
                return None;
            }
        };

        if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT != SFlag::S_IFDIR {
            self.unlink(parent, &name, &path, UnlinkatFlags::NoRemoveDir);
            return None;
        }

        if st.st_dev != self.root_dev {
            self.fail(&path, Errno::EXDEV.into());
            return None;
        }

        let mut dir = match Dir::openat(parent, name.as_c_str(), DIR_FLAGS, Mode::empty()) {
            Ok(dir) => dir,
            Err(Errno::ENOENT) => return None,
            Err(e) => {
                self.fail(&path, e.into());
                return None;
            }
        };
        // the entry must still be the directory we looked at
        match fstat(&dir) {
            Ok(now) if now.st_dev == st.st_dev && now.st_ino == st.st_ino => {}
            Ok(_) => {
                self.fail(&path, Errno::ESTALE.into());
                return None;
            }
            Err(e) => {
                self.fail(&path, e.into());
                return None;
            }
        }

        let pending = self.names(&mut dir, &path)?;
        Some((
            dir,
            Frame {
                path,
                name: Some(name),
                dev: st.st_dev,
                ino: st.st_ino,
                pending,
            },
        ))
    }

    /// Child names, without `.` and `..`.
    fn names(&mut self, dir: &mut Dir, path: &Path) -> Option<Vec<CString>> {
        let mut names = Vec::new();
        for entry in dir.iter() {
            match entry {
                Ok(entry) => {
                    let name = entry.file_name();
                    let bytes = name.to_bytes();
                    if bytes != b"." && bytes != b".." {
                        names.push(name.to_owned());
                    }
                }
                Err(e) => {
                    self.fail(path, e.into());
                    return None;
                }
            }
        }
        Some(names)
    }

    fn unlink(&mut self, parent: &Dir, name: &CStr, path: &Path, flag: UnlinkatFlags) {
        match unlinkat(parent, name, flag) {
            Ok(()) => self.removed.push(path.to_path_buf()),
            // already gone: a peer removed it
            Err(Errno::ENOENT) => {}
            Err(e) => self.fail(path, e.into()),
        }
    }

    fn fail(&mut self, path: &Path, source: io::Error) {
        tracing::debug!(path = %path.display(), error = %source, "unable to remove entry");
        self.failures.push(RemovalFailure {
            path: path.to_path_buf(),
            source,
        });
    }
}

/// Reopen the parent of `current` and make sure it is still `parent`.
fn ascend(current: &Dir, parent: &Frame) -> io::Result<Dir> {
    let dir = Dir::openat(current, "..", DIR_FLAGS, Mode::empty())?;
    let st = fstat(&dir)?;
    if st.st_dev == parent.dev && st.st_ino == parent.ino {
        Ok(dir)
    } else {
        Err(Errno::ESTALE.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::geteuid;
    use std::fs;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::create_dir_all(root.join("d")).unwrap();
        fs::write(root.join("top.txt"), b"1").unwrap();
        fs::write(root.join("a/one"), b"1").unwrap();
        fs::write(root.join("a/b/two"), b"2").unwrap();
        fs::write(root.join("a/b/c/three"), b"3").unwrap();
        std::os::unix::fs::symlink("a/b", root.join("d/link")).unwrap();
    }

    #[test]
    fn removes_whole_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("job_42");
        populate(&root);

        let report = SecureTreeRemover::new(geteuid()).remove(&root).unwrap();

        assert!(report.root_present);
        assert!(!root.exists());
        assert_eq!(report.removed.last(), Some(&root));
    }

    #[test]
    fn missing_root_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("job_42");

        let report = SecureTreeRemover::new(geteuid()).remove(&root).unwrap();
        assert!(!report.root_present);
        assert!(report.removed.is_empty());
    }

    #[test]
    fn second_removal_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("job_42");
        populate(&root);
        let remover = SecureTreeRemover::new(geteuid());

        assert!(remover.remove(&root).unwrap().root_present);
        let again = remover.remove(&root).unwrap();
        assert!(!again.root_present);
        assert!(again.removed.is_empty());
    }

    #[test]
    fn foreign_owner_is_refused_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("job_42");
        populate(&root);
        let stranger = Uid::from_raw(geteuid().as_raw().wrapping_add(1));

        let err = SecureTreeRemover::new(stranger).remove(&root).unwrap_err();

        match err {
            TmpdirError::OwnershipMismatch {
                expected, found, ..
            } => {
                assert_eq!(expected, stranger.as_raw());
                assert_eq!(found, geteuid().as_raw());
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(root.join("a/b/c/three").exists());
        assert!(root.join("d/link").symlink_metadata().is_ok());
    }

    #[test]
    fn symlink_target_outside_tree_survives() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("job_42");
        let outside = tmp.path().join("precious");
        fs::create_dir_all(&root).unwrap();
        fs::create_dir_all(&outside).unwrap();
        fs::write(outside.join("data"), b"keep me").unwrap();
        std::os::unix::fs::symlink(&outside, root.join("escape")).unwrap();
        std::os::unix::fs::symlink(outside.join("data"), root.join("file-link")).unwrap();

        let report = SecureTreeRemover::new(geteuid()).remove(&root).unwrap();

        assert!(!root.exists());
        assert!(report.removed.contains(&root.join("escape")));
        assert_eq!(fs::read(outside.join("data")).unwrap(), b"keep me");
    }

    #[test]
    fn symlinked_root_is_not_followed() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("real");
        populate(&target);
        let root = tmp.path().join("job_42");
        std::os::unix::fs::symlink(&target, &root).unwrap();

        let report = SecureTreeRemover::new(geteuid()).remove(&root).unwrap();

        assert!(!report.root_present);
        assert!(target.join("a/b/c/three").exists());
        assert!(root.symlink_metadata().is_ok());
    }

    #[test]
    fn directories_go_after_their_descendants() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("job_42");
        populate(&root);

        let report = SecureTreeRemover::new(geteuid()).remove(&root).unwrap();

        for (i, removed) in report.removed.iter().enumerate() {
            for later in &report.removed[i + 1..] {
                assert!(
                    !later.starts_with(removed) || later == removed,
                    "{} removed before its descendant {}",
                    removed.display(),
                    later.display()
                );
            }
        }
        assert_eq!(report.removed.len(), 10);
    }

    #[test]
    fn contents_only_keeps_root() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("mnt");
        populate(&root);

        SecureTreeRemover::new(geteuid())
            .scope(RemovalScope::ContentsOnly)
            .remove(&root)
            .unwrap();

        assert!(root.is_dir());
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
    }

    #[test]
    fn failures_do_not_stop_the_walk() {
        use std::os::unix::fs::PermissionsExt;

        if geteuid().is_root() {
            // root ignores directory permissions
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("job_42");
        fs::create_dir_all(root.join("locked")).unwrap();
        fs::create_dir_all(root.join("open")).unwrap();
        fs::write(root.join("locked/stuck"), b"x").unwrap();
        fs::write(root.join("open/gone"), b"x").unwrap();
        fs::set_permissions(root.join("locked"), fs::Permissions::from_mode(0o500)).unwrap();

        let err = SecureTreeRemover::new(geteuid()).remove(&root).unwrap_err();

        fs::set_permissions(root.join("locked"), fs::Permissions::from_mode(0o700)).unwrap();
        match err {
            TmpdirError::PartialDelete { failures, .. } => {
                assert!(failures.iter().any(|f| f.path == root.join("locked/stuck")));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!root.join("open").exists());
        assert!(root.join("locked/stuck").exists());
    }
}
