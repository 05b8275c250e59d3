//! Removal of a directory chain far deeper than the open-file limit.
//!
//! Kept in its own test binary: lowering `RLIMIT_NOFILE` is process-wide.

use auto_tmpdir_core::remover::SecureTreeRemover;
use nix::sys::resource::{Resource, getrlimit, setrlimit};
use nix::unistd::geteuid;
use std::fs;

const FD_LIMIT: u64 = 64;
const DEPTH: usize = 600;

#[test]
fn chain_deeper_than_fd_limit_is_removed() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("job_1");

    let mut leaf = root.clone();
    for _ in 0..DEPTH {
        leaf.push("d");
    }
    fs::create_dir_all(&leaf).unwrap();
    fs::write(leaf.join("bottom"), b"x").unwrap();

    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
    setrlimit(Resource::RLIMIT_NOFILE, FD_LIMIT.min(hard), hard).unwrap();
    let result = SecureTreeRemover::new(geteuid()).remove(&root);
    setrlimit(Resource::RLIMIT_NOFILE, soft, hard).unwrap();

    let report = result.unwrap();
    assert!(!root.exists());
    // every level, the file at the bottom and the root itself
    assert_eq!(report.removed.len(), DEPTH + 2);
    assert_eq!(report.removed.first(), Some(&leaf.join("bottom")));
}
