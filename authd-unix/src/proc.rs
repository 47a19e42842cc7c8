//! Live-process UID discovery.
//!
//! The expiry sweep must never remove a user that still owns a running
//! process. The live UID set is gathered by scanning the proc filesystem for
//! numeric directory entries and reading each one's owner.

use std::collections::HashSet;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Return the set of UIDs owning at least one running process.
///
/// `proc_dir` is `/proc` in production; tests point it at a fixture
/// directory. Entries that vanish mid-scan are skipped: the process exited,
/// which is exactly the state we are probing for.
pub fn uids_of_running_processes(proc_dir: &Path) -> io::Result<HashSet<u32>> {
    let mut uids = HashSet::new();

    for entry in std::fs::read_dir(proc_dir)? {
        let entry = entry?;

        // Only /proc/<pid>/ directories are process entries.
        if entry.file_name().to_string_lossy().parse::<u32>().is_err() {
            continue;
        }

        match entry.metadata() {
            Ok(meta) => {
                uids.insert(meta.uid());
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(uids)
}
