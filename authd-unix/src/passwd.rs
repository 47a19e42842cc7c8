//! Minimal passwd(5) reader.
//!
//! The local-groups sweep needs to know whether a name still belongs to a
//! host account. Going through the NSS stack here would loop back into the
//! daemon itself, so the file is read directly; the path is injectable for
//! tests.

use std::collections::HashSet;
use std::io;
use std::path::Path;

/// Return the set of account names declared in the given passwd file.
///
/// Malformed lines are skipped rather than treated as errors; the host file
/// is not under our control.
pub fn account_names(passwd_path: &Path) -> io::Result<HashSet<String>> {
    let content = std::fs::read_to_string(passwd_path)?;
    Ok(content
        .lines()
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split(':').next())
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parses_names_and_skips_garbage() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "root:x:0:0:root:/root:/bin/bash").unwrap();
        writeln!(f, "daemon:x:1:1::/usr/sbin:/usr/sbin/nologin").unwrap();
        writeln!(f, "# comment").unwrap();
        writeln!(f).unwrap();
        writeln!(f, ":::broken").unwrap();

        let names = account_names(f.path()).unwrap();
        assert!(names.contains("root"));
        assert!(names.contains("daemon"));
        assert_eq!(names.len(), 2);
    }
}
