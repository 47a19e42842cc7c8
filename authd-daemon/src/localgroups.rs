//! Reconciliation of host-local group membership.
//!
//! Brokers may declare purely local groups (no GID) for a user; those are
//! host groups in group(5), not records of the identity store. The shim
//! diffs the file against the declared set and rewrites it atomically.
//! Unparseable lines are carried through untouched.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::{DaemonError, Result};

/// One line of the group file. Anything that does not look like an entry is
/// preserved verbatim.
#[derive(Debug, Clone)]
enum Line {
    Entry {
        name: String,
        passwd: String,
        gid: String,
        members: Vec<String>,
    },
    Raw(String),
}

impl Line {
    fn parse(raw: &str) -> Self {
        if raw.is_empty() || raw.starts_with('#') {
            return Line::Raw(raw.to_owned());
        }
        let fields: Vec<&str> = raw.split(':').collect();
        if fields.len() != 4 || fields[0].is_empty() {
            return Line::Raw(raw.to_owned());
        }
        Line::Entry {
            name: fields[0].to_owned(),
            passwd: fields[1].to_owned(),
            gid: fields[2].to_owned(),
            members: fields[3]
                .split(',')
                .filter(|m| !m.is_empty())
                .map(str::to_owned)
                .collect(),
        }
    }

    fn render(&self) -> String {
        match self {
            Line::Entry {
                name,
                passwd,
                gid,
                members,
            } => format!("{name}:{passwd}:{gid}:{}", members.join(",")),
            Line::Raw(raw) => raw.clone(),
        }
    }
}

/// Shim over the host group file (default `/etc/group`).
pub struct LocalGroups {
    group_path: PathBuf,
}

impl LocalGroups {
    pub fn new(group_path: impl Into<PathBuf>) -> Self {
        Self {
            group_path: group_path.into(),
        }
    }

    fn load(&self) -> Result<Vec<Line>> {
        let content = std::fs::read_to_string(&self.group_path)?;
        Ok(content.lines().map(Line::parse).collect())
    }

    /// Atomically rewrite the group file. Mode is 0o644: group(5) is world
    /// readable.
    fn store(&self, lines: &[Line]) -> Result<()> {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let parent = self
            .group_path
            .parent()
            .ok_or_else(|| DaemonError::Internal("group file path has no parent".into()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        for line in lines {
            writeln!(tmp, "{}", line.render())?;
        }
        tmp.persist(&self.group_path)
            .map_err(|e| DaemonError::Io(e.error))?;
        Ok(())
    }

    /// Reconcile `username`'s local membership with `desired`: add the user
    /// to missing groups, remove it from extras. Idempotent; a declared
    /// group that does not exist on the host is skipped with a warning.
    pub fn update(&self, username: &str, desired: &[String]) -> Result<()> {
        let mut lines = self.load()?;
        let mut changed = false;
        let mut seen = Vec::new();

        for line in &mut lines {
            let Line::Entry { name, members, .. } = line else {
                continue;
            };
            seen.push(name.clone());
            let wanted = desired.iter().any(|d| d == name);
            let present = members.iter().any(|m| m == username);
            if wanted && !present {
                debug!("Adding {username:?} to local group {name:?}");
                members.push(username.to_owned());
                changed = true;
            } else if !wanted && present {
                debug!("Removing {username:?} from local group {name:?}");
                members.retain(|m| m != username);
                changed = true;
            }
        }

        for missing in desired.iter().filter(|d| !seen.contains(d)) {
            warn!("Local group {missing:?} does not exist on this host; skipping");
        }

        if changed {
            self.store(&lines)?;
        }
        Ok(())
    }

    /// Remove `username` from every local group.
    pub fn clean_user(&self, username: &str) -> Result<()> {
        self.update(username, &[])
    }

    /// Full sweep: drop every member the predicate condemns. Used after a
    /// database reset to strip members that no longer resolve anywhere.
    pub fn clean(&self, should_remove: impl Fn(&str) -> bool) -> Result<()> {
        let mut lines = self.load()?;
        let mut changed = false;

        for line in &mut lines {
            let Line::Entry { name, members, .. } = line else {
                continue;
            };
            let before = members.len();
            members.retain(|m| {
                let drop = should_remove(m);
                if drop {
                    debug!("Sweeping {m:?} from local group {name:?}");
                }
                !drop
            });
            changed |= members.len() != before;
        }

        if changed {
            self.store(&lines)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.group_path
    }
}

#[cfg(test)]
mod tests;
