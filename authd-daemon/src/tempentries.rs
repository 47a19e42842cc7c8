//! In-memory temporary users and groups.
//!
//! During PAM pre-check the daemon must resolve a user that is not yet
//! persisted, so NSS probes between broker selection and the end of the
//! session see a consistent identity. Temporary records live only in
//! memory, draw their ids from the same range as persisted ones, and are
//! promoted or discarded when the session ends.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::errors::{DaemonError, Result};
use crate::idgen::MAX_ID_ATTEMPTS;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempUser {
    pub name: String,
    pub uid: u32,
    /// Private primary group, same id as the uid.
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempGroup {
    pub name: String,
    pub gid: u32,
}

#[derive(Default)]
struct Tables {
    users_by_id: HashMap<u32, TempUser>,
    /// Lowercased name to uid.
    users_by_name: HashMap<String, u32>,
    groups_by_id: HashMap<u32, TempGroup>,
    groups_by_name: HashMap<String, u32>,
}

/// Table of temporary entries, shared between the NSS lookups and the
/// session workflow that owns the entries' lifetime.
#[derive(Default)]
pub struct TempEntries {
    tables: RwLock<Tables>,
}

impl TempEntries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a temporary user (and its private group) for `name`.
    ///
    /// Candidate ids are drawn from `candidates` and rejected while
    /// `is_taken` says the id is occupied elsewhere (the persistent store)
    /// or it collides with another temporary entry. Registering a name
    /// twice returns the existing record so repeated pre-checks are
    /// idempotent.
    pub fn register_user(
        &self,
        name: &str,
        candidates: impl Iterator<Item = u32>,
        is_taken: impl Fn(u32) -> bool,
    ) -> Result<TempUser> {
        let key = name.to_lowercase();
        let mut tables = self.tables.write();

        if let Some(uid) = tables.users_by_name.get(&key) {
            return Ok(tables.users_by_id[uid].clone());
        }

        let mut uid = None;
        for candidate in candidates.take(MAX_ID_ATTEMPTS) {
            if is_taken(candidate)
                || tables.users_by_id.contains_key(&candidate)
                || tables.groups_by_id.contains_key(&candidate)
            {
                continue;
            }
            uid = Some(candidate);
            break;
        }
        let uid = uid.ok_or_else(|| DaemonError::IdSpaceExhausted(name.to_owned()))?;

        let user = TempUser {
            name: name.to_owned(),
            uid,
            gid: uid,
            gecos: name.to_owned(),
            home: format!("/home/{name}"),
            shell: "/usr/sbin/nologin".to_owned(),
        };
        tables.users_by_id.insert(uid, user.clone());
        tables.users_by_name.insert(key.clone(), uid);
        tables.groups_by_id.insert(
            uid,
            TempGroup {
                name: name.to_owned(),
                gid: uid,
            },
        );
        tables.groups_by_name.insert(key, uid);

        Ok(user)
    }

    /// Drop the temporary user and its private group. Missing entries are
    /// fine: promotion and cancellation race against idle reaping.
    pub fn remove_user(&self, name: &str) -> Option<TempUser> {
        let key = name.to_lowercase();
        let mut tables = self.tables.write();
        let uid = tables.users_by_name.remove(&key)?;
        let user = tables.users_by_id.remove(&uid);
        tables.groups_by_id.remove(&uid);
        tables.groups_by_name.remove(&key);
        user
    }

    pub fn user_by_name(&self, name: &str) -> Option<TempUser> {
        let tables = self.tables.read();
        let uid = tables.users_by_name.get(&name.to_lowercase())?;
        tables.users_by_id.get(uid).cloned()
    }

    pub fn user_by_id(&self, uid: u32) -> Option<TempUser> {
        self.tables.read().users_by_id.get(&uid).cloned()
    }

    pub fn group_by_name(&self, name: &str) -> Option<TempGroup> {
        let tables = self.tables.read();
        let gid = tables.groups_by_name.get(&name.to_lowercase())?;
        tables.groups_by_id.get(gid).cloned()
    }

    pub fn group_by_id(&self, gid: u32) -> Option<TempGroup> {
        self.tables.read().groups_by_id.get(&gid).cloned()
    }

    pub fn all_users(&self) -> Vec<TempUser> {
        let mut users: Vec<_> = self.tables.read().users_by_id.values().cloned().collect();
        users.sort_by_key(|u| u.uid);
        users
    }

    pub fn all_groups(&self) -> Vec<TempGroup> {
        let mut groups: Vec<_> = self.tables.read().groups_by_id.values().cloned().collect();
        groups.sort_by_key(|g| g.gid);
        groups
    }

    pub fn is_id_used(&self, id: u32) -> bool {
        let tables = self.tables.read();
        tables.users_by_id.contains_key(&id) || tables.groups_by_id.contains_key(&id)
    }
}
