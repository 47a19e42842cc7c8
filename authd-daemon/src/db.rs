//! Identity store: users, groups, and broker bindings.
//!
//! A single-file embedded database under the state directory. Records are
//! held as individually encoded values inside keyed buckets; the whole
//! bucket set is rewritten atomically (write-to-temp, rename) on every
//! write transaction, and a reader-writer lock gives serializable writes
//! with concurrent readers.
//!
//! Any per-record decode failure is treated as corruption: the store
//! surfaces [`DbError::NeedsClearing`] and the owning manager schedules a
//! database reset. Raw decode errors are never returned to callers.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Database file name inside the state directory.
pub const DB_FILENAME: &str = "authd.db";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("no data found")]
    NotFound,

    #[error("database needs clearing: {0}")]
    NeedsClearing(String),

    #[error("database I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Persisted identity of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    pub uid: u32,
    /// Primary group. Always references a persisted [`GroupRecord`].
    pub gid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
    /// Wall-clock seconds of the last successful login; drives expiry.
    pub last_login: i64,

    // shadow(5) fields; -1 means unset
    pub last_pwd_change: i64,
    pub min_pwd_age: i64,
    pub max_pwd_age: i64,
    pub pwd_warn_period: i64,
    pub pwd_inactivity: i64,
    pub expiration_date: i64,

    /// Administratively disabled via `authctl user disable`.
    pub disabled: bool,
}

/// Persisted identity of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub name: String,
    pub gid: u32,
    /// Random opaque token; never a real password.
    pub passwd: String,
    pub members: BTreeSet<String>,
}

/// The logical buckets of the store. Record values are kept encoded so that
/// a corrupted value is detected exactly where the original would have
/// failed: at read time, per entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Buckets {
    user_by_id: HashMap<u32, Vec<u8>>,
    /// Keyed by lowercased name; user names are case-insensitive.
    user_by_name: HashMap<String, Vec<u8>>,
    group_by_id: HashMap<u32, Vec<u8>>,
    /// Keyed by lowercased name.
    group_by_name: HashMap<String, Vec<u8>>,
    user_to_groups: HashMap<u32, BTreeSet<u32>>,
    group_to_users: HashMap<u32, BTreeSet<u32>>,
    /// Lowercased user name to broker id.
    user_to_broker: HashMap<String, String>,
}

pub struct Database {
    path: PathBuf,
    buckets: RwLock<Buckets>,
}

impl Database {
    /// Open (or create) the database file in `dir`.
    ///
    /// A file that cannot be decoded raises [`DbError::NeedsClearing`]; the
    /// caller removes the file and retries.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(DB_FILENAME);
        let buckets = if path.exists() {
            let bytes = std::fs::read(&path)?;
            bincode::deserialize(&bytes)
                .map_err(|e| DbError::NeedsClearing(format!("can't decode database file: {e}")))?
        } else {
            let buckets = Buckets::default();
            persist(&path, &buckets)?;
            buckets
        };

        Ok(Self {
            path,
            buckets: RwLock::new(buckets),
        })
    }

    /// Remove the database file, if present.
    pub fn remove_file(dir: &Path) -> std::io::Result<()> {
        match std::fs::remove_file(dir.join(DB_FILENAME)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Run a write transaction: mutations happen on a working copy which is
    /// persisted before being swapped in, so readers never observe
    /// half-updated state and a failed persist leaves memory untouched.
    fn write_txn<T>(&self, f: impl FnOnce(&mut Buckets) -> Result<T>) -> Result<T> {
        let mut guard = self.buckets.write();
        let mut work = guard.clone();
        let out = f(&mut work)?;
        persist(&self.path, &work)?;
        *guard = work;
        Ok(out)
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Write a user and its group memberships in one transaction.
    ///
    /// Both keyings, the group records, and both membership indexes are
    /// updated together. `last_login` is stamped to now, monotonically
    /// non-decreasing per record. Groups that do not exist yet are created
    /// from the given records; existing groups keep their stored identity.
    pub fn update_user(&self, user: &UserRecord, groups: &[GroupRecord]) -> Result<()> {
        let mut user = user.clone();
        user.last_login = Utc::now().timestamp();

        self.write_txn(|b| {
            let name_key = user.name.to_lowercase();

            let old_by_name = match b.user_by_name.get(&name_key) {
                Some(bytes) => Some(decode::<UserRecord>("user_by_name", bytes)?),
                None => None,
            };
            if let Some(old) = old_by_name {
                user.last_login = user.last_login.max(old.last_login);
                if old.uid != user.uid {
                    remove_user_entries(b, &old)?;
                }
            }

            let old_by_id = match b.user_by_id.get(&user.uid) {
                Some(bytes) => Some(decode::<UserRecord>("user_by_id", bytes)?),
                None => None,
            };
            if let Some(old) = old_by_id {
                if old.name.to_lowercase() != name_key {
                    remove_user_entries(b, &old)?;
                }
            }

            let encoded = encode(&user);
            b.user_by_id.insert(user.uid, encoded.clone());
            b.user_by_name.insert(name_key, encoded);

            let mut gids = BTreeSet::new();
            for group in groups {
                let group_key = group.name.to_lowercase();
                let mut record: GroupRecord = match b.group_by_id.get(&group.gid) {
                    Some(bytes) => decode("group_by_id", bytes)?,
                    None => group.clone(),
                };
                record.members.insert(user.name.clone());
                let encoded = encode(&record);
                b.group_by_id.insert(record.gid, encoded.clone());
                b.group_by_name.insert(group_key, encoded);
                b.group_to_users.entry(group.gid).or_default().insert(user.uid);
                gids.insert(group.gid);
            }

            // Drop memberships the new update no longer declares.
            let old_gids = b.user_to_groups.get(&user.uid).cloned().unwrap_or_default();
            for gid in old_gids.difference(&gids) {
                remove_member(b, *gid, &user)?;
            }
            b.user_to_groups.insert(user.uid, gids);

            Ok(())
        })
    }

    pub fn user_by_id(&self, uid: u32) -> Result<UserRecord> {
        let buckets = self.buckets.read();
        let bytes = buckets.user_by_id.get(&uid).ok_or(DbError::NotFound)?;
        decode("user_by_id", bytes)
    }

    pub fn user_by_name(&self, name: &str) -> Result<UserRecord> {
        let buckets = self.buckets.read();
        let bytes = buckets
            .user_by_name
            .get(&name.to_lowercase())
            .ok_or(DbError::NotFound)?;
        decode("user_by_name", bytes)
    }

    /// Snapshot of all users, ordered by uid.
    pub fn all_users(&self) -> Result<Vec<UserRecord>> {
        let buckets = self.buckets.read();
        let mut users = Vec::with_capacity(buckets.user_by_id.len());
        for bytes in buckets.user_by_id.values() {
            users.push(decode::<UserRecord>("user_by_id", bytes)?);
        }
        users.sort_by_key(|u| u.uid);
        Ok(users)
    }

    /// Remove a user from both keyings and from all membership indexes.
    /// A missing entry is not an error.
    pub fn delete_user(&self, uid: u32) -> Result<()> {
        self.write_txn(|b| {
            let user: UserRecord = match b.user_by_id.get(&uid) {
                Some(bytes) => decode("user_by_id", bytes)?,
                None => return Ok(()),
            };
            remove_user_entries(b, &user)
        })
    }

    // =========================================================================
    // Groups
    // =========================================================================

    pub fn group_by_id(&self, gid: u32) -> Result<GroupRecord> {
        let buckets = self.buckets.read();
        let bytes = buckets.group_by_id.get(&gid).ok_or(DbError::NotFound)?;
        decode("group_by_id", bytes)
    }

    pub fn group_by_name(&self, name: &str) -> Result<GroupRecord> {
        let buckets = self.buckets.read();
        let bytes = buckets
            .group_by_name
            .get(&name.to_lowercase())
            .ok_or(DbError::NotFound)?;
        decode("group_by_name", bytes)
    }

    /// Snapshot of all groups, ordered by gid.
    pub fn all_groups(&self) -> Result<Vec<GroupRecord>> {
        let buckets = self.buckets.read();
        let mut groups = Vec::with_capacity(buckets.group_by_id.len());
        for bytes in buckets.group_by_id.values() {
            groups.push(decode::<GroupRecord>("group_by_id", bytes)?);
        }
        groups.sort_by_key(|g| g.gid);
        Ok(groups)
    }

    // =========================================================================
    // Broker bindings
    // =========================================================================

    pub fn broker_for_user(&self, name: &str) -> Result<String> {
        self.buckets
            .read()
            .user_to_broker
            .get(&name.to_lowercase())
            .cloned()
            .ok_or(DbError::NotFound)
    }

    pub fn set_broker_for_user(&self, name: &str, broker_id: &str) -> Result<()> {
        let key = name.to_lowercase();
        let broker_id = broker_id.to_owned();
        self.write_txn(move |b| {
            b.user_to_broker.insert(key, broker_id);
            Ok(())
        })
    }

    // =========================================================================
    // Administration
    // =========================================================================

    pub fn set_user_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let key = name.to_lowercase();
        self.write_txn(move |b| {
            let bytes = b.user_by_name.get(&key).ok_or(DbError::NotFound)?;
            let mut user: UserRecord = decode("user_by_name", bytes)?;
            user.disabled = !enabled;
            let encoded = encode(&user);
            b.user_by_id.insert(user.uid, encoded.clone());
            b.user_by_name.insert(key, encoded);
            Ok(())
        })
    }

    // =========================================================================
    // Expiry and reset
    // =========================================================================

    /// Remove every user whose `last_login` predates `cutoff` and whose uid
    /// owns no running process. Returns the removed names for downstream
    /// local-group cleanup. Removal cascades through the membership indexes
    /// and broker bindings; readers see each user either fully present or
    /// fully removed.
    pub fn clean_expired_users(
        &self,
        active_uids: &HashSet<u32>,
        cutoff: i64,
    ) -> Result<Vec<String>> {
        self.write_txn(|b| {
            let mut expired = Vec::new();
            for bytes in b.user_by_id.values() {
                let user: UserRecord = decode("user_by_id", bytes)?;
                if user.last_login < cutoff && !active_uids.contains(&user.uid) {
                    expired.push(user);
                }
            }

            let mut removed = Vec::with_capacity(expired.len());
            for user in expired {
                let name = user.name.clone();
                remove_user_entries(b, &user)?;
                removed.push(name);
            }
            removed.sort_unstable();
            Ok(removed)
        })
    }

    /// Destroy all contents and rewrite an empty database file.
    pub fn clear(&self) -> Result<()> {
        self.write_txn(|b| {
            *b = Buckets::default();
            Ok(())
        })
    }

    // =========================================================================
    // ID allocation support
    // =========================================================================

    /// An id is taken if any user or group occupies it, in either id space.
    /// The two spaces share a range, and a persisted user's private group
    /// reuses its uid.
    pub fn is_id_used(&self, id: u32) -> bool {
        let buckets = self.buckets.read();
        buckets.user_by_id.contains_key(&id) || buckets.group_by_id.contains_key(&id)
    }

    pub fn has_user_name(&self, name: &str) -> bool {
        self.buckets
            .read()
            .user_by_name
            .contains_key(&name.to_lowercase())
    }

    #[cfg(test)]
    pub(crate) fn set_last_login(&self, name: &str, timestamp: i64) -> Result<()> {
        let key = name.to_lowercase();
        self.write_txn(move |b| {
            let bytes = b.user_by_name.get(&key).ok_or(DbError::NotFound)?;
            let mut user: UserRecord = decode("user_by_name", bytes)?;
            user.last_login = timestamp;
            let encoded = encode(&user);
            b.user_by_id.insert(user.uid, encoded.clone());
            b.user_by_name.insert(key, encoded);
            Ok(())
        })
    }

    #[cfg(test)]
    pub(crate) fn inject_raw_user(&self, uid: u32, bytes: Vec<u8>) -> Result<()> {
        self.write_txn(move |b| {
            b.user_by_id.insert(uid, bytes);
            Ok(())
        })
    }
}

/// Remove a user's keyings, membership edges, and broker binding.
/// Groups left without members are dropped.
fn remove_user_entries(b: &mut Buckets, user: &UserRecord) -> Result<()> {
    b.user_by_id.remove(&user.uid);
    b.user_by_name.remove(&user.name.to_lowercase());
    b.user_to_broker.remove(&user.name.to_lowercase());

    if let Some(gids) = b.user_to_groups.remove(&user.uid) {
        for gid in gids {
            remove_member(b, gid, user)?;
        }
    }
    Ok(())
}

/// Drop one membership edge; a group left empty is removed entirely.
fn remove_member(b: &mut Buckets, gid: u32, user: &UserRecord) -> Result<()> {
    if let Some(uids) = b.group_to_users.get_mut(&gid) {
        uids.remove(&user.uid);
        if uids.is_empty() {
            b.group_to_users.remove(&gid);
        }
    }

    let Some(bytes) = b.group_by_id.get(&gid) else {
        return Ok(());
    };
    let mut group: GroupRecord = decode("group_by_id", bytes)?;
    group.members.remove(&user.name);

    if group.members.is_empty() {
        b.group_by_id.remove(&gid);
        b.group_by_name.remove(&group.name.to_lowercase());
    } else {
        let encoded = encode(&group);
        b.group_by_id.insert(gid, encoded.clone());
        b.group_by_name.insert(group.name.to_lowercase(), encoded);
    }
    Ok(())
}

fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    // Plain-old-data records always encode; a failure here would be a
    // serde derive bug, not runtime state.
    bincode::serialize(value).unwrap_or_default()
}

fn decode<T: DeserializeOwned>(bucket: &str, bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| DbError::NeedsClearing(format!("can't decode entry in bucket {bucket:?}: {e}")))
}

/// Atomically replace the database file: write to a temp file in the same
/// directory with mode 0o600, then rename over the target.
fn persist(path: &Path, buckets: &Buckets) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| DbError::Io(std::io::Error::other("database path has no parent")))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o600))?;
    }

    let content = bincode::serialize(buckets)
        .map_err(|e| DbError::Io(std::io::Error::other(format!("can't encode database: {e}"))))?;
    tmp.write_all(&content)?;
    tmp.persist(path)
        .map_err(|e| DbError::Io(e.error))?;
    Ok(())
}
