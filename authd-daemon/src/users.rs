//! User management facade.
//!
//! Owns the identity store, the temporary entries, and the local-groups
//! shim, and funnels every database corruption signal into the self-heal
//! path: mark the corruption flag, ask the cleanup loop for a reset, and
//! surface a `corruption` error instead of the raw decode failure.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use authd_protocol::protocol::{GroupEntry, PasswdEntry, ShadowEntry};
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::brokers::BrokerUserInfo;
use crate::db::{Database, DbError, GroupRecord, UserRecord};
use crate::errors::{DaemonError, Result};
use crate::idgen::{IdGenerator, Sha256IdGenerator, MAX_ID_ATTEMPTS};
use crate::localgroups::LocalGroups;
use crate::tempentries::{TempEntries, TempGroup, TempUser};
use crate::token::SecretToken;

/// Name of the corruption marker beside the database file. Its presence
/// forces database recreation on the next open.
pub const CORRUPTION_MARKER: &str = ".corrupted";

/// A user as handed to [`UserManager::update_user`], identity already
/// materialized. Groups with no GID are local groups: reconciled into the
/// host group file, never persisted.
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub name: String,
    pub uid: u32,
    pub gecos: String,
    pub home: String,
    pub shell: String,
    pub groups: Vec<GroupInfo>,
}

#[derive(Debug, Clone)]
pub struct GroupInfo {
    pub name: String,
    pub gid: Option<u32>,
}

pub struct UserManagerConfig {
    pub state_dir: PathBuf,
    pub group_file: PathBuf,
    pub passwd_file: PathBuf,
    pub proc_dir: PathBuf,
    /// Users whose last login predates this window are swept.
    pub expiration: Duration,
    /// Run an expiry sweep as part of startup.
    pub clean_on_startup: bool,
}

impl UserManagerConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            group_file: PathBuf::from("/etc/group"),
            passwd_file: PathBuf::from("/etc/passwd"),
            proc_dir: PathBuf::from("/proc"),
            expiration: Duration::days(180),
            clean_on_startup: true,
        }
    }
}

pub struct UserManager {
    db: Database,
    temp: TempEntries,
    local_groups: LocalGroups,
    idgen: Box<dyn IdGenerator>,
    passwd_file: PathBuf,
    proc_dir: PathBuf,
    expiration: Duration,
    dirty_flag: PathBuf,
    clear_tx: mpsc::Sender<()>,
    clear_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl UserManager {
    pub fn new(config: UserManagerConfig) -> Result<Self> {
        Self::with_id_generator(config, Box::new(Sha256IdGenerator))
    }

    /// Like [`UserManager::new`] with an explicit id generator. The seam
    /// exists so tests can script id allocation.
    pub fn with_id_generator(
        config: UserManagerConfig,
        idgen: Box<dyn IdGenerator>,
    ) -> Result<Self> {
        let dirty_flag = config.state_dir.join(CORRUPTION_MARKER);
        let local_groups = LocalGroups::new(&config.group_file);

        // An undecodable file is removed and recreated once; failing again
        // right away means the directory itself is broken.
        let mut db = None;
        for _ in 0..2 {
            match Database::open(&config.state_dir) {
                Ok(d) => {
                    db = Some(d);
                    break;
                }
                Err(DbError::NeedsClearing(e)) => {
                    warn!("Database needs clearing: {e}");
                    Database::remove_file(&config.state_dir)?;
                    if let Err(e) = clean_foreign_members(&local_groups, &config.passwd_file, None)
                    {
                        warn!("Could not clean local groups: {e}");
                    }
                }
                Err(DbError::Io(e)) => return Err(e.into()),
                Err(DbError::NotFound) => unreachable!("open never reports NotFound"),
            }
        }
        let db = db.ok_or_else(|| {
            DaemonError::Internal("database could not be recreated after clearing".into())
        })?;

        let (clear_tx, clear_rx) = mpsc::channel(1);
        let manager = Self {
            db,
            temp: TempEntries::new(),
            local_groups,
            idgen,
            passwd_file: config.passwd_file,
            proc_dir: config.proc_dir,
            expiration: config.expiration,
            dirty_flag,
            clear_tx,
            clear_rx: Mutex::new(Some(clear_rx)),
        };

        if manager.is_marked_corrupted() {
            info!("Corruption marker present; recreating the database");
            manager.clear_database()?;
        }

        if config.clean_on_startup {
            if let Err(e) = manager.clean_expired_user_data() {
                warn!("Could not fully clean expired user data: {e}");
            }
        }

        Ok(manager)
    }

    /// Receiver for database-clear requests, consumed by the cleanup loop.
    pub fn take_clear_rx(&self) -> Option<mpsc::Receiver<()>> {
        self.clear_rx.lock().take()
    }

    // =========================================================================
    // NSS resolution (persisted records, temporary entries as fallback)
    // =========================================================================

    pub fn passwd_by_name(&self, name: &str) -> Result<PasswdEntry> {
        match self.db.user_by_name(name) {
            Ok(user) => Ok(passwd_entry(&user)),
            Err(DbError::NotFound) => self
                .temp
                .user_by_name(name)
                .map(|u| temp_passwd_entry(&u))
                .ok_or_else(|| DaemonError::UnknownUser(name.to_owned())),
            Err(e) => Err(self.db_failure(e)),
        }
    }

    pub fn passwd_by_uid(&self, uid: u32) -> Result<PasswdEntry> {
        match self.db.user_by_id(uid) {
            Ok(user) => Ok(passwd_entry(&user)),
            Err(DbError::NotFound) => self
                .temp
                .user_by_id(uid)
                .map(|u| temp_passwd_entry(&u))
                .ok_or(DaemonError::UnknownUid(uid)),
            Err(e) => Err(self.db_failure(e)),
        }
    }

    pub fn all_passwds(&self) -> Result<Vec<PasswdEntry>> {
        let mut entries: Vec<PasswdEntry> = self
            .db
            .all_users()
            .map_err(|e| self.db_failure(e))?
            .iter()
            .map(passwd_entry)
            .collect();
        entries.extend(self.temp.all_users().iter().map(temp_passwd_entry));
        Ok(entries)
    }

    pub fn group_by_name(&self, name: &str) -> Result<GroupEntry> {
        match self.db.group_by_name(name) {
            Ok(group) => Ok(group_entry(&group)),
            Err(DbError::NotFound) => self
                .temp
                .group_by_name(name)
                .map(|g| temp_group_entry(&g))
                .ok_or_else(|| DaemonError::UnknownGroup(name.to_owned())),
            Err(e) => Err(self.db_failure(e)),
        }
    }

    pub fn group_by_gid(&self, gid: u32) -> Result<GroupEntry> {
        match self.db.group_by_id(gid) {
            Ok(group) => Ok(group_entry(&group)),
            Err(DbError::NotFound) => self
                .temp
                .group_by_id(gid)
                .map(|g| temp_group_entry(&g))
                .ok_or(DaemonError::UnknownGid(gid)),
            Err(e) => Err(self.db_failure(e)),
        }
    }

    pub fn all_groups(&self) -> Result<Vec<GroupEntry>> {
        let mut entries: Vec<GroupEntry> = self
            .db
            .all_groups()
            .map_err(|e| self.db_failure(e))?
            .iter()
            .map(group_entry)
            .collect();
        entries.extend(self.temp.all_groups().iter().map(temp_group_entry));
        Ok(entries)
    }

    /// Shadow data exists only for persisted users.
    pub fn shadow_by_name(&self, name: &str) -> Result<ShadowEntry> {
        match self.db.user_by_name(name) {
            Ok(user) => Ok(shadow_entry(&user)),
            Err(DbError::NotFound) => Err(DaemonError::UnknownUser(name.to_owned())),
            Err(e) => Err(self.db_failure(e)),
        }
    }

    pub fn all_shadows(&self) -> Result<Vec<ShadowEntry>> {
        Ok(self
            .db
            .all_users()
            .map_err(|e| self.db_failure(e))?
            .iter()
            .map(shadow_entry)
            .collect())
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Validate and persist a user together with its group memberships.
    /// Groups without a GID are reconciled into the host group file only.
    /// If the local-group reconciliation fails the store write is rolled
    /// back so both sides stay consistent.
    pub fn update_user(&self, info: &UserInfo) -> Result<()> {
        if info.name.is_empty() {
            return Err(DaemonError::EmptyUsername);
        }
        if info.groups.is_empty() {
            return Err(DaemonError::NoGroups(info.name.clone()));
        }
        let Some(primary_gid) = info.groups[0].gid else {
            return Err(DaemonError::NoGidForPrimaryGroup(info.groups[0].name.clone()));
        };

        let mut records = Vec::new();
        let mut local_groups = Vec::new();
        for group in &info.groups {
            if group.name.is_empty() {
                return Err(DaemonError::EmptyGroupName(info.name.clone()));
            }
            match group.gid {
                Some(gid) => records.push(GroupRecord {
                    name: group.name.clone(),
                    gid,
                    passwd: SecretToken::generate()
                        .map_err(|e| DaemonError::Internal(format!("CSPRNG unavailable: {e}")))?
                        .to_hex(),
                    members: Default::default(),
                }),
                None => local_groups.push(group.name.clone()),
            }
        }

        let record = UserRecord {
            name: info.name.clone(),
            uid: info.uid,
            gid: primary_gid,
            gecos: info.gecos.clone(),
            home: info.home.clone(),
            shell: info.shell.clone(),
            last_login: 0, // server-set by the store
            last_pwd_change: -1,
            min_pwd_age: -1,
            max_pwd_age: -1,
            pwd_warn_period: -1,
            pwd_inactivity: -1,
            expiration_date: -1,
            disabled: false,
        };

        self.db
            .update_user(&record, &records)
            .map_err(|e| self.db_failure(e))?;

        if let Err(e) = self.local_groups.update(&info.name, &local_groups) {
            warn!(
                "Local group reconciliation for {:?} failed, rolling back store write: {e}",
                info.name
            );
            if let Err(del) = self.db.delete_user(info.uid) {
                warn!("Rollback of user {:?} failed: {del}", info.name);
            }
            return Err(e);
        }

        Ok(())
    }

    /// Turn a broker-declared identity into persisted records: reuse the
    /// stored uid for returning users, keep the temporary uid across
    /// promotion, synthesize ids for anything new, then record the broker
    /// binding. The temporary entry is dropped whether or not this
    /// succeeds; the session is over either way.
    pub fn materialize_user(
        &self,
        username: &str,
        info: &BrokerUserInfo,
        broker_id: &str,
    ) -> Result<()> {
        let result = self.materialize_inner(username, info, broker_id);
        self.temp.remove_user(username);
        result
    }

    fn materialize_inner(
        &self,
        username: &str,
        info: &BrokerUserInfo,
        broker_id: &str,
    ) -> Result<()> {
        if !info.name.eq_ignore_ascii_case(username) {
            return Err(DaemonError::InvalidUserInfo(format!(
                "broker declared user {:?} for a session owned by {username:?}",
                info.name
            )));
        }

        let uid = match self.db.user_by_name(username) {
            Ok(user) => user.uid,
            Err(DbError::NotFound) => match self.temp.user_by_name(username) {
                Some(temp) => temp.uid,
                None => self.generate_id(username)?,
            },
            Err(e) => return Err(self.db_failure(e)),
        };

        let mut groups = Vec::with_capacity(info.groups.len());
        for group in &info.groups {
            if group.local {
                groups.push(GroupInfo {
                    name: group.name.clone(),
                    gid: None,
                });
                continue;
            }
            let gid = match self.db.group_by_name(&group.name) {
                Ok(record) => record.gid,
                Err(DbError::NotFound) => {
                    if group.name.eq_ignore_ascii_case(username) {
                        // Private primary group shares the user's id.
                        uid
                    } else {
                        self.generate_id(&group.name)?
                    }
                }
                Err(e) => return Err(self.db_failure(e)),
            };
            groups.push(GroupInfo {
                name: group.name.clone(),
                gid: Some(gid),
            });
        }

        self.update_user(&UserInfo {
            name: info.name.clone(),
            uid,
            gecos: info.gecos.clone(),
            home: info.home.clone(),
            shell: info.shell.clone(),
            groups,
        })?;
        self.set_broker_for_user(username, broker_id)
    }

    /// Synthesize a temporary user (visible to NSS) for a pre-checked name.
    pub fn register_temp_user(&self, name: &str) -> Result<PasswdEntry> {
        if self.db.has_user_name(name) {
            return Err(DaemonError::TempUserShadows(name.to_owned()));
        }
        let user = self.temp.register_user(name, self.idgen.candidates(name), |id| {
            self.db.is_id_used(id)
        })?;
        debug!("Registered temporary user {:?} with uid {}", name, user.uid);
        Ok(temp_passwd_entry(&user))
    }

    pub fn discard_temp_user(&self, name: &str) {
        if self.temp.remove_user(name).is_some() {
            debug!("Discarded temporary user {name:?}");
        }
    }

    fn generate_id(&self, name: &str) -> Result<u32> {
        self.idgen
            .candidates(name)
            .take(MAX_ID_ATTEMPTS)
            .find(|&id| !self.db.is_id_used(id) && !self.temp.is_id_used(id))
            .ok_or_else(|| DaemonError::IdSpaceExhausted(name.to_owned()))
    }

    // =========================================================================
    // Broker bindings and administration
    // =========================================================================

    pub fn broker_for_user(&self, name: &str) -> Result<String> {
        match self.db.broker_for_user(name) {
            Ok(broker_id) => Ok(broker_id),
            Err(DbError::NotFound) => Err(DaemonError::NoBrokerForUser(name.to_owned())),
            Err(e) => Err(self.db_failure(e)),
        }
    }

    pub fn set_broker_for_user(&self, name: &str, broker_id: &str) -> Result<()> {
        self.db
            .set_broker_for_user(name, broker_id)
            .map_err(|e| self.db_failure(e))
    }

    pub fn set_user_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        match self.db.set_user_enabled(name, enabled) {
            Ok(()) => Ok(()),
            Err(DbError::NotFound) => Err(DaemonError::UnknownUser(name.to_owned())),
            Err(e) => Err(self.db_failure(e)),
        }
    }

    /// Unknown users are enabled: they have not been disabled yet.
    pub fn is_user_enabled(&self, name: &str) -> Result<bool> {
        match self.db.user_by_name(name) {
            Ok(user) => Ok(!user.disabled),
            Err(DbError::NotFound) => Ok(true),
            Err(e) => Err(self.db_failure(e)),
        }
    }

    // =========================================================================
    // Expiry and self-healing
    // =========================================================================

    /// Sweep users outside the expiry window whose uid owns no running
    /// process, then strip them from the host's local groups.
    pub fn clean_expired_user_data(&self) -> Result<()> {
        let active = authd_unix::proc::uids_of_running_processes(&self.proc_dir)?;
        let cutoff = (Utc::now() - self.expiration).timestamp();

        let removed = self
            .db
            .clean_expired_users(&active, cutoff)
            .map_err(|e| self.db_failure(e))?;

        for name in &removed {
            if let Err(e) = self.local_groups.clean_user(name) {
                warn!("Could not clean user {name:?} from local groups: {e}");
            }
        }

        if !removed.is_empty() {
            info!("Swept {} expired user(s): {removed:?}", removed.len());
        }
        Ok(())
    }

    /// Destroy and recreate the database, drop the corruption marker, and
    /// sweep local groups of members that no longer resolve anywhere.
    pub fn clear_database(&self) -> Result<()> {
        self.db.clear().map_err(|e| {
            DaemonError::Internal(format!("could not clear the database: {e}"))
        })?;

        match std::fs::remove_file(&self.dirty_flag) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove corruption marker: {e}"),
        }

        clean_foreign_members(&self.local_groups, &self.passwd_file, Some(&self.db))
    }

    pub fn is_marked_corrupted(&self) -> bool {
        self.dirty_flag.exists()
    }

    fn mark_corrupted(&self) {
        if self.is_marked_corrupted() {
            return;
        }
        if let Err(e) = std::fs::write(&self.dirty_flag, []) {
            warn!("Could not mark database as corrupted: {e}");
        }
    }

    /// Corruption funnel: every decode failure flags the database and asks
    /// the cleanup loop for a reset. If a clear is already pending the
    /// request is dropped; the system is headed to the desired state.
    fn db_failure(&self, err: DbError) -> DaemonError {
        match err {
            DbError::NotFound => DaemonError::Internal("unexpected missing record".into()),
            DbError::NeedsClearing(message) => {
                self.mark_corrupted();
                if self.clear_tx.try_send(()).is_err() {
                    debug!("Database clear already pending");
                }
                DaemonError::Corruption(message)
            }
            DbError::Io(e) => DaemonError::Internal(format!("database I/O failed: {e}")),
        }
    }

    #[cfg(test)]
    pub(crate) fn db(&self) -> &Database {
        &self.db
    }
}

/// Remove group-file members that neither the host account database nor the
/// identity store can resolve. Runs after a database reset, when any member
/// the daemon once managed stops resolving.
fn clean_foreign_members(
    local_groups: &LocalGroups,
    passwd_file: &Path,
    db: Option<&Database>,
) -> Result<()> {
    let host: HashSet<String> = authd_unix::passwd::account_names(passwd_file)?;
    local_groups.clean(|name| {
        !host.contains(name) && !db.is_some_and(|db| db.has_user_name(name))
    })
}

fn passwd_entry(user: &UserRecord) -> PasswdEntry {
    PasswdEntry {
        name: user.name.clone(),
        uid: user.uid,
        gid: user.gid,
        gecos: user.gecos.clone(),
        home: user.home.clone(),
        shell: user.shell.clone(),
    }
}

fn temp_passwd_entry(user: &TempUser) -> PasswdEntry {
    PasswdEntry {
        name: user.name.clone(),
        uid: user.uid,
        gid: user.gid,
        gecos: user.gecos.clone(),
        home: user.home.clone(),
        shell: user.shell.clone(),
    }
}

fn group_entry(group: &GroupRecord) -> GroupEntry {
    GroupEntry {
        name: group.name.clone(),
        gid: group.gid,
        passwd: group.passwd.clone(),
        members: group.members.iter().cloned().collect(),
    }
}

fn temp_group_entry(group: &TempGroup) -> GroupEntry {
    GroupEntry {
        name: group.name.clone(),
        gid: group.gid,
        passwd: String::new(),
        members: vec![group.name.clone()],
    }
}

fn shadow_entry(user: &UserRecord) -> ShadowEntry {
    ShadowEntry {
        name: user.name.clone(),
        last_pwd_change: user.last_pwd_change,
        min_pwd_age: user.min_pwd_age,
        max_pwd_age: user.max_pwd_age,
        pwd_warn_period: user.pwd_warn_period,
        pwd_inactivity: user.pwd_inactivity,
        expiration_date: user.expiration_date,
    }
}
