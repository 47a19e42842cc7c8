//! Group membership queries against the host databases.
//!
//! Used by the socket server to decide whether a connecting peer belongs
//! to the group allowed on the daemon socket.

use std::ffi::{CStr, CString};

use nix::errno::Errno;

/// All group ids of a user: the primary gid plus the supplementary list.
///
/// On Linux a failed getgrouplist(3) reports the required entry count back
/// through its in/out parameter, so the buffer is grown to exactly that
/// size and the call retried. A kernel that fails without raising the
/// count would loop forever; treat that as invalid instead.
pub fn group_ids(user: &CStr, primary_gid: u32) -> Result<Vec<u32>, Errno> {
    let mut capacity: libc::c_int = 32;

    loop {
        let mut count = capacity;
        let mut gids = vec![0 as libc::gid_t; capacity as usize];
        let rc = unsafe {
            libc::getgrouplist(
                user.as_ptr(),
                primary_gid as libc::gid_t,
                gids.as_mut_ptr(),
                &mut count,
            )
        };

        if rc >= 0 {
            gids.truncate(count as usize);
            return Ok(gids.into_iter().map(|gid| gid as u32).collect());
        }
        if count <= capacity {
            return Err(Errno::EINVAL);
        }
        capacity = count;
    }
}

/// Whether the account owning `uid` carries `gid`, as primary or
/// supplementary group. A uid that does not resolve to an account is a
/// member of nothing.
pub fn uid_member_of(uid: u32, gid: u32) -> bool {
    let Ok(Some(user)) = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid)) else {
        return false;
    };
    let Ok(name) = CString::new(user.name) else {
        return false;
    };
    matches!(group_ids(&name, user.gid.as_raw()), Ok(gids) if gids.contains(&gid))
}

/// Resolve a group name to its GID via the host group database.
pub fn gid_of_group(name: &str) -> Option<u32> {
    match nix::unistd::Group::from_name(name) {
        Ok(Some(g)) => Some(g.gid.as_raw()),
        _ => None,
    }
}
