// The daemon's host integration is Linux-specific: /proc ownership scans,
// group(5) reconciliation, and the getgrouplist(3) size-reporting contract
// group_ids() relies on.
#[cfg(not(target_os = "linux"))]
compile_error!("authd-unix requires Linux (peer credentials, /proc, host group databases)");

pub mod credentials;
pub mod groups;
pub mod passwd;
pub mod proc;
