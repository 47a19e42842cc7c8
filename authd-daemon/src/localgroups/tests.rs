use super::*;
use tempfile::TempDir;

const FIXTURE: &str = "\
root:x:0:
adm:x:4:syslog
docker:x:999:carol
# comment line
lpadmin:x:120:
";

fn shim(dir: &TempDir) -> LocalGroups {
    let path = dir.path().join("group");
    std::fs::write(&path, FIXTURE).unwrap();
    LocalGroups::new(path)
}

fn read(shim: &LocalGroups) -> String {
    std::fs::read_to_string(shim.path()).unwrap()
}

#[test]
fn update_adds_and_removes_membership() {
    let dir = TempDir::new().unwrap();
    let shim = shim(&dir);

    shim.update("alice", &["adm".into(), "lpadmin".into()]).unwrap();
    let content = read(&shim);
    assert!(content.contains("adm:x:4:syslog,alice"));
    assert!(content.contains("lpadmin:x:120:alice"));

    // Shrinking the desired set removes the extra membership.
    shim.update("alice", &["adm".into()]).unwrap();
    let content = read(&shim);
    assert!(content.contains("adm:x:4:syslog,alice"));
    assert!(content.contains("lpadmin:x:120:\n"));
}

#[test]
fn update_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let shim = shim(&dir);

    shim.update("alice", &["adm".into()]).unwrap();
    let first = read(&shim);
    shim.update("alice", &["adm".into()]).unwrap();
    assert_eq!(first, read(&shim));
}

#[test]
fn unknown_groups_are_skipped() {
    let dir = TempDir::new().unwrap();
    let shim = shim(&dir);

    shim.update("alice", &["no-such-group".into(), "adm".into()])
        .unwrap();
    let content = read(&shim);
    assert!(content.contains("adm:x:4:syslog,alice"));
    assert!(!content.contains("no-such-group"));
}

#[test]
fn clean_user_strips_every_membership() {
    let dir = TempDir::new().unwrap();
    let shim = shim(&dir);

    shim.update("alice", &["adm".into(), "docker".into(), "lpadmin".into()])
        .unwrap();
    shim.clean_user("alice").unwrap();

    let content = read(&shim);
    assert!(!content.contains("alice"));
    // Other members are untouched.
    assert!(content.contains("docker:x:999:carol"));
}

#[test]
fn clean_sweeps_by_predicate() {
    let dir = TempDir::new().unwrap();
    let shim = shim(&dir);

    shim.update("alice", &["adm".into()]).unwrap();
    shim.update("bob", &["adm".into()]).unwrap();

    // Condemn alice, keep everyone else.
    shim.clean(|name| name == "alice").unwrap();

    let content = read(&shim);
    assert!(!content.contains("alice"));
    assert!(content.contains("bob"));
    assert!(content.contains("syslog"));
}

#[test]
fn comments_and_malformed_lines_survive_rewrites() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("group");
    std::fs::write(&path, "# header\nbroken line without fields\nadm:x:4:\n").unwrap();
    let shim = LocalGroups::new(path);

    shim.update("alice", &["adm".into()]).unwrap();

    let content = read(&shim);
    assert!(content.contains("# header"));
    assert!(content.contains("broken line without fields"));
    assert!(content.contains("adm:x:4:alice"));
}
