//! Broker manifest files.
//!
//! A broker declares itself with a plain key/value file carrying a `.conf`
//! suffix; any other extension is ignored. Mandatory fields: `id`, `name`
//! and the `dbus.name` / `dbus.object` / `dbus.interface` triple naming the
//! broker on the accessibility bus. `brand_icon` is optional.

use std::collections::HashMap;
use std::path::Path;

use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerManifest {
    pub id: String,
    pub name: String,
    pub brand_icon: Option<String>,
    pub dbus_name: String,
    pub dbus_object: String,
    pub dbus_interface: String,
}

/// Load every valid manifest from `dir`. A missing directory means no
/// brokers are configured; malformed manifests are skipped with a warning.
pub fn load_manifests(dir: &Path) -> Vec<BrokerManifest> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("No broker configuration directory at {dir:?}: {e}");
            return Vec::new();
        }
    };

    let mut manifests = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("conf") {
            continue;
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Can't read broker manifest {path:?}: {e}");
                continue;
            }
        };
        match parse_manifest(&content) {
            Ok(manifest) => manifests.push(manifest),
            Err(e) => warn!("Skipping broker manifest {path:?}: {e}"),
        }
    }

    // Directory iteration order is not stable; keep listing order stable.
    manifests.sort_by(|a, b| a.id.cmp(&b.id));
    manifests
}

/// Parse one manifest. Lines are `key = value`; `#` starts a comment.
pub fn parse_manifest(content: &str) -> Result<BrokerManifest, String> {
    let mut fields = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(format!("line {line:?} is not a key=value pair"));
        };
        fields.insert(key.trim().to_owned(), value.trim().to_owned());
    }

    let mut required = |key: &str| {
        fields
            .get(key)
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| format!("missing mandatory field {key:?}"))
    };

    Ok(BrokerManifest {
        id: required("id")?,
        name: required("name")?,
        dbus_name: required("dbus.name")?,
        dbus_object: required("dbus.object")?,
        dbus_interface: required("dbus.interface")?,
        brand_icon: fields.get("brand_icon").filter(|v| !v.is_empty()).cloned(),
    })
}
