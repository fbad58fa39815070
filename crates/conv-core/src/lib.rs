use anyhow::Result;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const INSTANCE_INSTALL_MARKER: &str = ".environment_installed";
pub const RUNTIME_CONFIG_FILE: &str = "runtime.conf";
pub const RUN_SPEC_FILE: &str = "run_spec.json";
pub const STAGING_DIR: &str = "executable";
pub const CACHE_DIR: &str = "runtime_data";
pub const POLICIES_DIR: &str = "policies";
pub const ROLES_DIR: &str = "roles";
pub const DEFAULT_RESULTS_DIR: &str = "out";
pub const RESULTS_FILE: &str = "results.jsonl";

pub const HOST_INSTALL_MARKER: &str = "/opt/converge_installed";
pub const BUNDLE_METADATA_FILE: &str = "metadata.json";
pub const DEFAULT_DEPENDENCIES_SUBDIR: &str = "policy_dependencies";

pub const RUNTIME_BIN: &str = "converged";
pub const RUNTIME_BOOTSTRAP_URL: &str = "https://packages.converge.dev/install.sh";

pub const ATTRIBUTE_DELIMITER: char = '/';

/// Absolute paths derived from one invocation's instance directory. The
/// instance directory lives on the target host; every path here is composed
/// for the target, not the invoking machine.
#[derive(Debug, Clone)]
pub struct InstanceLayout {
    pub instance_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub policies_dir: PathBuf,
    pub roles_dir: PathBuf,
    pub install_marker: PathBuf,
    pub runtime_config: PathBuf,
    pub run_spec: PathBuf,
}

pub fn instance_layout(instance_dir: &Path) -> InstanceLayout {
    let cache_dir = instance_dir.join(CACHE_DIR);
    InstanceLayout {
        instance_dir: instance_dir.to_path_buf(),
        staging_dir: instance_dir.join(STAGING_DIR),
        policies_dir: cache_dir.join(POLICIES_DIR),
        roles_dir: cache_dir.join(ROLES_DIR),
        cache_dir,
        install_marker: instance_dir.join(INSTANCE_INSTALL_MARKER),
        runtime_config: instance_dir.join(RUNTIME_CONFIG_FILE),
        run_spec: instance_dir.join(RUN_SPEC_FILE),
    }
}

/// The generated runtime configuration: cache path, policy search path,
/// role path. Written once to the target during installation.
pub fn runtime_config_content(layout: &InstanceLayout) -> String {
    [
        format!("cache_path \"{}\"", layout.cache_dir.display()),
        format!("policy_path [ \"{}\" ]", layout.policies_dir.display()),
        format!("role_path \"{}\"", layout.roles_dir.display()),
    ]
    .join("\n")
}

/// Reconstruct nested objects from delimiter-separated keys:
/// `{"nginx/worker_processes": 4}` becomes `{"nginx":{"worker_processes":4}}`.
/// A non-object value in the middle of a deeper path is replaced by an object.
pub fn unflatten(flat: &Map<String, Value>, delimiter: char) -> Value {
    let mut root = Map::new();
    for (key, value) in flat {
        let parts: Vec<&str> = key.split(delimiter).collect();
        let mut node = &mut root;
        for part in &parts[..parts.len() - 1] {
            let entry = node
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            node = match entry {
                Value::Object(map) => map,
                _ => unreachable!("entry was just made an object"),
            };
        }
        node.insert(parts[parts.len() - 1].to_string(), value.clone());
    }
    Value::Object(root)
}

/// Inverse of [`unflatten`]: collapse nested objects into delimiter-joined
/// keys. Arrays and scalars are leaves.
pub fn flatten(value: &Value, delimiter: char) -> Map<String, Value> {
    let mut out = Map::new();
    flatten_into(value, delimiter, None, &mut out);
    out
}

fn flatten_into(value: &Value, delimiter: char, prefix: Option<&str>, out: &mut Map<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let joined = match prefix {
                    Some(prefix) => format!("{}{}{}", prefix, delimiter, key),
                    None => key.clone(),
                };
                flatten_into(child, delimiter, Some(&joined), out);
            }
        }
        other => {
            if let Some(prefix) = prefix {
                out.insert(prefix.to_string(), other.clone());
            }
        }
    }
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    Ok(sha256_bytes(&fs::read(path)?))
}

/// Stable digest over a directory tree: relative paths and file contents,
/// walked in sorted order.
pub fn sha256_dir(root: &Path) -> Result<String> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    let mut hasher = Sha256::new();
    for path in files {
        let rel = path.strip_prefix(root).unwrap_or(&path);
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(&fs::read(&path)?);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_root(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "converge_core_{}_{}_{}",
            label,
            std::process::id(),
            nanos
        ))
    }

    #[test]
    fn layout_derives_paths_under_instance_dir() {
        let layout = instance_layout(Path::new("/tmp/converge/nginx"));
        assert_eq!(
            layout.staging_dir,
            PathBuf::from("/tmp/converge/nginx/executable")
        );
        assert_eq!(
            layout.policies_dir,
            PathBuf::from("/tmp/converge/nginx/runtime_data/policies")
        );
        assert_eq!(
            layout.roles_dir,
            PathBuf::from("/tmp/converge/nginx/runtime_data/roles")
        );
        assert_eq!(
            layout.install_marker,
            PathBuf::from("/tmp/converge/nginx/.environment_installed")
        );
        assert_eq!(
            layout.run_spec,
            PathBuf::from("/tmp/converge/nginx/run_spec.json")
        );
    }

    #[test]
    fn runtime_config_has_three_declarations() {
        let layout = instance_layout(Path::new("/srv/inst"));
        let content = runtime_config_content(&layout);
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "cache_path \"/srv/inst/runtime_data\"");
        assert_eq!(
            lines[1],
            "policy_path [ \"/srv/inst/runtime_data/policies\" ]"
        );
        assert_eq!(lines[2], "role_path \"/srv/inst/runtime_data/roles\"");
    }

    #[test]
    fn unflatten_reconstructs_nested_objects() {
        let mut flat = Map::new();
        flat.insert("nginx/worker_processes".to_string(), json!(4));
        flat.insert("nginx/gzip/enabled".to_string(), json!(true));
        flat.insert("port".to_string(), json!(8080));
        let value = unflatten(&flat, '/');
        assert_eq!(
            value,
            json!({
                "nginx": { "worker_processes": 4, "gzip": { "enabled": true } },
                "port": 8080
            })
        );
    }

    #[test]
    fn unflatten_replaces_scalar_in_the_middle_of_a_path() {
        let mut flat = Map::new();
        flat.insert("a".to_string(), json!(1));
        flat.insert("a/b".to_string(), json!(2));
        let value = unflatten(&flat, '/');
        assert_eq!(value, json!({ "a": { "b": 2 } }));
    }

    #[test]
    fn flatten_round_trips_through_unflatten() {
        let nested = json!({
            "nginx": { "worker_processes": 4, "listen": [80, 443] },
            "tz": "UTC"
        });
        let flat = flatten(&nested, '/');
        assert_eq!(flat.get("nginx/worker_processes"), Some(&json!(4)));
        assert_eq!(flat.get("nginx/listen"), Some(&json!([80, 443])));
        assert_eq!(unflatten(&flat, '/'), nested);
    }

    #[test]
    fn dir_digest_changes_with_content() {
        let root = temp_root("digest");
        fs::create_dir_all(root.join("sub")).expect("create tree");
        fs::write(root.join("sub").join("a.txt"), b"one").expect("write a");
        let first = sha256_dir(&root).expect("digest");
        fs::write(root.join("sub").join("a.txt"), b"two").expect("rewrite a");
        let second = sha256_dir(&root).expect("digest again");
        assert_ne!(first, second);
        assert!(first.starts_with("sha256:"));
        let _ = fs::remove_dir_all(root);
    }
}
