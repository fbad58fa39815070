//! Pre-invocation dependency resolution: walk the bundle's metadata and
//! fetch any dependency bundles that are not already present, depth-first.
//! Runs before the invoker proper and is safe to re-run; present
//! dependencies are never re-fetched.

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use tar::Archive;
use tracing::{debug, info};

use conv_core::{ensure_dir, BUNDLE_METADATA_FILE};

use crate::{read_bundle_metadata, BundleMetadata};

pub const DEFAULT_BUNDLE_REGISTRY_URL: &str = "https://bundles.converge.dev/policies";

const FETCH_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of dependency bundles, keyed by bundle name. Returns a gzipped
/// tarball of the bundle's contents.
pub trait BundleFetcher {
    fn fetch(&self, name: &str) -> Result<Vec<u8>>;
}

pub struct HttpBundleFetcher {
    client: Client,
    base_url: String,
}

impl HttpBundleFetcher {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            bail!("bundle registry url must not be empty");
        }
        let client = Client::builder()
            .connect_timeout(FETCH_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client, base_url })
    }
}

impl BundleFetcher for HttpBundleFetcher {
    fn fetch(&self, name: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}/download", self.base_url, name);
        let response = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("bundle registry GET {} failed", url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("bundle registry GET {} failed: status={}", url, status);
        }
        Ok(response.bytes()?.to_vec())
    }
}

#[derive(Debug, Default)]
pub struct PrepareSummary {
    pub fetched: Vec<String>,
    pub skipped: Vec<String>,
}

/// Resolve the bundle's dependency closure into `<bundle>/<deps_subdir>`.
/// Dependencies of dependencies land flat in the same directory, so a
/// bundle shared by two branches of the tree is fetched once.
pub fn prepare_dependencies(
    bundle_dir: &Path,
    deps_subdir: &str,
    fetcher: &dyn BundleFetcher,
) -> Result<PrepareSummary> {
    let metadata = read_bundle_metadata(bundle_dir)?.ok_or_else(|| {
        anyhow!(
            "bundle metadata missing: no {} in {}",
            BUNDLE_METADATA_FILE,
            bundle_dir.display()
        )
    })?;
    let deps_dir = bundle_dir.join(deps_subdir);
    ensure_dir(&deps_dir)?;
    let mut summary = PrepareSummary::default();
    resolve_into(&metadata, &deps_dir, fetcher, &mut summary)?;
    Ok(summary)
}

fn resolve_into(
    metadata: &BundleMetadata,
    deps_dir: &Path,
    fetcher: &dyn BundleFetcher,
    summary: &mut PrepareSummary,
) -> Result<()> {
    for dep in metadata.dependencies.keys() {
        let dep_dir = deps_dir.join(dep);
        if dep_dir.exists() {
            debug!(dep, "dependency bundle already present");
            summary.skipped.push(dep.clone());
            continue;
        }
        info!(dep, "fetching dependency bundle");
        let bytes = fetcher.fetch(dep)?;
        if let Err(err) = unpack_bundle(&bytes, &dep_dir) {
            let _ = fs::remove_dir_all(&dep_dir);
            return Err(err.context(format!("unpacking dependency bundle '{}'", dep)));
        }
        summary.fetched.push(dep.clone());
        if let Some(dep_metadata) = read_bundle_metadata(&dep_dir)? {
            resolve_into(&dep_metadata, deps_dir, fetcher, summary)?;
        }
    }
    Ok(())
}

fn unpack_bundle(bytes: &[u8], dest: &Path) -> Result<()> {
    ensure_dir(dest)?;
    let mut archive = Archive::new(GzDecoder::new(bytes));
    archive.unpack(dest)?;
    hoist_single_root(dest)
}

/// Registry tarballs wrap the bundle in a single top-level directory;
/// hoist its contents so `metadata.json` sits at the dependency root.
fn hoist_single_root(dest: &Path) -> Result<()> {
    if dest.join(BUNDLE_METADATA_FILE).exists() {
        return Ok(());
    }
    let entries: Vec<fs::DirEntry> = fs::read_dir(dest)?.collect::<io::Result<Vec<_>>>()?;
    if entries.len() != 1 || !entries[0].file_type()?.is_dir() {
        return Ok(());
    }
    let root = entries[0].path();
    for child in fs::read_dir(&root)? {
        let child = child?;
        fs::rename(child.path(), dest.join(child.file_name()))?;
    }
    fs::remove_dir(&root)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_root(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time should be monotonic")
            .as_nanos();
        std::env::temp_dir().join(format!(
            "converge_prepare_{}_{}_{}",
            label,
            std::process::id(),
            nanos
        ))
    }

    fn tarball(files: &[(&str, &str)]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, content.as_bytes())
                .expect("append tar entry");
        }
        builder
            .into_inner()
            .expect("finish tar")
            .finish()
            .expect("finish gzip")
    }

    struct MapFetcher {
        bundles: BTreeMap<String, Vec<u8>>,
        calls: Mutex<Vec<String>>,
    }

    impl MapFetcher {
        fn new(bundles: BTreeMap<String, Vec<u8>>) -> Self {
            Self {
                bundles,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl BundleFetcher for MapFetcher {
        fn fetch(&self, name: &str) -> Result<Vec<u8>> {
            self.calls.lock().expect("calls").push(name.to_string());
            self.bundles
                .get(name)
                .cloned()
                .ok_or_else(|| anyhow!("no such bundle '{}'", name))
        }
    }

    fn write_bundle(dir: &Path, metadata: &str) {
        fs::create_dir_all(dir).expect("bundle dir");
        fs::write(dir.join(BUNDLE_METADATA_FILE), metadata).expect("metadata");
    }

    #[test]
    fn fetches_transitive_dependencies_flat() {
        let root = temp_root("transitive");
        let bundle = root.join("bundle");
        write_bundle(&bundle, r#"{"name":"app","dependencies":{"a":">= 0"}}"#);

        let mut bundles = BTreeMap::new();
        // "a" wraps its contents in a top-level dir and depends on "b".
        bundles.insert(
            "a".to_string(),
            tarball(&[(
                "a/metadata.json",
                r#"{"name":"a","dependencies":{"b":">= 0"}}"#,
            )]),
        );
        bundles.insert(
            "b".to_string(),
            tarball(&[("metadata.json", r#"{"name":"b","dependencies":{}}"#)]),
        );
        let fetcher = MapFetcher::new(bundles);

        let summary = prepare_dependencies(&bundle, "policy_dependencies", &fetcher)
            .expect("prepare succeeds");
        assert_eq!(summary.fetched, vec!["a", "b"]);
        assert!(summary.skipped.is_empty());
        let deps = bundle.join("policy_dependencies");
        assert!(deps.join("a").join(BUNDLE_METADATA_FILE).exists());
        assert!(deps.join("b").join(BUNDLE_METADATA_FILE).exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn present_dependencies_are_skipped_without_fetching() {
        let root = temp_root("skip");
        let bundle = root.join("bundle");
        write_bundle(&bundle, r#"{"name":"app","dependencies":{"a":">= 0"}}"#);
        fs::create_dir_all(bundle.join("policy_dependencies").join("a"))
            .expect("preexisting dep");

        let fetcher = MapFetcher::new(BTreeMap::new());
        let summary = prepare_dependencies(&bundle, "policy_dependencies", &fetcher)
            .expect("prepare succeeds");
        assert_eq!(summary.skipped, vec!["a"]);
        assert!(summary.fetched.is_empty());
        assert!(fetcher.calls.lock().expect("calls").is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn failed_unpack_removes_the_partial_dependency() {
        let root = temp_root("partial");
        let bundle = root.join("bundle");
        write_bundle(&bundle, r#"{"name":"app","dependencies":{"a":">= 0"}}"#);

        let mut bundles = BTreeMap::new();
        bundles.insert("a".to_string(), b"not a gzip stream".to_vec());
        let fetcher = MapFetcher::new(bundles);

        prepare_dependencies(&bundle, "policy_dependencies", &fetcher)
            .expect_err("unpack should fail");
        assert!(!bundle.join("policy_dependencies").join("a").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_metadata_is_an_error() {
        let root = temp_root("nometa");
        let bundle = root.join("bundle");
        fs::create_dir_all(&bundle).expect("bundle dir");
        let fetcher = MapFetcher::new(BTreeMap::new());
        prepare_dependencies(&bundle, "policy_dependencies", &fetcher)
            .expect_err("metadata is required");
        let _ = fs::remove_dir_all(root);
    }
}
