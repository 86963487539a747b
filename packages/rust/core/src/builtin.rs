//! Built-in plugins: the `fs` source and the `sha256` processor.

use std::collections::VecDeque;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};
use url::Url;

use assetcat_shared::{CatalogError, Result, Value, expand_home};

use crate::registry::UnitRegistry;
use crate::unit::{
    AssetScan, Capabilities, DiscoveredAsset, ProcessingUnit, SourceUnit, UnitContext,
};

pub(crate) fn register(registry: &mut UnitRegistry) {
    registry.register_source("fs", |config| {
        Ok(Arc::new(FsSource::from_config(config)?) as Arc<dyn SourceUnit>)
    });
    registry.register_processor("sha256", |config| {
        Ok(Arc::new(Sha256Unit::from_config(config)?) as Arc<dyn ProcessingUnit>)
    });
}

fn parse_config<T: for<'de> Deserialize<'de> + Default>(
    plugin: &str,
    config: &serde_json::Value,
) -> Result<T> {
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone())
        .map_err(|e| CatalogError::config(format!("invalid `{plugin}` config: {e}")))
}

// ---------------------------------------------------------------------------
// fs source
// ---------------------------------------------------------------------------

const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FsConfig {
    root: String,
    include: Vec<String>,
    exclude: Vec<String>,
    batch_size: Option<usize>,
}

/// Walks a directory tree and reports regular files.
///
/// Patterns match the path relative to `root` with `/` separators. `*`
/// stays within one segment, `**` crosses segments and `**/` also matches
/// zero directories.
pub struct FsSource {
    root: PathBuf,
    filter: Arc<FsFilter>,
    batch_size: usize,
    caps: Capabilities,
}

impl FsSource {
    fn from_config(config: &serde_json::Value) -> Result<Self> {
        let config: FsConfig = parse_config("fs", config)?;
        if config.root.trim().is_empty() {
            return Err(CatalogError::config("`fs` source needs a `root` directory"));
        }
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns.iter().map(|p| glob_to_regex(p)).collect()
        };
        Ok(Self {
            root: expand_home(&config.root)?,
            filter: Arc::new(FsFilter {
                include: compile(&config.include)?,
                exclude: compile(&config.exclude)?,
            }),
            batch_size: config.batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1),
            caps: Capabilities::new([], ["path", "file_size", "modified_at"]),
        })
    }
}

#[async_trait]
impl SourceUnit for FsSource {
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    async fn scan(&self) -> Result<Box<dyn AssetScan>> {
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|e| CatalogError::Scan(format!("{}: {e}", self.root.display())))?;
        debug!(root = %root.display(), "starting filesystem scan");
        Ok(Box::new(FsScan {
            filter: Arc::clone(&self.filter),
            pending: vec![root.clone()],
            root,
            ready: VecDeque::new(),
            batch_size: self.batch_size,
        }))
    }
}

struct FsFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

struct FsScan {
    filter: Arc<FsFilter>,
    root: PathBuf,
    pending: Vec<PathBuf>,
    ready: VecDeque<DiscoveredAsset>,
    batch_size: usize,
}

impl FsScan {
    /// Read one directory, queueing subdirectories and selected files.
    async fn visit(&mut self, dir: &Path) -> Result<()> {
        let scan_err = |e: std::io::Error| CatalogError::Scan(format!("{}: {e}", dir.display()));
        let mut entries = tokio::fs::read_dir(dir).await.map_err(scan_err)?;
        let mut children = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(scan_err)? {
            children.push(entry);
        }
        children.sort_by_key(|e| e.file_name());

        let mut subdirs = Vec::new();
        for entry in children {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(scan_err)?;
            if file_type.is_dir() {
                subdirs.push(path);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            let Some(relative) = relative_path(&self.root, &path) else {
                continue;
            };
            if !self.filter.selected(&relative) {
                trace!(%relative, "filtered out");
                continue;
            }
            // Vanished between listing and stat: skip.
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            self.ready.push_back(discovered(relative, &path, &metadata)?);
        }
        // Depth-first, visiting siblings in name order.
        self.pending.extend(subdirs.into_iter().rev());
        Ok(())
    }
}

impl FsFilter {
    fn selected(&self, relative: &str) -> bool {
        if self.exclude.iter().any(|p| p.is_match(relative)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.is_match(relative))
    }
}

#[async_trait]
impl AssetScan for FsScan {
    async fn next_batch(&mut self) -> Result<Option<Vec<DiscoveredAsset>>> {
        while self.ready.len() < self.batch_size {
            let Some(dir) = self.pending.pop() else {
                break;
            };
            self.visit(&dir).await?;
        }
        if self.ready.is_empty() {
            return Ok(None);
        }
        let take = self.batch_size.min(self.ready.len());
        Ok(Some(self.ready.drain(..take).collect()))
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = relative
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    Some(parts.join("/"))
}

fn discovered(relative: String, path: &Path, metadata: &std::fs::Metadata) -> Result<DiscoveredAsset> {
    let locator = Url::from_file_path(path)
        .map_err(|()| CatalogError::Scan(format!("{} is not an absolute path", path.display())))?;
    let mut attributes = vec![
        ("path".to_string(), Value::from(path.display().to_string())),
        ("file_size".to_string(), Value::Integer(metadata.len() as i64)),
    ];
    if let Ok(modified) = metadata.modified() {
        attributes.push((
            "modified_at".to_string(),
            Value::DateTime(DateTime::<Utc>::from(modified)),
        ));
    }
    Ok(DiscoveredAsset {
        external_id: relative,
        locator,
        attributes,
    })
}

/// Translate a glob into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*\*/", "(?:.*/)?")
        .replace(r"\*\*", ".*")
        .replace(r"\*", "[^/]*")
        .replace(r"\?", "[^/]");
    Regex::new(&format!("^{escaped}$"))
        .map_err(|e| CatalogError::config(format!("invalid glob `{pattern}`: {e}")))
}

// ---------------------------------------------------------------------------
// sha256 processor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct Sha256Config {
    /// Hash in a worker process.
    isolated: bool,
}

/// Content hash of the file at `path`.
pub struct Sha256Unit {
    caps: Capabilities,
}

impl Sha256Unit {
    fn from_config(config: &serde_json::Value) -> Result<Self> {
        let config: Sha256Config = parse_config("sha256", config)?;
        // Content changes surface as size or mtime changes.
        let caps = Capabilities::new(["path", "file_size", "modified_at"], ["sha256"]);
        Ok(Self {
            caps: if config.isolated { caps.isolated() } else { caps },
        })
    }
}

impl ProcessingUnit for Sha256Unit {
    fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    fn run(&self, ctx: &mut UnitContext) -> Result<()> {
        let Some(Value::String(path)) = ctx.first("path").cloned() else {
            ctx.skip("no path");
            return Ok(());
        };
        let mut file = match std::fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                ctx.skip("file missing");
                return Ok(());
            }
            Err(e) => return Err(CatalogError::io(&path, e)),
        };

        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(|e| CatalogError::io(&path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        ctx.set("sha256", [Value::from(format!("{:x}", hasher.finalize()))])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::CurrentView;
    use assetcat_shared::{ActorId, Asset, AssetId, ChangesetId, Fact, FactId};
    use uuid::Uuid;

    fn temp_tree() -> PathBuf {
        let root = std::env::temp_dir().join(format!("assetcat-fs-{}", Uuid::now_v7()));
        for (rel, body) in [
            ("a.txt", "alpha"),
            ("b.log", "beta"),
            ("docs/c.txt", "gamma"),
            ("docs/deep/d.txt", "delta"),
            ("target/e.txt", "eps"),
        ] {
            let path = root.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, body).unwrap();
        }
        root
    }

    async fn collect(source: &FsSource) -> Vec<DiscoveredAsset> {
        let mut scan = source.scan().await.unwrap();
        let mut out = Vec::new();
        while let Some(batch) = scan.next_batch().await.unwrap() {
            assert!(batch.len() <= source.batch_size);
            out.extend(batch);
        }
        out
    }

    fn ids(assets: &[DiscoveredAsset]) -> Vec<&str> {
        assets.iter().map(|a| a.external_id.as_str()).collect()
    }

    #[test]
    fn glob_patterns() {
        let re = glob_to_regex("**/*.txt").unwrap();
        assert!(re.is_match("a.txt"));
        assert!(re.is_match("docs/deep/d.txt"));
        assert!(!re.is_match("b.log"));

        let re = glob_to_regex("docs/*.txt").unwrap();
        assert!(re.is_match("docs/c.txt"));
        assert!(!re.is_match("docs/deep/d.txt"));

        let re = glob_to_regex("target/**").unwrap();
        assert!(re.is_match("target/e.txt"));
        assert!(!re.is_match("a.txt"));

        assert!(glob_to_regex("?.txt").unwrap().is_match("a.txt"));
    }

    #[test]
    fn fs_config_requires_root() {
        assert!(FsSource::from_config(&serde_json::Value::Null).is_err());
        assert!(FsSource::from_config(&serde_json::json!({"root": "/tmp", "bogus": 1})).is_err());
    }

    #[tokio::test]
    async fn fs_scan_walks_in_name_order_with_filters() {
        let root = temp_tree();
        let source = FsSource::from_config(&serde_json::json!({
            "root": root.to_str().unwrap(),
            "exclude": ["target/**"],
            "batch_size": 2,
        }))
        .unwrap();

        let found = collect(&source).await;
        assert_eq!(ids(&found), ["a.txt", "b.log", "docs/c.txt", "docs/deep/d.txt"]);

        let a = &found[0];
        assert_eq!(a.locator.scheme(), "file");
        assert!(a.attributes.iter().any(|(k, v)| k == "file_size" && *v == Value::Integer(5)));
        assert!(a.attributes.iter().any(|(k, _)| k == "modified_at"));

        let only_txt = FsSource::from_config(&serde_json::json!({
            "root": root.to_str().unwrap(),
            "include": ["**/*.txt"],
            "exclude": ["target/**"],
        }))
        .unwrap();
        assert_eq!(ids(&collect(&only_txt).await), ["a.txt", "docs/c.txt", "docs/deep/d.txt"]);

        std::fs::remove_dir_all(root).ok();
    }

    #[tokio::test]
    async fn fs_scan_of_missing_root_fails() {
        let source = FsSource::from_config(&serde_json::json!({
            "root": "/nonexistent/assetcat/root",
        }))
        .unwrap();
        assert!(source.scan().await.is_err());
    }

    fn context_for(path: &str) -> (UnitContext, Sha256Unit) {
        let unit = Sha256Unit::from_config(&serde_json::Value::Null).unwrap();
        let asset = Asset {
            id: AssetId::new(),
            namespace: "files".into(),
            external_id: "x".into(),
            locator: "file:///x".parse().unwrap(),
            created_by: ActorId(1),
            created_in: ChangesetId(1),
        };
        let view = CurrentView::from_facts(&[Fact::assert(
            asset.id,
            "path",
            Value::from(path),
            ActorId(1),
            ChangesetId(1),
        )
        .with_id(FactId(1))]);
        let ctx = UnitContext::new("sha256", asset, ActorId(2), ChangesetId(1), &unit.caps, view);
        (ctx, unit)
    }

    #[test]
    fn sha256_hashes_file_contents() {
        let path = std::env::temp_dir().join(format!("assetcat-hash-{}", Uuid::now_v7()));
        std::fs::write(&path, "abc").unwrap();

        let (mut ctx, unit) = context_for(path.to_str().unwrap());
        unit.run(&mut ctx).unwrap();
        let facts = ctx.into_facts();
        assert_eq!(facts.len(), 1);
        assert_eq!(
            facts[0].value,
            Value::from("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn sha256_skips_missing_file() {
        let (mut ctx, unit) = context_for("/nonexistent/assetcat/file");
        unit.run(&mut ctx).unwrap();
        assert_eq!(ctx.skipped(), Some("file missing"));
        assert!(ctx.staged().is_empty());
    }

    #[test]
    fn sha256_can_request_isolation() {
        let unit = Sha256Unit::from_config(&serde_json::json!({"isolated": true})).unwrap();
        assert!(unit.capabilities().isolated);
    }

    #[test]
    fn sha256_depends_on_file_metadata() {
        let unit = Sha256Unit::from_config(&serde_json::Value::Null).unwrap();
        let deps: Vec<&str> = unit.caps.dependencies.iter().map(String::as_str).collect();
        assert_eq!(deps, ["file_size", "modified_at", "path"]);
    }
}
