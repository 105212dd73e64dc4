//! Polling key/value-tree client
//!
//! Metadata services in the EC2 style expose a directory-like tree over
//! HTTP: a path ending in `/` lists its children one per line, anything else
//! returns a leaf value. The client waits (bounded) for the service to come
//! up, then materializes the whole `meta-data/` tree.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bm_error::TransportError;
use tracing::{debug, info, trace, warn};

use crate::capabilities::{wait_until, Clock};
use crate::constants::metadata::MAX_TREE_DEPTH;
use crate::context::DetectionContext;
use crate::record::{BlobPayload, MetadataValue, RawMetadataBlob};
use crate::settings::TreeSettings;
use crate::transport::Transport;

// ============================================================================
// Readers
// ============================================================================

pub trait TreeReader {
    /// Read `path` below the base; `Ok(None)` when the key does not exist
    fn read(&self, path: &str) -> Result<Option<String>, TransportError>;

    /// Base location, for logs and blob sources
    fn base(&self) -> &str;
}

/// Reads a tree from an HTTP metadata service
pub struct HttpTreeReader {
    agent: ureq::Agent,
    base: String,
}

impl HttpTreeReader {
    pub fn new(base: &str, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            base: base.trim_end_matches('/').to_string(),
        }
    }
}

impl TreeReader for HttpTreeReader {
    fn read(&self, path: &str) -> Result<Option<String>, TransportError> {
        let url = format!("{}/{}", self.base, path);
        trace!(url = %url, "GET");
        match self.agent.get(&url).call() {
            Ok(resp) => resp
                .into_string()
                .map(Some)
                .map_err(|e| TransportError::unreachable(format!("{}: {}", url, e))),
            Err(ureq::Error::Status(404, _)) => Ok(None),
            Err(ureq::Error::Status(code, _)) => {
                Err(TransportError::unreachable(format!("{} returned HTTP {}", url, code)))
            }
            Err(e) => Err(TransportError::unreachable(format!("{}: {}", url, e))),
        }
    }

    fn base(&self) -> &str {
        &self.base
    }
}

/// Reads a tree mirrored into a local directory (`file://` metadata urls)
pub struct DirTreeReader {
    root: PathBuf,
    base: String,
}

impl DirTreeReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let base = format!("file://{}", root.display());
        Self { root, base }
    }

    fn list(dir: &Path) -> std::io::Result<String> {
        let mut names: Vec<String> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                if e.path().is_dir() {
                    format!("{}/", name)
                } else {
                    name
                }
            })
            .collect();
        names.sort();
        Ok(names.join("\n"))
    }
}

impl TreeReader for DirTreeReader {
    fn read(&self, path: &str) -> Result<Option<String>, TransportError> {
        let target = self.root.join(path.trim_end_matches('/'));
        let result = if path.ends_with('/') {
            Self::list(&target)
        } else {
            fs::read_to_string(&target)
        };
        match result {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransportError::unreachable(format!("{}: {}", target.display(), e))),
        }
    }

    fn base(&self) -> &str {
        &self.base
    }
}

/// Reader for a configured base url
pub fn reader_for(base: &str, timeout: Duration) -> Box<dyn TreeReader> {
    match base.strip_prefix("file://") {
        Some(path) => Box::new(DirTreeReader::new(path)),
        None => Box::new(HttpTreeReader::new(base, timeout)),
    }
}

// ============================================================================
// Crawling
// ============================================================================

/// Leaf bodies: JSON objects are decoded, multi-line values become lists.
fn decode_leaf(body: &str) -> MetadataValue {
    if body.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            return MetadataValue::from_json(value);
        }
    }
    if body.contains('\n') {
        return MetadataValue::List(body.lines().map(MetadataValue::from).collect());
    }
    MetadataValue::from(body)
}

pub struct TreeClient<'a> {
    reader: &'a dyn TreeReader,
    max_depth: usize,
}

impl<'a> TreeClient<'a> {
    pub fn new(reader: &'a dyn TreeReader) -> Self {
        Self {
            reader,
            max_depth: MAX_TREE_DEPTH,
        }
    }

    /// Materialize the subtree listed at `prefix` (which must end in `/`).
    pub fn crawl(&self, prefix: &str, warnings: &mut Vec<String>) -> Result<MetadataValue, TransportError> {
        self.crawl_at(prefix, 0, warnings)
    }

    fn crawl_at(&self, prefix: &str, depth: usize, warnings: &mut Vec<String>) -> Result<MetadataValue, TransportError> {
        let listing = self
            .reader
            .read(prefix)?
            .ok_or_else(|| TransportError::not_present(format!("{}/{}", self.reader.base(), prefix)))?;

        let mut map = BTreeMap::new();
        for line in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(child) = line.strip_suffix('/') {
                if depth + 1 >= self.max_depth {
                    warn!(path = %format!("{}{}", prefix, line), "Metadata tree too deep, not descending");
                    warnings.push(format!("skipped {}{}: tree deeper than {}", prefix, line, self.max_depth));
                    continue;
                }
                match self.crawl_at(&format!("{}{}", prefix, line), depth + 1, warnings) {
                    Ok(value) => {
                        map.insert(child.to_string(), value);
                    }
                    Err(TransportError::NotPresent(path)) => {
                        debug!(path = %path, "Listed subtree vanished");
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            // "0=my-key" names the key while the value lives at "0/openssh-key"
            let (name, path) = match line.split_once('=') {
                Some((idx, name)) if idx.parse::<u32>().is_ok() => (name, format!("{}/openssh-key", idx)),
                _ => (line, line.to_string()),
            };
            match self.reader.read(&format!("{}{}", prefix, path))? {
                Some(body) => {
                    map.insert(name.to_string(), decode_leaf(&body));
                }
                None => debug!(key = %name, "Listed leaf vanished"),
            }
        }
        Ok(MetadataValue::Map(map))
    }
}

/// Poll `ready_path` on each reader until one answers, bounded by `max_wait`.
///
/// Returns the index of the reader that answered.
pub fn wait_for_service(
    clock: &dyn Clock,
    readers: &[Box<dyn TreeReader>],
    ready_path: &str,
    max_wait: Duration,
    interval: Duration,
) -> Result<usize, TransportError> {
    if readers.is_empty() {
        return Err(TransportError::not_present("no metadata urls configured"));
    }
    let start = clock.elapsed();
    let found = wait_until(clock, max_wait, interval, || {
        readers.iter().position(|reader| match reader.read(ready_path) {
            Ok(Some(body)) if !body.trim().is_empty() => true,
            Ok(_) => {
                debug!(base = reader.base(), "Metadata service up but readiness key empty");
                false
            }
            Err(e) => {
                debug!(base = reader.base(), error = %e, "Metadata service not answering");
                false
            }
        })
    });
    found.ok_or_else(|| TransportError::Timeout {
        what: format!("metadata service ({})", ready_path),
        waited_secs: clock.elapsed().saturating_sub(start).as_secs(),
    })
}

// ============================================================================
// EC2-style transport
// ============================================================================

/// Seed directory or metadata service in the EC2 layout
pub struct Ec2Transport {
    seed_dir: PathBuf,
    readers: Vec<Box<dyn TreeReader>>,
    api_version: String,
    max_wait: Duration,
    retry_interval: Duration,
}

impl Ec2Transport {
    pub fn new(seed_dir: PathBuf, readers: Vec<Box<dyn TreeReader>>, api_version: &str) -> Self {
        Self {
            seed_dir,
            readers,
            api_version: api_version.to_string(),
            max_wait: crate::constants::timing::METADATA_MAX_WAIT,
            retry_interval: crate::constants::timing::METADATA_RETRY_INTERVAL,
        }
    }

    /// Build from settings, falling back to the platform's urls and version
    pub fn from_settings(
        seed_dir: PathBuf,
        settings: &TreeSettings,
        default_urls: &[&str],
        default_version: &str,
    ) -> Self {
        let urls: Vec<String> = if settings.metadata_urls.is_empty() {
            default_urls.iter().map(|u| u.to_string()).collect()
        } else {
            settings.metadata_urls.clone()
        };
        let readers = urls.iter().map(|u| reader_for(u, settings.timeout())).collect();
        let version = settings.api_version.as_deref().unwrap_or(default_version);
        let mut transport = Self::new(seed_dir, readers, version);
        transport.max_wait = settings.max_wait();
        transport.retry_interval = settings.retry_interval();
        transport
    }

    fn read_seed(&self) -> Option<Result<RawMetadataBlob, TransportError>> {
        let meta_path = self.seed_dir.join("meta-data");
        let content = fs::read_to_string(&meta_path).ok()?;
        debug!(path = ?meta_path, "Using seeded metadata");

        let meta: serde_json::Value = match serde_yaml::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                return Some(Err(TransportError::unreachable(format!(
                    "unreadable seed {}: {}",
                    meta_path.display(),
                    e
                ))))
            }
        };
        let mut tree = BTreeMap::new();
        tree.insert("meta-data".to_string(), MetadataValue::from_json(meta));
        if let Ok(user_data) = fs::read_to_string(self.seed_dir.join("user-data")) {
            tree.insert("user-data".to_string(), MetadataValue::from(user_data));
        }
        Some(Ok(RawMetadataBlob::new(
            format!("seed:{}", self.seed_dir.display()),
            BlobPayload::Tree(MetadataValue::Map(tree)),
        )))
    }
}

impl Transport for Ec2Transport {
    fn fetch(&self, ctx: &DetectionContext<'_>) -> Result<RawMetadataBlob, TransportError> {
        if let Some(seeded) = self.read_seed() {
            return seeded;
        }

        let ready_key = format!("{}/meta-data/instance-id", self.api_version);
        let index = wait_for_service(ctx.clock, &self.readers, &ready_key, self.max_wait, self.retry_interval)?;
        let reader = self.readers[index].as_ref();
        info!(base = reader.base(), "Metadata service answered");

        let mut warnings = Vec::new();
        let client = TreeClient::new(reader);
        let meta = client.crawl(&format!("{}/meta-data/", self.api_version), &mut warnings)?;

        let mut tree = BTreeMap::new();
        tree.insert("meta-data".to_string(), meta);
        match reader.read(&format!("{}/user-data", self.api_version)) {
            Ok(Some(user_data)) => {
                tree.insert("user-data".to_string(), MetadataValue::from(user_data));
            }
            Ok(None) => debug!("No user-data provided"),
            Err(e) => {
                warn!(error = %e, "Failed to read user-data");
                warnings.push(format!("user-data: {}", e));
            }
        }

        let mut blob = RawMetadataBlob::new(reader.base(), BlobPayload::Tree(MetadataValue::Map(tree)));
        blob.warnings = warnings;
        Ok(blob)
    }
}
