//! Mounted-volume document reader
//!
//! Looks for a provisioning document (`ovf-env.xml` and friends) in the seed
//! directory, then on every candidate volume, then in the cache left by a
//! previous boot. Volumes are mounted only for the duration of the read.

use std::fs;
use std::path::{Path, PathBuf};

use bm_error::TransportError;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::capabilities::{with_mounted, DeviceQuery};
use crate::context::DetectionContext;
use crate::record::{BlobPayload, RawMetadataBlob};
use crate::transport::Transport;

pub struct VolumeReader {
    seed_dir: Option<PathBuf>,
    fstypes: Vec<String>,
    device_filter: Option<Regex>,
    cache_dir: PathBuf,
    doc_names: Vec<String>,
}

/// First document from `names` present in `dir`
fn find_document(dir: &Path, names: &[String]) -> Option<(String, Vec<u8>)> {
    names.iter().find_map(|name| {
        let path = dir.join(name);
        match fs::read(&path) {
            Ok(bytes) => Some((name.clone(), bytes)),
            Err(_) => None,
        }
    })
}

impl VolumeReader {
    pub fn new(fstypes: &[String], cache_dir: impl Into<PathBuf>, doc_names: &[&str]) -> Self {
        Self {
            seed_dir: None,
            fstypes: fstypes.to_vec(),
            device_filter: None,
            cache_dir: cache_dir.into(),
            doc_names: doc_names.iter().map(|n| n.to_string()).collect(),
        }
    }

    pub fn with_seed_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.seed_dir = Some(dir.into());
        self
    }

    /// Only consider devices whose name matches `pattern`
    pub fn with_device_filter(mut self, pattern: Regex) -> Self {
        self.device_filter = Some(pattern);
        self
    }

    /// Where a copy of the document from a previous boot lives
    pub fn cache_path(&self) -> Option<PathBuf> {
        self.doc_names
            .iter()
            .map(|n| self.cache_dir.join(n))
            .find(|p| p.is_file())
    }

    fn device_allowed(&self, device: &str) -> bool {
        let name = Path::new(device)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.device_filter.as_ref().map_or(true, |re| re.is_match(&name))
    }

    /// Candidate devices, newest name first
    fn devices(&self, ctx: &DetectionContext<'_>) -> Vec<(String, String)> {
        let mut devices: Vec<(String, String)> = Vec::new();
        for fstype in &self.fstypes {
            for device in ctx.candidates(&DeviceQuery::FsType(fstype.clone())) {
                if self.device_allowed(&device) && !devices.iter().any(|(d, _)| d == &device) {
                    devices.push((device, fstype.clone()));
                }
            }
        }
        devices.sort_by(|a, b| b.0.cmp(&a.0));
        devices
    }

    /// Read live media only. Reports `Ejected` when media is gone but a
    /// previous boot cached the document.
    pub fn read_media(&self, ctx: &DetectionContext<'_>) -> Result<RawMetadataBlob, TransportError> {
        if let Some(seed) = &self.seed_dir {
            if let Some((name, bytes)) = find_document(seed, &self.doc_names) {
                debug!(dir = ?seed, name = %name, "Found seeded document");
                return Ok(RawMetadataBlob::new(
                    format!("seed:{}", seed.display()),
                    BlobPayload::Document { name, bytes },
                ));
            }
        }

        let mut ejected: Option<String> = None;
        for (device, fstype) in self.devices(ctx) {
            match with_mounted(ctx.devices, &device, Some(&fstype), |root| find_document(root, &self.doc_names)) {
                Ok(Some((name, bytes))) => {
                    info!(device = %device, name = %name, "Read provisioning document");
                    return Ok(RawMetadataBlob::new(device, BlobPayload::Document { name, bytes }));
                }
                Ok(None) => debug!(device = %device, "No provisioning document on volume"),
                Err(TransportError::Ejected(reason)) => {
                    warn!(device = %device, reason = %reason, "Volume disappeared before it could be read");
                    ejected = Some(reason);
                }
                Err(e) => debug!(device = %device, error = %e, "Skipping volume"),
            }
        }

        match (ejected, self.cache_path()) {
            (Some(reason), _) => Err(TransportError::Ejected(reason)),
            (None, Some(cached)) => Err(TransportError::Ejected(format!(
                "no media present, previous copy at {}",
                cached.display()
            ))),
            (None, None) => Err(TransportError::not_present(format!(
                "no {} found on {} volumes",
                self.doc_names.first().map(String::as_str).unwrap_or("document"),
                self.fstypes.join("/")
            ))),
        }
    }

    fn read_cache(&self, reason: &str) -> Result<RawMetadataBlob, TransportError> {
        let Some(path) = self.cache_path() else {
            debug!(reason, "Media ejected and nothing cached");
            return Err(TransportError::not_present(format!("{} (no cached copy)", reason)));
        };
        let bytes = fs::read(&path)
            .map_err(|e| TransportError::not_present(format!("cached copy {}: {}", path.display(), e)))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        info!(path = ?path, "Using cached provisioning document");
        let mut blob = RawMetadataBlob::new(path.display().to_string(), BlobPayload::Document { name, bytes });
        blob.from_cache = true;
        blob.warnings.push(format!("media ejected ({}); using cached copy", reason));
        Ok(blob)
    }
}

impl Transport for VolumeReader {
    fn fetch(&self, ctx: &DetectionContext<'_>) -> Result<RawMetadataBlob, TransportError> {
        match self.read_media(ctx) {
            Err(TransportError::Ejected(reason)) => self.read_cache(&reason),
            other => other,
        }
    }
}
