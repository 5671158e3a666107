//! Local filesystem backend.
//!
//! Objects live at `root/<org>/<mediapackage>/<version>/<element>[.ext]`, the
//! object key's segments joined onto the root. Writes land in a temporary
//! file next to the target and are renamed into place, so readers never see
//! a partial object.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_types::{MimeType, ObjectKey, ObjectVersion};
use sysinfo::Disks;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{BackendError, BackendResult};
use crate::traits::BackendDriver;

/// Filesystem backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilesystemConfig {
    /// Directory all objects are stored under.
    pub root: PathBuf,
    /// Copy by hard-linking objects instead of sharing them through the
    /// mapping table only.
    #[serde(default)]
    pub hard_links: bool,
}

impl FilesystemConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            hard_links: false,
        }
    }

    pub fn with_hard_links(mut self, enabled: bool) -> Self {
        self.hard_links = enabled;
        self
    }
}

/// A [`BackendDriver`] storing objects as files.
#[derive(Debug)]
pub struct FilesystemBackend {
    root: PathBuf,
    hard_links: bool,
}

impl FilesystemBackend {
    /// Open the backend, creating the root directory if needed.
    pub fn new(config: FilesystemConfig) -> BackendResult<Self> {
        fs::create_dir_all(&config.root).map_err(|e| {
            BackendError::Config(format!(
                "cannot create storage root {}: {e}",
                config.root.display()
            ))
        })?;
        let root = config.root.canonicalize()?;
        if !root.is_dir() {
            return Err(BackendError::Config(format!(
                "storage root {} is not a directory",
                root.display()
            )));
        }
        info!(root = %root.display(), hard_links = config.hard_links, "filesystem backend ready");
        Ok(Self {
            root,
            hard_links: config.hard_links,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The file an object key maps to.
    pub fn object_path(&self, key: &ObjectKey) -> PathBuf {
        key.segments().fold(self.root.clone(), |path, seg| path.join(seg))
    }

    /// Remove directories left empty below the root, starting at `dir`.
    fn prune_empty_dirs(&self, mut dir: &Path) {
        while dir != self.root && dir.starts_with(&self.root) {
            match fs::remove_dir(dir) {
                Ok(()) => debug!(dir = %dir.display(), "pruned empty directory"),
                // Not empty, or already gone: either way stop climbing.
                Err(_) => break,
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => break,
            }
        }
    }

    /// The mounted disk holding the root, by longest mount-point prefix.
    fn with_disk<T>(&self, f: impl Fn(&sysinfo::Disk) -> T) -> Option<T> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| self.root.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(f)
    }
}

fn not_found_as<T>(result: io::Result<T>, absent: T) -> BackendResult<T> {
    match result {
        Ok(v) => Ok(v),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(absent),
        Err(e) => Err(e.into()),
    }
}

impl BackendDriver for FilesystemBackend {
    fn name(&self) -> &str {
        "filesystem"
    }

    fn write(
        &self,
        key: &ObjectKey,
        data: &mut dyn Read,
        _mime_type: Option<&MimeType>,
    ) -> BackendResult<Option<ObjectVersion>> {
        let target = self.object_path(key);
        let dir = target
            .parent()
            .ok_or_else(|| BackendError::Config(format!("object key {key} has no parent")))?;
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::Builder::new().prefix(".incoming-").tempfile_in(dir)?;
        let bytes = io::copy(data, &mut tmp)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| BackendError::Io(e.error))?;

        info!(%key, bytes, path = %target.display(), "object written");
        Ok(None)
    }

    fn read(
        &self,
        key: &ObjectKey,
        _version: Option<&ObjectVersion>,
    ) -> BackendResult<Option<Box<dyn Read + Send>>> {
        let opened = File::open(self.object_path(key))
            .map(|f| Some(Box::new(io::BufReader::new(f)) as Box<dyn Read + Send>));
        not_found_as(opened, None)
    }

    fn exists(&self, key: &ObjectKey, _version: Option<&ObjectVersion>) -> BackendResult<bool> {
        not_found_as(fs::metadata(self.object_path(key)).map(|m| m.is_file()), false)
    }

    fn delete(&self, key: &ObjectKey, _version: Option<&ObjectVersion>) -> BackendResult<bool> {
        let path = self.object_path(key);
        let removed = not_found_as(fs::remove_file(&path).map(|()| true), false)?;
        if removed {
            info!(%key, path = %path.display(), "object deleted");
        }
        if let Some(dir) = path.parent() {
            self.prune_empty_dirs(dir);
        }
        Ok(removed)
    }

    fn link(&self, from: &ObjectKey, to: &ObjectKey) -> BackendResult<bool> {
        if !self.hard_links {
            return Ok(false);
        }
        if from == to {
            return Ok(self.object_path(from).is_file());
        }
        let source = self.object_path(from);
        let target = self.object_path(to);
        if !source.is_file() {
            debug!(%from, "link source missing");
            return Ok(false);
        }
        let dir = target
            .parent()
            .ok_or_else(|| BackendError::Config(format!("object key {to} has no parent")))?;
        fs::create_dir_all(dir)?;

        // The link is made under a temporary name and renamed over the
        // target, so the target always holds either its old or new object.
        let linked = tempfile::Builder::new()
            .prefix(".link-")
            .make_in(dir, |tmp| fs::hard_link(&source, tmp))
            .and_then(|tmp| tmp.persist(&target).map_err(|e| e.error));
        match linked {
            Ok(()) => {
                info!(%from, %to, "object hard-linked");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(%from, "link source vanished");
                Ok(false)
            }
            Err(e) => {
                warn!(%from, %to, error = %e, "hard link failed; sharing through mappings");
                Ok(false)
            }
        }
    }

    fn used_space(&self) -> Option<u64> {
        let total = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum();
        Some(total)
    }

    fn usable_space(&self) -> Option<u64> {
        self.with_disk(|d| d.available_space())
    }

    fn total_space(&self) -> Option<u64> {
        self.with_disk(|d| d.total_space())
    }
}
