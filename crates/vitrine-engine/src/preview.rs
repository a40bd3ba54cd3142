use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use uuid::Uuid;
use vitrine_contracts::images::{PendingImage, PreviewRef};

use crate::media::extension_for_mime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Still on screen; released on `unpin`.
    Deferred,
    /// Remote, unknown, or already released.
    NotOwned,
}

/// Owns the local preview files shown for pending images.
///
/// Previews are spooled to disk and addressed by `file://` URLs. Ownership is
/// tracked in `handles`, never inferred from the URL, so provider-hosted
/// previews are never touched. Every local handle is released exactly once.
#[derive(Debug)]
pub struct PreviewManager {
    spool_dir: PathBuf,
    handles: BTreeMap<String, PathBuf>,
    pinned: Option<String>,
    deferred: BTreeSet<String>,
    released: u64,
}

impl PreviewManager {
    pub fn new(spool_dir: impl Into<PathBuf>) -> Result<Self> {
        let spool_dir = spool_dir.into();
        std::fs::create_dir_all(&spool_dir)
            .with_context(|| format!("failed creating {}", spool_dir.display()))?;
        Ok(Self {
            spool_dir,
            handles: BTreeMap::new(),
            pinned: None,
            deferred: BTreeSet::new(),
            released: 0,
        })
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    pub fn allocate(&mut self, bytes: &[u8], mime_type: &str) -> Result<PreviewRef> {
        let path = self.spool_dir.join(format!(
            "preview-{}.{}",
            Uuid::new_v4(),
            extension_for_mime(mime_type)
        ));
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed writing {}", path.display()))?;
        let url = format!("file://{}", path.display());
        self.handles.insert(url.clone(), path);
        Ok(PreviewRef {
            url,
            is_local: true,
        })
    }

    /// A preview already reachable at a stable remote URL.
    pub fn remote(url: impl Into<String>) -> PreviewRef {
        PreviewRef {
            url: url.into(),
            is_local: false,
        }
    }

    pub fn is_live(&self, url: &str) -> bool {
        self.handles.contains_key(url)
    }

    pub fn live_count(&self) -> usize {
        self.handles.len()
    }

    pub fn released_count(&self) -> u64 {
        self.released
    }

    pub fn pinned(&self) -> Option<&str> {
        self.pinned.as_deref()
    }

    /// Marks the preview currently displayed. A previously pinned preview
    /// whose release was deferred is released now.
    pub fn pin(&mut self, url: &str) -> Result<()> {
        let previous = self.pinned.replace(url.to_string());
        if let Some(previous) = previous.filter(|previous| previous != url) {
            if self.deferred.remove(&previous) {
                self.release_now(&previous)?;
            }
        }
        Ok(())
    }

    pub fn unpin(&mut self) -> Result<()> {
        if let Some(previous) = self.pinned.take() {
            if self.deferred.remove(&previous) {
                self.release_now(&previous)?;
            }
        }
        Ok(())
    }

    pub fn release(&mut self, url: &str) -> Result<ReleaseOutcome> {
        if !self.handles.contains_key(url) {
            return Ok(ReleaseOutcome::NotOwned);
        }
        if self.pinned.as_deref() == Some(url) {
            self.deferred.insert(url.to_string());
            return Ok(ReleaseOutcome::Deferred);
        }
        self.release_now(url)?;
        Ok(ReleaseOutcome::Released)
    }

    pub fn release_image(&mut self, image: &PendingImage) -> Result<ReleaseOutcome> {
        if !image.preview_is_local {
            return Ok(ReleaseOutcome::NotOwned);
        }
        self.release(&image.preview_url)
    }

    /// Releases every remaining local handle, pinned or not.
    pub fn teardown(&mut self) -> Result<usize> {
        self.pinned = None;
        self.deferred.clear();
        let urls: Vec<String> = self.handles.keys().cloned().collect();
        for url in &urls {
            self.release_now(url)?;
        }
        Ok(urls.len())
    }

    fn release_now(&mut self, url: &str) -> Result<()> {
        let Some(path) = self.handles.remove(url) else {
            return Ok(());
        };
        self.released += 1;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => {
                Err(err).with_context(|| format!("failed removing {}", path.display()))
            }
        }
    }
}

impl Drop for PreviewManager {
    fn drop(&mut self) {
        let _ = self.teardown();
    }
}
