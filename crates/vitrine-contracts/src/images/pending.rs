use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Error,
}

impl UploadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    Upload,
    Cropped,
    Ai,
}

impl Provenance {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Cropped => "cropped",
            Self::Ai => "ai",
        }
    }
}

/// Logical image position on a product: an image already persisted (keyed by
/// its URL) or a brand-new image (keyed by the id of its first pending entry).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "key", rename_all = "snake_case")]
pub enum SlotKey {
    Existing(String),
    New(String),
}

impl SlotKey {
    pub fn replacement_target(&self) -> Option<&str> {
        match self {
            Self::Existing(url) => Some(url.as_str()),
            Self::New(_) => None,
        }
    }

    pub fn is_existing(&self) -> bool {
        matches!(self, Self::Existing(_))
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Existing(url) => write!(f, "existing:{url}"),
            Self::New(id) => write!(f, "new:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteResult {
    pub public_url: String,
    pub thumbnail_url: Option<String>,
    pub path: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// A finished AI edit as recorded by the edit service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRun {
    pub run_id: String,
    pub operation: Option<String>,
    pub storage_path: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingPayload {
    Local {
        bytes: Vec<u8>,
        mime_type: String,
        file_name: String,
    },
    /// Already stored by the edit service; adopted as-is on submit.
    Hosted {
        url: String,
        thumbnail_url: Option<String>,
    },
}

impl PendingPayload {
    pub fn byte_len(&self) -> usize {
        match self {
            Self::Local { bytes, .. } => bytes.len(),
            Self::Hosted { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewRef {
    pub url: String,
    pub is_local: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingImage {
    pub id: String,
    pub created_at: u64,
    pub slot: SlotKey,
    pub payload: PendingPayload,
    pub preview_url: String,
    pub preview_is_local: bool,
    pub status: UploadStatus,
    pub progress: u8,
    pub provenance: Provenance,
    pub remote_result: Option<RemoteResult>,
    pub provider_run: Option<ProviderRun>,
    pub error: Option<String>,
}

impl PendingImage {
    pub fn new(
        slot: SlotKey,
        payload: PendingPayload,
        preview: PreviewRef,
        provenance: Provenance,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: 0,
            slot,
            payload,
            preview_url: preview.url,
            preview_is_local: preview.is_local,
            status: UploadStatus::Pending,
            progress: 0,
            provenance,
            remote_result: None,
            provider_run: None,
            error: None,
        }
    }

    /// A brand-new image gets its own slot named after its id.
    pub fn new_slot(payload: PendingPayload, preview: PreviewRef, provenance: Provenance) -> Self {
        let mut image = Self::new(SlotKey::New(String::new()), payload, preview, provenance);
        image.slot = SlotKey::New(image.id.clone());
        image
    }

    pub fn with_provider_run(mut self, run: ProviderRun) -> Self {
        self.provider_run = Some(run);
        self
    }

    pub fn replacement_target_key(&self) -> Option<&str> {
        self.slot.replacement_target()
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn summary(&self) -> Map<String, Value> {
        let value = json!({
            "pending_id": self.id,
            "slot": self.slot.to_string(),
            "provenance": self.provenance.as_str(),
            "status": self.status.as_str(),
            "replacement_target": self.replacement_target_key(),
            "bytes": self.payload.byte_len(),
        });
        value.as_object().cloned().unwrap_or_default()
    }
}

/// Working set of images awaiting upload, in submission order.
///
/// At most one non-terminal entry exists per replacement target (or per slot
/// for new images); inserting another supersedes it in place.
#[derive(Debug, Clone, Default)]
pub struct PendingSet {
    items: Vec<PendingImage>,
    clock: u64,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the superseded entry, whose local preview the caller must release.
    pub fn insert(&mut self, mut image: PendingImage) -> Option<PendingImage> {
        self.clock += 1;
        image.created_at = self.clock;

        let position = self.items.iter().position(|existing| {
            if !existing.is_active() {
                return false;
            }
            match (
                image.replacement_target_key(),
                existing.replacement_target_key(),
            ) {
                (Some(new_key), Some(old_key)) => new_key == old_key,
                (None, None) => existing.slot == image.slot,
                _ => false,
            }
        });

        match position {
            Some(idx) => Some(std::mem::replace(&mut self.items[idx], image)),
            None => {
                self.items.push(image);
                None
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&PendingImage> {
        self.items.iter().find(|image| image.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PendingImage> {
        self.items.iter_mut().find(|image| image.id == id)
    }

    pub fn remove(&mut self, id: &str) -> Option<PendingImage> {
        let idx = self.items.iter().position(|image| image.id == id)?;
        Some(self.items.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingImage> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn active_for_slot(&self, slot: &SlotKey) -> Option<&PendingImage> {
        self.items
            .iter()
            .find(|image| image.is_active() && &image.slot == slot)
    }

    pub fn for_slot<'a>(&'a self, slot: &SlotKey) -> impl Iterator<Item = &'a PendingImage> + 'a {
        let slot = slot.clone();
        self.items.iter().filter(move |image| image.slot == slot)
    }

    pub fn any_uploading(&self) -> bool {
        self.items
            .iter()
            .any(|image| image.status == UploadStatus::Uploading)
    }

    pub fn count_active_for_target(&self, target: &str) -> usize {
        self.items
            .iter()
            .filter(|image| image.is_active() && image.replacement_target_key() == Some(target))
            .count()
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|image| image.id.clone()).collect()
    }

    /// Distinct slots in the order they first appear.
    pub fn slots(&self) -> Vec<SlotKey> {
        let mut out: Vec<SlotKey> = Vec::new();
        for image in &self.items {
            if !out.contains(&image.slot) {
                out.push(image.slot.clone());
            }
        }
        out
    }

    pub fn mark_uploading(&mut self, id: &str) {
        if let Some(image) = self.get_mut(id) {
            image.status = UploadStatus::Uploading;
            image.progress = 0;
            image.error = None;
        }
    }

    pub fn set_progress(&mut self, id: &str, progress: u8) {
        if let Some(image) = self.get_mut(id) {
            if image.status == UploadStatus::Uploading {
                image.progress = progress.min(100);
            }
        }
    }

    pub fn mark_completed(&mut self, id: &str, result: RemoteResult) {
        if let Some(image) = self.get_mut(id) {
            image.status = UploadStatus::Completed;
            image.progress = 100;
            image.remote_result = Some(result);
            image.error = None;
        }
    }

    pub fn mark_failed(&mut self, id: &str, reason: impl Into<String>) {
        if let Some(image) = self.get_mut(id) {
            image.status = UploadStatus::Error;
            image.progress = 0;
            image.error = Some(reason.into());
        }
    }

    pub fn drain_completed(&mut self) -> Vec<PendingImage> {
        let (done, rest): (Vec<PendingImage>, Vec<PendingImage>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|image| image.status == UploadStatus::Completed);
        self.items = rest;
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(name: &str) -> PendingPayload {
        PendingPayload::Local {
            bytes: vec![1, 2, 3],
            mime_type: "image/png".to_string(),
            file_name: name.to_string(),
        }
    }

    fn preview(url: &str) -> PreviewRef {
        PreviewRef {
            url: url.to_string(),
            is_local: true,
        }
    }

    fn replacement(target: &str, preview_url: &str) -> PendingImage {
        PendingImage::new(
            SlotKey::Existing(target.to_string()),
            local("crop.png"),
            preview(preview_url),
            Provenance::Cropped,
        )
    }

    #[test]
    fn superseding_keeps_one_active_entry_per_target() {
        let mut set = PendingSet::new();
        assert!(set.insert(replacement("https://cdn/a.jpg", "file:///p/1")).is_none());
        let displaced = set.insert(replacement("https://cdn/a.jpg", "file:///p/2"));

        assert_eq!(
            displaced.map(|image| image.preview_url),
            Some("file:///p/1".to_string())
        );
        assert_eq!(set.len(), 1);
        assert_eq!(set.count_active_for_target("https://cdn/a.jpg"), 1);
    }

    #[test]
    fn superseding_replaces_in_place() {
        let mut set = PendingSet::new();
        set.insert(replacement("https://cdn/a.jpg", "file:///p/1"));
        set.insert(PendingImage::new_slot(
            local("new.png"),
            preview("file:///p/new"),
            Provenance::Upload,
        ));
        let newer = replacement("https://cdn/a.jpg", "file:///p/2");
        let newer_id = newer.id.clone();
        set.insert(newer);

        assert_eq!(set.ids().first(), Some(&newer_id));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn terminal_entries_are_not_superseded() {
        let mut set = PendingSet::new();
        let first = replacement("https://cdn/a.jpg", "file:///p/1");
        let first_id = first.id.clone();
        set.insert(first);
        set.mark_uploading(&first_id);
        set.mark_failed(&first_id, "network");

        assert!(set.insert(replacement("https://cdn/a.jpg", "file:///p/2")).is_none());
        assert_eq!(set.len(), 2);
        assert_eq!(set.count_active_for_target("https://cdn/a.jpg"), 1);
    }

    fn newest_for<'a>(set: &'a PendingSet, target: &str) -> Option<&'a PendingImage> {
        let slot = SlotKey::Existing(target.to_string());
        set.for_slot(&slot).max_by_key(|image| image.created_at)
    }

    #[test]
    fn slot_lookup_outlives_the_key() {
        let mut set = PendingSet::new();
        set.insert(replacement("https://cdn/a.jpg", "file:///p/1"));
        set.insert(replacement("https://cdn/b.jpg", "file:///p/2"));

        let found = newest_for(&set, "https://cdn/a.jpg");
        assert_eq!(found.map(|image| image.preview_url.as_str()), Some("file:///p/1"));
        assert!(newest_for(&set, "https://cdn/c.jpg").is_none());
    }

    #[test]
    fn new_slots_do_not_collide() {
        let mut set = PendingSet::new();
        set.insert(PendingImage::new_slot(local("a.png"), preview("file:///a"), Provenance::Upload));
        set.insert(PendingImage::new_slot(local("b.png"), preview("file:///b"), Provenance::Upload));
        assert_eq!(set.len(), 2);
        assert_eq!(set.slots().len(), 2);
    }

    #[test]
    fn created_at_is_monotonic() {
        let mut set = PendingSet::new();
        set.insert(PendingImage::new_slot(local("a.png"), preview("file:///a"), Provenance::Upload));
        set.insert(replacement("https://cdn/a.jpg", "file:///p/1"));
        let stamps: Vec<u64> = set.iter().map(|image| image.created_at).collect();
        assert_eq!(stamps, vec![1, 2]);
    }

    #[test]
    fn progress_only_moves_while_uploading() {
        let mut set = PendingSet::new();
        let image = replacement("https://cdn/a.jpg", "file:///p/1");
        let id = image.id.clone();
        set.insert(image);

        set.set_progress(&id, 40);
        assert_eq!(set.get(&id).map(|image| image.progress), Some(0));

        set.mark_uploading(&id);
        set.set_progress(&id, 140);
        assert_eq!(set.get(&id).map(|image| image.progress), Some(100));
        assert!(set.any_uploading());
    }

    #[test]
    fn drain_completed_leaves_failures() {
        let mut set = PendingSet::new();
        let ok = replacement("https://cdn/a.jpg", "file:///p/1");
        let bad = PendingImage::new_slot(local("c.png"), preview("file:///c"), Provenance::Upload);
        let (ok_id, bad_id) = (ok.id.clone(), bad.id.clone());
        set.insert(ok);
        set.insert(bad);
        set.mark_completed(
            &ok_id,
            RemoteResult {
                public_url: "https://cdn/a2.jpg".to_string(),
                thumbnail_url: None,
                path: None,
                width: None,
                height: None,
            },
        );
        set.mark_failed(&bad_id, "boom");

        let drained = set.drain_completed();
        assert_eq!(drained.len(), 1);
        assert_eq!(set.ids(), vec![bad_id]);
    }
}
