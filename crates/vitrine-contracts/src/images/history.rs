use serde::{Deserialize, Serialize};

use super::pending::{PendingImage, PendingSet, Provenance, ProviderRun, SlotKey, UploadStatus};
use crate::edits::humanize_operation;

pub const ORIGINAL_ENTRY_ID: &str = "original";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditHistoryEntry {
    pub id: String,
    pub preview_url: String,
    pub thumbnail_url: Option<String>,
    pub label: String,
    pub provenance: Provenance,
    pub provider_run: Option<ProviderRun>,
    pub created_at: u64,
    pub status: UploadStatus,
}

/// Steps applied to one slot, oldest first. Recomputed from the pending set on
/// every call; there is nothing to keep in sync.
pub fn edit_history(slot: &SlotKey, pending: &PendingSet) -> Vec<EditHistoryEntry> {
    let mut entries = Vec::new();
    if let SlotKey::Existing(url) = slot {
        entries.push(EditHistoryEntry {
            id: ORIGINAL_ENTRY_ID.to_string(),
            preview_url: url.clone(),
            thumbnail_url: None,
            label: "Original".to_string(),
            provenance: Provenance::Upload,
            provider_run: None,
            created_at: 0,
            status: UploadStatus::Completed,
        });
    }

    let mut derived: Vec<&PendingImage> = pending.for_slot(slot).collect();
    derived.sort_by_key(|image| image.created_at);
    entries.extend(derived.into_iter().map(|image| EditHistoryEntry {
        id: image.id.clone(),
        preview_url: image.preview_url.clone(),
        thumbnail_url: image
            .remote_result
            .as_ref()
            .and_then(|result| result.thumbnail_url.clone()),
        label: entry_label(image),
        provenance: image.provenance,
        provider_run: image.provider_run.clone(),
        created_at: image.created_at,
        status: image.status,
    }));
    entries
}

fn entry_label(image: &PendingImage) -> String {
    if let Some(run) = image.provider_run.as_ref() {
        return match run.operation.as_deref() {
            Some(operation) if !operation.trim().is_empty() => humanize_operation(operation),
            _ => "AI Edit".to_string(),
        };
    }
    if image.slot.is_existing() {
        "Replacement".to_string()
    } else {
        "Upload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::images::{PendingPayload, PreviewRef};

    fn payload() -> PendingPayload {
        PendingPayload::Local {
            bytes: vec![0; 4],
            mime_type: "image/png".to_string(),
            file_name: "x.png".to_string(),
        }
    }

    fn preview(url: &str) -> PreviewRef {
        PreviewRef {
            url: url.to_string(),
            is_local: true,
        }
    }

    #[test]
    fn existing_slot_starts_with_original() {
        let slot = SlotKey::Existing("https://cdn/a.jpg".to_string());
        let mut set = PendingSet::new();
        set.insert(PendingImage::new(
            slot.clone(),
            payload(),
            preview("file:///crop"),
            Provenance::Cropped,
        ));

        let history = edit_history(&slot, &set);
        let labels: Vec<&str> = history.iter().map(|entry| entry.label.as_str()).collect();
        assert_eq!(labels, vec!["Original", "Replacement"]);
        assert_eq!(history[0].preview_url, "https://cdn/a.jpg");
    }

    #[test]
    fn ai_entries_use_operation_label() {
        let slot = SlotKey::Existing("https://cdn/b.jpg".to_string());
        let mut set = PendingSet::new();
        set.insert(
            PendingImage::new(slot.clone(), payload(), preview("file:///ai"), Provenance::Ai)
                .with_provider_run(ProviderRun {
                    run_id: "run-1".to_string(),
                    operation: Some("remove_bg".to_string()),
                    storage_path: None,
                    mime_type: None,
                }),
        );
        let history = edit_history(&slot, &set);
        assert_eq!(history[1].label, "Remove Background");

        let mut unnamed = PendingSet::new();
        unnamed.insert(
            PendingImage::new(slot.clone(), payload(), preview("file:///ai"), Provenance::Ai)
                .with_provider_run(ProviderRun {
                    run_id: "run-2".to_string(),
                    operation: None,
                    storage_path: None,
                    mime_type: None,
                }),
        );
        assert_eq!(edit_history(&slot, &unnamed)[1].label, "AI Edit");
    }

    #[test]
    fn new_slot_has_no_original_and_is_ordered() {
        let mut set = PendingSet::new();
        let first = PendingImage::new_slot(payload(), preview("file:///1"), Provenance::Upload);
        let slot = first.slot.clone();
        set.insert(first.clone());
        let first_id = first.id.clone();
        set.mark_uploading(&first_id);
        set.mark_failed(&first_id, "offline");
        set.insert(PendingImage::new(
            slot.clone(),
            payload(),
            preview("file:///2"),
            Provenance::Cropped,
        ));

        let history = edit_history(&slot, &set);
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|entry| entry.label == "Upload"));
        assert!(history[0].created_at < history[1].created_at);
        assert_eq!(history[0].status, UploadStatus::Error);
    }
}
