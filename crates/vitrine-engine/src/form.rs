//! Product form state: fields, persisted images and the pending edit set.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::json;
use thiserror::Error;
use uuid::Uuid;
use vitrine_contracts::edits::{EditOptions, EditRegistry};
use vitrine_contracts::errors::ValidationError;
use vitrine_contracts::events::EventLog;
use vitrine_contracts::images::{
    edit_history, EditHistoryEntry, PendingImage, PendingPayload, PendingSet, Provenance,
    ProviderRun, SlotKey, UploadStatus,
};
use vitrine_contracts::product::{Product, ProductFields};

use crate::ai_edit::{run_edit, EditError, EditImage, EditOutcome, EditRequest, EditTransport};
use crate::backend::{fields_to_map, AuthSession, BackendError, ImageFetcher};
use crate::crop::{crop_image, CropError, CropRect, LocalImage};
use crate::map_object;
use crate::media::{extension_for_mime, validate_upload};
use crate::preview::PreviewManager;
use crate::reconcile::{SubmitError, SubmitReport, UploadReconciler};

/// Smallest crop, in pixels per side, accepted as a product image.
pub const MIN_CROP_DIMENSION: u32 = 100;

#[derive(Debug, Error)]
pub enum FormError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Crop(#[from] CropError),

    #[error(transparent)]
    Edit(#[from] EditError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl FormError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(err) => err.user_message(),
            Self::Crop(err) => err.user_message(),
            Self::Edit(err) => err.user_message(),
            Self::Backend(err) => err.user_message(),
            Self::Submit(err) => err.user_message(),
            Self::Io(err) => format!("{err:#}"),
        }
    }
}

/// Handed out when an AI edit starts; its result is applied only while the
/// ticket's generation is still current for the slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditTicket {
    pub slot: SlotKey,
    pub generation: u64,
    pub operation: String,
}

pub struct ProductForm {
    pub fields: ProductFields,
    product_id: Option<String>,
    existing: Vec<String>,
    removed: Vec<String>,
    pending: PendingSet,
    previews: PreviewManager,
    events: EventLog,
    edits: EditRegistry,
    generations: BTreeMap<SlotKey, u64>,
    /// Uploaded objects retired before any saved image list referenced them.
    unpersisted: Vec<String>,
    receipts_dir: Option<PathBuf>,
    min_crop: u32,
}

impl ProductForm {
    /// Blank form for a product that does not exist yet.
    pub fn new(previews: PreviewManager, events: EventLog) -> Self {
        Self {
            fields: ProductFields::default(),
            product_id: None,
            existing: Vec::new(),
            removed: Vec::new(),
            pending: PendingSet::new(),
            previews,
            events,
            edits: EditRegistry::default(),
            generations: BTreeMap::new(),
            unpersisted: Vec::new(),
            receipts_dir: None,
            min_crop: MIN_CROP_DIMENSION,
        }
    }

    pub fn for_product(product: Product, previews: PreviewManager, events: EventLog) -> Self {
        let mut form = Self::new(previews, events);
        form.product_id = Some(product.id);
        form.fields = product.fields;
        form.existing = product.images;
        form
    }

    pub fn with_receipts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.receipts_dir = Some(dir.into());
        self
    }

    pub fn with_min_crop(mut self, min_side: u32) -> Self {
        self.min_crop = min_side.max(1);
        self
    }

    pub fn with_edit_registry(mut self, registry: EditRegistry) -> Self {
        self.edits = registry;
        self
    }

    pub fn product_id(&self) -> Option<&str> {
        self.product_id.as_deref()
    }

    /// Persisted images still on the product, in display order.
    pub fn existing(&self) -> Vec<String> {
        self.existing
            .iter()
            .filter(|url| !self.removed.contains(url))
            .cloned()
            .collect()
    }

    pub fn removed(&self) -> &[String] {
        &self.removed
    }

    pub fn pending(&self) -> &PendingSet {
        &self.pending
    }

    pub fn previews(&self) -> &PreviewManager {
        &self.previews
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn edit_registry(&self) -> &EditRegistry {
        &self.edits
    }

    /// Existing images first, then slots for new images.
    pub fn slots(&self) -> Vec<SlotKey> {
        let mut slots: Vec<SlotKey> = self.existing().into_iter().map(SlotKey::Existing).collect();
        slots.extend(
            self.pending
                .slots()
                .into_iter()
                .filter(|slot| !slot.is_existing()),
        );
        slots
    }

    pub fn slot_at(&self, index: usize) -> Result<SlotKey, FormError> {
        self.slots()
            .into_iter()
            .nth(index)
            .ok_or_else(|| ValidationError::UnknownSlot(format!("#{index}")).into())
    }

    /// What the slot currently shows: its newest pending preview, or the
    /// persisted URL.
    pub fn display_url(&self, slot: &SlotKey) -> Option<String> {
        if let Some(latest) = self.latest_for_slot(slot) {
            return Some(latest.preview_url.clone());
        }
        slot.replacement_target().map(str::to_string)
    }

    /// Pins the slot's preview while it is on screen.
    pub fn select(&mut self, slot: Option<&SlotKey>) -> Result<(), FormError> {
        match slot.and_then(|slot| self.display_url(slot)) {
            Some(url) => self.previews.pin(&url)?,
            None => self.previews.unpin()?,
        }
        Ok(())
    }

    pub fn add_image(&mut self, file_name: &str, bytes: Vec<u8>) -> Result<String, FormError> {
        let mime_type = validate_upload(file_name, &bytes)?;
        let preview = self.previews.allocate(&bytes, mime_type)?;
        let image = PendingImage::new_slot(
            PendingPayload::Local {
                bytes,
                mime_type: mime_type.to_string(),
                file_name: file_name.to_string(),
            },
            preview,
            Provenance::Upload,
        );
        let id = image.id.clone();
        let slot = image.slot.clone();
        self.stage(image)?;
        self.events.emit(
            "image_added",
            map_object(json!({
                "pending_id": id,
                "slot": slot.to_string(),
                "file_name": file_name,
                "mime_type": mime_type,
            })),
        )?;
        Ok(id)
    }

    /// Drops a persisted image, along with any edits staged against it.
    pub fn remove_existing(&mut self, url: &str) -> Result<(), FormError> {
        let slot = SlotKey::Existing(url.to_string());
        self.ensure_editable(&slot)?;
        let staged: Vec<String> = self.pending.for_slot(&slot).map(|image| image.id.clone()).collect();
        for id in &staged {
            if let Some(image) = self.pending.remove(id) {
                self.previews.release_image(&image)?;
            }
        }
        self.bump_generation(&slot);
        self.removed.push(url.to_string());
        self.events.emit(
            "image_removed",
            map_object(json!({ "url": url, "discarded_pending": staged })),
        )?;
        Ok(())
    }

    pub fn discard_pending(&mut self, pending_id: &str) -> Result<(), FormError> {
        let Some(image) = self.pending.get(pending_id) else {
            return Err(ValidationError::UnknownPending(pending_id.to_string()).into());
        };
        if image.status == UploadStatus::Uploading {
            return Err(ValidationError::EditInFlight(image.slot.to_string()).into());
        }
        let slot = image.slot.clone();
        if let Some(image) = self.pending.remove(pending_id) {
            self.previews.release_image(&image)?;
        }
        self.bump_generation(&slot);
        self.events.emit(
            "pending_discarded",
            map_object(json!({ "pending_id": pending_id, "slot": slot.to_string() })),
        )?;
        Ok(())
    }

    pub fn crop_slot(
        &mut self,
        slot: &SlotKey,
        rect: &CropRect,
        fetcher: &dyn ImageFetcher,
    ) -> Result<String, FormError> {
        self.ensure_editable(slot)?;
        let source = LocalImage::decode(self.source_bytes(slot, fetcher)?)?;
        let output = crop_image(&source, rect)?;
        if output.width < self.min_crop || output.height < self.min_crop {
            return Err(ValidationError::CropTooSmall {
                width: output.width,
                height: output.height,
                min: self.min_crop,
            }
            .into());
        }

        let preview = self.previews.allocate(&output.bytes, output.mime_type)?;
        let image = PendingImage::new(
            slot.clone(),
            PendingPayload::Local {
                bytes: output.bytes,
                mime_type: output.mime_type.to_string(),
                file_name: format!("crop.{}", extension_for_mime(output.mime_type)),
            },
            preview,
            Provenance::Cropped,
        );
        let id = image.id.clone();
        self.bump_generation(slot);
        self.stage(image)?;
        self.events.emit(
            "image_cropped",
            map_object(json!({
                "pending_id": id,
                "slot": slot.to_string(),
                "width": output.width,
                "height": output.height,
                "source": output.source,
            })),
        )?;
        Ok(id)
    }

    pub fn begin_ai_edit(&mut self, slot: &SlotKey, operation: &str) -> Result<EditTicket, FormError> {
        self.ensure_editable(slot)?;
        let operation = operation.trim().to_ascii_lowercase();
        if self.edits.get(&operation).is_none() {
            return Err(ValidationError::UnknownOperation(operation).into());
        }
        let generation = self.bump_generation(slot);
        self.events.emit(
            "ai_edit_started",
            map_object(json!({
                "slot": slot.to_string(),
                "operation": operation,
                "generation": generation,
            })),
        )?;
        Ok(EditTicket {
            slot: slot.clone(),
            generation,
            operation,
        })
    }

    /// Applies an AI edit result. Returns the new pending id, or `None` when
    /// the ticket went stale while the edit was running.
    pub fn complete_ai_edit(
        &mut self,
        ticket: &EditTicket,
        result: Result<EditOutcome, EditError>,
    ) -> Result<Option<String>, FormError> {
        let current = self.generations.get(&ticket.slot).copied().unwrap_or(0);
        if current != ticket.generation || !self.slot_known(&ticket.slot) {
            self.events.emit(
                "ai_edit_discarded",
                map_object(json!({
                    "slot": ticket.slot.to_string(),
                    "operation": ticket.operation,
                    "generation": ticket.generation,
                    "current_generation": current,
                })),
            )?;
            return Ok(None);
        }

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.events.emit(
                    "ai_edit_failed",
                    map_object(json!({
                        "slot": ticket.slot.to_string(),
                        "operation": ticket.operation,
                        "kind": err.kind(),
                        "error": err.to_string(),
                    })),
                )?;
                return Err(err.into());
            }
        };

        let image = match outcome {
            EditOutcome::Image { bytes, mime_type } => {
                let preview = self.previews.allocate(&bytes, &mime_type)?;
                PendingImage::new(
                    ticket.slot.clone(),
                    PendingPayload::Local {
                        file_name: format!(
                            "ai-{}.{}",
                            ticket.operation,
                            extension_for_mime(&mime_type)
                        ),
                        bytes,
                        mime_type: mime_type.clone(),
                    },
                    preview,
                    Provenance::Ai,
                )
                .with_provider_run(ProviderRun {
                    run_id: Uuid::new_v4().to_string(),
                    operation: Some(ticket.operation.clone()),
                    storage_path: None,
                    mime_type: Some(mime_type),
                })
            }
            EditOutcome::Stored(stored) => PendingImage::new(
                ticket.slot.clone(),
                PendingPayload::Hosted {
                    url: stored.public_url.clone(),
                    thumbnail_url: stored.thumbnail_url.clone(),
                },
                PreviewManager::remote(stored.public_url.clone()),
                Provenance::Ai,
            )
            .with_provider_run(ProviderRun {
                run_id: stored
                    .run_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                operation: Some(ticket.operation.clone()),
                storage_path: stored.storage_path,
                mime_type: stored.mime_type,
            }),
        };
        let id = image.id.clone();
        self.stage(image)?;
        self.events.emit(
            "ai_edit_applied",
            map_object(json!({
                "pending_id": id,
                "slot": ticket.slot.to_string(),
                "operation": ticket.operation,
            })),
        )?;
        Ok(Some(id))
    }

    /// Runs one AI edit on `slot` through `transport`, end to end.
    pub fn run_ai_edit(
        &mut self,
        transport: &dyn EditTransport,
        fetcher: &dyn ImageFetcher,
        slot: &SlotKey,
        operation: &str,
        references: Vec<EditImage>,
        options: EditOptions,
    ) -> Result<Option<String>, FormError> {
        let ticket = self.begin_ai_edit(slot, operation)?;
        let source = match self.source_bytes(slot, fetcher) {
            Ok(bytes) => EditImage::new(bytes),
            Err(err) => {
                self.bump_generation(slot);
                return Err(err);
            }
        };
        let mut request = EditRequest::new(source, ticket.operation.clone());
        request.references = references;
        request.options = options;
        let run = run_edit(
            transport,
            &self.edits,
            &request,
            self.receipts_dir.as_deref(),
            Some(slot.to_string().as_str()),
        )?;
        for warning in &run.warnings {
            self.events.emit(
                "ai_edit_warning",
                map_object(json!({ "slot": slot.to_string(), "warning": warning })),
            )?;
        }
        self.complete_ai_edit(&ticket, run.result)
    }

    pub fn history(&self, slot: &SlotKey) -> Vec<EditHistoryEntry> {
        edit_history(slot, &self.pending)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.fields.validate()
    }

    /// Saves fields, then uploads and reconciles images. New products are
    /// created first and reconciled against an empty image list.
    pub fn submit(
        &mut self,
        auth: Option<&AuthSession>,
        reconciler: &UploadReconciler,
    ) -> Result<SubmitReport, FormError> {
        let Some(auth) = auth else {
            return Err(SubmitError::NotAuthenticated.into());
        };
        self.validate()?;
        if self.pending.any_uploading() {
            return Err(SubmitError::UploadInFlight.into());
        }

        let product_id = match self.product_id.clone() {
            Some(id) => {
                reconciler
                    .products()
                    .update_product(auth, &id, &fields_to_map(&self.fields))?;
                id
            }
            None => {
                let created = reconciler.products().create_product(auth, &self.fields)?;
                self.events.emit(
                    "product_created",
                    map_object(json!({ "product_id": created.id })),
                )?;
                self.product_id = Some(created.id.clone());
                created.id
            }
        };

        let existing = self.existing.clone();
        let mut report = reconciler.submit(
            Some(auth),
            &product_id,
            &existing,
            &self.removed,
            &mut self.pending,
            &mut self.previews,
        )?;

        let orphans: Vec<String> = std::mem::take(&mut self.unpersisted)
            .into_iter()
            .filter(|url| !report.images.contains(url))
            .collect();
        if !orphans.is_empty() {
            report.removed_objects.extend(reconciler.discard(&orphans));
        }

        self.existing = report.images.clone();
        self.removed.clear();
        let live = self.slots();
        self.generations.retain(|slot, _| live.contains(slot));
        self.events.emit(
            "form_submitted",
            map_object(json!({
                "product_id": product_id,
                "images": report.images,
                "failure_summary": report.failure_summary(),
            })),
        )?;
        Ok(report)
    }

    /// Releases every local preview; the form is unusable afterwards.
    pub fn teardown(&mut self) -> Result<usize, FormError> {
        Ok(self.previews.teardown()?)
    }

    fn slot_known(&self, slot: &SlotKey) -> bool {
        match slot {
            SlotKey::Existing(url) => self.existing.contains(url) && !self.removed.contains(url),
            SlotKey::New(_) => self.pending.for_slot(slot).next().is_some(),
        }
    }

    fn ensure_editable(&self, slot: &SlotKey) -> Result<(), FormError> {
        if !self.slot_known(slot) {
            return Err(ValidationError::UnknownSlot(slot.to_string()).into());
        }
        if self
            .pending
            .for_slot(slot)
            .any(|image| image.status == UploadStatus::Uploading)
        {
            return Err(ValidationError::EditInFlight(slot.to_string()).into());
        }
        Ok(())
    }

    fn bump_generation(&mut self, slot: &SlotKey) -> u64 {
        let generation = self.generations.entry(slot.clone()).or_insert(0);
        *generation += 1;
        *generation
    }

    fn latest_for_slot(&self, slot: &SlotKey) -> Option<&PendingImage> {
        self.pending
            .for_slot(slot)
            .max_by_key(|image| image.created_at)
    }

    fn source_bytes(&self, slot: &SlotKey, fetcher: &dyn ImageFetcher) -> Result<Vec<u8>, FormError> {
        match self.latest_for_slot(slot).map(|image| &image.payload) {
            Some(PendingPayload::Local { bytes, .. }) => Ok(bytes.clone()),
            Some(PendingPayload::Hosted { url, .. }) => Ok(fetcher.fetch(url)?),
            None => match slot.replacement_target() {
                Some(url) => Ok(fetcher.fetch(url)?),
                None => Err(ValidationError::UnknownSlot(slot.to_string()).into()),
            },
        }
    }

    /// Inserts `image`, retiring whatever it supersedes on the same slot.
    ///
    /// Settled entries for the slot are retired as well. Uploaded ones are
    /// queued for removal after the next successful submit.
    fn stage(&mut self, image: PendingImage) -> Result<(), FormError> {
        let settled: Vec<String> = self
            .pending
            .for_slot(&image.slot)
            .filter(|existing| {
                matches!(existing.status, UploadStatus::Error | UploadStatus::Completed)
            })
            .map(|existing| existing.id.clone())
            .collect();
        for id in settled {
            let Some(old) = self.pending.remove(&id) else {
                continue;
            };
            self.previews.release_image(&old)?;
            if old.status == UploadStatus::Completed {
                if let Some(result) = old.remote_result.as_ref() {
                    self.unpersisted.push(result.public_url.clone());
                }
                self.events.emit(
                    "pending_superseded",
                    map_object(json!({
                        "pending_id": old.id,
                        "slot": old.slot.to_string(),
                        "uploaded": true,
                    })),
                )?;
            }
        }
        if let Some(displaced) = self.pending.insert(image) {
            self.previews.release_image(&displaced)?;
            self.events.emit(
                "pending_superseded",
                map_object(json!({
                    "pending_id": displaced.id,
                    "slot": displaced.slot.to_string(),
                })),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use vitrine_contracts::images::ORIGINAL_ENTRY_ID;

    use super::*;
    use crate::ai_edit::{LocalEditor, StoredEdit};
    use crate::backend::{ImageBucket, MemoryBackend};
    use crate::media::fixtures::png;
    use crate::media::MAX_UPLOAD_BYTES;

    struct Fixture {
        temp: tempfile::TempDir,
        backend: Arc<MemoryBackend>,
        form: ProductForm,
        auth: AuthSession,
    }

    fn fixture(existing: &[&str]) -> anyhow::Result<Fixture> {
        let temp = tempfile::tempdir()?;
        let backend = Arc::new(MemoryBackend::new());
        let images: Vec<String> = existing
            .iter()
            .map(|name| backend.public_url(&format!("products/p-1/{name}")))
            .collect();
        for url in &images {
            backend.seed_remote(url.clone(), png(400, 300));
        }
        let product = Product {
            id: "p-1".to_string(),
            fields: ProductFields {
                name: "Wool coat".to_string(),
                price_cents: 18900,
                ..ProductFields::default()
            },
            images,
        };
        backend.insert_product(product.clone());
        let previews = PreviewManager::new(temp.path().join("previews"))?;
        let form = if existing.is_empty() {
            let mut form = ProductForm::new(previews, EventLog::in_memory("form"));
            form.fields = product.fields.clone();
            form
        } else {
            ProductForm::for_product(product, previews, EventLog::in_memory("form"))
        };
        let form = form.with_receipts_dir(temp.path().join("receipts"));
        Ok(Fixture {
            temp,
            backend,
            form,
            auth: AuthSession::new("admin").ok_or_else(|| anyhow::anyhow!("auth"))?,
        })
    }

    fn reconciler(fx: &Fixture) -> UploadReconciler {
        UploadReconciler::new(fx.backend.clone(), fx.backend.clone(), fx.form.events().clone())
    }

    #[test]
    fn add_image_checks_magic_bytes_and_size() -> anyhow::Result<()> {
        let mut fx = fixture(&[])?;
        assert!(matches!(
            fx.form.add_image("notes.png", b"plain text".to_vec()),
            Err(FormError::Validation(ValidationError::UnsupportedFileType { .. }))
        ));
        assert!(matches!(
            fx.form.add_image("huge.png", vec![0u8; MAX_UPLOAD_BYTES + 1]),
            Err(FormError::Validation(ValidationError::FileTooLarge { .. }))
        ));
        let id = fx.form.add_image("front.png", png(200, 200))?;
        assert_eq!(fx.form.pending().len(), 1);
        assert_eq!(fx.form.slots(), vec![SlotKey::New(id)]);
        assert_eq!(fx.form.previews().live_count(), 1);
        Ok(())
    }

    #[test]
    fn recropping_supersedes_and_releases_previous_preview_once() -> anyhow::Result<()> {
        let mut fx = fixture(&["a.jpg"])?;
        let slot = fx.form.slot_at(0)?;
        let first = fx.form.crop_slot(&slot, &CropRect::new(0.0, 0.0, 50.0, 50.0), fx.backend.as_ref())?;
        let second = fx.form.crop_slot(&slot, &CropRect::new(10.0, 10.0, 80.0, 80.0), fx.backend.as_ref())?;

        assert_ne!(first, second);
        assert_eq!(fx.form.pending().len(), 1);
        assert_eq!(fx.form.pending().count_active_for_target(&fx.form.existing()[0]), 1);
        assert_eq!(fx.form.previews().released_count(), 1);
        assert_eq!(fx.form.previews().live_count(), 1);
        assert!(fx.form.events().recorded_types().contains(&"pending_superseded".to_string()));
        Ok(())
    }

    #[test]
    fn re_editing_after_failed_image_save_keeps_one_image_per_slot() -> anyhow::Result<()> {
        let mut fx = fixture(&["a.jpg", "b.jpg"])?;
        let (a, b) = (fx.form.existing()[0].clone(), fx.form.existing()[1].clone());
        let slot = fx.form.slot_at(0)?;
        let uploads = reconciler(&fx);

        fx.form.crop_slot(&slot, &CropRect::new(0.0, 0.0, 50.0, 50.0), fx.backend.as_ref())?;
        fx.backend.fail_image_persist(true);
        let err = fx.form.submit(Some(&fx.auth), &uploads).err();
        assert!(matches!(err, Some(FormError::Submit(SubmitError::Persist(_)))));
        let first_upload = fx
            .backend
            .uploads()
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no upload"))?;
        assert_eq!(fx.form.existing(), vec![a.clone(), b.clone()]);

        fx.form.crop_slot(&slot, &CropRect::new(10.0, 10.0, 80.0, 80.0), fx.backend.as_ref())?;
        assert_eq!(fx.form.pending().len(), 1);

        fx.backend.fail_image_persist(false);
        let report = fx.form.submit(Some(&fx.auth), &uploads)?;
        assert_eq!(report.images.len(), 2);
        assert_ne!(report.images[0], a);
        assert_eq!(report.images[1], b);
        assert!(report.removed_objects.contains(&first_upload));
        assert!(fx.backend.object(&first_upload).is_none());
        assert_eq!(
            fx.backend.product("p-1").map(|product| product.images),
            Some(report.images.clone())
        );
        assert!(fx.form.pending().is_empty());
        Ok(())
    }

    #[test]
    fn crops_below_minimum_are_rejected() -> anyhow::Result<()> {
        let mut fx = fixture(&["a.jpg"])?;
        let slot = fx.form.slot_at(0)?;
        let err = fx
            .form
            .crop_slot(&slot, &CropRect::new(0.0, 0.0, 20.0, 50.0), fx.backend.as_ref())
            .err();
        assert!(matches!(
            err,
            Some(FormError::Validation(ValidationError::CropTooSmall { width: 80, height: 150, min: 100 }))
        ));
        assert!(fx.form.pending().is_empty());

        let mut form = fx.form.with_min_crop(50);
        let id = form.crop_slot(&slot, &CropRect::new(0.0, 0.0, 20.0, 50.0), fx.backend.as_ref())?;
        assert_eq!(form.pending().len(), 1);
        assert!(form.pending().get(&id).is_some());
        Ok(())
    }

    #[test]
    fn failed_ai_edit_leaves_pending_set_untouched() -> anyhow::Result<()> {
        let mut fx = fixture(&["a.jpg"])?;
        let slot = fx.form.slot_at(0)?;
        fx.form.crop_slot(&slot, &CropRect::full(), fx.backend.as_ref())?;
        let before = fx.form.pending().ids();
        let live = fx.form.previews().live_count();

        let ticket = fx.form.begin_ai_edit(&slot, "remove_bg")?;
        let result = fx.form.complete_ai_edit(
            &ticket,
            Err(EditError::NoImageReturned {
                text: "I can only describe this image.".to_string(),
            }),
        );
        assert!(matches!(result, Err(FormError::Edit(EditError::NoImageReturned { .. }))));
        assert_eq!(fx.form.pending().ids(), before);
        assert_eq!(fx.form.previews().live_count(), live);
        Ok(())
    }

    #[test]
    fn stale_ai_results_are_discarded() -> anyhow::Result<()> {
        let mut fx = fixture(&["a.jpg"])?;
        let slot = fx.form.slot_at(0)?;
        let stale = fx.form.begin_ai_edit(&slot, "enhance")?;
        fx.form.crop_slot(&slot, &CropRect::full(), fx.backend.as_ref())?;

        let applied = fx.form.complete_ai_edit(
            &stale,
            Ok(EditOutcome::Image {
                bytes: png(400, 300),
                mime_type: "image/png".to_string(),
            }),
        )?;
        assert_eq!(applied, None);
        assert_eq!(fx.form.pending().len(), 1);
        assert_eq!(
            fx.form.pending().iter().next().map(|image| image.provenance),
            Some(Provenance::Cropped)
        );
        assert!(fx.form.events().recorded_types().contains(&"ai_edit_discarded".to_string()));
        Ok(())
    }

    #[test]
    fn stored_ai_results_keep_remote_preview() -> anyhow::Result<()> {
        let mut fx = fixture(&["a.jpg"])?;
        let slot = fx.form.slot_at(0)?;
        let ticket = fx.form.begin_ai_edit(&slot, "replace_bg_studio")?;
        let id = fx
            .form
            .complete_ai_edit(
                &ticket,
                Ok(EditOutcome::Stored(StoredEdit {
                    public_url: "https://edits.example/run-7.png".to_string(),
                    thumbnail_url: None,
                    run_id: Some("run-7".to_string()),
                    storage_path: Some("edits/run-7.png".to_string()),
                    mime_type: Some("image/png".to_string()),
                })),
            )?
            .ok_or_else(|| anyhow::anyhow!("edit was discarded"))?;

        let image = fx.form.pending().get(&id).cloned().ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert!(!image.preview_is_local);
        assert_eq!(fx.form.previews().live_count(), 0);
        let history = fx.form.history(&slot);
        assert_eq!(history[0].id, ORIGINAL_ENTRY_ID);
        assert_eq!(history[1].label, "Studio Background");
        Ok(())
    }

    #[test]
    fn edits_are_refused_while_slot_is_uploading() -> anyhow::Result<()> {
        let mut fx = fixture(&["a.jpg"])?;
        let slot = fx.form.slot_at(0)?;
        let id = fx.form.crop_slot(&slot, &CropRect::full(), fx.backend.as_ref())?;
        fx.form.pending.mark_uploading(&id);

        assert!(matches!(
            fx.form.begin_ai_edit(&slot, "enhance"),
            Err(FormError::Validation(ValidationError::EditInFlight(_)))
        ));
        assert!(matches!(
            fx.form.discard_pending(&id),
            Err(FormError::Validation(ValidationError::EditInFlight(_)))
        ));
        let uploads = reconciler(&fx);
        assert!(matches!(
            fx.form.submit(Some(&fx.auth), &uploads),
            Err(FormError::Submit(SubmitError::UploadInFlight))
        ));
        Ok(())
    }

    #[test]
    fn unknown_operations_and_slots_are_rejected() -> anyhow::Result<()> {
        let mut fx = fixture(&["a.jpg"])?;
        let slot = fx.form.slot_at(0)?;
        assert!(matches!(
            fx.form.begin_ai_edit(&slot, "teleport"),
            Err(FormError::Validation(ValidationError::UnknownOperation(_)))
        ));
        assert!(matches!(fx.form.slot_at(5), Err(FormError::Validation(ValidationError::UnknownSlot(_)))));
        assert!(matches!(
            fx.form.discard_pending("nope"),
            Err(FormError::Validation(ValidationError::UnknownPending(_)))
        ));
        Ok(())
    }

    #[test]
    fn local_ai_edit_runs_end_to_end_with_receipt() -> anyhow::Result<()> {
        let mut fx = fixture(&[])?;
        let first = fx.form.add_image("tee.png", png(300, 200))?;
        let slot = SlotKey::New(first);
        let edited = fx
            .form
            .run_ai_edit(
                &LocalEditor::new(),
                fx.backend.as_ref(),
                &slot,
                "rotate_right",
                Vec::new(),
                EditOptions::default(),
            )?
            .ok_or_else(|| anyhow::anyhow!("edit was discarded"))?;

        let image = fx.form.pending().get(&edited).cloned().ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(image.provenance, Provenance::Ai);
        assert_eq!(image.slot, slot);
        assert_eq!(fx.form.pending().len(), 1);
        assert_eq!(fx.form.previews().released_count(), 1);
        assert_eq!(std::fs::read_dir(fx.temp.path().join("receipts"))?.count(), 1);
        Ok(())
    }

    #[test]
    fn submit_creates_new_product_then_uploads() -> anyhow::Result<()> {
        let mut fx = fixture(&[])?;
        fx.form.add_image("front.png", png(200, 200))?;
        fx.form.add_image("back.png", png(220, 200))?;
        let uploads = reconciler(&fx);
        let report = fx.form.submit(Some(&fx.auth), &uploads)?;

        let product_id = fx.form.product_id().map(str::to_string).unwrap_or_default();
        assert!(product_id.starts_with("prod-"));
        assert_eq!(report.images.len(), 2);
        assert_eq!(fx.form.existing(), report.images);
        assert!(fx.form.pending().is_empty());
        assert_eq!(fx.backend.product(&product_id).map(|row| row.images), Some(report.images));
        Ok(())
    }

    #[test]
    fn submit_requires_session_and_valid_fields() -> anyhow::Result<()> {
        let mut fx = fixture(&[])?;
        fx.form.add_image("front.png", png(200, 200))?;
        let uploads = reconciler(&fx);
        assert!(matches!(
            fx.form.submit(None, &uploads),
            Err(FormError::Submit(SubmitError::NotAuthenticated))
        ));
        fx.form.fields.name.clear();
        assert!(matches!(
            fx.form.submit(Some(&fx.auth), &uploads),
            Err(FormError::Validation(ValidationError::MissingField(_)))
        ));
        assert!(fx.backend.uploads().is_empty());
        Ok(())
    }

    #[test]
    fn removing_an_image_discards_its_edits_and_persists_without_it() -> anyhow::Result<()> {
        let mut fx = fixture(&["a.jpg", "b.jpg"])?;
        let slot = fx.form.slot_at(0)?;
        fx.form.crop_slot(&slot, &CropRect::full(), fx.backend.as_ref())?;
        let removed = fx.form.existing()[0].clone();
        fx.form.remove_existing(&removed)?;
        assert!(fx.form.pending().is_empty());
        assert_eq!(fx.form.slots().len(), 1);

        let uploads = reconciler(&fx);
        let report = fx.form.submit(Some(&fx.auth), &uploads)?;
        assert_eq!(report.images.len(), 1);
        assert!(!report.images.contains(&removed));
        assert!(fx.form.removed().is_empty());
        Ok(())
    }
}
