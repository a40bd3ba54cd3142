//! Uploads pending images and folds the results into a product's image list.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use thiserror::Error;
use vitrine_contracts::events::{now_utc_iso, EventLog};
use vitrine_contracts::images::{PendingPayload, PendingSet, RemoteResult, UploadStatus};
use vitrine_contracts::reports::{write_summary, SubmitSummary};

use crate::backend::{AuthSession, BackendError, ImageBucket, ProductStore, ProgressFn};
use crate::map_object;
use crate::media::{object_path, optimize, thumbnail, thumbnail_path};
use crate::preview::PreviewManager;

pub const DEFAULT_PARALLELISM: usize = 4;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("an upload is already in progress")]
    UploadInFlight,

    #[error("not signed in")]
    NotAuthenticated,

    #[error("saving the image list failed: {0}")]
    Persist(#[source] BackendError),

    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl SubmitError {
    pub fn user_message(&self) -> String {
        match self {
            Self::UploadInFlight => {
                "Uploads are still running. Wait for them to finish before saving again."
                    .to_string()
            }
            Self::NotAuthenticated => "Please sign in as an admin first.".to_string(),
            Self::Persist(err) => format!(
                "Images were uploaded but the product could not be saved: {}",
                err.user_message()
            ),
            Self::Io(err) => format!("Saving failed: {err:#}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedImage {
    pub pending_id: String,
    pub url: String,
    pub replaced: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFailure {
    pub pending_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReport {
    pub product_id: String,
    /// The image list as persisted.
    pub images: Vec<String>,
    pub uploaded: Vec<UploadedImage>,
    pub failures: Vec<UploadFailure>,
    pub aggregate_progress: u8,
    pub removed_objects: Vec<String>,
}

impl SubmitReport {
    pub fn attempted(&self) -> usize {
        self.uploaded.len() + self.failures.len()
    }

    /// e.g. "1 of 2 uploads failed"; `None` when everything landed.
    pub fn failure_summary(&self) -> Option<String> {
        if self.failures.is_empty() {
            return None;
        }
        Some(format!(
            "{} of {} uploads failed",
            self.failures.len(),
            self.attempted()
        ))
    }
}

struct UploadJob {
    id: String,
    bytes: Vec<u8>,
}

enum WorkerMessage {
    Progress { id: String, percent: u8 },
    Done {
        id: String,
        outcome: Result<RemoteResult, String>,
    },
}

pub struct UploadReconciler {
    bucket: Arc<dyn ImageBucket>,
    products: Arc<dyn ProductStore>,
    events: EventLog,
    parallelism: usize,
    summary_path: Option<PathBuf>,
}

impl UploadReconciler {
    pub fn new(
        bucket: Arc<dyn ImageBucket>,
        products: Arc<dyn ProductStore>,
        events: EventLog,
    ) -> Self {
        Self {
            bucket,
            products,
            events,
            parallelism: DEFAULT_PARALLELISM,
            summary_path: None,
        }
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.clamp(1, 16);
        self
    }

    pub fn with_summary_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.summary_path = Some(path.into());
        self
    }

    pub fn products(&self) -> &dyn ProductStore {
        self.products.as_ref()
    }

    pub fn bucket(&self) -> &dyn ImageBucket {
        self.bucket.as_ref()
    }

    /// Uploads every unsettled pending image, splices the successes into
    /// `existing` (minus `removed`) and persists the result once all uploads
    /// have settled. Failed entries stay in `pending` for a retry.
    pub fn submit(
        &self,
        auth: Option<&AuthSession>,
        product_id: &str,
        existing: &[String],
        removed: &[String],
        pending: &mut PendingSet,
        previews: &mut PreviewManager,
    ) -> Result<SubmitReport, SubmitError> {
        let Some(auth) = auth else {
            return Err(SubmitError::NotAuthenticated);
        };
        if pending.any_uploading() {
            return Err(SubmitError::UploadInFlight);
        }

        let started_at = now_utc_iso();
        let base: Vec<String> = existing
            .iter()
            .filter(|url| !removed.contains(url))
            .cloned()
            .collect();
        let batch: Vec<String> = pending.ids();
        self.events.emit(
            "submit_started",
            map_object(json!({
                "product_id": product_id,
                "base": base,
                "pending": batch.len(),
                "removed": removed,
            })),
        )?;

        let mut jobs = Vec::new();
        for id in &batch {
            let Some(image) = pending.get(id) else {
                continue;
            };
            if image.status == UploadStatus::Completed && image.remote_result.is_some() {
                continue;
            }
            match &image.payload {
                PendingPayload::Hosted { url, thumbnail_url } => {
                    let adopted = RemoteResult {
                        public_url: url.clone(),
                        thumbnail_url: thumbnail_url.clone(),
                        path: image
                            .provider_run
                            .as_ref()
                            .and_then(|run| run.storage_path.clone()),
                        width: None,
                        height: None,
                    };
                    pending.mark_completed(id, adopted);
                }
                PendingPayload::Local { bytes, .. } => {
                    jobs.push(UploadJob {
                        id: id.clone(),
                        bytes: bytes.clone(),
                    });
                }
            }
        }

        let mut percents: BTreeMap<String, u8> = batch
            .iter()
            .map(|id| (id.clone(), if jobs.iter().any(|job| &job.id == id) { 0 } else { 100 }))
            .collect();
        for job in &jobs {
            pending.mark_uploading(&job.id);
        }
        let job_ids: Vec<String> = jobs.iter().map(|job| job.id.clone()).collect();
        let mut aggregate = mean_percent(&percents);
        let mut outcomes = self.run_workers(product_id, jobs, pending, &mut percents, &mut aggregate);
        for id in job_ids {
            if !outcomes.iter().any(|(done, _)| done == &id) {
                outcomes.push((id, Err("upload did not finish".to_string())));
            }
        }

        // Every job is settled below; event writes are best-effort so none
        // is left `Uploading`.
        let mut failures = Vec::new();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    self.note(
                        "upload_completed",
                        json!({
                            "pending_id": id,
                            "url": result.public_url,
                            "path": result.path,
                        }),
                    );
                    pending.mark_completed(&id, result);
                }
                Err(reason) => {
                    self.note(
                        "upload_failed",
                        json!({ "pending_id": id, "reason": reason }),
                    );
                    pending.mark_failed(&id, reason.clone());
                    failures.push(UploadFailure {
                        pending_id: id,
                        reason,
                    });
                }
            }
        }

        let mut images = base.clone();
        let mut uploaded = Vec::new();
        for id in &batch {
            let Some(image) = pending.get(id) else {
                continue;
            };
            let Some(result) = image
                .remote_result
                .as_ref()
                .filter(|_| image.status == UploadStatus::Completed)
            else {
                continue;
            };
            let url = result.public_url.clone();
            let replaced = match image
                .replacement_target_key()
                .and_then(|target| images.iter().position(|current| current == target))
            {
                Some(position) => Some(std::mem::replace(&mut images[position], url.clone())),
                None => {
                    images.push(url.clone());
                    None
                }
            };
            uploaded.push(UploadedImage {
                pending_id: id.clone(),
                url,
                replaced,
            });
        }
        let images = dedupe(images);

        if let Err(err) = self.products.update_images(auth, product_id, &images) {
            self.note(
                "persist_failed",
                json!({ "product_id": product_id, "error": err.to_string() }),
            );
            return Err(SubmitError::Persist(err));
        }
        self.note(
            "images_persisted",
            json!({
                "product_id": product_id,
                "images": images,
                "uploaded": uploaded.len(),
                "failed": failures.len(),
            }),
        );

        let mut released = 0usize;
        for image in pending.drain_completed() {
            if previews.release_image(&image)? != crate::preview::ReleaseOutcome::NotOwned {
                released += 1;
            }
        }
        if released > 0 {
            self.note("previews_released", json!({ "count": released }));
        }

        let stale: Vec<&String> = uploaded
            .iter()
            .filter_map(|upload| upload.replaced.as_ref())
            .chain(removed.iter())
            .filter(|url| !images.contains(url))
            .collect();
        let removed_objects = self.cleanup(&stale);

        let report = SubmitReport {
            product_id: product_id.to_string(),
            images,
            uploaded,
            failures,
            aggregate_progress: aggregate,
            removed_objects,
        };
        if let Some(path) = self.summary_path.as_ref() {
            let summary = SubmitSummary {
                session_id: self.events.session_id().to_string(),
                product_id: product_id.to_string(),
                started_at,
                finished_at: now_utc_iso(),
                images: report.images.clone(),
                uploaded: report.uploaded.len() as u64,
                failed: report
                    .failures
                    .iter()
                    .map(|failure| {
                        map_object(json!({
                            "pending_id": failure.pending_id,
                            "reason": failure.reason,
                        }))
                    })
                    .collect(),
            };
            write_summary(path, &summary, None)?;
        }
        Ok(report)
    }

    fn run_workers(
        &self,
        product_id: &str,
        jobs: Vec<UploadJob>,
        pending: &mut PendingSet,
        percents: &mut BTreeMap<String, u8>,
        aggregate: &mut u8,
    ) -> Vec<(String, Result<RemoteResult, String>)> {
        if jobs.is_empty() {
            return Vec::new();
        }
        let workers = self.parallelism.min(jobs.len()).max(1);
        let queue = Mutex::new(jobs.into_iter());
        let bucket = self.bucket.as_ref();
        let (tx, rx) = mpsc::channel::<WorkerMessage>();
        let mut outcomes = Vec::new();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || loop {
                    let next = match queue.lock() {
                        Ok(mut queue) => queue.next(),
                        Err(_) => None,
                    };
                    let Some(job) = next else {
                        break;
                    };
                    let outcome = upload_one(bucket, product_id, &job, &tx);
                    if tx
                        .send(WorkerMessage::Done {
                            id: job.id,
                            outcome,
                        })
                        .is_err()
                    {
                        break;
                    }
                });
            }
            drop(tx);

            for message in rx.iter() {
                match message {
                    WorkerMessage::Progress { id, percent } => {
                        pending.set_progress(&id, percent);
                        percents.insert(id.clone(), percent);
                    }
                    WorkerMessage::Done { id, outcome } => {
                        percents.insert(id.clone(), 100);
                        outcomes.push((id, outcome));
                    }
                }
                let next = mean_percent(percents);
                if next != *aggregate {
                    *aggregate = next;
                    self.note("upload_progress", json!({ "aggregate": next }));
                }
            }
        });
        outcomes
    }

    /// Removes finished uploads that were superseded before any persisted
    /// image list referenced them.
    pub fn discard(&self, urls: &[String]) -> Vec<String> {
        let urls: Vec<&String> = urls.iter().collect();
        self.cleanup(&urls)
    }

    fn note(&self, event_type: &str, payload: Value) {
        let _ = self.events.emit(event_type, map_object(payload));
    }

    fn cleanup(&self, urls: &[&String]) -> Vec<String> {
        let mut paths = Vec::new();
        for url in urls {
            if let Some(path) = self.bucket.path_for_url(url) {
                paths.push(thumbnail_path(&path));
                paths.push(path);
            }
        }
        if paths.is_empty() {
            return paths;
        }
        match self.bucket.remove(&paths) {
            Ok(()) => {
                self.note("storage_cleanup", json!({ "paths": paths }));
                paths
            }
            Err(err) => {
                self.note(
                    "storage_cleanup_failed",
                    json!({ "paths": paths, "error": err.to_string() }),
                );
                Vec::new()
            }
        }
    }
}

fn upload_one(
    bucket: &dyn ImageBucket,
    product_id: &str,
    job: &UploadJob,
    tx: &Sender<WorkerMessage>,
) -> Result<RemoteResult, String> {
    let main = optimize(&job.bytes).map_err(|err| format!("{err:#}"))?;
    let thumb = thumbnail(&job.bytes).map_err(|err| format!("{err:#}"))?;
    let total = (main.bytes.len() + thumb.bytes.len()) as u64;

    let path = object_path(product_id, &job.id, &main.bytes, main.extension);
    let thumb_path = thumbnail_path(&path);
    bucket
        .upload(
            &path,
            &main.bytes,
            main.mime_type,
            progress_sink(tx, &job.id, 0, total),
        )
        .map_err(|err| err.to_string())?;
    if let Err(err) = bucket.upload(
        &thumb_path,
        &thumb.bytes,
        thumb.mime_type,
        progress_sink(tx, &job.id, main.bytes.len() as u64, total),
    ) {
        let _ = bucket.remove(&[path]);
        return Err(err.to_string());
    }

    Ok(RemoteResult {
        public_url: bucket.public_url(&path),
        thumbnail_url: Some(bucket.public_url(&thumb_path)),
        path: Some(path),
        width: Some(main.width),
        height: Some(main.height),
    })
}

fn progress_sink(tx: &Sender<WorkerMessage>, id: &str, offset: u64, total: u64) -> ProgressFn {
    let tx = Mutex::new(tx.clone());
    let id = id.to_string();
    Arc::new(move |sent, _| {
        // 100 is reserved for `Done`.
        let percent = ((offset + sent) * 100 / total.max(1)).min(99) as u8;
        if let Ok(tx) = tx.lock() {
            let _ = tx.send(WorkerMessage::Progress {
                id: id.clone(),
                percent,
            });
        }
    })
}

fn mean_percent(percents: &BTreeMap<String, u8>) -> u8 {
    if percents.is_empty() {
        return 100;
    }
    let sum: u64 = percents.values().map(|value| *value as u64).sum();
    (sum / percents.len() as u64) as u8
}

fn dedupe(images: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(images.len());
    for url in images {
        if !out.contains(&url) {
            out.push(url);
        }
    }
    out
}

/// Summary value handed to callers that log reports as JSON.
pub fn report_json(report: &SubmitReport) -> Value {
    json!({
        "product_id": report.product_id,
        "images": report.images,
        "uploaded": report
            .uploaded
            .iter()
            .map(|upload| json!({
                "pending_id": upload.pending_id,
                "url": upload.url,
                "replaced": upload.replaced,
            }))
            .collect::<Vec<Value>>(),
        "failed": report
            .failures
            .iter()
            .map(|failure| json!({ "pending_id": failure.pending_id, "reason": failure.reason }))
            .collect::<Vec<Value>>(),
        "failure_summary": report.failure_summary(),
    })
}
