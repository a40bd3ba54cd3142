pub mod ai_edit;
pub mod backend;
pub mod config;
pub mod content;
pub mod crop;
pub mod form;
pub mod media;
pub mod preview;
pub mod reconcile;

use serde_json::{Map, Value};

pub use ai_edit::{
    run_edit, EditError, EditImage, EditOutcome, EditRequest, EditRun, EditTransport, EditWire,
    EditorRegistry, LocalEditor, ProxyEditor, StoredEdit,
};
pub use backend::{
    AuthSession, BackendError, ContentStore, HttpBackend, ImageBucket, ImageFetcher,
    MemoryBackend, ProductStore,
};
pub use config::VitrineConfig;
pub use content::ContentService;
pub use crop::{crop_image, CropError, CropOutput, CropRect, LocalImage, PixelRect};
pub use form::{EditTicket, FormError, ProductForm, MIN_CROP_DIMENSION};
pub use preview::{PreviewManager, ReleaseOutcome};
pub use reconcile::{
    report_json, SubmitError, SubmitReport, UploadFailure, UploadReconciler, UploadedImage,
};

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() || parts.last().map(|last| last == trimmed).unwrap_or(false) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use anyhow::Context;

    use super::{error_chain_text, truncate_text};

    #[test]
    fn truncate_text_appends_ellipsis() {
        assert_eq!(truncate_text("abcdef", 3), "abc…");
        assert_eq!(truncate_text("abc", 3), "abc");
    }

    #[test]
    fn error_chain_text_joins_causes() {
        let err = Err::<(), _>(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
            .context("write preview")
            .err();
        let text = err
            .map(|err| error_chain_text(&err, 200))
            .unwrap_or_default();
        assert_eq!(text, "write preview | caused by: disk full");
    }
}
