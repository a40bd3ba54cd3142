mod history;
mod pending;

pub use history::{edit_history, EditHistoryEntry, ORIGINAL_ENTRY_ID};
pub use pending::{
    PendingImage, PendingPayload, PendingSet, PreviewRef, Provenance, ProviderRun, RemoteResult,
    SlotKey, UploadStatus,
};
