mod options;
pub mod receipts;
mod registry;

pub use options::{EditOptions, EditTuning, MAX_REFERENCE_IMAGES};
pub use registry::{
    humanize_operation, EditCategory, EditOperationSpec, EditRegistry, EditSelection,
    FALLBACK_OPERATION, GENERIC_PROMPT,
};
