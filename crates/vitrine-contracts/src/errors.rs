use thiserror::Error;

/// Input problems caught before any work starts. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("{file_name} is not a supported image type (png, jpeg, webp, gif)")]
    UnsupportedFileType { file_name: String },

    #[error("{file_name} is {size} bytes; the limit is {max} bytes")]
    FileTooLarge {
        file_name: String,
        size: usize,
        max: usize,
    },

    #[error("crop of {width}x{height}px is below the {min}x{min}px minimum")]
    CropTooSmall { width: u32, height: u32, min: u32 },

    #[error("price must not be negative")]
    NegativePrice,

    #[error("variant {index} needs a size")]
    VariantMissingSize { index: usize },

    #[error("image slot {0} has an upload in flight")]
    EditInFlight(String),

    #[error("unknown image slot {0}")]
    UnknownSlot(String),

    #[error("unknown pending image {0}")]
    UnknownPending(String),

    #[error("unknown edit operation '{0}'")]
    UnknownOperation(String),

    #[error("section {index} needs a heading")]
    SectionMissingHeading { index: usize },
}

impl ValidationError {
    pub fn user_message(&self) -> String {
        match self {
            Self::MissingField(field) => format!("Please fill in the {field}."),
            Self::CropTooSmall { min, .. } => {
                format!("The crop area is too small. Select at least {min}x{min} pixels.")
            }
            Self::EditInFlight(_) => {
                "This image is still uploading. Wait for it to finish before editing again."
                    .to_string()
            }
            other => other.to_string(),
        }
    }
}
