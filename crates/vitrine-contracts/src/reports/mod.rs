mod summary;

pub use summary::{write_summary, SubmitSummary};
