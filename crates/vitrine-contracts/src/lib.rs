pub mod content;
pub mod edits;
pub mod errors;
pub mod events;
pub mod images;
pub mod product;
pub mod reports;
pub mod session;
