//! Hosted backend collaborators: image bucket, product table, CMS content.

mod http;
mod memory;

use std::sync::Arc;

use serde_json::{json, Map, Value};
use thiserror::Error;
use vitrine_contracts::content::{ContentVersion, PageType};
use vitrine_contracts::product::{Product, ProductFields};

pub use http::HttpBackend;
pub use memory::MemoryBackend;

/// Upload progress sink: `(bytes_sent, bytes_total)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("not signed in")]
    NotAuthenticated,

    #[error("{operation} failed: network error: {message}")]
    Transport { operation: String, message: String },

    #[error("{operation} failed ({status}): {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
    },

    #[error("{operation} returned an unexpected payload: {message}")]
    UnexpectedShape { operation: String, message: String },

    #[error("{0} not found")]
    NotFound(String),
}

impl BackendError {
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::NotAuthenticated => "Please sign in as an admin first.".to_string(),
            Self::Transport { .. } => {
                "Could not reach the server. Check your connection and try again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Proof of a signed-in admin session; writes require one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    access_token: String,
}

impl AuthSession {
    pub fn new(access_token: &str) -> Option<Self> {
        let trimmed = access_token.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self {
            access_token: trimmed.to_string(),
        })
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }
}

pub trait ImageBucket: Send + Sync {
    fn name(&self) -> &str;

    /// Writes (or overwrites) one object.
    fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
        progress: ProgressFn,
    ) -> Result<(), BackendError>;

    fn public_url(&self, path: &str) -> String;

    fn remove(&self, paths: &[String]) -> Result<(), BackendError>;

    fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError>;

    fn list_buckets(&self) -> Result<Vec<String>, BackendError>;

    /// Object path behind one of this bucket's public URLs.
    fn path_for_url(&self, url: &str) -> Option<String> {
        let prefix = self.public_url("");
        url.strip_prefix(prefix.as_str())
            .filter(|path| !path.is_empty())
            .map(str::to_string)
    }
}

pub trait ProductStore: Send + Sync {
    fn create_product(
        &self,
        auth: &AuthSession,
        fields: &ProductFields,
    ) -> Result<Product, BackendError>;

    fn update_product(
        &self,
        auth: &AuthSession,
        id: &str,
        partial: &Map<String, Value>,
    ) -> Result<Product, BackendError>;

    fn get_product(&self, id: &str) -> Result<Product, BackendError>;

    fn update_images(
        &self,
        auth: &AuthSession,
        id: &str,
        images: &[String],
    ) -> Result<Product, BackendError> {
        let mut partial = Map::new();
        partial.insert("images".to_string(), json!(images));
        self.update_product(auth, id, &partial)
    }
}

pub trait ContentStore: Send + Sync {
    /// Latest published version, if any.
    fn load(&self, page: PageType) -> Result<Option<ContentVersion>, BackendError>;

    fn save_version(&self, auth: &AuthSession, version: &ContentVersion)
        -> Result<(), BackendError>;

    /// All versions, oldest first.
    fn versions(&self, page: PageType) -> Result<Vec<ContentVersion>, BackendError>;
}

/// Pulls remote image bytes so they can be edited locally.
pub trait ImageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, BackendError>;
}

pub(crate) fn fields_to_map(fields: &ProductFields) -> Map<String, Value> {
    serde_json::to_value(fields)
        .ok()
        .and_then(|value| value.as_object().cloned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_session_rejects_blank_tokens() {
        assert!(AuthSession::new("   ").is_none());
        assert_eq!(
            AuthSession::new(" tok ").map(|auth| auth.access_token().to_string()),
            Some("tok".to_string())
        );
    }

    #[test]
    fn path_for_url_strips_public_prefix() {
        let backend = MemoryBackend::new();
        let url = backend.public_url("products/p-1/a.jpg");
        assert_eq!(
            backend.path_for_url(&url).as_deref(),
            Some("products/p-1/a.jpg")
        );
        assert_eq!(backend.path_for_url("https://elsewhere/a.jpg"), None);
    }
}
