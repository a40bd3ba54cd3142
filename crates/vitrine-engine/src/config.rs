//! Runtime configuration read from the environment.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::ai_edit::EditWire;
use crate::backend::AuthSession;
use crate::non_empty_env;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitrineConfig {
    /// Base URL of the hosted backend (storage + REST).
    pub backend_url: String,

    /// Public (anon) key sent with every backend request.
    pub anon_key: String,

    /// Admin session token; writes are refused without it.
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default = "default_image_bucket")]
    pub image_bucket: String,

    /// Server-side proxy in front of the AI edit service.
    #[serde(default)]
    pub edit_proxy_url: Option<String>,

    #[serde(default)]
    pub edit_wire: EditWire,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: f64,

    #[serde(default = "default_upload_parallelism")]
    pub upload_parallelism: usize,
}

impl VitrineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(non_empty_env)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let Some(backend_url) = lookup("VITRINE_BACKEND_URL") else {
            bail!("Missing VITRINE_BACKEND_URL.");
        };
        let Some(anon_key) = lookup("VITRINE_ANON_KEY") else {
            bail!("Missing VITRINE_ANON_KEY.");
        };
        let edit_wire = match lookup("VITRINE_EDIT_WIRE") {
            Some(raw) => raw.parse::<EditWire>().map_err(anyhow::Error::msg)?,
            None => EditWire::default(),
        };
        let request_timeout_secs = lookup("VITRINE_REQUEST_TIMEOUT")
            .and_then(|raw| raw.parse::<f64>().ok())
            .unwrap_or_else(default_request_timeout)
            .clamp(5.0, 300.0);
        let upload_parallelism = lookup("VITRINE_UPLOAD_PARALLELISM")
            .and_then(|raw| raw.parse::<usize>().ok())
            .unwrap_or_else(default_upload_parallelism)
            .clamp(1, 16);

        Ok(Self {
            backend_url: backend_url.trim_end_matches('/').to_string(),
            anon_key,
            access_token: lookup("VITRINE_ACCESS_TOKEN"),
            image_bucket: lookup("VITRINE_IMAGE_BUCKET").unwrap_or_else(default_image_bucket),
            edit_proxy_url: lookup("VITRINE_EDIT_PROXY_URL")
                .map(|value| value.trim_end_matches('/').to_string()),
            edit_wire,
            request_timeout_secs,
            upload_parallelism,
        })
    }

    pub fn auth_session(&self) -> Option<AuthSession> {
        self.access_token
            .as_deref()
            .and_then(AuthSession::new)
    }

    /// Prefix shared by every public object URL in the image bucket.
    pub fn public_url_prefix(&self) -> String {
        format!(
            "{}/storage/v1/object/public/{}/",
            self.backend_url, self.image_bucket
        )
    }
}

fn default_image_bucket() -> String {
    "product-images".to_string()
}

fn default_request_timeout() -> f64 {
    60.0
}

fn default_upload_parallelism() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn from_lookup_applies_defaults() -> anyhow::Result<()> {
        let config = VitrineConfig::from_lookup(lookup_from(&[
            ("VITRINE_BACKEND_URL", "https://backend.example/"),
            ("VITRINE_ANON_KEY", "anon"),
        ]))?;
        assert_eq!(config.backend_url, "https://backend.example");
        assert_eq!(config.image_bucket, "product-images");
        assert_eq!(config.edit_wire, EditWire::Json);
        assert_eq!(config.request_timeout_secs, 60.0);
        assert_eq!(config.upload_parallelism, 4);
        assert!(config.auth_session().is_none());
        assert_eq!(
            config.public_url_prefix(),
            "https://backend.example/storage/v1/object/public/product-images/"
        );
        Ok(())
    }

    #[test]
    fn from_lookup_clamps_knobs() -> anyhow::Result<()> {
        let config = VitrineConfig::from_lookup(lookup_from(&[
            ("VITRINE_BACKEND_URL", "https://backend.example"),
            ("VITRINE_ANON_KEY", "anon"),
            ("VITRINE_ACCESS_TOKEN", "token"),
            ("VITRINE_EDIT_WIRE", "multipart"),
            ("VITRINE_REQUEST_TIMEOUT", "1"),
            ("VITRINE_UPLOAD_PARALLELISM", "64"),
        ]))?;
        assert_eq!(config.edit_wire, EditWire::Multipart);
        assert_eq!(config.request_timeout_secs, 5.0);
        assert_eq!(config.upload_parallelism, 16);
        assert!(config.auth_session().is_some());
        Ok(())
    }

    #[test]
    fn from_lookup_requires_backend() {
        let err = VitrineConfig::from_lookup(lookup_from(&[("VITRINE_ANON_KEY", "anon")]))
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert_eq!(err, "Missing VITRINE_BACKEND_URL.");
    }
}
