use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde_json::{Map, Value};
use vitrine_contracts::content::{ContentVersion, PageType};
use vitrine_contracts::product::{Product, ProductFields};

use super::{
    fields_to_map, AuthSession, BackendError, ContentStore, ImageBucket, ImageFetcher,
    ProductStore, ProgressFn,
};

const MEMORY_PUBLIC_PREFIX: &str = "memory://product-images/";

/// In-process backend for dry runs and tests, with failure injection.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, Vec<u8>>,
    remote: BTreeMap<String, Vec<u8>>,
    products: BTreeMap<String, Product>,
    content: Vec<ContentVersion>,
    fail_uploads: Vec<String>,
    fail_image_persist: bool,
    uploads: Vec<String>,
    removed: Vec<String>,
    image_updates: Vec<Vec<String>>,
    next_product: u64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Uploads whose path contains `needle` fail with a transport error.
    pub fn fail_uploads_matching(&self, needle: impl Into<String>) {
        self.state().fail_uploads.push(needle.into());
    }

    /// Image-list writes fail while set; field updates still succeed.
    pub fn fail_image_persist(&self, fail: bool) {
        self.state().fail_image_persist = fail;
    }

    /// Makes `url` fetchable without storing it in the bucket.
    pub fn seed_remote(&self, url: impl Into<String>, bytes: Vec<u8>) {
        self.state().remote.insert(url.into(), bytes);
    }

    pub fn insert_product(&self, product: Product) {
        self.state().products.insert(product.id.clone(), product);
    }

    pub fn product(&self, id: &str) -> Option<Product> {
        self.state().products.get(id).cloned()
    }

    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.state().objects.get(path).cloned()
    }

    pub fn uploads(&self) -> Vec<String> {
        self.state().uploads.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state().removed.clone()
    }

    /// Every image list persisted through `update_product`, in call order.
    pub fn image_updates(&self) -> Vec<Vec<String>> {
        self.state().image_updates.clone()
    }
}

impl ImageBucket for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        _content_type: &str,
        progress: ProgressFn,
    ) -> Result<(), BackendError> {
        let total = bytes.len() as u64;
        progress(0, total);
        let mut state = self.state();
        if state
            .fail_uploads
            .iter()
            .any(|needle| path.contains(needle.as_str()))
        {
            return Err(BackendError::Transport {
                operation: format!("upload {path}"),
                message: "connection reset".to_string(),
            });
        }
        state.objects.insert(path.to_string(), bytes.to_vec());
        state.uploads.push(path.to_string());
        drop(state);
        progress(total / 2, total);
        progress(total, total);
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("{MEMORY_PUBLIC_PREFIX}{path}")
    }

    fn remove(&self, paths: &[String]) -> Result<(), BackendError> {
        let mut state = self.state();
        for path in paths {
            state.objects.remove(path);
            state.removed.push(path.clone());
        }
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        Ok(self
            .state()
            .objects
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn list_buckets(&self) -> Result<Vec<String>, BackendError> {
        Ok(vec!["product-images".to_string()])
    }
}

impl ImageFetcher for MemoryBackend {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, BackendError> {
        let state = self.state();
        if let Some(bytes) = state.remote.get(url) {
            return Ok(bytes.clone());
        }
        url.strip_prefix(MEMORY_PUBLIC_PREFIX)
            .and_then(|path| state.objects.get(path))
            .cloned()
            .ok_or_else(|| BackendError::NotFound(url.to_string()))
    }
}

impl ProductStore for MemoryBackend {
    fn create_product(
        &self,
        _auth: &AuthSession,
        fields: &ProductFields,
    ) -> Result<Product, BackendError> {
        let mut state = self.state();
        state.next_product += 1;
        let product = Product {
            id: format!("prod-{}", state.next_product),
            fields: fields.clone(),
            images: Vec::new(),
        };
        state.products.insert(product.id.clone(), product.clone());
        Ok(product)
    }

    fn update_product(
        &self,
        _auth: &AuthSession,
        id: &str,
        partial: &Map<String, Value>,
    ) -> Result<Product, BackendError> {
        let mut state = self.state();
        let Some(current) = state.products.get(id).cloned() else {
            return Err(BackendError::NotFound(format!("product {id}")));
        };

        let mut row = fields_to_map(&current.fields);
        row.insert("id".to_string(), Value::String(current.id.clone()));
        row.insert(
            "images".to_string(),
            serde_json::to_value(&current.images).unwrap_or(Value::Null),
        );
        for (key, value) in partial {
            row.insert(key.clone(), value.clone());
        }
        let updated: Product =
            serde_json::from_value(Value::Object(row)).map_err(|err| {
                BackendError::UnexpectedShape {
                    operation: format!("update product {id}"),
                    message: err.to_string(),
                }
            })?;
        if partial.contains_key("images") {
            state.image_updates.push(updated.images.clone());
        }
        state.products.insert(id.to_string(), updated.clone());
        Ok(updated)
    }

    fn update_images(
        &self,
        auth: &AuthSession,
        id: &str,
        images: &[String],
    ) -> Result<Product, BackendError> {
        if self.state().fail_image_persist {
            return Err(BackendError::Transport {
                operation: format!("update images {id}"),
                message: "connection reset".to_string(),
            });
        }
        let mut partial = Map::new();
        partial.insert("images".to_string(), serde_json::json!(images));
        self.update_product(auth, id, &partial)
    }

    fn get_product(&self, id: &str) -> Result<Product, BackendError> {
        self.product(id)
            .ok_or_else(|| BackendError::NotFound(format!("product {id}")))
    }
}

impl ContentStore for MemoryBackend {
    fn load(&self, page: PageType) -> Result<Option<ContentVersion>, BackendError> {
        Ok(self
            .state()
            .content
            .iter()
            .filter(|version| version.page_type == page)
            .max_by_key(|version| version.version)
            .cloned())
    }

    fn save_version(
        &self,
        _auth: &AuthSession,
        version: &ContentVersion,
    ) -> Result<(), BackendError> {
        let mut state = self.state();
        if state
            .content
            .iter()
            .any(|row| row.page_type == version.page_type && row.version == version.version)
        {
            return Err(BackendError::Status {
                operation: format!("save {} v{}", version.page_type, version.version),
                status: 409,
                body: "duplicate version".to_string(),
            });
        }
        state.content.push(version.clone());
        Ok(())
    }

    fn versions(&self, page: PageType) -> Result<Vec<ContentVersion>, BackendError> {
        let mut rows: Vec<ContentVersion> = self
            .state()
            .content
            .iter()
            .filter(|version| version.page_type == page)
            .cloned()
            .collect();
        rows.sort_by_key(|version| version.version);
        Ok(rows)
    }
}
