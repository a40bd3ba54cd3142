use std::io::{Cursor, Read};
use std::time::Duration;

use reqwest::blocking::{Body, Client as HttpClient, RequestBuilder, Response as HttpResponse};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use vitrine_contracts::content::{ContentVersion, PageContent, PageType};
use vitrine_contracts::product::{Product, ProductFields};

use super::{
    fields_to_map, AuthSession, BackendError, ContentStore, ImageBucket, ImageFetcher,
    ProductStore, ProgressFn,
};
use crate::config::VitrineConfig;
use crate::{error_chain_text, truncate_text};

/// REST client for the hosted backend (storage + tables).
pub struct HttpBackend {
    base_url: String,
    anon_key: String,
    bucket: String,
    session: Option<AuthSession>,
    http: HttpClient,
}

#[derive(Debug, Deserialize)]
struct BucketRow {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ObjectRow {
    name: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContentPageRow {
    page_type: PageType,
    version: u32,
    content: PageContent,
    #[serde(default)]
    updated_by: Option<String>,
    updated_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ContentVersionRow {
    page_type: PageType,
    version: u32,
    content: PageContent,
    #[serde(default)]
    created_by: Option<String>,
    created_at: String,
}

impl From<ContentVersionRow> for ContentVersion {
    fn from(row: ContentVersionRow) -> Self {
        ContentVersion {
            page_type: row.page_type,
            version: row.version,
            content: row.content,
            author: row.created_by,
            created_at: row.created_at,
        }
    }
}

impl From<ContentPageRow> for ContentVersion {
    fn from(row: ContentPageRow) -> Self {
        ContentVersion {
            page_type: row.page_type,
            version: row.version,
            content: row.content,
            author: row.updated_by,
            created_at: row.updated_at,
        }
    }
}

/// Request body that reports how much of it has been read.
struct ProgressReader {
    inner: Cursor<Vec<u8>>,
    total: u64,
    sent: u64,
    progress: ProgressFn,
}

impl Read for ProgressReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let read = self.inner.read(buf)?;
        self.sent += read as u64;
        (self.progress)(self.sent, self.total);
        Ok(read)
    }
}

impl HttpBackend {
    pub fn new(config: &VitrineConfig) -> anyhow::Result<Self> {
        let http = HttpClient::builder()
            .timeout(Duration::from_secs_f64(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.backend_url.clone(),
            anon_key: config.anon_key.clone(),
            bucket: config.image_bucket.clone(),
            session: config.auth_session(),
            http,
        })
    }

    fn bearer<'a>(&'a self, auth: Option<&'a AuthSession>) -> &'a str {
        auth.or(self.session.as_ref())
            .map(AuthSession::access_token)
            .unwrap_or(self.anon_key.as_str())
    }

    fn authorized(&self, builder: RequestBuilder, auth: Option<&AuthSession>) -> RequestBuilder {
        builder
            .header("apikey", &self.anon_key)
            .header(AUTHORIZATION, format!("Bearer {}", self.bearer(auth)))
    }

    fn send(&self, operation: &str, builder: RequestBuilder) -> Result<HttpResponse, BackendError> {
        let response = builder.send().map_err(|err| BackendError::Transport {
            operation: operation.to_string(),
            message: error_chain_text(&anyhow::Error::new(err), 256),
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().unwrap_or_default();
        Err(BackendError::Status {
            operation: operation.to_string(),
            status: status.as_u16(),
            body: truncate_text(&body, 512),
        })
    }

    fn send_json<T: DeserializeOwned>(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<T, BackendError> {
        let response = self.send(operation, builder)?;
        let body = response.text().map_err(|err| BackendError::Transport {
            operation: operation.to_string(),
            message: err.to_string(),
        })?;
        serde_json::from_str::<T>(&body).map_err(|err| BackendError::UnexpectedShape {
            operation: operation.to_string(),
            message: format!("{err}: {}", truncate_text(&body, 256)),
        })
    }

    fn single_row<T>(operation: &str, rows: Vec<T>) -> Result<T, BackendError> {
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::UnexpectedShape {
                operation: operation.to_string(),
                message: "expected one row, got none".to_string(),
            })
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn object_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/{}/{}",
            self.base_url,
            self.bucket,
            path.trim_start_matches('/')
        )
    }
}

impl ImageBucket for HttpBackend {
    fn name(&self) -> &str {
        &self.bucket
    }

    fn upload(
        &self,
        path: &str,
        bytes: &[u8],
        content_type: &str,
        progress: ProgressFn,
    ) -> Result<(), BackendError> {
        let total = bytes.len() as u64;
        let reader = ProgressReader {
            inner: Cursor::new(bytes.to_vec()),
            total,
            sent: 0,
            progress,
        };
        let builder = self
            .authorized(self.http.post(self.object_url(path)), None)
            .header(CONTENT_TYPE, content_type)
            .header("x-upsert", "true")
            .header("cache-control", "max-age=3600")
            .body(Body::sized(reader, total));
        self.send(&format!("upload {path}"), builder)?;
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url,
            self.bucket,
            path.trim_start_matches('/')
        )
    }

    fn remove(&self, paths: &[String]) -> Result<(), BackendError> {
        if paths.is_empty() {
            return Ok(());
        }
        let builder = self
            .authorized(
                self.http.delete(format!(
                    "{}/storage/v1/object/{}",
                    self.base_url, self.bucket
                )),
                None,
            )
            .json(&json!({ "prefixes": paths }));
        self.send("remove objects", builder)?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, BackendError> {
        let builder = self
            .authorized(
                self.http.post(format!(
                    "{}/storage/v1/object/list/{}",
                    self.base_url, self.bucket
                )),
                None,
            )
            .json(&json!({ "prefix": prefix, "limit": 1000 }));
        let rows: Vec<ObjectRow> = self.send_json("list objects", builder)?;
        let prefix = prefix.trim_end_matches('/');
        Ok(rows
            .into_iter()
            .map(|row| {
                if prefix.is_empty() {
                    row.name
                } else {
                    format!("{prefix}/{}", row.name)
                }
            })
            .collect())
    }

    fn list_buckets(&self) -> Result<Vec<String>, BackendError> {
        let builder = self.authorized(
            self.http
                .get(format!("{}/storage/v1/bucket", self.base_url)),
            None,
        );
        let rows: Vec<BucketRow> = self.send_json("list buckets", builder)?;
        Ok(rows.into_iter().map(|row| row.name).collect())
    }
}

impl ImageFetcher for HttpBackend {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, BackendError> {
        let response = self.send(&format!("fetch {url}"), self.http.get(url))?;
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| BackendError::Transport {
                operation: format!("fetch {url}"),
                message: err.to_string(),
            })
    }
}

impl ProductStore for HttpBackend {
    fn create_product(
        &self,
        auth: &AuthSession,
        fields: &ProductFields,
    ) -> Result<Product, BackendError> {
        let mut row = fields_to_map(fields);
        row.insert("images".to_string(), Value::Array(Vec::new()));
        let builder = self
            .authorized(self.http.post(self.rest_url("products")), Some(auth))
            .header("Prefer", "return=representation")
            .json(&Value::Object(row));
        let rows: Vec<Product> = self.send_json("create product", builder)?;
        Self::single_row("create product", rows)
    }

    fn update_product(
        &self,
        auth: &AuthSession,
        id: &str,
        partial: &Map<String, Value>,
    ) -> Result<Product, BackendError> {
        let operation = format!("update product {id}");
        let builder = self
            .authorized(self.http.patch(self.rest_url("products")), Some(auth))
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(partial);
        let rows: Vec<Product> = self.send_json(&operation, builder)?;
        Self::single_row(&operation, rows)
    }

    fn get_product(&self, id: &str) -> Result<Product, BackendError> {
        let operation = format!("get product {id}");
        let builder = self
            .authorized(self.http.get(self.rest_url("products")), None)
            .query(&[("id", format!("eq.{id}")), ("select", "*".to_string())]);
        let rows: Vec<Product> = self.send_json(&operation, builder)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| BackendError::NotFound(format!("product {id}")))
    }
}

impl ContentStore for HttpBackend {
    fn load(&self, page: PageType) -> Result<Option<ContentVersion>, BackendError> {
        let builder = self
            .authorized(self.http.get(self.rest_url("content_pages")), None)
            .query(&[("page_type", format!("eq.{page}")), ("select", "*".to_string())]);
        let rows: Vec<ContentPageRow> = self.send_json(&format!("load {page}"), builder)?;
        Ok(rows.into_iter().next().map(ContentVersion::from))
    }

    fn save_version(
        &self,
        auth: &AuthSession,
        version: &ContentVersion,
    ) -> Result<(), BackendError> {
        let history = ContentVersionRow {
            page_type: version.page_type,
            version: version.version,
            content: version.content.clone(),
            created_by: version.author.clone(),
            created_at: version.created_at.clone(),
        };
        let builder = self
            .authorized(
                self.http.post(self.rest_url("content_page_versions")),
                Some(auth),
            )
            .json(&history);
        self.send(
            &format!("save {} v{} history", version.page_type, version.version),
            builder,
        )?;

        let page = ContentPageRow {
            page_type: version.page_type,
            version: version.version,
            content: version.content.clone(),
            updated_by: version.author.clone(),
            updated_at: version.created_at.clone(),
        };
        let builder = self
            .authorized(self.http.post(self.rest_url("content_pages")), Some(auth))
            .query(&[("on_conflict", "page_type")])
            .header("Prefer", "resolution=merge-duplicates")
            .json(&page);
        self.send(&format!("publish {}", version.page_type), builder)?;
        Ok(())
    }

    fn versions(&self, page: PageType) -> Result<Vec<ContentVersion>, BackendError> {
        let builder = self
            .authorized(self.http.get(self.rest_url("content_page_versions")), None)
            .query(&[
                ("page_type", format!("eq.{page}")),
                ("select", "*".to_string()),
                ("order", "version.asc".to_string()),
            ]);
        let rows: Vec<ContentVersionRow> =
            self.send_json(&format!("list {page} versions"), builder)?;
        Ok(rows.into_iter().map(ContentVersion::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn backend() -> HttpBackend {
        let config = VitrineConfig::from_lookup(|key| match key {
            "VITRINE_BACKEND_URL" => Some("https://backend.example".to_string()),
            "VITRINE_ANON_KEY" => Some("anon".to_string()),
            _ => None,
        })
        .unwrap_or_else(|err| panic!("{err}"));
        HttpBackend::new(&config).unwrap_or_else(|err| panic!("{err}"))
    }

    #[test]
    fn public_and_object_urls_follow_storage_layout() {
        let backend = backend();
        assert_eq!(
            backend.public_url("products/p-1/a.jpg"),
            "https://backend.example/storage/v1/object/public/product-images/products/p-1/a.jpg"
        );
        assert_eq!(
            backend.object_url("/products/p-1/a.jpg"),
            "https://backend.example/storage/v1/object/product-images/products/p-1/a.jpg"
        );
        assert_eq!(
            backend
                .path_for_url(&backend.public_url("products/p-1/a.jpg"))
                .as_deref(),
            Some("products/p-1/a.jpg")
        );
    }

    #[test]
    fn bearer_prefers_explicit_session_over_anon_key() {
        let backend = backend();
        assert_eq!(backend.bearer(None), "anon");
        let auth = AuthSession::new("admin-token");
        assert_eq!(backend.bearer(auth.as_ref()), "admin-token");
    }

    #[test]
    fn content_rows_map_to_versions() -> anyhow::Result<()> {
        let row: ContentVersionRow = serde_json::from_value(json!({
            "page_type": "about",
            "version": 3,
            "content": {"title": "About us"},
            "created_by": "ada",
            "created_at": "2026-01-01T00:00:00Z"
        }))?;
        let version = ContentVersion::from(row);
        assert_eq!(version.page_type, PageType::About);
        assert_eq!(version.author.as_deref(), Some("ada"));
        assert!(version.content.sections.is_empty());
        Ok(())
    }

    #[test]
    fn content_rows_with_unknown_page_type_fail_loudly() {
        let parsed = serde_json::from_value::<ContentPageRow>(json!({
            "page_type": "blog",
            "version": 1,
            "content": {"title": "x"},
            "updated_at": "2026-01-01T00:00:00Z"
        }));
        assert!(parsed.is_err());
    }

    #[test]
    fn progress_reader_reports_every_chunk() -> anyhow::Result<()> {
        use std::sync::{Arc, Mutex};

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut reader = ProgressReader {
            inner: Cursor::new(vec![7u8; 10]),
            total: 10,
            sent: 0,
            progress: Arc::new(move |sent, total| {
                if let Ok(mut rows) = sink.lock() {
                    rows.push((sent, total));
                }
            }),
        };
        let mut buf = [0u8; 4];
        while reader.read(&mut buf)? > 0 {}
        let rows = seen.lock().map(|rows| rows.clone()).unwrap_or_default();
        assert_eq!(rows.first(), Some(&(4, 10)));
        assert_eq!(rows.iter().rev().nth(1), Some(&(10, 10)));
        Ok(())
    }
}
