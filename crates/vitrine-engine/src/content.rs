use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use serde_json::json;
use vitrine_contracts::content::{content_diff, ContentVersion, PageContent, PageType};
use vitrine_contracts::events::{now_utc_iso, EventLog};

use crate::backend::{AuthSession, ContentStore};
use crate::map_object;

/// Read-through cache over the CMS pages, owned by whoever constructs it.
pub struct ContentService {
    store: Arc<dyn ContentStore>,
    events: EventLog,
    cache: BTreeMap<PageType, Option<ContentVersion>>,
}

impl ContentService {
    pub fn new(store: Arc<dyn ContentStore>, events: EventLog) -> Self {
        Self {
            store,
            events,
            cache: BTreeMap::new(),
        }
    }

    pub fn get(&mut self, page: PageType) -> Result<Option<ContentVersion>> {
        if let Some(cached) = self.cache.get(&page) {
            return Ok(cached.clone());
        }
        let loaded = self.store.load(page)?;
        self.cache.insert(page, loaded.clone());
        Ok(loaded)
    }

    pub fn is_cached(&self, page: PageType) -> bool {
        self.cache.contains_key(&page)
    }

    /// Publishes `content` as the next version of `page`.
    pub fn publish(
        &mut self,
        auth: Option<&AuthSession>,
        page: PageType,
        content: PageContent,
        author: Option<&str>,
    ) -> Result<ContentVersion> {
        let Some(auth) = auth else {
            bail!("Please sign in as an admin first.");
        };
        content
            .validate()
            .map_err(|err| anyhow!(err.user_message()))?;

        let latest = self
            .store
            .versions(page)?
            .into_iter()
            .map(|version| version.version)
            .max()
            .unwrap_or(0);
        let version = ContentVersion {
            page_type: page,
            version: latest + 1,
            content,
            author: author.map(str::to_string),
            created_at: now_utc_iso(),
        };
        self.store.save_version(auth, &version)?;
        self.cache.insert(page, Some(version.clone()));
        self.events.emit(
            "content_published",
            map_object(json!({
                "page_type": page.as_str(),
                "version": version.version,
                "author": version.author,
            })),
        )?;
        Ok(version)
    }

    /// Every version of `page`, oldest first.
    pub fn history(&self, page: PageType) -> Result<Vec<ContentVersion>> {
        Ok(self.store.versions(page)?)
    }

    pub fn diff(&self, page: PageType, from: u32, to: u32) -> Result<Vec<String>> {
        let versions = self.history(page)?;
        let find = |number: u32| {
            versions
                .iter()
                .find(|version| version.version == number)
                .ok_or_else(|| anyhow!("{page} has no version {number}"))
        };
        Ok(content_diff(find(from)?, find(to)?))
    }

    /// Re-publishes an old version's content as a new version.
    pub fn revert(
        &mut self,
        auth: Option<&AuthSession>,
        page: PageType,
        version: u32,
        author: Option<&str>,
    ) -> Result<ContentVersion> {
        let target = self
            .history(page)?
            .into_iter()
            .find(|row| row.version == version)
            .ok_or_else(|| anyhow!("{page} has no version {version}"))?;
        let published = self.publish(auth, page, target.content, author)?;
        self.events.emit(
            "content_reverted",
            map_object(json!({
                "page_type": page.as_str(),
                "from_version": version,
                "version": published.version,
            })),
        )?;
        Ok(published)
    }

    pub fn invalidate(&mut self, page: Option<PageType>) {
        match page {
            Some(page) => {
                self.cache.remove(&page);
            }
            None => self.cache.clear(),
        }
    }

    pub fn teardown(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use vitrine_contracts::content::ContentSection;

    use super::*;
    use crate::backend::MemoryBackend;

    fn page(title: &str, body: &str) -> PageContent {
        PageContent {
            title: title.to_string(),
            description: String::new(),
            sections: vec![ContentSection {
                heading: "Returns window".to_string(),
                body: body.to_string(),
            }],
        }
    }

    fn service() -> (Arc<MemoryBackend>, ContentService, AuthSession) {
        let backend = Arc::new(MemoryBackend::new());
        let service = ContentService::new(backend.clone(), EventLog::in_memory("cms"));
        let auth = AuthSession::new("admin").unwrap_or_else(|| panic!("auth"));
        (backend, service, auth)
    }

    #[test]
    fn publish_bumps_versions_and_refreshes_cache() -> anyhow::Result<()> {
        let (_backend, mut service, auth) = service();
        assert_eq!(service.get(PageType::Returns)?, None);
        assert!(service.is_cached(PageType::Returns));

        let first = service.publish(Some(&auth), PageType::Returns, page("Returns", "30 days"), Some("ada"))?;
        let second = service.publish(Some(&auth), PageType::Returns, page("Returns", "60 days"), None)?;
        assert_eq!((first.version, second.version), (1, 2));
        assert_eq!(service.get(PageType::Returns)?, Some(second));
        assert_eq!(service.history(PageType::Returns)?.len(), 2);
        Ok(())
    }

    #[test]
    fn publish_requires_session_and_valid_content() {
        let (_backend, mut service, auth) = service();
        assert!(service
            .publish(None, PageType::About, page("About", "x"), None)
            .is_err());
        let err = service
            .publish(Some(&auth), PageType::About, page("  ", "x"), None)
            .err()
            .map(|err| err.to_string())
            .unwrap_or_default();
        assert!(err.to_lowercase().contains("title"));
        assert!(service.history(PageType::About).map(|rows| rows.is_empty()).unwrap_or(false));
    }

    #[test]
    fn revert_republishes_old_content_and_diff_shows_change() -> anyhow::Result<()> {
        let (_backend, mut service, auth) = service();
        service.publish(Some(&auth), PageType::Shipping, page("Shipping", "Free over 50"), None)?;
        service.publish(Some(&auth), PageType::Shipping, page("Shipping", "Free over 75"), None)?;

        let diff = service.diff(PageType::Shipping, 1, 2)?;
        assert!(diff.iter().any(|line| line == "+Free over 75"));

        let reverted = service.revert(Some(&auth), PageType::Shipping, 1, Some("ada"))?;
        assert_eq!(reverted.version, 3);
        assert_eq!(reverted.content, page("Shipping", "Free over 50"));
        assert!(service.diff(PageType::Shipping, 1, 3)?.is_empty());
        assert!(service.diff(PageType::Shipping, 1, 9).is_err());
        Ok(())
    }

    #[test]
    fn invalidate_forces_reload_from_store() -> anyhow::Result<()> {
        let (backend, mut service, auth) = service();
        service.get(PageType::Faq)?;
        let mut other = ContentService::new(backend, EventLog::in_memory("other"));
        other.publish(Some(&auth), PageType::Faq, page("FAQ", "Ask us"), None)?;

        assert_eq!(service.get(PageType::Faq)?, None);
        service.invalidate(Some(PageType::Faq));
        assert_eq!(service.get(PageType::Faq)?.map(|row| row.version), Some(1));
        service.teardown();
        assert!(!service.is_cached(PageType::Faq));
        Ok(())
    }
}
