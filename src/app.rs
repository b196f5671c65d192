//! Picks backends from configuration and wires the sync services together.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cache::{CacheStore, MemoryCache, RedisCache, SyncStore};
use crate::config::{ContentSettings, ImapSettings, SyncSettings};
use crate::content::{ContentStore, MemoryContentStore, StrapiClient};
use crate::mailbox::{ImapMailbox, MailboxFetcher, MailboxSource, UnconfiguredMailbox};
use crate::sync::SyncOrchestrator;

pub struct Backends {
    pub cache: Arc<dyn CacheStore>,
    pub content: Arc<dyn ContentStore>,
    pub mailbox: Arc<dyn MailboxSource>,
}

impl Backends {
    pub async fn from_settings(
        redis_url: Option<&str>,
        imap: &ImapSettings,
        content: &ContentSettings,
    ) -> Result<Self> {
        Ok(Self {
            cache: cache_backend(redis_url).await?,
            content: content_backend(content)?,
            mailbox: mailbox_backend(imap),
        })
    }

    pub fn orchestrator(self, settings: SyncSettings) -> SyncOrchestrator {
        let store = SyncStore::new(self.cache, &settings);
        SyncOrchestrator::new(
            store,
            MailboxFetcher::new(self.mailbox),
            self.content,
            settings,
        )
    }
}

async fn cache_backend(redis_url: Option<&str>) -> Result<Arc<dyn CacheStore>> {
    match redis_url.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => {
            let cache = RedisCache::connect(url)
                .await
                .context("connect to redis cache")?;
            Ok(Arc::new(cache))
        }
        None => {
            warn!("REDIS_URL not set: using in-process cache, sync exclusivity is local to this process");
            Ok(Arc::new(MemoryCache::new()))
        }
    }
}

fn content_backend(settings: &ContentSettings) -> Result<Arc<dyn ContentStore>> {
    match StrapiClient::from_settings(settings).context("configure content store client")? {
        Some(client) => {
            info!("using content store collection '{}'", settings.strapi_collection);
            Ok(Arc::new(client))
        }
        None => {
            warn!("STRAPI_URL not set: email records are kept in memory only");
            Ok(Arc::new(MemoryContentStore::new()))
        }
    }
}

fn mailbox_backend(settings: &ImapSettings) -> Arc<dyn MailboxSource> {
    match ImapMailbox::from_settings(settings) {
        Ok(mailbox) => Arc::new(mailbox),
        Err(error) => {
            warn!("mailbox not configured, fetches will serve fallback data: {error}");
            Arc::new(UnconfiguredMailbox::new(error.to_string()))
        }
    }
}
