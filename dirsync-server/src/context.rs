use crate::config::{Credentials, Limits, ServerConfig};
use crate::storage::StorageManager;
use crate::store::MetadataStore;

/// State shared by every connection: the store pool and the storage root.
pub struct ServerContext {
    pub store: MetadataStore,
    pub storage: StorageManager,
    pub limits: Limits,
    pub credentials: Credentials,
}

impl ServerContext {
    pub async fn bootstrap(config: &ServerConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let storage = StorageManager::new(&config.storage_root).with_context(|| {
            format!(
                "failed to prepare storage root at {}",
                config.storage_root.display()
            )
        })?;
        let store = MetadataStore::new(&config.database_url)
            .await
            .context("failed to initialize metadata store")?;
        Ok(Self {
            store,
            storage,
            limits: config.limits,
            credentials: config.credentials.clone(),
        })
    }
}
