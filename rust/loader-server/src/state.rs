//! Shared server state: catalog, session table and batch assembler.

use std::sync::Arc;

use loader_core::config::LoaderConfig;
use loader_core::{BatchAssembler, Catalog, LoaderError, Result, SessionStore, Snapshot};

pub struct ServerState {
    pub config: LoaderConfig,
    pub catalog: Arc<Catalog>,
    pub sessions: SessionStore,
    pub assembler: BatchAssembler,
}

impl ServerState {
    /// Builds the state and scans every configured dataset.
    ///
    /// # Errors
    ///
    /// Any scan failure is fatal at startup.
    pub fn new(config: LoaderConfig) -> Result<Self> {
        let catalog = Arc::new(Catalog::from_config(&config));
        catalog.scan_all()?;

        Ok(Self {
            sessions: SessionStore::new(config.session.clone(), config.shuffle.clone()),
            assembler: BatchAssembler::new(&config.storage),
            catalog,
            config,
        })
    }

    /// Rescans a dataset on the blocking pool.
    pub async fn rescan(&self, dataset_id: &str) -> Result<Arc<Snapshot>> {
        let catalog = Arc::clone(&self.catalog);
        let id = dataset_id.to_string();
        tokio::task::spawn_blocking(move || catalog.rescan(&id))
            .await
            .map_err(|e| {
                let path = self
                    .catalog
                    .dataset(dataset_id)
                    .map(|d| d.path.clone())
                    .unwrap_or_default();
                LoaderError::io(path, format!("rescan task failed: {e}"))
            })?
    }

    /// Rescans every dataset, logging failures instead of stopping.
    pub async fn rescan_all(&self) {
        for dataset_id in self.catalog.dataset_ids() {
            if let Err(e) = self.rescan(&dataset_id).await {
                tracing::warn!("Rescan of dataset {} failed: {}", dataset_id, e);
            }
        }
    }
}
