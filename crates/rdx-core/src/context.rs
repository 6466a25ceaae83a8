use std::sync::Arc;

use anyhow::{Context, Result};

use crate::alert::{AlertSink, TracingAlerts};
use crate::config::Config;
use crate::crypto::IndexLedger;
use crate::directory::Directory;
use crate::index::Index;
use crate::ingest::Ingestor;
use crate::store::{FsBackend, ObjectStore};

const OBJECTS_DIR: &str = "objects";

/// Everything a command needs, opened once per invocation.
pub struct CommandContext {
    config: Config,
    index: Index,
    directory: Arc<Directory>,
    store: ObjectStore,
    alerts: Arc<dyn AlertSink>,
}

impl CommandContext {
    /// Opens the index and object store under the configured root.
    ///
    /// # Errors
    /// Returns an error if the index or store cannot be opened.
    pub fn open(config: Config) -> Result<Self> {
        Self::with_alerts(config, Arc::new(TracingAlerts))
    }

    /// # Errors
    /// Returns an error if the index or store cannot be opened.
    pub fn with_alerts(config: Config, alerts: Arc<dyn AlertSink>) -> Result<Self> {
        let index = Index::open(config.root())?;
        let directory = Arc::new(Directory::new(index.clone()));
        let objects = config.root().join(OBJECTS_DIR);
        let backend = FsBackend::open(&objects)
            .with_context(|| format!("failed to open object store at {}", objects.display()))?;
        let store = ObjectStore::new(Arc::new(backend), directory.clone(), config.store());
        Ok(Self {
            config,
            index,
            directory,
            store,
            alerts,
        })
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn index(&self) -> &Index {
        &self.index
    }

    #[must_use]
    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    #[must_use]
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    #[must_use]
    pub fn alerts(&self) -> &dyn AlertSink {
        self.alerts.as_ref()
    }

    #[must_use]
    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(
            self.directory.clone(),
            self.store.clone(),
            self.index.clone(),
            Arc::new(IndexLedger::new(self.index.clone())),
            self.alerts.clone(),
        )
    }
}
